//! Admin mutations with audit trail
//!
//! Grant and revoke change what the router allows on the very next request
//! (nothing is cached). Every mutation, successful or not, is emitted on the
//! `admin_audit` tracing target:
//!
//! ```text
//! INFO admin_audit audit={"action":"permission.grant","admin":"root",...}
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Result;
use crate::model::{AccountPermission, EntityId, PermissionTarget};
use crate::store::Store;

/// Structured admin audit event.
#[derive(Debug, Clone, Serialize)]
pub struct AdminAuditEvent {
    /// Action string (e.g., `"permission.grant"`).
    pub action: &'static str,
    /// Who performed the action.
    pub admin: String,
    /// Affected entity, rendered as `kind:id`.
    pub target: String,
    /// Account on the other side of a grant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<EntityId>,
    /// Whether the mutation took effect.
    pub success: bool,
    /// Failure reason or extra note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Event time.
    pub at: DateTime<Utc>,
}

/// Builder for [`AdminAuditEvent`].
#[derive(Debug)]
pub struct AdminAuditBuilder {
    event: AdminAuditEvent,
}

impl AdminAuditBuilder {
    /// Start an event for an action performed by `admin`.
    pub fn new(action: &'static str, admin: impl Into<String>) -> Self {
        Self {
            event: AdminAuditEvent {
                action,
                admin: admin.into(),
                target: String::new(),
                account_id: None,
                success: true,
                detail: None,
                at: Utc::now(),
            },
        }
    }

    /// Affected entity.
    #[must_use]
    pub fn target(mut self, target: impl ToString) -> Self {
        self.event.target = target.to_string();
        self
    }

    /// Account involved.
    #[must_use]
    pub fn account(mut self, account_id: EntityId) -> Self {
        self.event.account_id = Some(account_id);
        self
    }

    /// Extra note.
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.event.detail = Some(detail.into());
        self
    }

    /// Mark the mutation as failed.
    #[must_use]
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.event.success = false;
        self.event.detail = Some(reason.into());
        self
    }

    /// Finish the event.
    #[must_use]
    pub fn build(self) -> AdminAuditEvent {
        self.event
    }
}

/// Emit an audit event on the `admin_audit` target.
pub fn emit(event: &AdminAuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(target: "admin_audit", audit = %json, "admin audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize admin audit event"),
    }
}

/// Grant `account_id` access to `target`.
pub async fn grant_permission(
    store: &dyn Store,
    admin: &str,
    account_id: EntityId,
    target: PermissionTarget,
) -> Result<AccountPermission> {
    let builder = AdminAuditBuilder::new("permission.grant", admin)
        .target(target)
        .account(account_id);
    match store.grant(account_id, target).await {
        Ok(permission) => {
            emit(&builder.detail(format!("permission {}", permission.id)).build());
            Ok(permission)
        }
        Err(e) => {
            emit(&builder.failed(e.to_string()).build());
            Err(e)
        }
    }
}

/// Revoke a grant. Returns whether one existed.
pub async fn revoke_permission(
    store: &dyn Store,
    admin: &str,
    account_id: EntityId,
    target: PermissionTarget,
) -> Result<bool> {
    let builder = AdminAuditBuilder::new("permission.revoke", admin)
        .target(target)
        .account(account_id);
    match store.revoke(account_id, target).await {
        Ok(true) => {
            emit(&builder.build());
            Ok(true)
        }
        Ok(false) => {
            emit(&builder.failed("no such grant").build());
            Ok(false)
        }
        Err(e) => {
            emit(&builder.failed(e.to_string()).build());
            Err(e)
        }
    }
}
