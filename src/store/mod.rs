//! Persistence collaborator
//!
//! The gateway never caches catalog state: every request goes back to the
//! [`Store`] for services, apps, capabilities, grants and variables, so admin
//! edits take effect on the next call.

mod memory;

pub use memory::{Catalog, MemoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;
use crate::model::{
    AccountPermission, App, Capability, ConnectionAccount, ConnectionLog, EntityId, McpService,
    PermissionTarget, Variable,
};

/// Storage backend consumed by the router, relay, and logger.
#[async_trait]
pub trait Store: Send + Sync {
    /// Look up an MCP Service by routing identifier (enabled or not).
    async fn service_by_identifier(&self, identifier: &str) -> Result<Option<McpService>>;

    /// All apps of a service, in id order.
    async fn apps_for_service(&self, service_id: EntityId) -> Result<Vec<App>>;

    /// App of a service by exact name.
    async fn app_by_name(&self, service_id: EntityId, name: &str) -> Result<Option<App>>;

    /// All capabilities of an app, in id order.
    async fn capabilities_for_app(&self, app_id: EntityId) -> Result<Vec<Capability>>;

    /// Account holding the given bearer token.
    async fn account_by_token(&self, token: &str) -> Result<Option<ConnectionAccount>>;

    /// Whether an account holds a grant on exactly this target.
    async fn has_grant(&self, account_id: EntityId, target: PermissionTarget) -> Result<bool>;

    /// Create a grant. Granting twice returns the existing grant.
    async fn grant(&self, account_id: EntityId, target: PermissionTarget)
    -> Result<AccountPermission>;

    /// Remove a grant. Returns whether one existed.
    async fn revoke(&self, account_id: EntityId, target: PermissionTarget) -> Result<bool>;

    /// Full variable table.
    async fn variables(&self) -> Result<Vec<Variable>>;

    /// Append a connection log record.
    async fn insert_connection_log(&self, log: ConnectionLog) -> Result<()>;

    /// Most recent connection logs, newest first.
    async fn connection_logs(&self, limit: usize) -> Result<Vec<ConnectionLog>>;

    /// Delete connection logs created before `older_than`. Returns the count.
    async fn prune_connection_logs(&self, older_than: DateTime<Utc>) -> Result<usize>;
}
