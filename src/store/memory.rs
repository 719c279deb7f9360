//! In-memory [`Store`] seeded from a YAML catalog.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::Store;
use crate::model::{
    AccountPermission, App, Capability, ConnectionAccount, ConnectionLog, EntityId,
    IntegrationKind, McpService, PermissionTarget, Variable,
};
use crate::variables::is_valid_name;
use crate::{Error, Result};

/// Catalog document: every admin-managed entity in one YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    /// MCP Services
    pub services: Vec<McpService>,
    /// Apps
    pub apps: Vec<App>,
    /// Capabilities
    pub capabilities: Vec<Capability>,
    /// Connection accounts
    pub accounts: Vec<ConnectionAccount>,
    /// Grants
    pub permissions: Vec<AccountPermission>,
    /// Variable table
    pub variables: Vec<Variable>,
}

impl Catalog {
    /// Parse a catalog from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a catalog file.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Catalog file not found: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Referential and uniqueness problems, one message per problem.
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let mut identifiers = HashSet::new();
        let mut service_ids = HashSet::new();
        for service in &self.services {
            if !service_ids.insert(service.id) {
                problems.push(format!("duplicate service id {}", service.id));
            }
            if !identifiers.insert(service.identifier.as_str()) {
                problems.push(format!("duplicate service identifier '{}'", service.identifier));
            }
        }

        let mut app_ids = HashSet::new();
        for app in &self.apps {
            if !app_ids.insert(app.id) {
                problems.push(format!("duplicate app id {}", app.id));
            }
            if !service_ids.contains(&app.service_id) {
                problems.push(format!(
                    "app '{}' references unknown service {}",
                    app.name, app.service_id
                ));
            }
            if app.kind == IntegrationKind::Mcp && app.mcp.is_none() {
                problems.push(format!("mcp app '{}' has no connection", app.name));
            }
        }

        let mut capability_ids = HashSet::new();
        let mut names_per_app = HashSet::new();
        for capability in &self.capabilities {
            if !capability_ids.insert(capability.id) {
                problems.push(format!("duplicate capability id {}", capability.id));
            }
            if !app_ids.contains(&capability.app_id) {
                problems.push(format!(
                    "capability '{}' references unknown app {}",
                    capability.name, capability.app_id
                ));
            }
            if !names_per_app.insert((capability.app_id, capability.name.as_str())) {
                problems.push(format!(
                    "duplicate capability name '{}' in app {}",
                    capability.name, capability.app_id
                ));
            }
        }

        let mut account_ids = HashSet::new();
        let mut tokens = HashSet::new();
        for account in &self.accounts {
            if !account_ids.insert(account.id) {
                problems.push(format!("duplicate account id {}", account.id));
            }
            if !tokens.insert(account.token.as_str()) {
                problems.push(format!("account '{}' reuses a token", account.name));
            }
        }

        for permission in &self.permissions {
            if !account_ids.contains(&permission.account_id) {
                problems.push(format!(
                    "permission {} references unknown account {}",
                    permission.id, permission.account_id
                ));
            }
            let exists = match permission.target {
                PermissionTarget::McpService(id) => service_ids.contains(&id),
                PermissionTarget::App(id) => app_ids.contains(&id),
                PermissionTarget::Capability(id) => capability_ids.contains(&id),
            };
            if !exists {
                problems.push(format!(
                    "permission {} targets unknown {}",
                    permission.id, permission.target
                ));
            }
        }

        let mut variable_names = HashSet::new();
        for variable in &self.variables {
            if !is_valid_name(&variable.name) {
                problems.push(format!("invalid variable name '{}'", variable.name));
            }
            if !variable_names.insert(variable.name.as_str()) {
                problems.push(format!("duplicate variable '{}'", variable.name));
            }
        }

        problems
    }

    /// Fail with every problem found.
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    fn target_exists(&self, target: PermissionTarget) -> bool {
        match target {
            PermissionTarget::McpService(id) => self.services.iter().any(|s| s.id == id),
            PermissionTarget::App(id) => self.apps.iter().any(|a| a.id == id),
            PermissionTarget::Capability(id) => self.capabilities.iter().any(|c| c.id == id),
        }
    }
}

/// Store holding a [`Catalog`] and the connection log in memory.
pub struct MemoryStore {
    catalog: RwLock<Catalog>,
    logs: RwLock<Vec<ConnectionLog>>,
    next_permission_id: AtomicI64,
}

impl MemoryStore {
    /// Build a store from a validated catalog.
    pub fn new(catalog: Catalog) -> Result<Self> {
        catalog.validate()?;
        let mut catalog = catalog;
        catalog.services.sort_by_key(|s| s.id);
        catalog.apps.sort_by_key(|a| a.id);
        catalog.capabilities.sort_by_key(|c| c.id);
        catalog.permissions.sort_by_key(|p| p.id);
        let next_id = catalog.permissions.iter().map(|p| p.id).max().unwrap_or(0) + 1;
        Ok(Self {
            catalog: RwLock::new(catalog),
            logs: RwLock::new(Vec::new()),
            next_permission_id: AtomicI64::new(next_id),
        })
    }

    /// Load and validate a catalog file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::new(Catalog::from_file(path)?)
    }

    /// Replace one variable (insert when absent).
    pub fn put_variable(&self, variable: Variable) {
        let mut catalog = self.catalog.write();
        catalog.variables.retain(|v| v.name != variable.name);
        catalog.variables.push(variable);
    }

    /// Mutate the catalog in place (admin edits).
    pub fn update<F: FnOnce(&mut Catalog)>(&self, f: F) {
        f(&mut self.catalog.write());
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn service_by_identifier(&self, identifier: &str) -> Result<Option<McpService>> {
        Ok(self
            .catalog
            .read()
            .services
            .iter()
            .find(|s| s.identifier == identifier)
            .cloned())
    }

    async fn apps_for_service(&self, service_id: EntityId) -> Result<Vec<App>> {
        Ok(self
            .catalog
            .read()
            .apps
            .iter()
            .filter(|a| a.service_id == service_id)
            .cloned()
            .collect())
    }

    async fn app_by_name(&self, service_id: EntityId, name: &str) -> Result<Option<App>> {
        Ok(self
            .catalog
            .read()
            .apps
            .iter()
            .find(|a| a.service_id == service_id && a.name == name)
            .cloned())
    }

    async fn capabilities_for_app(&self, app_id: EntityId) -> Result<Vec<Capability>> {
        Ok(self
            .catalog
            .read()
            .capabilities
            .iter()
            .filter(|c| c.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn account_by_token(&self, token: &str) -> Result<Option<ConnectionAccount>> {
        let catalog = self.catalog.read();
        // Compare against every account so timing does not leak the match position
        let mut found = None;
        for account in &catalog.accounts {
            if bool::from(account.token.as_bytes().ct_eq(token.as_bytes())) {
                found = Some(account.clone());
            }
        }
        Ok(found)
    }

    async fn has_grant(&self, account_id: EntityId, target: PermissionTarget) -> Result<bool> {
        Ok(self
            .catalog
            .read()
            .permissions
            .iter()
            .any(|p| p.account_id == account_id && p.target == target))
    }

    async fn grant(
        &self,
        account_id: EntityId,
        target: PermissionTarget,
    ) -> Result<AccountPermission> {
        let mut catalog = self.catalog.write();
        if !catalog.accounts.iter().any(|a| a.id == account_id) {
            return Err(Error::Store(format!("unknown account {account_id}")));
        }
        if !catalog.target_exists(target) {
            return Err(Error::Store(format!("unknown grant target {target}")));
        }
        if let Some(existing) = catalog
            .permissions
            .iter()
            .find(|p| p.account_id == account_id && p.target == target)
        {
            return Ok(existing.clone());
        }
        let permission = AccountPermission {
            id: self.next_permission_id.fetch_add(1, Ordering::Relaxed),
            account_id,
            target,
        };
        catalog.permissions.push(permission.clone());
        debug!(account_id, target = %target, "Grant stored");
        Ok(permission)
    }

    async fn revoke(&self, account_id: EntityId, target: PermissionTarget) -> Result<bool> {
        let mut catalog = self.catalog.write();
        let before = catalog.permissions.len();
        catalog
            .permissions
            .retain(|p| !(p.account_id == account_id && p.target == target));
        Ok(catalog.permissions.len() != before)
    }

    async fn variables(&self) -> Result<Vec<Variable>> {
        Ok(self.catalog.read().variables.clone())
    }

    async fn insert_connection_log(&self, log: ConnectionLog) -> Result<()> {
        self.logs.write().push(log);
        Ok(())
    }

    async fn connection_logs(&self, limit: usize) -> Result<Vec<ConnectionLog>> {
        Ok(self.logs.read().iter().rev().take(limit).cloned().collect())
    }

    async fn prune_connection_logs(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut logs = self.logs.write();
        let before = logs.len();
        logs.retain(|l| l.created_at >= older_than);
        Ok(before - logs.len())
    }
}
