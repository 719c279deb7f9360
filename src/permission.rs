//! Three-tier permission evaluator
//!
//! Each tier (MCP Service, App, Capability) carries its own access control.
//! A `restricted` tier requires a grant targeting exactly that entity; grants
//! never cascade downwards. Grants are read from the store on every call.

use std::fmt;

use tracing::warn;

use crate::model::{App, Capability, ConnectionAccount, McpService, PermissionTarget};
use crate::store::Store;

/// Tier of the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// MCP Service
    Service,
    /// App
    App,
    /// Capability
    Capability,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Service => "mcp_service",
            Self::App => "app",
            Self::Capability => "capability",
        })
    }
}

/// Reason a call was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// The entity at this tier is disabled
    Disabled(Tier),
    /// The tier is restricted and the caller holds no grant on it
    MissingGrant(Tier),
}

impl Denial {
    /// Tier that denied
    #[must_use]
    pub fn tier(self) -> Tier {
        match self {
            Self::Disabled(tier) | Self::MissingGrant(tier) => tier,
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled(tier) => write!(f, "{tier} is disabled"),
            Self::MissingGrant(tier) => write!(f, "no grant on restricted {tier}"),
        }
    }
}

/// Evaluate the given tiers for a caller.
///
/// Tiers are checked in order Service, App, Capability; the first failing
/// tier is reported. A disabled account counts as no caller.
pub async fn check(
    store: &dyn Store,
    caller: Option<&ConnectionAccount>,
    service: &McpService,
    app: Option<&App>,
    capability: Option<&Capability>,
) -> Result<(), Denial> {
    let caller = caller.filter(|a| a.enabled);

    let tiers = [
        Some((
            Tier::Service,
            service.enabled,
            service.access_control.is_restricted(),
            PermissionTarget::McpService(service.id),
        )),
        app.map(|a| {
            (
                Tier::App,
                a.enabled,
                a.access_control.is_restricted(),
                PermissionTarget::App(a.id),
            )
        }),
        capability.map(|c| {
            (
                Tier::Capability,
                c.enabled,
                c.access_control.is_restricted(),
                PermissionTarget::Capability(c.id),
            )
        }),
    ];

    for (tier, enabled, restricted, target) in tiers.into_iter().flatten() {
        if !enabled {
            return Err(Denial::Disabled(tier));
        }
        if !restricted {
            continue;
        }
        let Some(account) = caller else {
            return Err(Denial::MissingGrant(tier));
        };
        match store.has_grant(account.id, target).await {
            Ok(true) => {}
            Ok(false) => return Err(Denial::MissingGrant(tier)),
            Err(e) => {
                warn!(error = %e, target = %target, "Grant lookup failed, denying");
                return Err(Denial::MissingGrant(tier));
            }
        }
    }
    Ok(())
}

/// Boolean form of [`check`].
pub async fn authorize(
    store: &dyn Store,
    caller: Option<&ConnectionAccount>,
    service: &McpService,
    app: Option<&App>,
    capability: Option<&Capability>,
) -> bool {
    check(store, caller, service, app, capability).await.is_ok()
}
