//! Bearer authentication against connection accounts
//!
//! - Restricted service: a valid token for an enabled account is required,
//!   for every method including `initialize`.
//! - Public service: no token means anonymous; an unknown token is logged
//!   and also treated as anonymous.

use axum::http::HeaderMap;
use tracing::{debug, warn};

use crate::model::{ConnectionAccount, McpService};
use crate::store::Store;
use crate::{Error, Result};

/// Extract the token from `Authorization: Bearer <token>`.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the caller for a service.
///
/// Returns `Ok(None)` for anonymous callers of public services and
/// [`Error::Unauthenticated`] when a restricted service has no valid caller.
pub async fn authenticate(
    store: &dyn Store,
    service: &McpService,
    headers: &HeaderMap,
) -> Result<Option<ConnectionAccount>> {
    let restricted = service.access_control.is_restricted();

    let Some(token) = bearer_token(headers) else {
        if restricted {
            return Err(Error::Unauthenticated(
                "Missing Authorization header. Use: Authorization: Bearer <token>".to_string(),
            ));
        }
        return Ok(None);
    };

    let account = store
        .account_by_token(token)
        .await?
        .filter(|a| a.enabled);

    match account {
        Some(account) => {
            debug!(account = %account.name, service = %service.identifier, "Authenticated");
            Ok(Some(account))
        }
        None if restricted => Err(Error::Unauthenticated("Invalid token".to_string())),
        None => {
            warn!(service = %service.identifier, "Unknown bearer token on public service, continuing anonymously");
            Ok(None)
        }
    }
}
