//! Backend relay
//!
//! Executes a capability against its real backend:
//! - `tool`/`resource` on an `api` app: REST call ([`rest`])
//! - `mcp_tool` on an `mcp` app over HTTP: chained MCP call ([`mcp`])
//! - `mcp_tool` on an `mcp` app over stdio: child process ([`stdio`])
//!
//! Failures are [`RelayError`]s carrying a machine-readable code; the router
//! wraps them into the MCP result instead of failing the JSON-RPC envelope.

pub mod mcp;
pub mod rest;
pub mod stdio;

use std::fmt;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::audit::masking::truncate;
use crate::config::RelayConfig;
use crate::model::{App, Capability, CapabilityKind, IntegrationKind, McpConnection};
use crate::protocol::JsonRpcResponse;
use crate::variables::VariableResolver;

/// Header carrying the daisy-chain depth between gateways
pub const DEPTH_HEADER: &str = "X-AccelMCP-Depth";

/// Depth at which chained MCP relays are refused
pub const MAX_DEPTH: u32 = 10;

/// Per-request relay state
#[derive(Debug, Clone, Default)]
pub struct RelayContext {
    /// Inbound daisy-chain depth
    pub depth: u32,
    /// Variables loaded for this request
    pub variables: VariableResolver,
}

impl RelayContext {
    /// Build from the inbound depth header value (missing or unparsable is 0).
    #[must_use]
    pub fn new(depth_header: Option<&str>, variables: VariableResolver) -> Self {
        Self {
            depth: parse_depth(depth_header),
            variables,
        }
    }
}

/// Parse a depth header value, treating anything invalid as 0.
#[must_use]
pub fn parse_depth(value: Option<&str>) -> u32 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Result of a successful relay
#[derive(Debug, Clone)]
pub enum RelayOutcome {
    /// REST result, wrapped by the router into a text content block
    Value(Value),
    /// Upstream MCP response, returned to the caller unmodified
    Passthrough(JsonRpcResponse),
}

/// Machine-readable relay failure codes
pub mod codes {
    /// Request exceeded the capability timeout
    pub const API_TIMEOUT: &str = "API_TIMEOUT";
    /// Connect or transport failure
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
    /// Chained MCP depth limit reached
    pub const DAISY_CHAIN_DEPTH_EXCEEDED: &str = "DAISY_CHAIN_DEPTH_EXCEEDED";
    /// Missing or invalid backend configuration
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    /// Variable left unresolved before launching a process
    pub const UNRESOLVED_VARIABLE: &str = "UNRESOLVED_VARIABLE";
    /// Upstream MCP server misbehaved
    pub const MCP_PROTOCOL_ERROR: &str = "MCP_PROTOCOL_ERROR";
    /// Child process failed
    pub const PROCESS_ERROR: &str = "PROCESS_ERROR";
    /// Capability kind cannot be relayed for this app
    pub const UNSUPPORTED_CAPABILITY: &str = "UNSUPPORTED_CAPABILITY";
}

/// Structured relay failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayError {
    /// Machine-readable code (`HTTP_404`, `API_TIMEOUT`, ...)
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Truncated backend detail (response body, stderr)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Backend HTTP status, when there was one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

impl RelayError {
    /// Error with a code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            http_status: None,
        }
    }

    /// Attach backend detail
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Non-2xx backend response
    pub fn http(status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        Self {
            code: format!("HTTP_{}", status.as_u16()),
            message: status
                .canonical_reason()
                .unwrap_or("Unknown Status")
                .to_string(),
            detail: Some(body.into()),
            http_status: Some(status.as_u16()),
        }
    }

    /// Map a reqwest transport failure
    pub fn transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(codes::API_TIMEOUT, "Backend request timed out")
        } else {
            Self::new(codes::CONNECTION_ERROR, format!("Backend connection failed: {err}"))
        }
    }

    /// Missing or invalid configuration
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(codes::CONFIG_ERROR, message)
    }

    /// Upstream MCP protocol failure
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(codes::MCP_PROTOCOL_ERROR, message)
    }

    /// JSON form embedded in the MCP result
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn cap_detail(mut self, max_bytes: usize) -> Self {
        if let Some(detail) = self.detail.take() {
            self.detail = Some(truncate(&detail, max_bytes));
        }
        self
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RelayError {}

/// Relay entry point shared by every request
pub struct Relay {
    client: Client,
    config: RelayConfig,
}

impl Relay {
    /// Build the outbound HTTP client.
    pub fn new(config: RelayConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("accel-mcp/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }

    /// Execute a capability with caller arguments.
    pub async fn execute(
        &self,
        ctx: &RelayContext,
        app: &App,
        capability: &Capability,
        arguments: &Value,
    ) -> Result<RelayOutcome, RelayError> {
        debug!(
            app = %app.name,
            capability = %capability.name,
            kind = capability.kind.as_str(),
            depth = ctx.depth,
            "Relaying capability"
        );

        let result = match (app.kind, capability.kind) {
            (IntegrationKind::Api, CapabilityKind::Tool | CapabilityKind::Resource) => {
                rest::call(&self.client, &ctx.variables, app, capability, arguments)
                    .await
                    .map(RelayOutcome::Value)
            }
            (IntegrationKind::Mcp, CapabilityKind::McpTool) => match &app.mcp {
                Some(McpConnection::Http { url }) => {
                    mcp::call(&self.client, ctx, app, url.as_deref(), capability, arguments)
                        .await
                        .map(RelayOutcome::Passthrough)
                }
                Some(connection @ McpConnection::Stdio { .. }) => {
                    stdio::call(&ctx.variables, connection, capability, arguments)
                        .await
                        .map(RelayOutcome::Passthrough)
                }
                None => Err(RelayError::config(format!(
                    "MCP app '{}' has no connection configured",
                    app.name
                ))),
            },
            (app_kind, cap_kind) => Err(RelayError::new(
                codes::UNSUPPORTED_CAPABILITY,
                format!(
                    "Capability kind '{}' cannot be relayed through a {} app",
                    cap_kind.as_str(),
                    match app_kind {
                        IntegrationKind::Api => "api",
                        IntegrationKind::Mcp => "mcp",
                    }
                ),
            )),
        };

        result.map_err(|e| {
            warn!(
                app = %app.name,
                capability = %capability.name,
                code = %e.code,
                error = %e.message,
                "Relay failed"
            );
            telemetry_metrics::counter!("accelmcp_relay_errors_total", "code" => e.code.clone())
                .increment(1);
            e.cap_detail(self.config.max_error_body_bytes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn depth_header_parsing() {
        assert_eq!(parse_depth(None), 0);
        assert_eq!(parse_depth(Some("3")), 3);
        assert_eq!(parse_depth(Some(" 10 ")), 10);
        assert_eq!(parse_depth(Some("abc")), 0);
        assert_eq!(parse_depth(Some("-1")), 0);
    }

    #[test]
    fn http_error_uses_status_code_and_reason() {
        let err = RelayError::http(reqwest::StatusCode::NOT_FOUND, "missing");
        assert_eq!(err.code, "HTTP_404");
        assert_eq!(err.message, "Not Found");
        assert_eq!(err.http_status, Some(404));
        assert_eq!(
            err.to_value(),
            json!({"code": "HTTP_404", "message": "Not Found", "detail": "missing", "http_status": 404})
        );
    }

    #[test]
    fn detail_is_capped() {
        let err = RelayError::new("X", "y")
            .with_detail("a".repeat(5000))
            .cap_detail(1000);
        assert!(err.detail.unwrap().len() <= 1000 + "...[truncated]".len());
    }

    #[tokio::test]
    async fn prompt_capability_is_unsupported() {
        let relay = Relay::new(RelayConfig::default()).unwrap();
        let app: App = serde_json::from_value(json!({"id": 1, "service_id": 1, "name": "A"})).unwrap();
        let cap: Capability =
            serde_json::from_value(json!({"id": 2, "app_id": 1, "name": "p", "kind": "prompt"}))
                .unwrap();
        let err = relay
            .execute(&RelayContext::default(), &app, &cap, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::UNSUPPORTED_CAPABILITY);
    }

    #[tokio::test]
    async fn mcp_app_without_connection_is_config_error() {
        let relay = Relay::new(RelayConfig::default()).unwrap();
        let app: App = serde_json::from_value(
            json!({"id": 1, "service_id": 1, "name": "Remote", "kind": "mcp"}),
        )
        .unwrap();
        let cap: Capability =
            serde_json::from_value(json!({"id": 2, "app_id": 1, "name": "t", "kind": "mcp_tool"}))
                .unwrap();
        let err = relay
            .execute(&RelayContext::default(), &app, &cap, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::CONFIG_ERROR);
    }
}
