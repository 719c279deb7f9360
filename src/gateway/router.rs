//! HTTP router and JSON-RPC framing

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{debug, warn};

use super::auth;
use super::dispatch::{McpHandler, Scope};
use crate::audit::{LogRecordBuilder, RequestLogger};
use crate::config::ServerConfig;
use crate::error::rpc_codes;
use crate::model::{App, McpService, RoutingKind};
use crate::protocol::{JsonRpcResponse, RequestId};
use crate::relay::{DEPTH_HEADER, Relay};
use crate::store::Store;
use crate::{Error, Result};

/// Fallback header naming the service on `/mcp` endpoints
pub const SERVICE_HEADER: &str = "X-MCP-Service";

/// Session header returned by `initialize`
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Shared application state
pub struct AppState {
    /// Catalog, grants, variables and log sink
    pub store: Arc<dyn Store>,
    /// Outbound relay
    pub relay: Relay,
    /// Connection logger
    pub logger: Arc<RequestLogger>,
    /// Server settings (routing, body limit)
    pub server: ServerConfig,
}

/// Which endpoint family received the request
#[derive(Debug, Clone)]
enum Addressing {
    /// `/{identifier}/...`
    Path(String),
    /// `/mcp...`: host subdomain, or the fallback query/header
    Host,
}

/// Where the service identifier actually came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NamedBy {
    Path,
    Subdomain,
    Fallback,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/mcp", post(host_service_handler).get(method_not_allowed))
        .route(
            "/mcp/apps/{app}",
            post(host_app_handler).get(method_not_allowed),
        )
        .route(
            "/{identifier}/mcp",
            post(path_service_handler).get(method_not_allowed),
        )
        .route(
            "/{identifier}/apps/{app}/mcp",
            post(path_app_handler).get(method_not_allowed),
        )
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// No SSE stream is offered on MCP endpoints
async fn method_not_allowed() -> Response {
    let rpc = JsonRpcResponse::error(
        None,
        rpc_codes::INVALID_REQUEST,
        "Method not allowed: MCP endpoints accept POST only",
    );
    let mut response = (StatusCode::METHOD_NOT_ALLOWED, Json(rpc)).into_response();
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("POST"));
    response
}

async fn path_service_handler(
    State(state): State<Arc<AppState>>,
    Path(identifier): Path<String>,
    request: Request,
) -> Response {
    handle(&state, Addressing::Path(identifier), None, request).await
}

async fn path_app_handler(
    State(state): State<Arc<AppState>>,
    Path((identifier, app)): Path<(String, String)>,
    request: Request,
) -> Response {
    handle(&state, Addressing::Path(identifier), Some(app), request).await
}

async fn host_service_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    handle(&state, Addressing::Host, None, request).await
}

async fn host_app_handler(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
    request: Request,
) -> Response {
    handle(&state, Addressing::Host, Some(app), request).await
}

/// One MCP exchange: resolve, authenticate, parse, dispatch, log.
async fn handle(
    state: &AppState,
    addressing: Addressing,
    app_name: Option<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let identifier = requested_identifier(&addressing, &parts, &state.server);
    let hint = identifier.as_ref().map(|(id, _)| id.clone()).unwrap_or_default();
    let mut record = LogRecordBuilder::new(hint, "unknown")
        .client_ip(client_ip(&parts))
        .app(app_name.as_deref());

    // Only receiving the body is bounded here; relays carry their own timeouts.
    let read = tokio::time::timeout(
        state.server.request_timeout,
        axum::body::to_bytes(body, state.server.max_body_size),
    )
    .await;

    let (status, rpc, session_id) = match read {
        Ok(Ok(bytes)) => {
            record = record.request_body(String::from_utf8_lossy(&bytes));
            let (method, outcome) = exchange(state, identifier, app_name, &parts, &bytes).await;
            record = record.method(method.as_str());
            telemetry_metrics::counter!("accelmcp_requests_total", "method" => method)
                .increment(1);
            match outcome {
                Exchange::Accepted { account } => {
                    record = record.account(account.as_deref()).status(202);
                    state.logger.submit(record.build());
                    return StatusCode::ACCEPTED.into_response();
                }
                Exchange::Answered {
                    status,
                    rpc,
                    session_id,
                    account,
                    app,
                    capability,
                    failure,
                } => {
                    record = record
                        .account(account.as_deref())
                        .capability(capability.as_deref());
                    if app.is_some() {
                        record = record.app(app.as_deref());
                    }
                    if let Some((code, message)) = failure {
                        record = record.error(code, message);
                    }
                    (status, rpc, session_id)
                }
            }
        }
        Ok(Err(e)) => {
            let rpc = JsonRpcResponse::error(
                None,
                rpc_codes::PARSE_ERROR,
                format!("Failed to read body: {e}"),
            );
            record = record.error(rpc_codes::PARSE_ERROR.to_string(), e.to_string());
            (StatusCode::BAD_REQUEST, rpc, None)
        }
        Err(_) => {
            let message = format!(
                "Request body not received within {}s",
                state.server.request_timeout.as_secs()
            );
            warn!(timeout = ?state.server.request_timeout, "Timed out reading request body");
            let rpc = JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, message.clone());
            record = record.error(rpc_codes::INVALID_REQUEST.to_string(), message);
            (StatusCode::REQUEST_TIMEOUT, rpc, None)
        }
    };

    let body = serde_json::to_string(&rpc).unwrap_or_default();
    record = record.response_body(body.clone()).status(status.as_u16());
    state.logger.submit(record.build());

    build_response(status, body, session_id.as_deref())
}

/// Outcome of an exchange before it is rendered
enum Exchange {
    /// Notification or id-less message
    Accepted { account: Option<String> },
    /// A JSON-RPC response to send back
    Answered {
        status: StatusCode,
        rpc: JsonRpcResponse,
        session_id: Option<String>,
        account: Option<String>,
        app: Option<String>,
        capability: Option<String>,
        failure: Option<(String, String)>,
    },
}

impl Exchange {
    fn rejected(status: StatusCode, rpc: JsonRpcResponse, account: Option<String>) -> Self {
        let failure = rpc
            .error
            .as_ref()
            .map(|e| (e.code.to_string(), e.message.clone()));
        Self::Answered {
            status,
            rpc,
            session_id: None,
            account,
            app: None,
            capability: None,
            failure,
        }
    }

    fn from_error(id: Option<RequestId>, err: &Error) -> Self {
        let code = err.to_rpc_code();
        if code == rpc_codes::INTERNAL_ERROR {
            warn!(error = %err, "Request failed before dispatch");
        }
        Self::rejected(
            status_for(code),
            JsonRpcResponse::error(id, code, err.to_string()),
            None,
        )
    }
}

/// Returns the method name (for logs and metrics) and the outcome.
async fn exchange(
    state: &AppState,
    identifier: Option<(String, NamedBy)>,
    app_name: Option<String>,
    parts: &Parts,
    bytes: &Bytes,
) -> (String, Exchange) {
    let parsed: std::result::Result<Value, serde_json::Error> = serde_json::from_slice(bytes);
    let early_id = parsed
        .as_ref()
        .ok()
        .and_then(|v| v.get("id"))
        .and_then(extract_request_id);
    let early_method = parsed
        .as_ref()
        .ok()
        .and_then(|v| v.get("method"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let (service, scope) =
        match resolve_target(state, identifier, app_name).await {
            Ok(target) => target,
            Err(e) => return (early_method, Exchange::from_error(early_id, &e)),
        };

    let caller = match auth::authenticate(state.store.as_ref(), &service, &parts.headers).await {
        Ok(caller) => caller,
        Err(e) => return (early_method, Exchange::from_error(early_id, &e)),
    };
    let account = caller.as_ref().map(|a| a.name.clone());

    let value = match parsed {
        Ok(value) => value,
        Err(e) => {
            let rpc = JsonRpcResponse::error(
                None,
                rpc_codes::PARSE_ERROR,
                format!("Invalid JSON: {e}"),
            );
            return (
                early_method,
                Exchange::rejected(StatusCode::BAD_REQUEST, rpc, account),
            );
        }
    };

    if value.is_array() {
        let rpc = JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Batch requests are not supported",
        );
        return (
            "batch".to_string(),
            Exchange::rejected(StatusCode::BAD_REQUEST, rpc, account),
        );
    }

    let (id, method, params) = match parse_request(&value) {
        Ok(parsed) => parsed,
        Err(rpc) => {
            return (
                early_method,
                Exchange::rejected(StatusCode::BAD_REQUEST, rpc, account),
            );
        }
    };

    let Some(id) = id.filter(|_| !is_notification_method(&method)) else {
        debug!(service = %service.identifier, method = %method, "Notification accepted");
        return (method, Exchange::Accepted { account });
    };

    let depth = parts
        .headers
        .get(DEPTH_HEADER)
        .and_then(|v| v.to_str().ok());
    let handler = McpHandler::new(state, &service, caller.as_ref(), &scope, depth);
    let dispatched = handler.dispatch(id, &method, params).await;

    let answered = Exchange::Answered {
        status: StatusCode::OK,
        rpc: dispatched.response,
        session_id: dispatched.session_id,
        account,
        app: dispatched.app,
        capability: dispatched.capability,
        failure: dispatched.failure,
    };
    (method, answered)
}

/// Identifier named by the request, before any store lookup.
fn requested_identifier(
    addressing: &Addressing,
    parts: &Parts,
    server: &ServerConfig,
) -> Option<(String, NamedBy)> {
    match addressing {
        Addressing::Path(identifier) => Some((identifier.clone(), NamedBy::Path)),
        Addressing::Host => host_header(parts)
            .zip(server.base_domain.as_deref())
            .and_then(|(host, base)| subdomain_identifier(host, base))
            .map(|id| (id.to_string(), NamedBy::Subdomain))
            .or_else(|| {
                server
                    .routing_fallback
                    .then(|| fallback_identifier(parts))
                    .flatten()
                    .map(|id| (id, NamedBy::Fallback))
            }),
    }
}

/// Look up the service (and App for single-App endpoints), enforcing
/// routing kind and enabled state.
async fn resolve_target(
    state: &AppState,
    identifier: Option<(String, NamedBy)>,
    app_name: Option<String>,
) -> Result<(McpService, Scope)> {
    let (identifier, named_by) = identifier
        .ok_or_else(|| Error::ServiceNotFound("no service named by host or request".into()))?;
    let not_found = || Error::ServiceNotFound(identifier.clone());

    let service = state
        .store
        .service_by_identifier(&identifier)
        .await?
        .filter(|s| s.enabled)
        .ok_or_else(not_found)?;

    let reachable = match (named_by, service.routing) {
        (NamedBy::Fallback, _)
        | (NamedBy::Path, RoutingKind::Path)
        | (NamedBy::Subdomain, RoutingKind::Subdomain) => true,
        (NamedBy::Path, RoutingKind::Subdomain) | (NamedBy::Subdomain, RoutingKind::Path) => false,
    };
    if !reachable {
        debug!(service = %identifier, routing = ?service.routing, "Routing kind mismatch");
        return Err(not_found());
    }

    let scope = match app_name {
        None => Scope::Aggregate,
        Some(name) => {
            let app: App = state
                .store
                .app_by_name(service.id, &name)
                .await?
                .filter(|a| a.enabled)
                .ok_or_else(|| Error::ServiceNotFound(format!("{identifier}/apps/{name}")))?;
            Scope::SingleApp(app)
        }
    };
    Ok((service, scope))
}

fn host_header(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.host())
}

/// `<identifier>.<base_domain>` (port ignored) yields `identifier`.
fn subdomain_identifier<'h>(host: &'h str, base_domain: &str) -> Option<&'h str> {
    let host = host.split(':').next().unwrap_or(host);
    let base = base_domain.trim_matches('.');
    let label = host
        .strip_suffix(base)?
        .strip_suffix('.')
        .filter(|l| !l.is_empty() && !l.contains('.'))?;
    Some(label)
}

/// `?service=` query parameter, then the `X-MCP-Service` header.
fn fallback_identifier(parts: &Parts) -> Option<String> {
    parts
        .uri
        .query()
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "service")
                .map(|(_, v)| v.into_owned())
        })
        .or_else(|| {
            parts
                .headers
                .get(SERVICE_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .filter(|s| !s.is_empty())
}

/// Caller address: first `X-Forwarded-For` hop, `X-Real-IP`, then the socket.
fn client_ip(parts: &Parts) -> Option<String> {
    forwarded_ip(&parts.headers).or_else(|| {
        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    })
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(String::from)
}

/// HTTP status for errors raised before dispatch.
fn status_for(code: i32) -> StatusCode {
    match code {
        rpc_codes::PARSE_ERROR | rpc_codes::INVALID_REQUEST => StatusCode::BAD_REQUEST,
        rpc_codes::AUTHENTICATION_REQUIRED => StatusCode::UNAUTHORIZED,
        rpc_codes::SERVICE_NOT_FOUND => StatusCode::NOT_FOUND,
        rpc_codes::INTERNAL_ERROR => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    }
}

/// Render a JSON-RPC body, adding the session and auth challenge headers.
fn build_response(status: StatusCode, body: String, session_id: Option<&str>) -> Response {
    let mut response = (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response();
    if let Some(value) = session_id.and_then(|s| HeaderValue::from_str(s).ok()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    if status == StatusCode::UNAUTHORIZED {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    }
    response
}

/// Extract a `RequestId` from a JSON value.
///
/// Supports string and integer ids. Returns `None` for anything else.
fn extract_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .map(RequestId::Number),
        _ => None,
    }
}

/// Check whether a method name represents a notification (no response expected).
fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Parse a JSON-RPC request or notification.
///
/// Returns (id, method, params); id is `None` for notifications and
/// id-less messages, which are accepted without a response.
#[allow(clippy::result_large_err)] // JsonRpcResponse used directly as HTTP error body
fn parse_request(
    value: &Value,
) -> std::result::Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    if !value.is_object() {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Request must be a JSON object",
        ));
    }

    let id = value.get("id").and_then(extract_request_id);

    let jsonrpc = value.get("jsonrpc").and_then(Value::as_str);
    if jsonrpc != Some("2.0") {
        return Err(JsonRpcResponse::error(
            id,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method"))?;

    let params = value.get("params").cloned();

    Ok((id, method.to_string(), params))
}
