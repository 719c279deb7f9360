//! End-to-end tests driving the router with local mock backends

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

use accel_mcp::admin;
use accel_mcp::audit::RequestLogger;
use accel_mcp::config::{LoggingConfig, RelayConfig, ServerConfig};
use accel_mcp::gateway::{AppState, create_router};
use accel_mcp::model::PermissionTarget;
use accel_mcp::relay::Relay;
use accel_mcp::store::{Catalog, MemoryStore, Store};

// ============================================================================
// Mock backend
// ============================================================================

async fn forecast(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "received": body }))
}

async fn lookup(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    Json(json!({ "query": query }))
}

async fn slow_report() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(json!({ "report": "late but complete" }))
}

async fn unavailable() -> impl IntoResponse {
    (StatusCode::SERVICE_UNAVAILABLE, "backend down")
}

/// Minimal upstream MCP server that reports the depth it received.
async fn upstream_mcp(
    State(hits): State<Arc<AtomicUsize>>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    let id = request["id"].clone();
    match request["method"].as_str().unwrap_or_default() {
        "initialize" => {
            let mut response = Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "upstream", "version": "1.0"}
                }
            }))
            .into_response();
            response
                .headers_mut()
                .insert("mcp-session-id", "upstream-session".parse().unwrap());
            response
        }
        "tools/call" => {
            let depth = headers
                .get("x-accelmcp-depth")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("missing")
                .to_string();
            let session = headers
                .get("mcp-session-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("missing")
                .to_string();
            Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "content": [{
                        "type": "text",
                        "text": format!("tool={} depth={depth} session={session}", request["params"]["name"].as_str().unwrap_or_default())
                    }],
                    "isError": false
                }
            }))
            .into_response()
        }
        _ => StatusCode::ACCEPTED.into_response(),
    }
}

async fn spawn_backend() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/forecast", post(forecast))
        .route("/lookup", get(lookup))
        .route("/fail", post(unavailable))
        .route("/slow", post(slow_report))
        .route("/mcp", post(upstream_mcp))
        .with_state(Arc::clone(&hits));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

// ============================================================================
// Gateway harness
// ============================================================================

const CATALOG: &str = r#"
services:
  - id: 1
    identifier: acme
    name: Acme Weather
    description: Weather tools
  - id: 2
    identifier: secure
    name: Secure
    access_control: restricted
  - id: 3
    identifier: sub
    name: Subdomain Service
    routing: subdomain
  - id: 4
    identifier: collide
    name: Collisions
  - id: 5
    identifier: retired
    name: Retired
    enabled: false
apps:
  - id: 10
    service_id: 1
    name: Weather
    base_url: http://BACKEND
  - id: 11
    service_id: 1
    name: Remote
    kind: mcp
    mcp:
      transport: http
      url: http://BACKEND/mcp
  - id: 12
    service_id: 2
    name: Vault
    base_url: http://BACKEND
  - id: 13
    service_id: 3
    name: Weather
    base_url: http://BACKEND
  - id: 20
    service_id: 4
    name: My App
    base_url: http://BACKEND
  - id: 21
    service_id: 4
    name: My_App
    base_url: http://BACKEND
capabilities:
  - id: 100
    app_id: 10
    name: get_forecast
    description: Forecast for a city
    kind: tool
    url: /forecast
    body_params:
      units: "{{UNITS}}"
      limit: "{{LIMIT}}"
  - id: 101
    app_id: 10
    name: premium
    kind: tool
    url: /forecast
    access_control: restricted
  - id: 102
    app_id: 10
    name: lookup
    kind: tool
    url: /lookup
    headers:
      X-HTTP-Method: GET
  - id: 103
    app_id: 10
    name: broken
    kind: tool
    url: /fail
  - id: 104
    app_id: 10
    name: station_info
    kind: resource
    mime_type: text/plain
    content: Station 42, Oslo
  - id: 105
    app_id: 10
    name: daily_brief
    kind: prompt
    description: Daily weather brief
    template: "Write a brief for {{city}}"
    body_params:
      type: object
      properties:
        city:
          type: string
          description: City name
      required: [city]
  - id: 106
    app_id: 10
    name: old_tool
    kind: tool
    url: /forecast
    enabled: false
  - id: 107
    app_id: 10
    name: slow_report
    kind: tool
    url: /slow
    timeout_secs: 10
  - id: 110
    app_id: 11
    name: search
    kind: mcp_tool
  - id: 120
    app_id: 12
    name: open
    kind: tool
    url: /forecast
  - id: 130
    app_id: 13
    name: get_forecast
    kind: tool
    url: /forecast
  - id: 200
    app_id: 20
    name: run
    kind: tool
    url: /forecast
  - id: 210
    app_id: 21
    name: run
    kind: tool
    url: /fail
accounts:
  - id: 7
    name: alice
    token: tok-alice
variables:
  - name: UNITS
    source:
      kind: value
      value: bWV0cmlj
  - name: LIMIT
    source:
      kind: value
      value: NQ==
    type: number
"#;

struct Harness {
    router: Router,
    store: Arc<MemoryStore>,
    logger: Arc<RequestLogger>,
    hits: Arc<AtomicUsize>,
}

async fn harness() -> Harness {
    harness_with(ServerConfig {
        base_domain: Some("mcp.test".to_string()),
        ..ServerConfig::default()
    })
    .await
}

async fn harness_with(server: ServerConfig) -> Harness {
    let (addr, hits) = spawn_backend().await;
    let catalog = Catalog::from_yaml(&CATALOG.replace("BACKEND", &addr.to_string())).unwrap();
    let store = Arc::new(MemoryStore::new(catalog).unwrap());
    let dyn_store: Arc<dyn Store> = store.clone();
    let logger = Arc::new(RequestLogger::start(&LoggingConfig::default(), Arc::clone(&dyn_store)).unwrap());
    let state = Arc::new(AppState {
        store: dyn_store,
        relay: Relay::new(RelayConfig::default()).unwrap(),
        logger: Arc::clone(&logger),
        server,
    });
    Harness {
        router: create_router(state),
        store,
        logger,
        hits,
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl Harness {
    async fn send(&self, request: Request<Body>) -> Reply {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    async fn rpc(&self, uri: &str, token: Option<&str>, body: &Value) -> Reply {
        self.rpc_with(uri, token, &[], body).await
    }

    async fn rpc_with(
        &self,
        uri: &str,
        token: Option<&str>,
        headers: &[(&str, &str)],
        body: &Value,
    ) -> Reply {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn call_tool(&self, uri: &str, token: Option<&str>, name: &str, arguments: Value) -> Reply {
        self.rpc(
            uri,
            token,
            &json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": {"name": name, "arguments": arguments}
            }),
        )
        .await
    }
}

fn request(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params})
}

fn tool_names(reply: &Reply) -> Vec<String> {
    reply.body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect()
}

/// Parse the JSON text block of a `tools/call` result.
fn tool_text(reply: &Reply) -> Value {
    let text = reply.body["result"]["content"][0]["text"].as_str().unwrap();
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

// ============================================================================
// Protocol basics
// ============================================================================

#[tokio::test]
async fn initialize_reports_service_and_session() {
    let h = harness().await;
    let reply = h.rpc("/acme/mcp", None, &request("initialize", json!({}))).await;

    assert_eq!(reply.status, StatusCode::OK);
    let result = &reply.body["result"];
    assert_eq!(result["protocolVersion"], "2025-03-26");
    assert_eq!(result["serverInfo"]["name"], "Acme Weather");
    for kind in ["tools", "resources", "prompts"] {
        assert!(result["capabilities"].get(kind).is_some(), "missing {kind}");
    }
    let header = reply.headers.get("mcp-session-id").unwrap().to_str().unwrap();
    assert_eq!(result["_meta"]["sessionId"], header);
    assert_eq!(reply.body["id"], 1);
}

#[tokio::test]
async fn ping_returns_empty_object() {
    let h = harness().await;
    let reply = h
        .rpc("/acme/mcp", None, &json!({"jsonrpc": "2.0", "id": "p-1", "method": "ping"}))
        .await;
    assert_eq!(reply.body["result"], json!({}));
    assert_eq!(reply.body["id"], "p-1");
}

#[tokio::test]
async fn framing_errors() {
    let h = harness().await;

    let bad_json = h
        .send(
            Request::builder()
                .method("POST")
                .uri("/acme/mcp")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(bad_json.status, StatusCode::BAD_REQUEST);
    assert_eq!(bad_json.body["error"]["code"], -32700);

    let batch = h
        .rpc("/acme/mcp", None, &json!([{"jsonrpc": "2.0", "id": 1, "method": "ping"}]))
        .await;
    assert_eq!(batch.status, StatusCode::BAD_REQUEST);
    assert_eq!(batch.body["error"]["code"], -32600);

    let wrong_version = h
        .rpc("/acme/mcp", None, &json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}))
        .await;
    assert_eq!(wrong_version.body["error"]["code"], -32600);

    let notification = h
        .rpc(
            "/acme/mcp",
            None,
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .await;
    assert_eq!(notification.status, StatusCode::ACCEPTED);
    assert_eq!(notification.body, Value::Null);

    let unknown = h.rpc("/acme/mcp", None, &request("sampling/createMessage", json!({}))).await;
    assert_eq!(unknown.body["error"]["code"], -32601);
}

#[tokio::test]
async fn get_on_mcp_endpoint_is_not_allowed() {
    let h = harness().await;
    let reply = h
        .send(
            Request::builder()
                .method("GET")
                .uri("/acme/mcp")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(reply.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(reply.body["jsonrpc"], "2.0");
    assert!(reply.body["error"]["code"].is_number());
}

#[tokio::test]
async fn health_endpoint() {
    let h = harness().await;
    let reply = h
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["status"], "healthy");
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn unknown_and_disabled_services_are_not_found() {
    let h = harness().await;
    for uri in ["/nope/mcp", "/retired/mcp"] {
        let reply = h.rpc(uri, None, &request("ping", json!({}))).await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(reply.body["error"]["code"], -32004);
    }
}

#[tokio::test]
async fn routing_kind_is_enforced() {
    let h = harness().await;

    // Subdomain service is not reachable by path
    let by_path = h.rpc("/sub/mcp", None, &request("ping", json!({}))).await;
    assert_eq!(by_path.status, StatusCode::NOT_FOUND);
    assert_eq!(by_path.body["error"]["code"], -32004);

    let by_host = h
        .rpc_with("/mcp", None, &[("host", "sub.mcp.test")], &request("ping", json!({})))
        .await;
    assert_eq!(by_host.status, StatusCode::OK);

    // Path service is not reachable through its subdomain
    let path_by_host = h
        .rpc_with("/mcp", None, &[("host", "acme.mcp.test")], &request("ping", json!({})))
        .await;
    assert_eq!(path_by_host.status, StatusCode::NOT_FOUND);

    // ...but the fallback reaches either kind
    let fallback = h.rpc("/mcp?service=acme", None, &request("ping", json!({}))).await;
    assert_eq!(fallback.status, StatusCode::OK);
    let header_fallback = h
        .rpc_with("/mcp", None, &[("x-mcp-service", "sub")], &request("ping", json!({})))
        .await;
    assert_eq!(header_fallback.status, StatusCode::OK);
}

#[tokio::test]
async fn single_app_endpoint_uses_raw_names() {
    let h = harness().await;
    let reply = h.rpc("/acme/apps/Weather/mcp", None, &request("tools/list", json!({}))).await;
    let names = tool_names(&reply);
    assert!(names.contains(&"get_forecast".to_string()));
    assert!(names.iter().all(|n| !n.contains(':')));

    let call = h
        .call_tool("/acme/apps/Weather/mcp", None, "get_forecast", json!({"city": "Oslo"}))
        .await;
    assert_eq!(call.body["result"]["isError"], false);

    // Remote app's tools are not visible here
    let other = h
        .call_tool("/acme/apps/Weather/mcp", None, "search", json!({}))
        .await;
    assert_eq!(other.body["error"]["code"], -32602);

    let missing = h.rpc("/acme/apps/Nope/mcp", None, &request("tools/list", json!({}))).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.body["error"]["code"], -32004);
}

#[tokio::test]
async fn host_routed_single_app_endpoint() {
    let h = harness().await;
    let reply = h
        .rpc_with(
            "/mcp/apps/Weather",
            None,
            &[("host", "sub.mcp.test:39400")],
            &request("tools/list", json!({})),
        )
        .await;
    assert_eq!(tool_names(&reply), vec!["get_forecast".to_string()]);
}

// ============================================================================
// Tools
// ============================================================================

#[tokio::test]
async fn tools_list_is_namespaced_filtered_and_idempotent() {
    let h = harness().await;
    let first = h.rpc("/acme/mcp", None, &request("tools/list", json!({}))).await;
    let second = h.rpc("/acme/mcp", None, &request("tools/list", json!({}))).await;
    assert_eq!(first.body, second.body);

    let names = tool_names(&first);
    assert!(names.contains(&"Weather:get_forecast".to_string()));
    assert!(names.contains(&"Remote:search".to_string()));
    // Restricted capability hidden from anonymous callers, disabled ones hidden always
    assert!(!names.contains(&"Weather:premium".to_string()));
    assert!(!names.contains(&"Weather:old_tool".to_string()));
    // Resources and prompts are not tools
    assert!(!names.contains(&"Weather:station_info".to_string()));

    let forecast = first.body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["name"] == "Weather:get_forecast")
        .unwrap();
    // Legacy flat body params produce an empty object schema
    assert_eq!(forecast["inputSchema"], json!({"type": "object", "properties": {}}));
}

#[tokio::test]
async fn anonymous_tool_call_succeeds_and_is_logged() {
    let h = harness().await;
    let reply = h
        .call_tool("/acme/mcp", None, "Weather:get_forecast", json!({"city": "Oslo"}))
        .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["result"]["isError"], false);
    assert_eq!(reply.body["result"]["content"][0]["type"], "text");
    let received = &tool_text(&reply)["received"];
    assert_eq!(received["city"], "Oslo");
    assert_eq!(received["units"], "metric");
    // Number-typed variable arrives as a JSON number
    assert_eq!(received["limit"], json!(5));

    h.logger.shutdown().await;
    let logs = h.store.connection_logs(10).await.unwrap();
    let log = logs.iter().find(|l| l.method == "tools/call").unwrap();
    assert!(log.is_success);
    assert_eq!(log.service_identifier, "acme");
    assert_eq!(log.app_name.as_deref(), Some("Weather"));
    assert_eq!(log.capability_name.as_deref(), Some("get_forecast"));
    assert_eq!(log.account_name, None);
    assert_eq!(log.status_code, 200);
}

#[tokio::test]
async fn get_method_sends_arguments_as_query() {
    let h = harness().await;
    let reply = h
        .call_tool("/acme/mcp", None, "Weather:lookup", json!({"q": "rain", "n": 2}))
        .await;
    let query = &tool_text(&reply)["query"];
    assert_eq!(query["q"], "rain");
    assert_eq!(query["n"], "2");
}

#[tokio::test]
async fn backend_failure_is_reported_in_result() {
    let h = harness().await;
    let reply = h
        .call_tool("/acme/mcp", None, "Weather:broken", json!({}))
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["result"]["isError"], true);
    let error = &tool_text(&reply)["error"];
    assert_eq!(error["code"], "HTTP_503");

    h.logger.shutdown().await;
    let logs = h.store.connection_logs(10).await.unwrap();
    let log = logs.iter().find(|l| l.method == "tools/call").unwrap();
    assert!(!log.is_success);
    assert_eq!(log.error_code.as_deref(), Some("HTTP_503"));
}

#[tokio::test]
async fn capability_timeout_outlives_server_request_timeout() {
    let h = harness_with(ServerConfig {
        request_timeout: Duration::from_secs(1),
        ..ServerConfig::default()
    })
    .await;
    let reply = h
        .call_tool("/acme/mcp", None, "Weather:slow_report", json!({}))
        .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["result"]["isError"], false);
    assert_eq!(tool_text(&reply)["report"], "late but complete");

    h.logger.shutdown().await;
    let logs = h.store.connection_logs(10).await.unwrap();
    let log = logs.iter().find(|l| l.method == "tools/call").unwrap();
    assert!(log.is_success);
    assert_eq!(log.capability_name.as_deref(), Some("slow_report"));
}

#[tokio::test]
async fn tool_call_parameter_errors() {
    let h = harness().await;
    let missing = h
        .rpc("/acme/mcp", None, &request("tools/call", json!({"arguments": {}})))
        .await;
    assert_eq!(missing.body["error"]["code"], -32602);

    let unknown = h
        .call_tool("/acme/mcp", None, "Weather:nope", json!({}))
        .await;
    assert_eq!(unknown.body["error"]["code"], -32602);
}

#[tokio::test]
async fn colliding_sanitized_names_resolve_to_first_app() {
    let h = harness().await;
    let list = h.rpc("/collide/mcp", None, &request("tools/list", json!({}))).await;
    assert_eq!(
        tool_names(&list),
        vec!["My_App:run".to_string(), "My_App:run".to_string()]
    );

    // "My App" (id 20) comes first and points at a healthy endpoint
    let reply = h.call_tool("/collide/mcp", None, "My_App:run", json!({})).await;
    assert_eq!(reply.body["result"]["isError"], false);
}

// ============================================================================
// Authentication and permissions
// ============================================================================

#[tokio::test]
async fn restricted_service_requires_token() {
    let h = harness().await;
    let reply = h.rpc("/secure/mcp", None, &request("initialize", json!({}))).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.body["error"]["code"], -32001);
    assert_eq!(reply.body["id"], 1);
    assert_eq!(reply.headers.get("www-authenticate").unwrap(), "Bearer");

    let bad = h.rpc("/secure/mcp", Some("wrong"), &request("ping", json!({}))).await;
    assert_eq!(bad.status, StatusCode::UNAUTHORIZED);

    // Authenticated but without a service grant
    let ok = h.rpc("/secure/mcp", Some("tok-alice"), &request("initialize", json!({}))).await;
    assert_eq!(ok.status, StatusCode::OK);
    let denied = h.rpc("/secure/mcp", Some("tok-alice"), &request("tools/list", json!({}))).await;
    assert_eq!(denied.body["error"]["code"], -32003);

    admin::grant_permission(h.store.as_ref(), "root", 7, PermissionTarget::McpService(2))
        .await
        .unwrap();
    let allowed = h.rpc("/secure/mcp", Some("tok-alice"), &request("tools/list", json!({}))).await;
    assert_eq!(tool_names(&allowed), vec!["Vault:open".to_string()]);
}

#[tokio::test]
async fn restricted_capability_needs_grant_on_capability() {
    let h = harness().await;

    let anonymous = h.call_tool("/acme/mcp", None, "Weather:premium", json!({})).await;
    assert_eq!(anonymous.body["error"]["code"], -32003);

    let ungranted = h
        .call_tool("/acme/mcp", Some("tok-alice"), "Weather:premium", json!({}))
        .await;
    assert_eq!(ungranted.body["error"]["code"], -32003);

    // A grant on the App does not cascade to the restricted capability
    admin::grant_permission(h.store.as_ref(), "root", 7, PermissionTarget::App(10))
        .await
        .unwrap();
    let app_only = h
        .call_tool("/acme/mcp", Some("tok-alice"), "Weather:premium", json!({}))
        .await;
    assert_eq!(app_only.body["error"]["code"], -32003);

    admin::grant_permission(h.store.as_ref(), "root", 7, PermissionTarget::Capability(101))
        .await
        .unwrap();
    let granted = h
        .call_tool("/acme/mcp", Some("tok-alice"), "Weather:premium", json!({}))
        .await;
    assert_eq!(granted.body["result"]["isError"], false);

    let list = h.rpc("/acme/mcp", Some("tok-alice"), &request("tools/list", json!({}))).await;
    assert!(tool_names(&list).contains(&"Weather:premium".to_string()));

    // Revocation applies on the next request
    admin::revoke_permission(h.store.as_ref(), "root", 7, PermissionTarget::Capability(101))
        .await
        .unwrap();
    let revoked = h
        .call_tool("/acme/mcp", Some("tok-alice"), "Weather:premium", json!({}))
        .await;
    assert_eq!(revoked.body["error"]["code"], -32003);
}

#[tokio::test]
async fn public_service_treats_unknown_token_as_anonymous() {
    let h = harness().await;
    let reply = h
        .call_tool("/acme/mcp", Some("not-a-token"), "Weather:get_forecast", json!({}))
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["result"]["isError"], false);
}

// ============================================================================
// MCP relay
// ============================================================================

#[tokio::test]
async fn mcp_tool_passes_upstream_result_through() {
    let h = harness().await;
    let reply = h
        .rpc_with(
            "/acme/mcp",
            None,
            &[("x-accelmcp-depth", "3")],
            &json!({
                "jsonrpc": "2.0",
                "id": "outer-7",
                "method": "tools/call",
                "params": {"name": "Remote:search", "arguments": {"q": "x"}}
            }),
        )
        .await;
    assert_eq!(reply.body["id"], "outer-7");
    assert_eq!(reply.body["result"]["isError"], false);
    assert_eq!(
        reply.body["result"]["content"][0]["text"],
        "tool=search depth=4 session=upstream-session"
    );
    assert!(h.hits.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn depth_limit_stops_chain_without_outbound_call() {
    let h = harness().await;
    let reply = h
        .rpc_with(
            "/acme/mcp",
            None,
            &[("x-accelmcp-depth", "10")],
            &request("tools/call", json!({"name": "Remote:search", "arguments": {}})),
        )
        .await;
    assert_eq!(reply.body["result"]["isError"], true);
    assert_eq!(tool_text(&reply)["error"]["code"], "DAISY_CHAIN_DEPTH_EXCEEDED");
    assert_eq!(h.hits.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Resources and prompts
// ============================================================================

#[tokio::test]
async fn resources_list_and_read() {
    let h = harness().await;
    let list = h.rpc("/acme/mcp", None, &request("resources/list", json!({}))).await;
    let resources = list.body["result"]["resources"].as_array().unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0]["uri"], "resource://Weather/station_info");
    assert_eq!(resources[0]["mimeType"], "text/plain");

    let read = h
        .rpc(
            "/acme/mcp",
            None,
            &request("resources/read", json!({"uri": "resource://Weather/station_info"})),
        )
        .await;
    let contents = &read.body["result"]["contents"][0];
    assert_eq!(contents["text"], "Station 42, Oslo");
    assert_eq!(contents["uri"], "resource://Weather/station_info");

    let unknown = h
        .rpc("/acme/mcp", None, &request("resources/read", json!({"uri": "resource://x/y"})))
        .await;
    assert_eq!(unknown.body["error"]["code"], -32602);

    let missing = h.rpc("/acme/mcp", None, &request("resources/read", json!({}))).await;
    assert_eq!(missing.body["error"]["code"], -32602);
}

#[tokio::test]
async fn prompts_list_and_get() {
    let h = harness().await;
    let list = h.rpc("/acme/mcp", None, &request("prompts/list", json!({}))).await;
    let prompt = &list.body["result"]["prompts"][0];
    assert_eq!(prompt["name"], "Weather:daily_brief");
    assert_eq!(prompt["description"], "Daily weather brief");
    assert_eq!(prompt["arguments"][0]["name"], "city");
    assert_eq!(prompt["arguments"][0]["required"], true);

    let get = h
        .rpc(
            "/acme/mcp",
            None,
            &request(
                "prompts/get",
                json!({"name": "Weather:daily_brief", "arguments": {"city": "Bergen"}}),
            ),
        )
        .await;
    let message = &get.body["result"]["messages"][0];
    assert_eq!(message["role"], "user");
    assert_eq!(message["content"]["text"], "Write a brief for Bergen");

    let unknown = h
        .rpc("/acme/mcp", None, &request("prompts/get", json!({"name": "Weather:nope"})))
        .await;
    assert_eq!(unknown.body["error"]["code"], -32602);
}

// ============================================================================
// Connection logging
// ============================================================================

#[tokio::test]
async fn logged_bodies_are_masked() {
    let h = harness().await;
    h.call_tool(
        "/acme/mcp",
        None,
        "Weather:get_forecast",
        json!({"card": "4111 1111 1111 1111", "email": "alice@example.com"}),
    )
    .await;

    h.logger.shutdown().await;
    let logs = h.store.connection_logs(10).await.unwrap();
    let log = logs.iter().find(|l| l.method == "tools/call").unwrap();
    assert!(!log.request_body.contains("4111 1111 1111 1111"));
    assert!(log.request_body.contains("[CARD]"));
    assert!(!log.request_body.contains("alice@example.com"));
    // The backend echoes the arguments, so the response is masked too
    assert!(!log.response_body.contains("4111 1111 1111 1111"));
}

#[tokio::test]
async fn rejected_requests_are_logged() {
    let h = harness().await;
    h.rpc("/secure/mcp", None, &request("tools/list", json!({}))).await;
    h.logger.shutdown().await;

    let logs = h.store.connection_logs(10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].service_identifier, "secure");
    assert_eq!(logs[0].status_code, 401);
    assert_eq!(logs[0].error_code.as_deref(), Some("-32001"));
}
