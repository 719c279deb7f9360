//! Chained MCP relay over Streamable HTTP
//!
//! Each hop forwards `X-AccelMCP-Depth + 1`; a request arriving at
//! [`MAX_DEPTH`] is refused before any outbound call, which bounds loops
//! between services that relay to each other.

use std::collections::BTreeMap;

use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{MAX_DEPTH, RelayContext, RelayError, codes};
use crate::model::{App, Capability};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId};

/// Session header shared with upstream MCP servers
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Relay a `tools/call` to an upstream MCP server.
pub async fn call(
    client: &Client,
    ctx: &RelayContext,
    app: &App,
    url: Option<&str>,
    capability: &Capability,
    arguments: &Value,
) -> Result<JsonRpcResponse, RelayError> {
    if ctx.depth >= MAX_DEPTH {
        return Err(RelayError::new(
            codes::DAISY_CHAIN_DEPTH_EXCEEDED,
            format!("Daisy-chain depth {} reached the limit of {MAX_DEPTH}", ctx.depth),
        ));
    }

    let url = url
        .map(|u| ctx.variables.resolve_string(u))
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| {
            RelayError::config(format!("MCP app '{}' has no server URL", app.name))
        })?;

    let mut headers = base_headers(&ctx.variables.resolve_map(&app.headers), ctx.depth + 1);
    let exchange = async {
        if !headers.contains_key(SESSION_HEADER) {
            let session = initialize(client, &url, &headers).await?;
            if let Some(session) = session {
                headers.insert(HeaderName::from_static("mcp-session-id"), session);
            }
            notify_initialized(client, &url, &headers).await;
        }

        let request = JsonRpcRequest::new(
            RequestId::Number(1),
            "tools/call",
            Some(json!({"name": capability.name, "arguments": arguments})),
        );
        let (_, response) = send(client, &url, &headers, &request).await?;
        Ok::<_, RelayError>(response)
    };

    tokio::time::timeout(capability.timeout(), exchange)
        .await
        .unwrap_or_else(|_| Err(RelayError::new(codes::API_TIMEOUT, "MCP relay timed out")))
}

fn base_headers(app_headers: &BTreeMap<String, String>, forward_depth: u32) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/event-stream"),
    );
    headers.insert(
        HeaderName::from_static("mcp-protocol-version"),
        HeaderValue::from_static(PROTOCOL_VERSION),
    );
    for (key, value) in app_headers {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(k), Ok(v)) => {
                headers.insert(k, v);
            }
            _ => warn!(header = %key, "Skipping invalid header"),
        }
    }
    headers.insert(
        HeaderName::from_static("x-accelmcp-depth"),
        HeaderValue::from(forward_depth),
    );
    headers
}

async fn initialize(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
) -> Result<Option<HeaderValue>, RelayError> {
    let request = JsonRpcRequest::new(
        RequestId::Number(0),
        "initialize",
        Some(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "accel-mcp",
                "version": env!("CARGO_PKG_VERSION")
            }
        })),
    );
    let (response_headers, response) = send(client, url, headers, &request).await?;
    if let Some(error) = response.error {
        return Err(RelayError::protocol(format!(
            "Upstream initialize failed: {}",
            error.message
        )));
    }
    let session = response_headers.get(SESSION_HEADER).cloned();
    debug!(url = %url, has_session = session.is_some(), "Upstream MCP session initialized");
    Ok(session)
}

async fn notify_initialized(client: &Client, url: &str, headers: &HeaderMap) {
    let notification = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    match client
        .post(url)
        .headers(headers.clone())
        .json(&notification)
        .send()
        .await
    {
        Ok(response) if !response.status().is_success() => {
            warn!(status = %response.status(), url = %url, "Initialized notification rejected");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, url = %url, "Initialized notification failed"),
    }
}

async fn send(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    request: &JsonRpcRequest,
) -> Result<(HeaderMap, JsonRpcResponse), RelayError> {
    let response = client
        .post(url)
        .headers(headers.clone())
        .json(request)
        .send()
        .await
        .map_err(|e| RelayError::transport(&e))?;

    let status = response.status();
    let response_headers = response.headers().clone();
    let text = response.text().await.map_err(|e| RelayError::transport(&e))?;
    if !status.is_success() {
        return Err(RelayError::http(status, text));
    }

    let content_type = response_headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let decoded = decode_body(content_type, &text)?;
    Ok((response_headers, decoded))
}

/// Decode a JSON or single-event SSE body into a JSON-RPC response.
pub fn decode_body(content_type: &str, body: &str) -> Result<JsonRpcResponse, RelayError> {
    let payload = if content_type.contains("text/event-stream") {
        body.lines()
            .find_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .ok_or_else(|| RelayError::protocol("No data in SSE response"))?
    } else {
        body
    };
    serde_json::from_str(payload).map_err(|e| {
        RelayError::protocol(format!("Invalid JSON-RPC response: {e}")).with_detail(body)
    })
}
