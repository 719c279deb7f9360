//! REST relay for `api` apps

use std::collections::BTreeMap;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use super::RelayError;
use crate::model::{App, BodyParams, Capability};
use crate::variables::VariableResolver;

/// Pseudo-header selecting the HTTP method; never sent upstream
pub const METHOD_HEADER: &str = "X-HTTP-Method";

/// Call a REST capability and return its decoded body.
pub async fn call(
    client: &Client,
    variables: &VariableResolver,
    app: &App,
    capability: &Capability,
    arguments: &Value,
) -> Result<Value, RelayError> {
    let mut headers = merge_headers(&app.headers, &capability.headers);
    let method = take_method(&mut headers)?;
    let headers = variables.resolve_map(&headers);
    let url = build_url(
        app.base_url.as_deref().map(|u| variables.resolve_string(u)),
        capability.url.as_deref().map(|u| variables.resolve_string(u)),
    )?;
    let body = build_body(variables, capability, arguments)?;

    debug!(method = %method, url = %url, "REST relay");

    let mut request = client
        .request(method.clone(), url.as_str())
        .headers(to_header_map(&headers))
        .timeout(capability.timeout());
    request = if method == Method::GET || method == Method::DELETE {
        request.query(&query_pairs(&body))
    } else {
        request.json(&Value::Object(body))
    };

    let response = request.send().await.map_err(|e| RelayError::transport(&e))?;
    let status = response.status();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));
    let text = response.text().await.map_err(|e| RelayError::transport(&e))?;

    if !status.is_success() {
        return Err(RelayError::http(status, text));
    }

    if is_json {
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    } else {
        Ok(Value::String(text))
    }
}

/// App headers overlaid with capability headers; keys compare case-insensitively.
#[must_use]
pub fn merge_headers(
    app: &BTreeMap<String, String>,
    capability: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = app.clone();
    for (key, value) in capability {
        merged.retain(|k, _| !k.eq_ignore_ascii_case(key));
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Remove the method pseudo-header and parse it (default POST).
pub fn take_method(headers: &mut BTreeMap<String, String>) -> Result<Method, RelayError> {
    let key = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case(METHOD_HEADER))
        .cloned();
    let Some(value) = key.and_then(|k| headers.remove(&k)) else {
        return Ok(Method::POST);
    };
    Method::from_bytes(value.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| RelayError::config(format!("Invalid HTTP method '{value}'")))
}

/// Capability URL, joined to the app base URL when it has no scheme.
pub fn build_url(base: Option<String>, path: Option<String>) -> Result<Url, RelayError> {
    let path = path.filter(|p| !p.trim().is_empty());
    if let Some(ref p) = path {
        if let Ok(url) = Url::parse(p) {
            if url.has_host() {
                return Ok(url);
            }
        }
    }
    let Some(base) = base.filter(|b| !b.trim().is_empty()) else {
        return Err(RelayError::config(match path {
            Some(p) => format!("Relative capability URL '{p}' but the app has no base URL"),
            None => "Capability has no URL".to_string(),
        }));
    };
    let joined = match path {
        Some(p) => format!("{}/{}", base.trim_end_matches('/'), p.trim_start_matches('/')),
        None => base,
    };
    Url::parse(&joined).map_err(|e| RelayError::config(format!("Invalid URL '{joined}': {e}")))
}

/// Request body: fixed params (variables resolved, types kept) with caller
/// arguments layered on top.
pub fn build_body(
    variables: &VariableResolver,
    capability: &Capability,
    arguments: &Value,
) -> Result<Map<String, Value>, RelayError> {
    let descriptor = match &capability.body_params {
        Some(Value::String(doc)) => match variables.resolve_json_preserving_types(doc) {
            resolved @ Value::Object(_) => BodyParams::classify(&resolved),
            _ => {
                warn!(capability = %capability.name, "body_params document is not a JSON object");
                return Err(RelayError::config(format!(
                    "body_params of '{}' is not a JSON object after variable substitution",
                    capability.name
                )));
            }
        },
        Some(value) => BodyParams::classify(value),
        None => BodyParams::None,
    };

    let mut body = match descriptor {
        BodyParams::Fixed(fixed) | BodyParams::Schema { fixed: Some(fixed), .. } => {
            match variables.resolve_typed(&Value::Object(fixed)) {
                Value::Object(map) => map,
                _ => Map::new(),
            }
        }
        BodyParams::Schema { fixed: None, .. } | BodyParams::None => Map::new(),
    };

    match arguments {
        Value::Object(args) => {
            for (k, v) in args {
                body.insert(k.clone(), v.clone());
            }
        }
        Value::Null => {}
        other => warn!(arguments = %other, "Ignoring non-object tool arguments"),
    }
    Ok(body)
}

/// Query parameters for GET/DELETE: scalars as text, nested values as JSON.
#[must_use]
pub fn query_pairs(body: &Map<String, Value>) -> Vec<(String, String)> {
    body.iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                Value::Bool(_) | Value::Number(_) => v.to_string(),
                Value::Array(_) | Value::Object(_) => {
                    serde_json::to_string(v).unwrap_or_default()
                }
            };
            (k.clone(), value)
        })
        .collect()
}

fn to_header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(k), Ok(v)) => {
                map.insert(k, v);
            }
            _ => warn!(header = %key, "Skipping invalid header"),
        }
    }
    map
}
