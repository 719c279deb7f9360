//! Gateway data model
//!
//! Entities are owned by the persistence layer ([`crate::store`]); the
//! gateway only holds per-request clones.
//!
//! ```text
//! McpService ──< App ──< Capability
//!      ▲          ▲          ▲
//!      └──── AccountPermission (exactly one target) >── ConnectionAccount
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::protocol::PromptArgument;

/// Primary key type shared by all catalog entities
pub type EntityId = i64;

/// Default capability timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Key inside a JSON-Schema body descriptor holding constant parameters
pub const FIXED_PARAMS_KEY: &str = "_fixed";

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Access control setting carried independently by every tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessControl {
    /// Anyone may pass this tier
    #[default]
    Public,
    /// Caller needs a grant on exactly this entity
    Restricted,
}

impl AccessControl {
    /// Whether this tier requires a grant
    #[must_use]
    pub fn is_restricted(self) -> bool {
        matches!(self, Self::Restricted)
    }
}

/// How an MCP Service is addressed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingKind {
    /// `<identifier>.<base_domain>/mcp`
    Subdomain,
    /// `/<identifier>/mcp`
    #[default]
    Path,
}

/// Top-level routable endpoint grouping Apps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpService {
    /// Primary key
    pub id: EntityId,
    /// Unique routing key
    pub identifier: String,
    /// Display name (reported as `serverInfo.name`)
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Routing style
    #[serde(default)]
    pub routing: RoutingKind,
    /// Entry gate for everything beneath this service
    #[serde(default)]
    pub access_control: AccessControl,
    /// Disabled services are invisible
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Backend integration kind of an App
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationKind {
    /// REST API backend
    #[default]
    Api,
    /// Remote or local MCP server backend
    Mcp,
}

/// Connection details of an MCP-backed App
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum McpConnection {
    /// Streamable HTTP endpoint
    Http {
        /// Endpoint URL (may contain `{{NAME}}` variables)
        #[serde(default)]
        url: Option<String>,
    },
    /// Child process speaking MCP over stdio
    Stdio {
        /// Program to launch
        command: String,
        /// Program arguments
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment for the child
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Working directory
        #[serde(default)]
        cwd: Option<String>,
    },
}

/// Backend integration unit under an MCP Service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    /// Primary key
    pub id: EntityId,
    /// Owning MCP Service
    pub service_id: EntityId,
    /// Display name, also the left half of namespaced tool names
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Integration kind
    #[serde(default)]
    pub kind: IntegrationKind,
    /// Base URL that relative capability URLs are joined to
    #[serde(default)]
    pub base_url: Option<String>,
    /// MCP connection (only for `mcp` apps)
    #[serde(default)]
    pub mcp: Option<McpConnection>,
    /// Headers sent with every call to this App
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Access control for this tier
    #[serde(default)]
    pub access_control: AccessControl,
    /// Disabled apps are skipped
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Capability kind (closed set)
///
/// `api` and `mcp` are accepted as legacy spellings of `tool` and `mcp_tool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// REST-backed tool
    #[serde(alias = "api")]
    Tool,
    /// Readable resource
    Resource,
    /// Prompt template
    Prompt,
    /// Tool relayed to an MCP backend
    #[serde(alias = "mcp")]
    McpTool,
}

impl CapabilityKind {
    /// Whether the capability is exposed through `tools/*`
    #[must_use]
    pub fn is_tool(self) -> bool {
        matches!(self, Self::Tool | Self::McpTool)
    }

    /// Canonical name as stored
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::Prompt => "prompt",
            Self::McpTool => "mcp_tool",
        }
    }
}

/// Single callable unit belonging to an App
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Primary key
    pub id: EntityId,
    /// Owning App
    pub app_id: EntityId,
    /// Name, unique within the App
    pub name: String,
    /// Description shown to MCP clients
    #[serde(default)]
    pub description: Option<String>,
    /// Capability kind
    pub kind: CapabilityKind,
    /// Target URL (absolute, or relative to the App base URL)
    #[serde(default)]
    pub url: Option<String>,
    /// Capability headers (override App headers)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body parameter descriptor: legacy flat map, JSON Schema with
    /// optional `_fixed`, or a JSON document string
    #[serde(default)]
    pub body_params: Option<Value>,
    /// Prompt template content
    #[serde(default)]
    pub template: Option<String>,
    /// Explicit resource URI
    #[serde(default)]
    pub uri: Option<String>,
    /// Resource MIME type
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Inline resource content
    #[serde(default)]
    pub content: Option<String>,
    /// Access control for this tier
    #[serde(default)]
    pub access_control: AccessControl,
    /// Disabled capabilities are skipped
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Outbound call timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Capability {
    /// Outbound call timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    /// Body descriptor with JSON-document strings parsed
    #[must_use]
    pub fn body_descriptor(&self) -> BodyParams {
        match &self.body_params {
            Some(Value::String(doc)) => serde_json::from_str::<Value>(doc)
                .map(|v| BodyParams::classify(&v))
                .unwrap_or(BodyParams::None),
            Some(value) => BodyParams::classify(value),
            None => BodyParams::None,
        }
    }

    /// JSON Schema exposed as `inputSchema`, with `_fixed` stripped
    #[must_use]
    pub fn input_schema(&self) -> Value {
        match self.body_descriptor() {
            BodyParams::Schema { schema, .. } => {
                let mut schema = schema;
                schema
                    .entry("type".to_string())
                    .or_insert_with(|| Value::String("object".to_string()));
                Value::Object(schema)
            }
            BodyParams::None | BodyParams::Fixed(_) => {
                json!({"type": "object", "properties": {}})
            }
        }
    }

    /// Prompt arguments derived from the body schema
    #[must_use]
    pub fn prompt_arguments(&self) -> Vec<PromptArgument> {
        let BodyParams::Schema { schema, .. } = self.body_descriptor() else {
            return Vec::new();
        };
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, prop)| PromptArgument {
                        name: name.clone(),
                        description: prop
                            .get("description")
                            .and_then(Value::as_str)
                            .map(String::from),
                        required: required.contains(&name.as_str()),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// URI under which this resource is listed and read
    #[must_use]
    pub fn resource_uri(&self, app: &App) -> String {
        self.uri.clone().unwrap_or_else(|| {
            format!(
                "resource://{}/{}",
                crate::naming::sanitize(&app.name),
                crate::naming::sanitize(&self.name)
            )
        })
    }
}

/// Interpretation of a capability's body parameter descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum BodyParams {
    /// No descriptor: arguments only
    None,
    /// Legacy flat key/value map used verbatim as fixed params
    Fixed(Map<String, Value>),
    /// JSON Schema object (`properties` present), `_fixed` split out
    Schema {
        /// Schema without the `_fixed` key
        schema: Map<String, Value>,
        /// Constant parameters layered under caller arguments
        fixed: Option<Map<String, Value>>,
    },
}

impl BodyParams {
    /// Classify a parsed descriptor value
    #[must_use]
    pub fn classify(value: &Value) -> Self {
        let Value::Object(map) = value else {
            return Self::None;
        };
        if map.contains_key("properties") {
            let mut schema = map.clone();
            let fixed = match schema.remove(FIXED_PARAMS_KEY) {
                Some(Value::Object(fixed)) => Some(fixed),
                _ => None,
            };
            Self::Schema { schema, fixed }
        } else if map.is_empty() {
            Self::None
        } else {
            Self::Fixed(map.clone())
        }
    }
}

/// Caller identity authenticating inbound MCP calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionAccount {
    /// Primary key
    pub id: EntityId,
    /// Display name (snapshotted into connection logs)
    pub name: String,
    /// Unique bearer token
    pub token: String,
    /// Disabled accounts authenticate as nobody
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Exactly one of the three tiers a grant can target
///
/// Serialized as `{kind: app, id: 10}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PermissionTarget {
    /// Grant on an MCP Service
    McpService(EntityId),
    /// Grant on an App
    App(EntityId),
    /// Grant on a Capability
    Capability(EntityId),
}

impl std::fmt::Display for PermissionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::McpService(id) => write!(f, "mcp_service:{id}"),
            Self::App(id) => write!(f, "app:{id}"),
            Self::Capability(id) => write!(f, "capability:{id}"),
        }
    }
}

/// Grant of one account on one tier entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPermission {
    /// Primary key
    pub id: EntityId,
    /// Grantee
    pub account_id: EntityId,
    /// Granted entity
    pub target: PermissionTarget,
}

/// Where a variable's value comes from
///
/// Serialized as `{kind: value, value: <base64>}` or `{kind: env, value: VAR}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VariableSource {
    /// Stored value, base64-encoded at rest
    Value(String),
    /// Process environment variable read at call time
    Env(String),
}

/// Substitution type of a variable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// Always substituted as text
    #[default]
    String,
    /// Substituted as a JSON number in type-preserving contexts
    Number,
}

/// Named value available as `{{NAME}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    /// Name matching `[A-Z0-9_]+`
    pub name: String,
    /// Value source
    pub source: VariableSource,
    /// Substitution type
    #[serde(default, rename = "type")]
    pub kind: VariableType,
    /// Secret values are never shown by listing commands
    #[serde(default)]
    pub is_secret: bool,
}

/// Append-only audit record of one MCP exchange
///
/// Names are snapshotted so the record stays meaningful after the
/// referenced entities change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionLog {
    /// Record id
    pub id: Uuid,
    /// When the exchange started
    pub created_at: DateTime<Utc>,
    /// Caller account name, if authenticated
    pub account_name: Option<String>,
    /// MCP Service identifier
    pub service_identifier: String,
    /// App name, if resolved
    pub app_name: Option<String>,
    /// Capability name, if resolved
    pub capability_name: Option<String>,
    /// JSON-RPC method
    pub method: String,
    /// Masked, truncated request body
    pub request_body: String,
    /// Masked, truncated response body
    pub response_body: String,
    /// HTTP status returned to the caller
    pub status_code: u16,
    /// Wall time of the exchange
    pub duration_ms: u64,
    /// Success classification
    pub is_success: bool,
    /// Machine-readable error code
    pub error_code: Option<String>,
    /// Human-readable error message
    pub error_message: Option<String>,
    /// Caller address, when known
    pub client_ip: Option<String>,
}
