//! MCP method dispatch for one resolved service
//!
//! Everything is read from the store per call; nothing here is cached
//! between requests.

use futures::future::{join_all, try_join_all};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use super::router::AppState;
use crate::error::rpc_codes;
use crate::model::{App, Capability, CapabilityKind, ConnectionAccount, McpService};
use crate::naming;
use crate::permission::{self, Denial};
use crate::protocol::{
    Content, Info, InitializeResult, JsonRpcResponse, PROTOCOL_VERSION, Prompt, PromptMessage,
    PromptsGetResult, PromptsListResult, RequestId, Resource, ResourceContents,
    ResourcesListResult, ResourcesReadResult, Role, ServerCapabilities, Tool, ToolsCallParams,
    ToolsCallResult, ToolsListResult,
};
use crate::relay::{RelayContext, RelayOutcome};
use crate::variables::VariableResolver;
use crate::{Error, Result};

/// Which capabilities a request can see
#[derive(Debug, Clone)]
pub enum Scope {
    /// Every App of the service, names namespaced with the codec
    Aggregate,
    /// One App, raw capability names
    SingleApp(App),
}

/// Result of dispatching one request
#[derive(Debug)]
pub struct Dispatched {
    /// Response envelope
    pub response: JsonRpcResponse,
    /// Session id minted by `initialize`
    pub session_id: Option<String>,
    /// App touched by the call
    pub app: Option<String>,
    /// Capability touched by the call
    pub capability: Option<String>,
    /// Failure code and message for the connection log
    pub failure: Option<(String, String)>,
}

impl Dispatched {
    fn ok(response: JsonRpcResponse) -> Self {
        let failure = response
            .error
            .as_ref()
            .map(|e| (e.code.to_string(), e.message.clone()));
        Self {
            response,
            session_id: None,
            app: None,
            capability: None,
            failure,
        }
    }

    fn target(mut self, app: &App, capability: &Capability) -> Self {
        self.app = Some(app.name.clone());
        self.capability = Some(capability.name.clone());
        self
    }
}

/// Per-request MCP handler
pub struct McpHandler<'a> {
    state: &'a AppState,
    service: &'a McpService,
    caller: Option<&'a ConnectionAccount>,
    scope: &'a Scope,
    depth_header: Option<&'a str>,
}

impl<'a> McpHandler<'a> {
    /// Handler for a resolved service and caller.
    pub fn new(
        state: &'a AppState,
        service: &'a McpService,
        caller: Option<&'a ConnectionAccount>,
        scope: &'a Scope,
        depth_header: Option<&'a str>,
    ) -> Self {
        Self {
            state,
            service,
            caller,
            scope,
            depth_header,
        }
    }

    /// Dispatch a request that carries an id.
    pub async fn dispatch(&self, id: RequestId, method: &str, params: Option<Value>) -> Dispatched {
        debug!(service = %self.service.identifier, method, "Dispatching");
        let params = params.unwrap_or(Value::Null);

        let result = match method {
            "initialize" => return self.initialize(id),
            "ping" => Ok(Dispatched::ok(JsonRpcResponse::success(id.clone(), json!({})))),
            "tools/list" => self.tools_list(&id).await,
            "tools/call" => self.tools_call(&id, &params).await,
            "resources/list" => self.resources_list(&id).await,
            "resources/read" => self.resources_read(&id, &params).await,
            "prompts/list" => self.prompts_list(&id).await,
            "prompts/get" => self.prompts_get(&id, &params).await,
            _ => Ok(Dispatched::ok(JsonRpcResponse::error(
                Some(id.clone()),
                rpc_codes::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            ))),
        };

        result.unwrap_or_else(|e| {
            if matches!(e, Error::Store(_) | Error::Internal(_) | Error::Io(_)) {
                warn!(service = %self.service.identifier, method, error = %e, "Request failed");
            }
            Dispatched::ok(JsonRpcResponse::error(Some(id), e.to_rpc_code(), e.to_string()))
        })
    }

    fn initialize(&self, id: RequestId) -> Dispatched {
        let session_id = Uuid::new_v4().to_string();
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities::default(),
            server_info: Info {
                name: self.service.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: self.service.description.clone(),
            meta: Some(json!({ "sessionId": session_id })),
        };
        let mut dispatched = Dispatched::ok(JsonRpcResponse::success(id, to_value(&result)));
        dispatched.session_id = Some(session_id);
        dispatched
    }

    async fn tools_list(&self, id: &RequestId) -> Result<Dispatched> {
        self.check_service().await?;
        let mut tools = Vec::new();
        for (app, capabilities) in self.visible(CapabilityKind::is_tool).await? {
            for capability in capabilities {
                tools.push(Tool {
                    name: self.exposed_name(&app, &capability),
                    description: capability.description.clone(),
                    input_schema: capability.input_schema(),
                });
            }
        }
        Ok(Dispatched::ok(JsonRpcResponse::success(
            id.clone(),
            to_value(&ToolsListResult { tools }),
        )))
    }

    async fn tools_call(&self, id: &RequestId, params: &Value) -> Result<Dispatched> {
        let params: ToolsCallParams = serde_json::from_value(params.clone())
            .map_err(|_| Error::InvalidParams("Missing tool name".to_string()))?;
        if params.name.is_empty() {
            return Err(Error::InvalidParams("Missing tool name".to_string()));
        }
        let arguments = match params.arguments {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        let catalog = self.catalog(CapabilityKind::is_tool).await?;
        let (app, capability) = self
            .lookup(&params.name, &catalog)
            .ok_or_else(|| Error::InvalidParams(format!("Unknown tool: {}", params.name)))?;

        self.check_call(app, capability).await?;

        let ctx = self.relay_context().await?;
        let outcome = self
            .state
            .relay
            .execute(&ctx, app, capability, &arguments)
            .await;

        let dispatched = match outcome {
            Ok(RelayOutcome::Value(value)) => {
                let result = ToolsCallResult {
                    content: vec![Content::text(value.to_string())],
                    is_error: false,
                };
                Dispatched::ok(JsonRpcResponse::success(id.clone(), to_value(&result)))
            }
            Ok(RelayOutcome::Passthrough(upstream)) => {
                let mut response = upstream;
                response.id = Some(id.clone());
                if response.result.is_none() && response.error.is_none() {
                    response.result = Some(json!({}));
                }
                Dispatched::ok(response)
            }
            Err(e) => {
                let result = ToolsCallResult {
                    content: vec![Content::text(json!({ "error": e.to_value() }).to_string())],
                    is_error: true,
                };
                let mut dispatched =
                    Dispatched::ok(JsonRpcResponse::success(id.clone(), to_value(&result)));
                dispatched.failure = Some((e.code.clone(), e.message.clone()));
                dispatched
            }
        };
        Ok(dispatched.target(app, capability))
    }

    async fn resources_list(&self, id: &RequestId) -> Result<Dispatched> {
        self.check_service().await?;
        let mut resources = Vec::new();
        for (app, capabilities) in self.visible(is_resource).await? {
            for capability in capabilities {
                resources.push(Resource {
                    uri: capability.resource_uri(&app),
                    name: capability.name.clone(),
                    description: capability.description.clone(),
                    mime_type: capability.mime_type.clone(),
                });
            }
        }
        Ok(Dispatched::ok(JsonRpcResponse::success(
            id.clone(),
            to_value(&ResourcesListResult { resources }),
        )))
    }

    async fn resources_read(&self, id: &RequestId, params: &Value) -> Result<Dispatched> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::InvalidParams("Missing resource uri".to_string()))?;

        let catalog = self.catalog(is_resource).await?;
        let (app, capability) = catalog
            .iter()
            .find_map(|(app, caps)| {
                caps.iter()
                    .find(|c| c.resource_uri(app) == uri)
                    .map(|c| (app, c))
            })
            .ok_or_else(|| Error::InvalidParams(format!("Unknown resource: {uri}")))?;

        self.check_call(app, capability).await?;

        let text = if let Some(content) = &capability.content {
            content.clone()
        } else {
            let ctx = self.relay_context().await?;
            match self
                .state
                .relay
                .execute(&ctx, app, capability, &Value::Object(Map::new()))
                .await
            {
                Ok(RelayOutcome::Value(Value::String(text))) => text,
                Ok(RelayOutcome::Value(value)) => value.to_string(),
                Ok(RelayOutcome::Passthrough(upstream)) => {
                    upstream.result.unwrap_or(Value::Null).to_string()
                }
                Err(e) => {
                    let mut dispatched = Dispatched::ok(JsonRpcResponse::error_with_data(
                        Some(id.clone()),
                        rpc_codes::INTERNAL_ERROR,
                        e.message.clone(),
                        e.to_value(),
                    ));
                    dispatched.failure = Some((e.code.clone(), e.message.clone()));
                    return Ok(dispatched.target(app, capability));
                }
            }
        };

        let result = ResourcesReadResult {
            contents: vec![ResourceContents {
                uri: uri.to_string(),
                mime_type: Some(
                    capability
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "text/plain".to_string()),
                ),
                text,
            }],
        };
        Ok(Dispatched::ok(JsonRpcResponse::success(id.clone(), to_value(&result)))
            .target(app, capability))
    }

    async fn prompts_list(&self, id: &RequestId) -> Result<Dispatched> {
        self.check_service().await?;
        let mut prompts = Vec::new();
        for (app, capabilities) in self.visible(is_prompt).await? {
            for capability in capabilities {
                prompts.push(Prompt {
                    name: self.exposed_name(&app, &capability),
                    description: capability.description.clone(),
                    arguments: capability.prompt_arguments(),
                });
            }
        }
        Ok(Dispatched::ok(JsonRpcResponse::success(
            id.clone(),
            to_value(&PromptsListResult { prompts }),
        )))
    }

    async fn prompts_get(&self, id: &RequestId, params: &Value) -> Result<Dispatched> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidParams("Missing prompt name".to_string()))?;

        let catalog = self.catalog(is_prompt).await?;
        let (app, capability) = self
            .lookup(name, &catalog)
            .ok_or_else(|| Error::InvalidParams(format!("Unknown prompt: {name}")))?;

        self.check_call(app, capability).await?;

        let template = capability
            .template
            .as_deref()
            .or(capability.description.as_deref())
            .unwrap_or_default();
        let text = render_prompt(template, params.get("arguments"));

        let result = PromptsGetResult {
            description: capability.description.clone(),
            messages: vec![PromptMessage {
                role: Role::User,
                content: Content::text(text),
            }],
        };
        Ok(Dispatched::ok(JsonRpcResponse::success(id.clone(), to_value(&result)))
            .target(app, capability))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn check_service(&self) -> Result<()> {
        let app = match self.scope {
            Scope::Aggregate => None,
            Scope::SingleApp(app) => Some(app),
        };
        permission::check(self.state.store.as_ref(), self.caller, self.service, app, None)
            .await
            .map_err(denied)
    }

    async fn check_call(&self, app: &App, capability: &Capability) -> Result<()> {
        permission::check(
            self.state.store.as_ref(),
            self.caller,
            self.service,
            Some(app),
            Some(capability),
        )
        .await
        .map_err(denied)
    }

    async fn relay_context(&self) -> Result<RelayContext> {
        let variables = VariableResolver::load(self.state.store.as_ref()).await?;
        Ok(RelayContext::new(self.depth_header, variables))
    }

    /// Apps in scope with their capabilities of the wanted kind.
    async fn catalog(
        &self,
        wanted: fn(CapabilityKind) -> bool,
    ) -> Result<Vec<(App, Vec<Capability>)>> {
        let store = self.state.store.as_ref();
        let apps = match self.scope {
            Scope::Aggregate => store.apps_for_service(self.service.id).await?,
            Scope::SingleApp(app) => vec![app.clone()],
        };
        let capabilities =
            try_join_all(apps.iter().map(|app| store.capabilities_for_app(app.id))).await?;
        let catalog = apps
            .into_iter()
            .zip(capabilities)
            .map(|(app, caps)| (app, caps.into_iter().filter(|c| wanted(c.kind)).collect()))
            .collect();
        Ok(catalog)
    }

    /// Enabled capabilities the caller passes all three tiers for.
    async fn visible(
        &self,
        wanted: fn(CapabilityKind) -> bool,
    ) -> Result<Vec<(App, Vec<Capability>)>> {
        let store = self.state.store.as_ref();
        let mut visible = Vec::new();
        for (app, capabilities) in self.catalog(wanted).await? {
            if !app.enabled {
                continue;
            }
            let candidates: Vec<Capability> =
                capabilities.into_iter().filter(|c| c.enabled).collect();
            let verdicts = join_all(candidates.iter().map(|capability| {
                permission::authorize(store, self.caller, self.service, Some(&app), Some(capability))
            }))
            .await;
            let allowed = candidates
                .into_iter()
                .zip(verdicts)
                .filter_map(|(capability, ok)| ok.then_some(capability))
                .collect();
            visible.push((app, allowed));
        }
        Ok(visible)
    }

    fn exposed_name(&self, app: &App, capability: &Capability) -> String {
        match self.scope {
            Scope::Aggregate => naming::encode(&app.name, &capability.name),
            Scope::SingleApp(_) => capability.name.clone(),
        }
    }

    fn lookup<'c>(
        &self,
        name: &str,
        catalog: &'c [(App, Vec<Capability>)],
    ) -> Option<(&'c App, &'c Capability)> {
        match self.scope {
            Scope::Aggregate => naming::decode(name, catalog),
            Scope::SingleApp(_) => catalog.iter().find_map(|(app, caps)| {
                caps.iter().find(|c| c.name == name).map(|c| (app, c))
            }),
        }
    }
}

fn is_resource(kind: CapabilityKind) -> bool {
    kind == CapabilityKind::Resource
}

fn is_prompt(kind: CapabilityKind) -> bool {
    kind == CapabilityKind::Prompt
}

fn denied(denial: Denial) -> Error {
    Error::PermissionDenied(denial.to_string())
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Substitute `{{arg}}` placeholders with caller arguments.
///
/// Only caller arguments are used; the variable table is not consulted.
#[must_use]
pub fn render_prompt(template: &str, arguments: Option<&Value>) -> String {
    let Some(arguments) = arguments.and_then(Value::as_object) else {
        return template.to_string();
    };
    arguments.iter().fold(template.to_string(), |text, (key, value)| {
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        text.replace(&format!("{{{{{key}}}}}"), &replacement)
    })
}
