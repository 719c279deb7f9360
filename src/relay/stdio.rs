//! MCP relay to a child process over stdio
//!
//! One process per call: spawn, `initialize`, `notifications/initialized`,
//! `tools/call`, then kill. Messages are newline-delimited JSON-RPC.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{RelayError, codes};
use crate::model::{Capability, McpConnection};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use crate::variables::VariableResolver;

/// Stderr kept per call; the rest is drained so the child never blocks on it
const STDERR_CAPTURE_BYTES: usize = 16 * 1024;

/// How long to wait for stderr to close after the child is killed
const STDERR_GRACE: Duration = Duration::from_millis(250);

/// Launch parameters after variable resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program
    pub command: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub cwd: Option<String>,
}

/// Resolve variables in the launch parameters; any leftover token is fatal.
pub fn prepare(
    variables: &VariableResolver,
    connection: &McpConnection,
) -> Result<LaunchSpec, RelayError> {
    let McpConnection::Stdio {
        command,
        args,
        env,
        cwd,
    } = connection
    else {
        return Err(RelayError::config("Not a stdio connection"));
    };

    let spec = LaunchSpec {
        command: variables.resolve_string(command),
        args: args.iter().map(|a| variables.resolve_string(a)).collect(),
        env: variables.resolve_map(env),
        cwd: cwd.as_deref().map(|c| variables.resolve_string(c)),
    };

    let mut unresolved: Vec<String> = Vec::new();
    let texts = std::iter::once(&spec.command)
        .chain(spec.args.iter())
        .chain(spec.env.values())
        .chain(spec.cwd.iter());
    for text in texts {
        for name in variables.unresolved_names(text) {
            if !unresolved.contains(&name) {
                unresolved.push(name);
            }
        }
    }
    if !unresolved.is_empty() {
        return Err(RelayError::new(
            codes::UNRESOLVED_VARIABLE,
            format!("Unresolved variables: {}", unresolved.join(", ")),
        ));
    }
    if spec.command.trim().is_empty() {
        return Err(RelayError::config("Empty command"));
    }
    Ok(spec)
}

/// Run one `tools/call` against a freshly spawned MCP server.
pub async fn call(
    variables: &VariableResolver,
    connection: &McpConnection,
    capability: &Capability,
    arguments: &Value,
) -> Result<JsonRpcResponse, RelayError> {
    let spec = prepare(variables, connection)?;

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref cwd) = spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|e| {
        RelayError::new(
            codes::PROCESS_ERROR,
            format!("Failed to spawn '{}': {e}", spec.command),
        )
    })?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RelayError::new(codes::PROCESS_ERROR, "Failed to get stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RelayError::new(codes::PROCESS_ERROR, "Failed to get stdout"))?;
    let stderr = child.stderr.take().map(capture_stderr);

    let mut session = Session {
        stdin,
        lines: BufReader::new(stdout).lines(),
    };
    let exchange = async {
        let init = session
            .request(
                RequestId::Number(1),
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "accel-mcp", "version": env!("CARGO_PKG_VERSION")}
                }),
            )
            .await?;
        if let Some(error) = init.error {
            return Err(RelayError::protocol(format!(
                "Initialize failed: {}",
                error.message
            )));
        }
        session
            .write(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await?;
        session
            .request(
                RequestId::Number(2),
                "tools/call",
                json!({"name": capability.name, "arguments": arguments}),
            )
            .await
    };

    let result = tokio::time::timeout(capability.timeout(), exchange)
        .await
        .unwrap_or_else(|_| Err(RelayError::new(codes::API_TIMEOUT, "MCP process timed out")));

    if let Err(e) = child.kill().await {
        debug!(command = %spec.command, error = %e, "Failed to kill MCP process");
    }
    debug!(command = %spec.command, ok = result.is_ok(), "Stdio relay finished");

    // Grandchildren may keep the pipe open past the kill
    let stderr = match stderr {
        Some(mut task) => match tokio::time::timeout(STDERR_GRACE, &mut task).await {
            Ok(Ok(text)) => text,
            _ => {
                task.abort();
                String::new()
            }
        },
        None => String::new(),
    };
    result.map_err(|e| {
        if e.detail.is_none() && !stderr.trim().is_empty() {
            e.with_detail(stderr.trim())
        } else {
            e
        }
    })
}

/// Collect up to [`STDERR_CAPTURE_BYTES`] of stderr until the pipe closes.
fn capture_stderr(stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut captured = Vec::new();
        let mut reader = stderr;
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = STDERR_CAPTURE_BYTES.saturating_sub(captured.len());
                    captured.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
        String::from_utf8_lossy(&captured).into_owned()
    })
}

struct Session {
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl Session {
    async fn write(&mut self, message: &Value) -> Result<(), RelayError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| RelayError::protocol(format!("Failed to encode message: {e}")))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RelayError::new(codes::PROCESS_ERROR, format!("Write failed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| RelayError::new(codes::PROCESS_ERROR, format!("Flush failed: {e}")))
    }

    async fn request(
        &mut self,
        id: RequestId,
        method: &str,
        params: Value,
    ) -> Result<JsonRpcResponse, RelayError> {
        let request = JsonRpcRequest::new(id.clone(), method, Some(params));
        let message = serde_json::to_value(&request)
            .map_err(|e| RelayError::protocol(format!("Failed to encode request: {e}")))?;
        self.write(&message).await?;

        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| RelayError::new(codes::PROCESS_ERROR, format!("Read failed: {e}")))?
                .ok_or_else(|| {
                    RelayError::new(codes::PROCESS_ERROR, "Process exited before responding")
                })?;

            // Skip logs, notifications, and server-initiated requests
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if value.get("method").is_some() {
                continue;
            }
            let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value) else {
                continue;
            };
            if response.id.as_ref() == Some(&id) {
                return Ok(response);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Variable, VariableSource, VariableType};
    use crate::variables::obfuscate;
    use pretty_assertions::assert_eq;

    fn connection(command: &str, args: &[&str]) -> McpConnection {
        let mut env = BTreeMap::new();
        env.insert("API_TOKEN".to_string(), "{{TOKEN}}".to_string());
        McpConnection::Stdio {
            command: command.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            env,
            cwd: None,
        }
    }

    fn variables() -> VariableResolver {
        VariableResolver::new(vec![Variable {
            name: "TOKEN".to_string(),
            source: VariableSource::Value(obfuscate("t0k")),
            kind: VariableType::String,
            is_secret: true,
        }])
    }

    fn capability(timeout_secs: u64) -> Capability {
        serde_json::from_value(json!({
            "id": 1, "app_id": 1, "name": "echo", "kind": "mcp_tool",
            "timeout_secs": timeout_secs
        }))
        .unwrap()
    }

    #[test]
    fn prepare_resolves_args_and_env() {
        let spec = prepare(&variables(), &connection("server", &["--token={{TOKEN}}"])).unwrap();
        assert_eq!(spec.args, vec!["--token=t0k"]);
        assert_eq!(spec.env["API_TOKEN"], "t0k");
    }

    #[test]
    fn unresolved_variable_fails_before_spawn() {
        let err = prepare(
            &variables(),
            &connection("server", &["--key={{MISSING_KEY}}"]),
        )
        .unwrap_err();
        assert_eq!(err.code, codes::UNRESOLVED_VARIABLE);
        assert!(err.message.contains("MISSING_KEY"));
    }

    #[tokio::test]
    async fn spawn_failure_is_process_error() {
        let err = call(
            &variables(),
            &connection("/nonexistent/accel-mcp-test-binary", &[]),
            &capability(5),
            &json!({}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, codes::PROCESS_ERROR);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn scripted_server_round_trip() {
        let script = r#"read init
echo 'server starting'
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{}}}'
read notified
read call
echo '{"jsonrpc":"2.0","method":"notifications/progress","params":{}}'
echo '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"pong"}]}}'
"#;
        let response = call(
            &variables(),
            &connection("sh", &["-c", script]),
            &capability(10),
            &json!({"x": 1}),
        )
        .await
        .unwrap();
        assert_eq!(response.id, Some(RequestId::Number(2)));
        assert_eq!(response.result.unwrap()["content"][0]["text"], "pong");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_reported_as_detail() {
        let err = call(
            &variables(),
            &connection("sh", &["-c", "echo 'missing API_TOKEN' >&2; exit 3"]),
            &capability(5),
            &json!({}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, codes::PROCESS_ERROR);
        assert_eq!(err.detail.as_deref(), Some("missing API_TOKEN"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_server_times_out() {
        let err = call(
            &variables(),
            &connection("sh", &["-c", "sleep 5"]),
            &capability(1),
            &json!({}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, codes::API_TIMEOUT);
    }
}
