//! MCP provider — invokes one tool on an MCP server over stdio
//! JSON-RPC.
//!
//! Each execution spawns the configured server, performs the
//! `initialize` handshake, calls the tool, and shuts the process down.
//! Messages are newline-delimited JSON; non-JSON lines on stdout are
//! skipped (servers that log to stdout).

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use visor_domain::config::CheckSpec;
use visor_domain::error::{Error, Result};
use visor_domain::review::ReviewSummary;
use visor_engine::{DepResults, ExecContext, Provider};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MAX_SKIP_LINES: usize = 1000;

pub struct McpProvider;

#[async_trait]
impl Provider for McpProvider {
    fn name(&self) -> &'static str {
        "mcp"
    }

    fn description(&self) -> &'static str {
        "spawns an MCP server and invokes one of its tools"
    }

    fn supported_keys(&self) -> &'static [&'static str] {
        &["command", "args", "env", "tool", "arguments"]
    }

    fn validate(&self, spec: &CheckSpec) -> bool {
        spec.param_str("command").map(|s| !s.is_empty()).unwrap_or(false)
            && spec.param_str("tool").map(|s| !s.is_empty()).unwrap_or(false)
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        spec: &CheckSpec,
        _deps: &DepResults,
    ) -> Result<ReviewSummary> {
        let command = spec
            .param_str("command")
            .ok_or_else(|| Error::provider("mcp", "missing command", false))?;
        let tool = spec
            .param_str("tool")
            .ok_or_else(|| Error::provider("mcp", "missing tool", false))?;

        let args: Vec<String> = spec
            .params
            .get("args")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut arguments = spec
            .params
            .get("arguments")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        for value in arguments.values_mut() {
            if let serde_json::Value::String(s) = value {
                *s = visor_template::render(s, &ctx.template_scope)?;
            }
        }

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());
        cmd.kill_on_drop(true);
        if let Some(env) = spec.params.get("env").and_then(|v| v.as_object()) {
            for (key, value) in env {
                cmd.env(key, value.as_str().unwrap_or_default());
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::provider("mcp", format!("failed to spawn server: {e}"), false))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::provider("mcp", "failed to capture server stdin", false))?;
        let mut stdout = BufReader::new(child.stdout.take().ok_or_else(|| {
            Error::provider("mcp", "failed to capture server stdout", false)
        })?);

        let timeout = std::time::Duration::from_millis(
            spec.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        );
        let session = async {
            // initialize handshake
            write_message(
                &mut stdin,
                &json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "initialize",
                    "params": {
                        "protocolVersion": "2024-11-05",
                        "clientInfo": {"name": "visor", "version": env!("CARGO_PKG_VERSION")},
                        "capabilities": {},
                    },
                }),
            )
            .await?;
            read_response(&mut stdout, 1).await?;
            write_message(
                &mut stdin,
                &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            )
            .await?;

            // tool call
            write_message(
                &mut stdin,
                &json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "tools/call",
                    "params": {"name": tool, "arguments": arguments},
                }),
            )
            .await?;
            read_response(&mut stdout, 2).await
        };

        let result = match tokio::time::timeout(timeout, session).await {
            Ok(result) => result,
            Err(_) => {
                let _ = child.kill().await;
                return Err(Error::provider(
                    "mcp",
                    format!("tool call timed out after {}ms", timeout.as_millis()),
                    true,
                ));
            }
        };
        let _ = child.kill().await;
        let response = result?;

        if let Some(error) = response.get("error") {
            return Err(Error::provider(
                "mcp",
                format!("tool error: {error}"),
                false,
            ));
        }

        // Tool results carry a content list; concatenate the text parts.
        let result = response.get("result").cloned().unwrap_or(json!(null));
        let text = result
            .get("content")
            .and_then(|v| v.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|| result.to_string());

        Ok(crate::summary_from_text(text))
    }
}

async fn write_message(
    stdin: &mut tokio::process::ChildStdin,
    message: &serde_json::Value,
) -> Result<()> {
    let json = serde_json::to_string(message)?;
    stdin
        .write_all(json.as_bytes())
        .await
        .map_err(|e| Error::provider("mcp", format!("write failed: {e}"), true))?;
    stdin
        .write_all(b"\n")
        .await
        .map_err(|e| Error::provider("mcp", format!("write failed: {e}"), true))?;
    stdin
        .flush()
        .await
        .map_err(|e| Error::provider("mcp", format!("write failed: {e}"), true))?;
    Ok(())
}

/// Read lines until a JSON-RPC response with the given id; skips
/// notifications and stray non-JSON output.
async fn read_response(
    stdout: &mut BufReader<tokio::process::ChildStdout>,
    id: u64,
) -> Result<serde_json::Value> {
    let mut skipped = 0usize;
    loop {
        let mut line = String::new();
        let bytes = stdout
            .read_line(&mut line)
            .await
            .map_err(|e| Error::provider("mcp", format!("read failed: {e}"), true))?;
        if bytes == 0 {
            return Err(Error::provider("mcp", "server exited mid-call", true));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || !trimmed.starts_with('{') {
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                return Err(Error::provider(
                    "mcp",
                    "server produced too many non-JSON lines",
                    false,
                ));
            }
            continue;
        }
        if let Ok(message) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if message.get("id").and_then(|v| v.as_u64()) == Some(id) {
                return Ok(message);
            }
            tracing::debug!(line = %trimmed, "skipping non-matching MCP message");
        }
    }
}
