//! MCP server over stdio.
//!
//! Newline-delimited JSON-RPC 2.0: one message per line on stdin, one
//! response per line on stdout. Supported methods:
//!
//! - `initialize` / `notifications/initialized`
//! - `ping`
//! - `tools/list`
//! - `tools/call` (each call runs on its own task)
//!
//! Responses from concurrent calls go through a single writer task so
//! lines never interleave. stdout belongs to the protocol: logs go to
//! stderr and child processes never inherit it.
pub mod protocol;

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::tools::ToolRegistry;
use protocol::{Request, Response, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};

/// Protocol revision answered when the client does not ask for one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Name reported in `serverInfo`.
pub const SERVER_NAME: &str = "simple-bash-mcp";

pub struct McpServer {
    tools: Arc<ToolRegistry>,
}

impl McpServer {
    pub fn new(tools: ToolRegistry) -> Self {
        Self {
            tools: Arc::new(tools),
        }
    }

    /// Serves requests from `reader` until EOF, then waits for in-flight
    /// tool calls and flushes their responses.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel::<String>(64);
        let writer_task = tokio::spawn(write_loop(writer, out_rx));

        let mut lines = reader.lines();
        let mut calls = JoinSet::new();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        debug!("stdin closed");
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.handle_line(&line, &out_tx, &mut calls).await;
                }
                Some(joined) = calls.join_next(), if !calls.is_empty() => {
                    if let Err(e) = joined {
                        error!("Tool call task failed: {e}");
                    }
                }
            }
        }

        while let Some(joined) = calls.join_next().await {
            if let Err(e) = joined {
                error!("Tool call task failed: {e}");
            }
        }

        drop(out_tx);
        writer_task.await??;
        Ok(())
    }

    async fn handle_line(
        &self,
        line: &str,
        out_tx: &mpsc::Sender<String>,
        calls: &mut JoinSet<()>,
    ) {
        let request: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unparseable message: {e}");
                let _ = out_tx
                    .send(Response::error(Value::Null, PARSE_ERROR, format!("Parse error: {e}")).to_line())
                    .await;
                return;
            }
        };

        if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
            if let Some(id) = request.id {
                let _ = out_tx
                    .send(Response::error(id, INVALID_REQUEST, "Unsupported jsonrpc version").to_line())
                    .await;
            }
            return;
        }

        debug!("← {}", request.method);

        if request.is_notification() {
            self.handle_notification(&request);
            return;
        }

        let id = request.id.clone().unwrap_or(Value::Null);
        let response = match request.method.as_str() {
            "initialize" => Response::success(id, initialize_result(&request.params)),
            "ping" => Response::success(id, json!({})),
            "tools/list" => Response::success(
                id,
                json!({ "tools": self.tools.tool_definitions() }),
            ),
            "tools/call" => {
                let tools = Arc::clone(&self.tools);
                let tx = out_tx.clone();
                let params = request.params;
                calls.spawn(async move {
                    let response = call_tool(&tools, id, params).await;
                    let _ = tx.send(response.to_line()).await;
                });
                return;
            }
            other => Response::error(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
        };

        let _ = out_tx.send(response.to_line()).await;
    }

    fn handle_notification(&self, request: &Request) {
        match request.method.as_str() {
            "notifications/initialized" => info!("Client initialized"),
            "notifications/cancelled" => {
                debug!("Client cancelled a request (ignored): {}", request.params)
            }
            other => debug!("Ignoring notification {other}"),
        }
    }
}

fn initialize_result(params: &Value) -> Value {
    let version = params["protocolVersion"]
        .as_str()
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);

    if let Some(client) = params["clientInfo"]["name"].as_str() {
        info!("Initialize from client {client} (protocol {version})");
    }

    json!({
        "protocolVersion": version,
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// Runs one `tools/call`. Bad input to a known tool is a tool error
/// (`isError: true`); a malformed call itself is a JSON-RPC error.
async fn call_tool(tools: &ToolRegistry, id: Value, params: Value) -> Response {
    let Some(name) = params["name"].as_str() else {
        return Response::error(id, INVALID_PARAMS, "tools/call requires a tool name");
    };

    let Some(tool) = tools.get(name) else {
        return Response::success(id, tool_content(format!("Unknown tool: {name}"), true));
    };

    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
    match tool.execute(arguments).await {
        Ok(text) => Response::success(id, tool_content(text, false)),
        Err(e) => {
            warn!("Tool {name} rejected its arguments: {e}");
            Response::success(id, tool_content(format!("Error: {e}"), true))
        }
    }
}

fn tool_content(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error
    })
}

async fn write_loop<W>(mut writer: W, mut out_rx: mpsc::Receiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = out_rx.recv().await {
        debug!("→ {} bytes", line.len());
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}
