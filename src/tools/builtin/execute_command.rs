//! Builtin tool: run an allowlisted shell command.
//!
//! Thin adapter between MCP arguments and [`ExecutionService`]: it only
//! checks that the arguments are present and well-typed. Whether the
//! command may actually run is decided by the service's policy checks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::service::{ExecutionRequest, ExecutionService};
use crate::tools::Tool;

/// Builtin tool that executes a command through the sandbox.
pub struct ExecuteCommandTool {
    service: Arc<ExecutionService>,
}

impl ExecuteCommandTool {
    pub fn new(service: Arc<ExecutionService>) -> Self {
        Self { service }
    }
}

/// Turns raw tool arguments into an [`ExecutionRequest`].
///
/// `command` and `cwd` must be non-empty strings. `timeout` is optional;
/// `0` or `null` means no timeout.
fn parse_request(arguments: &Value) -> anyhow::Result<ExecutionRequest> {
    if !arguments.is_object() {
        bail!("Missing arguments");
    }

    let command = arguments["command"].as_str().filter(|s| !s.is_empty());
    let cwd = arguments["cwd"].as_str().filter(|s| !s.is_empty());
    let (Some(command), Some(cwd)) = (command, cwd) else {
        bail!("Missing required command or cwd parameter");
    };

    let timeout = match &arguments["timeout"] {
        Value::Null => None,
        Value::Number(n) => {
            let secs = n
                .as_f64()
                .ok_or_else(|| anyhow!("timeout must be a number of seconds"))?;
            if secs == 0.0 {
                None
            } else if secs.is_sign_negative() {
                bail!("timeout must be a positive number of seconds, got {secs}");
            } else {
                Some(
                    Duration::try_from_secs_f64(secs)
                        .map_err(|_| anyhow!("timeout out of range: {secs}"))?,
                )
            }
        }
        other => bail!("timeout must be a number of seconds, got {other}"),
    };

    Ok(ExecutionRequest {
        command: command.to_string(),
        working_directory: PathBuf::from(cwd),
        timeout,
    })
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Execute a bash command in a secure environment"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory for the command"
                },
                "timeout": {
                    "type": "number",
                    "description": "Optional timeout in seconds"
                }
            },
            "required": ["command", "cwd"]
        })
    }

    async fn execute(&self, arguments: Value) -> anyhow::Result<String> {
        let request = parse_request(&arguments)?;
        let result = self.service.run(request).await;
        Ok(serde_json::to_string_pretty(&result)?)
    }
}
