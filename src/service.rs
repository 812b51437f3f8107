//! Validation → execution orchestration.
//!
//! [`ExecutionService::run`] is the one entry point the tool layer calls.
//! It never fails: rejections, sandbox errors and even panics inside the
//! runner come back as an [`ExecutionResult`] with `success: false`.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};

use crate::policy::validator::{validate_command, validate_directory};
use crate::policy::PolicyStore;
use crate::sandbox::SandboxRunner;

/// Exit code reported when a request is rejected by policy.
pub const REJECTED_EXIT_CODE: i32 = 1;

/// Exit code reported when execution itself failed (spawn, timeout, ...).
pub const FAILED_EXIT_CODE: i32 = -1;

/// One call to run a command.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub command: String,
    pub working_directory: PathBuf,
    /// `None` waits for the command indefinitely.
    pub timeout: Option<Duration>,
}

/// Outcome of one call, in the shape handed back to the tool caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(rename = "error")]
    pub error_message: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    /// Always the caller's command, never the generated wrapper script.
    #[serde(rename = "command")]
    pub echoed_command: String,
}

impl ExecutionResult {
    /// Request refused before anything was spawned.
    pub fn rejected(command: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error_message: message.into(),
            exit_code: REJECTED_EXIT_CODE,
            echoed_command: command.to_string(),
        }
    }

    /// Execution was attempted and failed (or timed out).
    pub fn failed(command: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error_message: message.into(),
            exit_code: FAILED_EXIT_CODE,
            echoed_command: command.to_string(),
        }
    }
}

/// Validates requests against the live policy and runs the ones that pass.
pub struct ExecutionService {
    policy: Arc<PolicyStore>,
    runner: SandboxRunner,
}

impl ExecutionService {
    pub fn new(policy: Arc<PolicyStore>, runner: SandboxRunner) -> Self {
        Self { policy, runner }
    }

    pub async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let span = info_span!("execute", request_id = &request_id[..8]);
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: ExecutionRequest) -> ExecutionResult {
        let ExecutionRequest {
            command,
            working_directory,
            timeout,
        } = request;

        // One snapshot for the whole request, even if a reload lands mid-way
        let policy = self.policy.snapshot();

        if let Err(e) = validate_command(&command, &policy) {
            info!("Rejected command {command:?}: {e}");
            return ExecutionResult::rejected(&command, e.to_string());
        }
        if let Err(e) = validate_directory(&working_directory, &policy) {
            info!("Rejected directory {}: {e}", working_directory.display());
            return ExecutionResult::rejected(&command, e.to_string());
        }

        info!(
            "Running {command:?} in {} (timeout: {})",
            working_directory.display(),
            timeout.map_or_else(|| "none".to_string(), |t| format!("{}s", t.as_secs_f64()))
        );

        let run = self
            .runner
            .run(&command, &working_directory, timeout, policy.max_output_bytes);

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => {
                info!(
                    "Finished {command:?}: exit code {}, {} bytes of output",
                    result.exit_code,
                    result.output.len()
                );
                result
            }
            Err(_) => {
                error!("Runner panicked while executing {command:?}");
                ExecutionResult::failed(&command, "Error executing command: internal error")
            }
        }
    }
}
