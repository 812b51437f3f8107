//! Execution sandbox: runs one validated command as an isolated child.
//!
//! Every invocation goes through the same lifecycle:
//!
//! 1. Allocate three temp artifacts (stdout capture, stderr capture, the
//!    wrapper script) named `bash_mcp_<uuid>.*`
//! 2. Spawn the script under a login shell as a new process-group leader,
//!    with stdio detached from the server's own transport
//! 3. Wait, bounded by the request timeout
//! 4. On completion read and shape the output; on timeout SIGTERM the
//!    group, wait out the grace period, SIGKILL what remains
//! 5. Clean up the artifacts and any surviving process, on every path
//!
//! This is process isolation only: there is no namespace, seccomp or
//! filesystem confinement beyond the policy checks done upstream.
pub mod output;
pub mod session;
pub mod signal;
pub mod sweep;
#[cfg(all(test, target_os = "linux"))]
pub(crate) mod testutil;

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::service::ExecutionResult;
use session::SandboxSession;

/// Time between SIGTERM and SIGKILL on timeout.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// How the runner launches children.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Shell used to run the wrapper script.
    pub shell: PathBuf,
    /// Pass `-i` so interactive profile setup (`.bashrc`) applies.
    pub interactive: bool,
    /// Where temp artifacts are created.
    pub temp_dir: PathBuf,
    pub grace_period: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
            interactive: true,
            temp_dir: std::env::temp_dir(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Failures between allocation and exit. All of them surface to the
/// caller as a result with exit code -1.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to allocate temporary files: {0}")]
    Resource(#[source] std::io::Error),

    #[error("Failed to start command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Error executing command: {0}")]
    Execution(#[source] std::io::Error),

    #[error("Command execution timed out after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),
}

/// Runs commands that already passed validation.
pub struct SandboxRunner {
    config: RunnerConfig,
}

impl SandboxRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Runs `command` in `cwd`. Never fails: every error becomes an
    /// unsuccessful [`ExecutionResult`].
    ///
    /// `timeout` of `None` waits indefinitely. Merged output is capped at
    /// `max_output_bytes`.
    pub async fn run(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Option<Duration>,
        max_output_bytes: usize,
    ) -> ExecutionResult {
        match self.execute(command, cwd, timeout, max_output_bytes).await {
            Ok(result) => result,
            Err(e) => {
                match e {
                    SandboxError::Timeout(_) => info!("{e}"),
                    _ => warn!("{e}"),
                }
                ExecutionResult::failed(command, e.to_string())
            }
        }
    }

    async fn execute(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Option<Duration>,
        max_output_bytes: usize,
    ) -> Result<ExecutionResult, SandboxError> {
        let mut session = SandboxSession::allocate(&self.config.temp_dir, cwd, command).await?;
        let result = self
            .drive(&mut session, command, cwd, timeout, max_output_bytes)
            .await;
        session.cleanup();
        result
    }

    async fn drive(
        &self,
        session: &mut SandboxSession,
        command: &str,
        cwd: &Path,
        timeout: Option<Duration>,
        max_output_bytes: usize,
    ) -> Result<ExecutionResult, SandboxError> {
        session.spawn(cwd, &self.config)?;

        let status = match session.wait(timeout).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                let limit = timeout.unwrap_or_default();
                session.terminate(self.config.grace_period).await;
                return Err(SandboxError::Timeout(limit));
            }
            Err(e) => {
                session.force_kill();
                return Err(SandboxError::Execution(e));
            }
        };

        let stdout = output::read_capture(session.stdout_path(), max_output_bytes)
            .await
            .map_err(SandboxError::Execution)?;
        let stderr = output::read_capture(session.stderr_path(), max_output_bytes)
            .await
            .map_err(SandboxError::Execution)?;

        let exit_code = exit_code(status);
        debug!(
            "Session {} exited with {exit_code} ({} bytes stdout, {} bytes stderr)",
            session.id(),
            stdout.len(),
            stderr.len()
        );

        let merged = output::truncate(output::merge(&stdout, &stderr), max_output_bytes);
        let success = exit_code == 0;
        let error = if success {
            String::new()
        } else if !stderr.is_empty() {
            stderr
        } else {
            describe_failure(status, exit_code)
        };

        Ok(ExecutionResult {
            success,
            output: merged,
            error_message: error,
            exit_code,
            echoed_command: command.to_string(),
        })
    }
}

/// Exit code, or `-N` for a child killed by signal N.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return -sig;
        }
    }
    -1
}

fn describe_failure(status: ExitStatus, exit_code: i32) -> String {
    if status.code().is_some() {
        format!("Command exited with code {exit_code}")
    } else {
        format!("Command terminated by signal {}", -exit_code)
    }
}
