use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::sandbox::{RunnerConfig, DEFAULT_GRACE_PERIOD};

/// Runtime settings that are not part of the hot-reloadable policy.
///
/// Everything here is fixed for the life of the process. Values come from
/// `BASH_MCP_*` environment variables, falling back to defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Policy file to load and watch.
    pub policy_path: PathBuf,
    /// How often the policy file's mtime is checked.
    pub poll_interval: Duration,
    /// How often the temp dir is swept for orphaned artifacts.
    pub sweep_interval: Duration,
    /// Shell that runs the generated wrapper script.
    pub shell: PathBuf,
    /// Run the shell with `-i` (loads interactive profile such as `.bashrc`).
    pub interactive: bool,
    /// Directory for capture files and wrapper scripts.
    pub temp_dir: PathBuf,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_shell() -> PathBuf {
    PathBuf::from("/bin/bash")
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("config.json")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            policy_path: default_policy_path(),
            poll_interval: default_poll_interval(),
            sweep_interval: default_sweep_interval(),
            shell: default_shell(),
            interactive: true,
            temp_dir: std::env::temp_dir(),
        }
    }
}

impl Settings {
    /// Builds settings from the process environment.
    pub fn load(policy_path: Option<PathBuf>) -> Result<Self> {
        Self::from_lookup(policy_path, |key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable lookup (testable without
    /// touching the real environment).
    pub fn from_lookup(
        policy_path: Option<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();

        let seconds = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => {
                    let secs: u64 = raw
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))?;
                    if secs == 0 {
                        return Err(anyhow!("{key} must be greater than zero"));
                    }
                    Ok(Duration::from_secs(secs))
                }
            }
        };

        let interactive = match lookup("BASH_MCP_INTERACTIVE") {
            None => defaults.interactive,
            Some(raw) => parse_bool(&raw)
                .ok_or_else(|| anyhow!("BASH_MCP_INTERACTIVE must be true or false, got {raw:?}"))?,
        };

        Ok(Self {
            policy_path: policy_path.unwrap_or(defaults.policy_path),
            poll_interval: seconds("BASH_MCP_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            sweep_interval: seconds("BASH_MCP_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            shell: lookup("BASH_MCP_SHELL").map(PathBuf::from).unwrap_or(defaults.shell),
            interactive,
            temp_dir: lookup("BASH_MCP_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
        })
    }

    /// Sandbox runner configuration derived from these settings.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            shell: self.shell.clone(),
            interactive: self.interactive,
            temp_dir: self.temp_dir.clone(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
