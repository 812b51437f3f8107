//! Execution policy: which commands may run, where, and with what limits.
//!
//! The policy file is structured data (JSON, or TOML when the file name
//! ends in `.toml`) with camelCase fields:
//!
//! ```json
//! {
//!   "allowedCommands": ["ls", "cat", "git"],
//!   "allowedDirectories": ["${HOME}/projects", "/tmp"],
//!   "validateCommandsStrictly": true,
//!   "maxOutputSize": 1048576
//! }
//! ```
//!
//! `${VAR}` references are expanded from the environment before parsing.
pub mod store;
pub mod validator;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub use store::PolicyStore;

/// Default cap on merged command output (1 MB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1_048_576;

/// Immutable policy snapshot.
///
/// Never mutated after construction; a reload builds a new `Policy`
/// and swaps it into the [`PolicyStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    /// Base commands that may be executed. Sorted, so error messages list
    /// them deterministically.
    pub allowed_commands: BTreeSet<String>,
    /// Roots under which commands may run (as written in the file,
    /// canonicalized at validation time).
    pub allowed_directories: Vec<PathBuf>,
    pub strict_validation: bool,
    pub max_output_bytes: usize,
}

/// On-disk shape of the policy file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyFile {
    allowed_commands: Vec<String>,
    allowed_directories: Vec<PathBuf>,
    #[serde(default = "default_strict")]
    validate_commands_strictly: bool,
    #[serde(default = "default_max_output_size")]
    max_output_size: usize,
}

fn default_strict() -> bool {
    true
}

fn default_max_output_size() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

impl From<PolicyFile> for Policy {
    fn from(file: PolicyFile) -> Self {
        Self {
            allowed_commands: file.allowed_commands.into_iter().collect(),
            allowed_directories: file.allowed_directories,
            strict_validation: file.validate_commands_strictly,
            max_output_bytes: file.max_output_size,
        }
    }
}

/// The policy file could not be turned into a [`Policy`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read policy file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot expand environment variables in {path}: {message}")]
    Expand { path: PathBuf, message: String },

    #[error("invalid policy file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Serialization format of a policy file, picked from its extension.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PolicyFormat {
    Json,
    Toml,
}

impl PolicyFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            _ => Self::Json,
        }
    }
}

impl Policy {
    /// Parses policy file contents. `path` only selects the format and
    /// labels errors; nothing is read from disk.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        // Expand environment variables like ${HOME}
        let expanded = shellexpand::env(content).map_err(|e| ConfigError::Expand {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let file: PolicyFile = match PolicyFormat::for_path(path) {
            PolicyFormat::Json => {
                serde_json::from_str(&expanded).map_err(|e| ConfigError::Parse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?
            }
            PolicyFormat::Toml => toml::from_str(&expanded).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
        };

        Ok(file.into())
    }

    /// Reads and parses a policy file.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(path, &content)
    }

    /// Sorted, comma-separated list of allowed commands.
    pub fn commands_list(&self) -> String {
        self.allowed_commands
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Comma-separated list of allowed directories, in file order.
    pub fn directories_list(&self) -> String {
        self.allowed_directories
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
