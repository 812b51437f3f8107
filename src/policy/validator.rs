//! Command and working-directory checks against a [`Policy`] snapshot.
//!
//! Both checks are pure functions of their input and the snapshot, so a
//! request validated here is judged against one consistent policy even if
//! the file is reloaded mid-request.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::Policy;

/// Substrings that indicate command chaining, substitution, redirection or
/// comments. Checked against the raw command string, in this order, when
/// strict validation is on. This is a blunt filter, not a shell parser:
/// a `#` or `>` inside a quoted argument is rejected too.
pub const INJECTION_PATTERNS: [&str; 9] = [";", "&&", "||", "`", "$(", ">", "<", "|", "#"];

/// Why a request was rejected before anything was spawned.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Command '{command}' is not in the allowed commands list. Allowed commands: {allowed}")]
    CommandNotAllowed { command: String, allowed: String },

    #[error(
        "Potential command injection detected: '{pattern}'. Forbidden patterns: {}",
        forbidden_patterns()
    )]
    InjectionDetected { pattern: &'static str },

    #[error(
        "Directory '{}' is not in the allowed directories list. Allowed directories: {allowed}",
        .directory.display()
    )]
    DirectoryNotAllowed { directory: PathBuf, allowed: String },
}

fn forbidden_patterns() -> String {
    INJECTION_PATTERNS
        .iter()
        .map(|p| format!("'{p}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Checks the base command against the allowlist and, in strict mode,
/// scans the whole command for injection patterns.
pub fn validate_command(command: &str, policy: &Policy) -> Result<(), ValidationError> {
    // First whitespace-delimited token; empty input never matches
    let base = command.split_whitespace().next().unwrap_or("");

    if base.is_empty() || !policy.allowed_commands.contains(base) {
        return Err(ValidationError::CommandNotAllowed {
            command: base.to_string(),
            allowed: policy.commands_list(),
        });
    }

    if policy.strict_validation {
        if let Some(pattern) = INJECTION_PATTERNS.iter().copied().find(|p| command.contains(p)) {
            return Err(ValidationError::InjectionDetected { pattern });
        }
    }

    Ok(())
}

/// Checks that `directory` resolves to an allowed root or a descendant of
/// one. Both sides are canonicalized first, so `..` segments and symlinks
/// are judged by where they actually lead.
pub fn validate_directory(directory: &Path, policy: &Policy) -> Result<(), ValidationError> {
    let rejected = || ValidationError::DirectoryNotAllowed {
        directory: directory.to_path_buf(),
        allowed: policy.directories_list(),
    };

    let target = std::fs::canonicalize(directory).map_err(|_| rejected())?;

    let allowed = policy
        .allowed_directories
        .iter()
        .filter_map(|root| std::fs::canonicalize(root).ok())
        .any(|root| target.starts_with(&root));

    if allowed {
        Ok(())
    } else {
        Err(rejected())
    }
}
