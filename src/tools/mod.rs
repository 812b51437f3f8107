pub mod builtin;
pub mod registry;

use async_trait::async_trait;

/// A tool that an MCP client can invoke via `tools/call`.
///
/// The server calls `execute()` with the call's `arguments` object and
/// sends the returned text back as a single text content block.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique identifier listed in `tools/list`.
    /// Lowercase alphanumeric + underscores (e.g. "execute_command").
    fn name(&self) -> &str;

    /// Human-readable description shown to the client so it knows
    /// when to invoke this tool.
    fn description(&self) -> &str;

    /// JSON Schema describing the arguments this tool accepts.
    /// Sent as the `inputSchema` field of the tool definition.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool and return a text result.
    ///
    /// An `Err` means the caller's input was unusable; the server reports
    /// it as a tool error (`isError: true`), not a protocol error.
    async fn execute(&self, arguments: serde_json::Value) -> anyhow::Result<String>;
}

pub use registry::{ToolDefinition, ToolRegistry};
