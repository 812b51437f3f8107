mod config;
mod mcp;
mod policy;
mod sandbox;
mod service;
mod tools;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::mcp::McpServer;
use crate::policy::PolicyStore;
use crate::sandbox::sweep::{spawn_sweeper, STALE_AFTER};
use crate::sandbox::SandboxRunner;
use crate::service::ExecutionService;
use crate::tools::builtin::ExecuteCommandTool;
use crate::tools::ToolRegistry;

fn print_help() {
    println!(
        "\
simple-bash-mcp v{}

An MCP server (stdio) exposing one tool, execute_command, that runs
allowlisted shell commands inside allowlisted directories.

USAGE:
    simple-bash-mcp [OPTIONS] [POLICY_PATH]

ARGUMENTS:
    POLICY_PATH    Path to the JSON (or .toml) policy file [default: config.json]
                   The file is re-read automatically when it changes.

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the policy file via ${{VAR_NAME}} syntax.

    RUST_LOG                        Log level filter for tracing, written to stderr
                                    (e.g. debug, simple_bash_mcp=debug,warn)
    BASH_MCP_POLL_INTERVAL_SECS     Policy file check interval [default: 5]
    BASH_MCP_SWEEP_INTERVAL_SECS    Orphaned temp file sweep interval [default: 300]
    BASH_MCP_SHELL                  Shell used to run commands [default: /bin/bash]
    BASH_MCP_INTERACTIVE            Pass -i to the shell [default: true]
    BASH_MCP_TEMP_DIR               Directory for capture files [default: system temp]

EXAMPLES:
    simple-bash-mcp                           # uses ./config.json
    simple-bash-mcp /etc/bash-mcp/policy.json # custom policy path
    RUST_LOG=debug simple-bash-mcp            # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Positional policy path, after `--help` / `--version` have been handled.
fn policy_path_arg(args: impl Iterator<Item = String>) -> Result<Option<PathBuf>> {
    let mut path = None;
    for arg in args {
        if arg.starts_with('-') {
            bail!("Unknown option: {arg} (see --help)");
        }
        if path.is_some() {
            bail!("Unexpected extra argument: {arg} (see --help)");
        }
        path = Some(PathBuf::from(arg));
    }
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("simple-bash-mcp v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // stdout carries the protocol; logs go to stderr (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("simple_bash_mcp=info")),
        )
        .init();

    let settings = Settings::load(policy_path_arg(std::env::args().skip(1))?)?;

    info!("Loading policy from {}", settings.policy_path.display());
    let store = Arc::new(
        PolicyStore::open(&settings.policy_path)
            .await
            .context("Cannot start without a valid policy")?,
    );

    let policy = store.snapshot();
    info!("Allowed commands: {}", policy.commands_list());
    info!("Allowed directories: {}", policy.directories_list());
    info!("Max output: {} bytes", policy.max_output_bytes);
    info!(
        "Shell: {}{}",
        settings.shell.display(),
        if settings.interactive { " (interactive)" } else { "" }
    );

    let watcher = Arc::clone(&store).spawn_watcher(settings.poll_interval);
    let sweeper = spawn_sweeper(settings.temp_dir.clone(), settings.sweep_interval, STALE_AFTER);

    let runner = SandboxRunner::new(settings.runner_config());
    let service = Arc::new(ExecutionService::new(store, runner));

    let mut tools = ToolRegistry::new();
    tools.register(Box::new(ExecuteCommandTool::new(service)));
    info!("Tools: {} registered", tools.len());

    let server = McpServer::new(tools);
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let outcome = tokio::select! {
        result = server.serve(stdin, stdout) => {
            info!("Client disconnected, exiting");
            result
        }
        _ = tokio::signal::ctrl_c() => {
            // Dropping in-flight calls drops their sessions, which kills
            // the process groups and removes the temp files
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    };

    watcher.abort();
    sweeper.abort();

    if let Err(ref e) = outcome {
        error!("Server error: {e}");
    }
    outcome
}
