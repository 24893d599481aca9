//! mcp-harness: drive an MCP server from the command line.
//!
//! Starts the configured server, performs one operation, prints the result
//! as JSON on stdout and stops the server. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use mcp_harness::config::{self, Config};
use mcp_harness::error::{HarnessError, HarnessResult};
use mcp_harness::lifecycle::LifecycleManager;
use mcp_harness::logging;
use mcp_harness::mcp::McpClient;
use mcp_harness::snapshot::SnapshotStore;

/// Test harness for MCP servers spoken to over stdio.
#[derive(Parser, Debug)]
#[command(name = "mcp-harness")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the server's tools
    Tools,
    /// Call a tool
    Call {
        /// Tool name
        name: String,
        /// Arguments as a JSON object
        #[arg(value_name = "ARGS_JSON")]
        arguments: Option<String>,
    },
    /// List the server's resources
    Resources,
    /// Read a resource
    Read {
        /// Resource URI
        uri: String,
    },
    /// Inspect stored snapshots
    Snapshots {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotAction {
    /// List the snapshot labels of a test
    List {
        /// Test identity, e.g. `client_integration::lists_tools`
        #[arg(long, value_name = "ID")]
        test: String,
    },
    /// Delete one snapshot of a test
    Delete {
        /// Test identity
        #[arg(long, value_name = "ID")]
        test: String,
        /// Snapshot label
        label: String,
    },
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> HarnessResult<()> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|source| HarnessError::Serialization {
            context: "command output".to_string(),
            source,
        })?;
    println!("{rendered}");
    Ok(())
}

/// Runs a snapshot maintenance command. Returns whether it succeeded.
async fn run_snapshots(cfg: &Config, action: SnapshotAction) -> HarnessResult<bool> {
    match action {
        SnapshotAction::List { test } => {
            let store = SnapshotStore::from_config(&cfg.snapshots, &test)?;
            let labels = store.list_snapshots().await?;
            print_json(&labels)?;
            Ok(true)
        }
        SnapshotAction::Delete { test, label } => {
            let store = SnapshotStore::from_config(&cfg.snapshots, &test)?;
            let removed = store.delete_snapshot(&label).await?;
            if !removed {
                eprintln!("No snapshot '{label}' for {test}");
            }
            Ok(removed)
        }
    }
}

/// Runs one server operation. Returns whether it succeeded.
async fn run_operation(client: &McpClient, command: Command) -> HarnessResult<bool> {
    match command {
        Command::Tools => {
            print_json(&client.list_tools().await?)?;
            Ok(true)
        }
        Command::Call { name, arguments } => {
            let arguments: Value = match arguments {
                Some(raw) => {
                    serde_json::from_str(&raw).map_err(|source| HarnessError::Serialization {
                        context: "ARGS_JSON".to_string(),
                        source,
                    })?
                }
                None => Value::Object(serde_json::Map::new()),
            };
            let result = client.call_tool(&name, arguments).await?;
            print_json(&result)?;
            Ok(!result.is_error)
        }
        Command::Resources => {
            print_json(&client.list_resources().await?)?;
            Ok(true)
        }
        Command::Read { uri } => {
            print_json(&client.read_resource(&uri).await?)?;
            Ok(true)
        }
        Command::Snapshots { .. } => Ok(false),
    }
}

async fn run(cfg: Config, command: Command) -> HarnessResult<bool> {
    if let Command::Snapshots { action } = command {
        return run_snapshots(&cfg, action).await;
    }

    let manager = LifecycleManager::from_config(&cfg);
    manager.start().await?;

    let outcome = match manager.client() {
        Ok(client) => run_operation(&client, command).await,
        Err(e) => Err(e),
    };

    if let Some(exit) = manager.stop(cfg.timeouts.shutdown_grace()).await {
        info!(%exit, "Server stopped");
    }
    outcome
}

/// Entry point for the mcp-harness CLI.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.as_deref();
    let cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nExpected config at: {}", default_path.display());
                }
            }
            return ExitCode::FAILURE;
        }
    };

    // Initialise logging
    logging::init(logging::level_from_flags(
        args.verbose,
        args.quiet,
        &cfg.logging.level,
    ));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %cfg.server.display_command(),
        "Starting mcp-harness"
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg, args.command)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
