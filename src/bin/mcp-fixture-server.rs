//! mcp-fixture-server: reference stdio MCP server for exercising the harness.
//!
//! Speaks JSON-RPC on stdin/stdout and logs to stderr.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use mcp_harness::logging;
use mcp_harness::mcp::server::{FixtureOptions, FixtureServer};

/// Reference MCP server with well-behaved and misbehaving tools.
#[derive(Parser, Debug)]
#[command(name = "mcp-fixture-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Wait this long before reading the first request
    #[arg(long, value_name = "MS", default_value_t = 0)]
    startup_delay_ms: u64,

    /// Return listings in pages of this size
    #[arg(long, value_name = "N")]
    page_size: Option<usize>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(logging::level_from_flags(args.verbose, false, "warn"));

    let options = FixtureOptions {
        startup_delay: Duration::from_millis(args.startup_delay_ms),
        page_size: args.page_size,
    };
    info!(?options, "Starting fixture server");

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

    match runtime.block_on(FixtureServer::new(options).run()) {
        Ok(()) => {
            info!("Fixture server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Fixture server error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
