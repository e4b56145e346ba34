//! myproxy: TCP/HTTP reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────┐
//!                    │                       MYPROXY                         │
//!                    │                                                       │
//!   Client bytes     │  ┌──────────┐   ┌──────────┐   ┌──────────┐          │
//!   ─────────────────┼─▶│   net    │──▶│  framer  │──▶│ routing  │          │
//!                    │  │ listener │   │ http/tcp │   │ snapshot │          │
//!                    │  └──────────┘   └──────────┘   └────┬─────┘          │
//!                    │                                     ▼                 │
//!                    │                               ┌──────────┐            │
//!                    │                               │   pool   │            │
//!                    │                               │  leases  │            │
//!                    │                               └────┬─────┘            │
//!                    │                                     ▼                 │
//!   Client bytes     │                ┌───────────────────────────┐         │
//!   ◀────────────────┼────────────────│      relay (both ways)     │◀────────┼── Upstream
//!                    │                └───────────────────────────┘         │
//!                    │                                                       │
//!                    │  config · lifecycle · observability · admin           │
//!                    └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use myproxy::config::load_config;
use myproxy::lifecycle;
use myproxy::observability::logging::init_logging;

#[derive(Debug, Parser)]
#[command(name = "myproxy", version, about = "TCP/HTTP reverse proxy")]
struct Args {
    /// TOML route file; watched for changes while running.
    #[arg(short, long, env = "ROUTE_TABLE_FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("myproxy: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = init_logging(&config.observability.log_level, config.observability.log_format) {
        eprintln!("myproxy: {}", e);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        port = config.listener.port,
        max_connections = config.listener.max_connections,
        "myproxy starting"
    );

    match lifecycle::run(config, args.config).await {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            ExitCode::from(1)
        }
    }
}
