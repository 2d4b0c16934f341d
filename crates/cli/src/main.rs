//! shardboot: bring a sharded MongoDB cluster from freshly started processes
//! to a queryable state.
//!
//! Environment variables (a `.env` file is read if present):
//!
//! | Variable                   | Default   | Description                        |
//! |----------------------------|-----------|------------------------------------|
//! | `SHARDBOOT_TIMEOUT`        | `120s`    | Readiness deadline per node        |
//! | `SHARDBOOT_POLL_INTERVAL`  | `2s`      | Delay between readiness polls      |
//! | `SHARDBOOT_COMMAND_TIMEOUT`| `30s`     | Limit for a single admin command   |
//! | `SHARDBOOT_MONGOSH`        | `mongosh` | Shell used to send admin commands  |
//! | `SHARDBOOT_MONGOD`         | `mongod`  | Binary for launched data nodes     |
//! | `SHARDBOOT_MONGOS`         | `mongos`  | Binary for the launched router     |
//! | `RUST_LOG`                 | `info`    | Log filter                         |
//!
//! Exit codes: 0 ready, 1 failed, 2 partially complete, 3 invalid topology.

use std::process::ExitCode;

use clap::Parser;
use shardboot_cli::{Args, LogFormat};
use shardboot_core::state::EXIT_FAILED;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str =
    "shardboot=info,shardboot_cli=info,shardboot_orchestrator=info,shardboot_mongo=info";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling bootstrap");
                cancel.cancel();
            }
        });
    }

    match shardboot_cli::run(&args, cancel).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "shardboot failed");
            ExitCode::from(EXIT_FAILED)
        }
    }
}
