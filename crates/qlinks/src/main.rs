#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use qlinks::config::{Args, ServerConfig};
use qlinks::run;
use qlinks::server::ServerState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(args: &Args) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }
    if config.allow.is_empty() {
        info!("no allow-list configured, any robot address is accepted");
    }

    let state = Arc::new(ServerState::new(config.clone()));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    tokio::select! {
        result = run(listener, state) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}
