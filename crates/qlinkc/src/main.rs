#![forbid(unsafe_code)]

use qlinkc::api::{Api, Response};
use qlinkc::bridge::{Bridge, BridgeOptions, ConnectionSource};
use qlinkc::bridge_client::BridgeClient;
use qlinkc::config::{load_config, Cli, ClientConfig, Commands, Switch};
use qlinkc::connection::{ConnectionState, Link};
use qlinkc::router::Route;

use clap::Parser;
use qlink_common::{Frame, MessageKind};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";

const CLOSE_GRACE: Duration = Duration::from_secs(2);

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "warn,qlinkc=info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
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
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

fn resolve_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = load_config(cli.config.as_deref())?;

    if let Some(ref ip) = cli.ip {
        config.robot.ip = ip.clone();
    }
    if let Some(ref url) = cli.bridge {
        config.bridge.url = url.clone();
    }
    if let Some(ms) = cli.timeout_ms {
        config.request.timeout_ms = ms;
    }
    if let Commands::Bridge {
        listen: Some(ref listen),
    } = cli.command
    {
        config.bridge.listen = listen.clone();
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

// ── Bridge ──────────────────────────────────────────────────────────

async fn run_bridge(config: ClientConfig) -> anyhow::Result<()> {
    let span = info_span!("bridge", ip = %config.robot.ip);
    let options = BridgeOptions::from(&config.bridge);
    let bridge = Bridge::new(ConnectionSource::Config(config.clone()), options, span).await?;

    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}◈ qlink bridge{RESET} {DIM}v{v}{RESET}");
        eprintln!("  {DIM}Robot{RESET}      {CYAN}{}{RESET}", config.robot.ip);
        eprintln!("  {DIM}Listen{RESET}     ws://{}", bridge.local_addr());
        eprintln!();
    }

    bridge.connect().await?;
    info!("upstream session validated, serving clients");

    let mut state = bridge.state();
    tokio::select! {
        _ = state.wait_for(|s| *s == ConnectionState::Disconnected) => {
            warn!("upstream session closed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    bridge.close();
    Ok(())
}

// ── Bridge client commands ──────────────────────────────────────────

async fn open_client(config: &ClientConfig) -> Api<BridgeClient> {
    let url = config.bridge.url.clone();
    let client = BridgeClient::new(url.clone(), info_span!("client", bridge = %url));
    if let Err(e) = client.connect().await {
        if tty() {
            eprintln!();
            eprintln!("  {RED}✗{RESET} Could not connect to bridge");
            eprintln!("    {DIM}{e}{RESET}");
            eprintln!();
            eprintln!("    Is the bridge running? Try: {BOLD}qlinkc bridge{RESET}");
            eprintln!();
        } else {
            eprintln!("Failed to connect to bridge at {url}: {e}");
        }
        std::process::exit(1);
    }
    Api::new(Arc::new(client)).with_timeout(config.request_timeout())
}

/// Closes the link and waits for queued frames to be written.
async fn close_client(api: &Api<BridgeClient>) {
    let link = api.link();
    let mut state = link.state();
    link.close();
    let drained = tokio::time::timeout(
        CLOSE_GRACE,
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await;
    if drained.is_err() {
        warn!("bridge did not close in time");
    }
}

fn fmt_response(response: &Response) {
    let rendered = serde_json::from_str::<serde_json::Value>(&response.raw)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| response.raw.clone());
    if tty() {
        println!("  {GREEN}✓{RESET} {DIM}{}{RESET}", response.frame.topic_str());
        for line in rendered.lines() {
            println!("    {line}");
        }
    } else {
        println!("{}", response.raw);
    }
}

fn fmt_sent(what: &str) {
    if tty() {
        println!("  {GREEN}✓{RESET} {what}");
    }
}

async fn run_client(cli: &Cli, config: ClientConfig) -> anyhow::Result<()> {
    let api = open_client(&config).await;

    let outcome: anyhow::Result<()> = match &cli.command {
        Commands::Standup => api.standup().await.map(|r| fmt_response(&r)).map_err(Into::into),
        Commands::Sit => api.sit().await.map(|r| fmt_response(&r)).map_err(Into::into),
        Commands::Color { color, time, blink } => {
            let response = match blink {
                Some(cycle) => api.color_blink(*color, *cycle, *time).await,
                None => api.color(*color, *time).await,
            };
            response.map(|r| fmt_response(&r)).map_err(Into::into)
        }
        Commands::Lidar { state } => {
            let sent = match state {
                Switch::On => api.lidar_on(),
                Switch::Off => api.lidar_off(),
            };
            sent.map(|()| fmt_sent("LiDAR switch sent")).map_err(Into::into)
        }
        Commands::Move { x, y, rx, ry } => api
            .move_stick(*x, *y, *rx, *ry)
            .map(|()| fmt_sent("Stick sample sent"))
            .map_err(Into::into),
        Commands::Request {
            topic,
            code,
            params,
        } => request(&api, topic, *code, params.as_deref()).await,
        Commands::Send { frame } => send_raw(&api, frame),
        Commands::Watch { kind } => watch(&api, kind.as_deref()).await,
        Commands::Bridge { .. } => Ok(()),
    };

    close_client(&api).await;
    outcome
}

async fn request(
    api: &Api<BridgeClient>,
    topic: &str,
    code: u32,
    params: Option<&str>,
) -> anyhow::Result<()> {
    let params = params
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|e| anyhow::anyhow!("params must be JSON: {e}"))?;
    let response = api.request(topic, code, params).await?;
    fmt_response(&response);
    Ok(())
}

fn send_raw(api: &Api<BridgeClient>, text: &str) -> anyhow::Result<()> {
    let kind = Frame::parse(text)?.kind;
    api.link().send_raw(text.to_owned())?;
    fmt_sent(&format!("{kind} frame sent"));
    Ok(())
}

async fn watch(api: &Api<BridgeClient>, kind: Option<&str>) -> anyhow::Result<()> {
    let route = match kind {
        Some(name) => Route::Kind(
            MessageKind::from_wire(name)
                .ok_or_else(|| anyhow::anyhow!("unknown message type: {name}"))?,
        ),
        None => Route::Any,
    };
    let mut frames = api.link().router().subscribe(route);

    loop {
        tokio::select! {
            next = frames.recv() => match next {
                Some(inbound) => println!("{}", inbound.raw),
                None => {
                    warn!("bridge closed the stream");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli)?;

    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Bridge { .. } => run_bridge(config).await,
        _ => run_client(&cli, config).await,
    }
}
