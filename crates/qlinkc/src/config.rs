use clap::{Parser, Subcommand, ValueEnum};
use qlink_common::types::{Color, SIGNALING_PORT, VENDOR_PREFIX};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI interface for the robot client.
#[derive(Parser)]
#[command(name = "qlinkc", about = "Robot control-channel client and broadcast bridge")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Robot IP address override.
    #[arg(long, global = true)]
    pub ip: Option<String>,

    /// Bridge WebSocket URL override (for commands talking to a running bridge).
    #[arg(long, global = true)]
    pub bridge: Option<String>,

    /// Request timeout override, in milliseconds.
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Connect to the robot and serve the broadcast bridge.
    Bridge {
        /// Listen address override (host:port).
        #[arg(long)]
        listen: Option<String>,
    },
    /// Stand up.
    Standup,
    /// Lie down.
    Sit,
    /// Set the body light color.
    Color {
        /// One of white, red, yellow, blue, green, cyan, purple.
        color: Color,
        /// Duration in seconds.
        #[arg(long, default_value_t = 1)]
        time: u32,
        /// Blink with this flash cycle (ms) instead of holding the color.
        #[arg(long)]
        blink: Option<u32>,
    },
    /// Switch the LiDAR on or off.
    Lidar {
        /// Desired state.
        state: Switch,
    },
    /// Send one virtual joystick sample.
    Move {
        /// Left stick x.
        #[arg(allow_hyphen_values = true)]
        x: f64,
        /// Left stick y.
        #[arg(allow_hyphen_values = true)]
        y: f64,
        /// Right stick x.
        #[arg(allow_hyphen_values = true, default_value_t = 0.0)]
        rx: f64,
        /// Right stick y.
        #[arg(allow_hyphen_values = true, default_value_t = 0.0)]
        ry: f64,
    },
    /// Issue a request and print the correlated response.
    Request {
        /// Request topic (e.g. `rt/api/sport/request`).
        topic: String,
        /// Command code (`api_id`).
        code: u32,
        /// JSON parameters.
        params: Option<String>,
    },
    /// Send a raw JSON frame.
    Send {
        /// Frame JSON, e.g. `{"type":"subscribe","topic":"rt/lf/lowstate"}`.
        frame: String,
    },
    /// Print inbound frames.
    Watch {
        /// Only print frames of this type (wire name, e.g. `msg`).
        #[arg(long = "type")]
        kind: Option<String>,
    },
}

/// On/off switch value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    /// On.
    On,
    /// Off.
    Off,
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Robot addressing and signaling.
    pub robot: RobotConfig,
    /// Request/response settings.
    pub request: RequestConfig,
    /// Keepalive settings.
    pub heartbeat: HeartbeatConfig,
    /// Validation exchange settings.
    pub validation: ValidationConfig,
    /// Broadcast bridge settings.
    pub bridge: BridgeConfig,
}

/// Robot addressing and signaling.
#[derive(Debug, Deserialize, Clone)]
pub struct RobotConfig {
    /// Robot IP address.
    pub ip: String,
    /// Opaque token merged into the offer. Empty means none.
    pub token: String,
    /// Port of the robot's local signaling endpoint.
    pub signaling_port: u16,
    /// Signaling proxy URL. Empty means signal the robot directly.
    pub signaling_url: String,
    /// Per-request timeout for signaling calls, in milliseconds.
    pub signaling_timeout_ms: u64,
    /// Overall deadline for connect (handshake plus validation), in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.12.1".to_string(),
            token: String::new(),
            signaling_port: SIGNALING_PORT,
            signaling_url: String::new(),
            signaling_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
        }
    }
}

/// Request/response settings.
#[derive(Debug, Deserialize, Clone)]
pub struct RequestConfig {
    /// Time to wait for a correlated response, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

/// Keepalive settings.
#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    /// Interval between heartbeat frames, in milliseconds.
    pub period_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { period_ms: 2000 }
    }
}

/// Validation exchange settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    /// Challenges answered before giving up on the session.
    pub max_attempts: u32,
    /// Prefix hashed with each challenge.
    pub vendor_prefix: String,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            vendor_prefix: VENDOR_PREFIX.to_string(),
        }
    }
}

/// Broadcast bridge settings.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    /// Address the bridge listens on.
    pub listen: String,
    /// URL clients use to reach a running bridge.
    pub url: String,
    /// Frames buffered per downstream client before it is dropped.
    pub client_queue: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3333".to_string(),
            url: "ws://127.0.0.1:3333".to_string(),
            client_queue: 256,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            robot: RobotConfig::default(),
            request: RequestConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            validation: ValidationConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.robot.ip.is_empty() {
            return Err("robot.ip must not be empty".to_string());
        }
        if self.robot.signaling_port == 0 {
            return Err("robot.signaling_port must be greater than 0".to_string());
        }
        if !self.robot.signaling_url.is_empty()
            && !(self.robot.signaling_url.starts_with("http://")
                || self.robot.signaling_url.starts_with("https://"))
        {
            return Err(format!(
                "robot.signaling_url must start with http:// or https://, got: {}",
                self.robot.signaling_url
            ));
        }
        if self.robot.signaling_timeout_ms == 0 {
            return Err("robot.signaling_timeout_ms must be greater than 0".to_string());
        }
        if self.robot.connect_timeout_ms == 0 {
            return Err("robot.connect_timeout_ms must be greater than 0".to_string());
        }

        if self.request.timeout_ms == 0 {
            return Err("request.timeout_ms must be greater than 0".to_string());
        }
        if self.heartbeat.period_ms == 0 {
            return Err("heartbeat.period_ms must be greater than 0".to_string());
        }
        if self.validation.max_attempts == 0 {
            return Err("validation.max_attempts must be greater than 0".to_string());
        }
        if self.validation.vendor_prefix.is_empty() {
            return Err("validation.vendor_prefix must not be empty".to_string());
        }

        if self.bridge.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "bridge.listen must be a host:port socket address, got: {}",
                self.bridge.listen
            ));
        }
        if !(self.bridge.url.starts_with("ws://") || self.bridge.url.starts_with("wss://")) {
            return Err(format!(
                "bridge.url must start with ws:// or wss://, got: {}",
                self.bridge.url
            ));
        }
        if self.bridge.client_queue == 0 {
            return Err("bridge.client_queue must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Token to merge into the offer, if any.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        Some(self.robot.token.as_str()).filter(|t| !t.is_empty())
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request.timeout_ms)
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();
    let mut builder = config::Config::builder()
        .set_default("robot.ip", defaults.robot.ip.as_str())?
        .set_default("robot.token", defaults.robot.token.as_str())?
        .set_default("robot.signaling_port", i64::from(defaults.robot.signaling_port))?
        .set_default("robot.signaling_url", defaults.robot.signaling_url.as_str())?
        .set_default(
            "robot.signaling_timeout_ms",
            defaults.robot.signaling_timeout_ms as i64,
        )?
        .set_default(
            "robot.connect_timeout_ms",
            defaults.robot.connect_timeout_ms as i64,
        )?
        .set_default("request.timeout_ms", defaults.request.timeout_ms as i64)?
        .set_default("heartbeat.period_ms", defaults.heartbeat.period_ms as i64)?
        .set_default(
            "validation.max_attempts",
            i64::from(defaults.validation.max_attempts),
        )?
        .set_default(
            "validation.vendor_prefix",
            defaults.validation.vendor_prefix.as_str(),
        )?
        .set_default("bridge.listen", defaults.bridge.listen.as_str())?
        .set_default("bridge.url", defaults.bridge.url.as_str())?
        .set_default("bridge.client_queue", defaults.bridge.client_queue as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        let native_path = dirs::config_dir().map(|d| d.join("qlink").join("config.toml"));
        let xdg_path = dirs::home_dir().map(|d| d.join(".config").join("qlink").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    // Field names contain underscores, so sections are split on `__`
    // (QLINK_ROBOT__IP, QLINK_REQUEST__TIMEOUT_MS).
    builder = builder.add_source(
        config::Environment::with_prefix("QLINK")
            .prefix_separator("_")
            .separator("__"),
    );

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}
