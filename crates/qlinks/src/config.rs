use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments for the signaling proxy.
#[derive(Parser, Debug, Clone)]
#[command(name = "qlinks")]
#[command(about = "Signaling proxy for robots on the local network")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:3000", env = "QLINKS_LISTEN")]
    pub listen: SocketAddr,
    /// Port of the robots' local signaling endpoint.
    #[arg(long, default_value = "9991", env = "QLINKS_SIGNALING_PORT")]
    pub signaling_port: u16,
    /// Per-request timeout towards the robot, in milliseconds.
    #[arg(long, default_value = "10000", env = "QLINKS_SIGNALING_TIMEOUT_MS")]
    pub signaling_timeout_ms: u64,
    /// Robot addresses the proxy may signal. Repeatable; empty allows any.
    #[arg(long = "allow", env = "QLINKS_ALLOW", value_delimiter = ',')]
    pub allow: Vec<IpAddr>,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Write logs to a file instead of stderr
    #[arg(long, env = "QLINKS_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Port of the robots' local signaling endpoint.
    pub signaling_port: u16,
    /// Per-request timeout towards the robot.
    pub signaling_timeout: Duration,
    /// Robot addresses the proxy may signal. Empty allows any.
    pub allow: Vec<IpAddr>,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.signaling_port == 0 {
            return Err("signaling_port must be greater than 0".to_string());
        }
        if self.signaling_timeout.is_zero() {
            return Err("signaling_timeout_ms must be greater than 0".to_string());
        }
        if self.signaling_timeout > Duration::from_secs(300) {
            return Err("signaling_timeout_ms exceeds reasonable limit (300 seconds)".to_string());
        }
        Ok(())
    }

    /// Whether the proxy may signal the robot at `ip`.
    #[must_use]
    pub fn allows(&self, ip: IpAddr) -> bool {
        self.allow.is_empty() || self.allow.contains(&ip)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            signaling_port: args.signaling_port,
            signaling_timeout: Duration::from_millis(args.signaling_timeout_ms),
            allow: args.allow,
        }
    }
}
