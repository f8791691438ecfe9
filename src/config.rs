//! Runtime configuration
//!
//! Parsed from command-line flags with environment-variable fallbacks.
//! `Config::default()` mirrors the flag defaults.

use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Presence hub server
#[derive(Parser, Debug, Clone)]
#[command(name = "presence_hub", version, about = "Real-time presence and fan-out server")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "PRESENCE_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Interval between heartbeat pings, must be shorter than the read timeout
    #[arg(long, env = "PRESENCE_PING_INTERVAL_MS", default_value_t = 54_000)]
    pub ping_interval_ms: u64,

    /// Idle read deadline, refreshed by every inbound frame or pong
    #[arg(long, env = "PRESENCE_READ_TIMEOUT_MS", default_value_t = 60_000)]
    pub read_timeout_ms: u64,

    /// Deadline for a single outbound write
    #[arg(long, env = "PRESENCE_WRITE_TIMEOUT_MS", default_value_t = 10_000)]
    pub write_timeout_ms: u64,

    /// Grace period for the close handshake before the transport is abandoned
    #[arg(long, env = "PRESENCE_CLOSE_GRACE_MS", default_value_t = 1_000)]
    pub close_grace_ms: u64,

    /// Largest accepted inbound message in bytes
    #[arg(long, env = "PRESENCE_MAX_MESSAGE_SIZE", default_value_t = 512 * 1024)]
    pub max_message_size: usize,

    /// Deliver group and broadcast messages back to their sender
    #[arg(long, env = "PRESENCE_SELF_ECHO")]
    pub self_echo: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            ping_interval_ms: 54_000,
            read_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            close_grace_ms: 1_000,
            max_message_size: 512 * 1024,
            self_echo: false,
        }
    }
}

/// Per-connection deadlines
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub write_timeout: Duration,
    pub close_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Config::default().connection()
    }
}

impl Config {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            write_timeout: self.write_timeout(),
            close_grace: self.close_grace(),
        }
    }

    /// Check the heartbeat and deadline settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("ping_interval", self.ping_interval_ms),
            ("read_timeout", self.read_timeout_ms),
            ("write_timeout", self.write_timeout_ms),
            ("close_grace", self.close_grace_ms),
        ];
        if let Some((name, _)) = durations.into_iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::ZeroDuration(name));
        }

        if self.ping_interval() >= self.read_timeout() {
            return Err(ConfigError::HeartbeatTooSlow {
                ping_interval: self.ping_interval(),
                read_timeout: self.read_timeout(),
            });
        }

        Ok(())
    }
}
