//! Runtime configuration.
//!
//! Every option is a CLI flag with an environment fallback. `.env` is loaded
//! by the binary before parsing.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use url::Url;

use crate::error::ConfigError;
use crate::session::{ReconnectPolicy, SupervisorOptions};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "pairbot")]
#[command(about = "Chat bot that issues and verifies device-pairing codes")]
#[command(version)]
pub struct BotConfig {
    /// HTTP port for the pairing endpoints
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Address to bind the HTTP server to
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    /// Prefix that marks a chat message as a command
    #[arg(long, env = "BOT_PREFIX", default_value = ".")]
    pub prefix: String,

    /// Bot name used in the welcome message
    #[arg(long, env = "BOT_NAME", default_value = "DOM-X Bot")]
    pub bot_name: String,

    /// Directory holding session credentials
    #[arg(long, env = "AUTH_DIR", default_value = "auth_info")]
    pub auth_dir: PathBuf,

    /// WebSocket URL of the messaging bridge
    #[arg(long, env = "BRIDGE_URL", default_value = "ws://127.0.0.1:8765")]
    pub bridge_url: Url,

    /// Seconds to wait for the bridge handshake
    #[arg(long, env = "BRIDGE_CONNECT_TIMEOUT_SECS", default_value_t = 20)]
    pub bridge_connect_timeout_secs: u64,

    /// Lifetime of a pairing code in seconds
    #[arg(long, env = "PAIRING_CODE_TTL_SECS", default_value_t = 600)]
    pub code_ttl_secs: u64,

    /// Seconds between sweeps of expired pairing codes
    #[arg(long, env = "PAIRING_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Upstream service that issues pairing codes (relay mode)
    #[arg(long, env = "UPSTREAM_CODE_URL")]
    pub upstream_code_url: Option<Url>,

    /// Timeout for upstream code requests, in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 10)]
    pub upstream_timeout_secs: u64,

    /// Timeout for a single outbound message, in seconds
    #[arg(long, env = "SEND_TIMEOUT_SECS", default_value_t = 15)]
    pub send_timeout_secs: u64,

    /// First reconnect delay in milliseconds
    #[arg(long, env = "RECONNECT_BASE_DELAY_MS", default_value_t = 1000)]
    pub reconnect_base_delay_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[arg(long, env = "RECONNECT_MAX_DELAY_MS", default_value_t = 30_000)]
    pub reconnect_max_delay_ms: u64,

    /// Jitter as a fraction of the delay (0.0 to 1.0)
    #[arg(long, env = "RECONNECT_JITTER", default_value_t = 0.25)]
    pub reconnect_jitter: f64,

    /// Give up after this many consecutive failures (unset: never)
    #[arg(long, env = "RECONNECT_MAX_RETRIES")]
    pub reconnect_max_retries: Option<u32>,

    /// Log at error level once this many consecutive failures occur (0: never)
    #[arg(long, env = "RECONNECT_ALERT_AFTER", default_value_t = 5)]
    pub reconnect_alert_after: u32,

    /// Capacity of the inbound message queue
    #[arg(long, env = "INBOUND_QUEUE_CAPACITY", default_value_t = 256)]
    pub inbound_capacity: usize,

    /// Milliseconds to wait for room in the inbound queue before dropping
    #[arg(long, env = "INBOUND_TIMEOUT_MS", default_value_t = 5000)]
    pub inbound_timeout_ms: u64,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl BotConfig {
    /// Check cross-field constraints clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.trim().is_empty() || self.prefix.chars().any(char::is_whitespace) {
            return Err(invalid("BOT_PREFIX", "must be non-empty without whitespace"));
        }
        if self.code_ttl_secs == 0 {
            return Err(invalid("PAIRING_CODE_TTL_SECS", "must be greater than zero"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(invalid("PAIRING_SWEEP_INTERVAL_SECS", "must be greater than zero"));
        }
        if self.send_timeout_secs == 0 {
            return Err(invalid("SEND_TIMEOUT_SECS", "must be greater than zero"));
        }
        if self.upstream_timeout_secs == 0 {
            return Err(invalid("UPSTREAM_TIMEOUT_SECS", "must be greater than zero"));
        }
        if self.inbound_capacity == 0 {
            return Err(invalid("INBOUND_QUEUE_CAPACITY", "must be greater than zero"));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(invalid(
                "RECONNECT_MAX_DELAY_MS",
                "must not be smaller than RECONNECT_BASE_DELAY_MS",
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(invalid("RECONNECT_JITTER", "must be between 0.0 and 1.0"));
        }
        if !matches!(self.bridge_url.scheme(), "ws" | "wss") {
            return Err(invalid("BRIDGE_URL", "scheme must be ws or wss"));
        }
        if let Some(url) = &self.upstream_code_url
            && !matches!(url.scheme(), "http" | "https")
        {
            return Err(invalid("UPSTREAM_CODE_URL", "scheme must be http or https"));
        }
        Ok(())
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn code_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.code_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn bridge_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge_connect_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Upstream base URL with a trailing slash, so `join("code")` appends
    /// instead of replacing the last path segment.
    pub fn upstream_base_url(&self) -> Option<Url> {
        self.upstream_code_url.clone().map(|mut url| {
            if !url.path().ends_with('/') {
                let path = format!("{}/", url.path());
                url.set_path(&path);
            }
            url
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay_ms: self.reconnect_base_delay_ms,
            max_delay_ms: self.reconnect_max_delay_ms,
            jitter_factor: self.reconnect_jitter,
            max_retries: self.reconnect_max_retries,
            alert_after: self.reconnect_alert_after,
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            inbound_timeout: Duration::from_millis(self.inbound_timeout_ms),
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
