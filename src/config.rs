//! Signing-core configuration derived from environment variables.
//!
//! Configuration is loaded once at startup and validated before use.
//! Anything scoped to a single ceremony (base URL, encryption key, mode)
//! lives on the session instead.
//!
//! ## Environment Variables
//!
//! ### Transport
//! - `KEYSIGN_RELAY_URL`: Public relay base URL
//! - `KEYSIGN_NETWORK_MODE`: "relay" or "local" (default: relay)
//! - `KEYSIGN_MEDIATOR_HOST`: Local mediator bind address (default: 0.0.0.0)
//! - `KEYSIGN_MEDIATOR_PORT`: Local mediator port (default: 18080)
//! - `KEYSIGN_SERVICE_PREFIX`: Prefix of the advertised mediator service name
//!
//! ### Retry and polling
//! - `KEYSIGN_RETRY_ATTEMPTS`: Attempts per relay call before giving up (default: 3)
//! - `KEYSIGN_RETRY_BACKOFF_MS`: Fixed delay between attempts (default: 1000)
//! - `KEYSIGN_POLL_INTERVAL_MS`: Discovery and start-signal poll interval (default: 1000)
//! - `KEYSIGN_REQUEST_TIMEOUT_MS`: Per-request HTTP timeout (default: 30000)
//! - `KEYSIGN_CEREMONY_TIMEOUT_SECS`: Inbound-message wait per ceremony (default: 60)
//!
//! ### Storage and logging
//! - `KEYSIGN_DB_PATH`: Path to the ReDB vault database
//! - `KEYSIGN_LOG_FORMAT`: "json" for JSON log lines
//! - `RUST_LOG`: Log level filter

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_RELAY_URL: &str = "https://api.vultisig.com/router";
const DEFAULT_MEDIATOR_PORT: u16 = 18080;
const DEFAULT_SERVICE_PREFIX: &str = "vultisigApp";
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CEREMONY_TIMEOUT_SECS: u64 = 60;

/// Helper to get trimmed env var or empty string.
fn env_trim(name: &str) -> String {
    env::var(name).unwrap_or_default().trim().to_string()
}

/// Helper to get lowercase env var.
fn env_lower(name: &str) -> String {
    env_trim(name).to_lowercase()
}

/// Transport backend used by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Public relay reachable over the internet.
    #[default]
    Relay,
    /// Mediator started on this device and advertised on the local network.
    Local,
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relay" | "internet" => Ok(Self::Relay),
            "local" => Ok(Self::Local),
            other => Err(format!(
                "Invalid network mode '{other}'. Must be 'relay' or 'local'."
            )),
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Relay => write!(f, "relay"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Signing-core configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    // Transport
    relay_url: String,
    network_mode: NetworkMode,
    mediator_host: IpAddr,
    mediator_port: u16,
    service_prefix: String,

    // Retry and polling
    retry_attempts: u32,
    retry_backoff_ms: u64,
    poll_interval_ms: u64,
    request_timeout_ms: u64,
    ceremony_timeout_secs: u64,

    // Storage and logging
    db_path: PathBuf,
    log_format: LogFormat,
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// Unset or unparsable values fall back to defaults; call
    /// [`Settings::validate`] before use.
    pub fn from_env() -> Self {
        let relay_url = env_trim("KEYSIGN_RELAY_URL");
        let relay_url = if relay_url.is_empty() {
            DEFAULT_RELAY_URL.to_string()
        } else {
            relay_url.trim_end_matches('/').to_string()
        };

        let network_mode = env_trim("KEYSIGN_NETWORK_MODE")
            .parse::<NetworkMode>()
            .unwrap_or_default();

        let mediator_host = env_trim("KEYSIGN_MEDIATOR_HOST")
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let mediator_port = env_trim("KEYSIGN_MEDIATOR_PORT")
            .parse::<u16>()
            .unwrap_or(DEFAULT_MEDIATOR_PORT);

        let service_prefix = env_trim("KEYSIGN_SERVICE_PREFIX");
        let service_prefix = if service_prefix.is_empty() {
            DEFAULT_SERVICE_PREFIX.to_string()
        } else {
            service_prefix
        };

        let retry_attempts = env_trim("KEYSIGN_RETRY_ATTEMPTS")
            .parse::<u32>()
            .unwrap_or(DEFAULT_RETRY_ATTEMPTS);

        let retry_backoff_ms = env_trim("KEYSIGN_RETRY_BACKOFF_MS")
            .parse::<u64>()
            .unwrap_or(DEFAULT_RETRY_BACKOFF_MS);

        let poll_interval_ms = env_trim("KEYSIGN_POLL_INTERVAL_MS")
            .parse::<u64>()
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let request_timeout_ms = env_trim("KEYSIGN_REQUEST_TIMEOUT_MS")
            .parse::<u64>()
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);

        let ceremony_timeout_secs = env_trim("KEYSIGN_CEREMONY_TIMEOUT_SECS")
            .parse::<u64>()
            .unwrap_or(DEFAULT_CEREMONY_TIMEOUT_SECS);

        let db_path = env_trim("KEYSIGN_DB_PATH");
        let db_path = if db_path.is_empty() {
            PathBuf::from("./.data/vaults.redb")
        } else {
            PathBuf::from(db_path)
        };

        let log_format = match env_lower("KEYSIGN_LOG_FORMAT").as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            relay_url,
            network_mode,
            mediator_host,
            mediator_port,
            service_prefix,
            retry_attempts,
            retry_backoff_ms,
            poll_interval_ms,
            request_timeout_ms,
            ceremony_timeout_secs,
            db_path,
            log_format,
        }
    }

    /// Create settings for tests: loopback mediator on an ephemeral port,
    /// short poll and backoff intervals.
    pub fn for_tests() -> Self {
        Self {
            relay_url: "http://127.0.0.1:18080".to_string(),
            network_mode: NetworkMode::Local,
            mediator_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            mediator_port: 0,
            service_prefix: DEFAULT_SERVICE_PREFIX.to_string(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff_ms: 20,
            poll_interval_ms: 20,
            request_timeout_ms: 5_000,
            ceremony_timeout_secs: 10,
            db_path: PathBuf::from("./.data/test-vaults.redb"),
            log_format: LogFormat::Text,
        }
    }

    /// Return a copy using a different relay URL.
    #[must_use]
    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Return a copy using a different network mode.
    #[must_use]
    pub fn with_network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = mode;
        self
    }

    /// Return a copy using a different mediator port.
    #[must_use]
    pub fn with_mediator_port(mut self, port: u16) -> Self {
        self.mediator_port = port;
        self
    }

    /// Validate settings.
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.relay_url.starts_with("http://") || self.relay_url.starts_with("https://")) {
            return Err(format!(
                "KEYSIGN_RELAY_URL must be an http(s) URL, got '{}'",
                self.relay_url
            ));
        }

        if self.retry_attempts == 0 {
            return Err("KEYSIGN_RETRY_ATTEMPTS must be at least 1".to_string());
        }

        if self.poll_interval_ms == 0 {
            return Err("KEYSIGN_POLL_INTERVAL_MS must be greater than zero".to_string());
        }

        if self.service_prefix.contains(char::is_whitespace) {
            return Err("KEYSIGN_SERVICE_PREFIX must not contain whitespace".to_string());
        }

        Ok(())
    }

    // Getters

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.network_mode
    }

    pub fn mediator_addr(&self) -> SocketAddr {
        SocketAddr::new(self.mediator_host, self.mediator_port)
    }

    pub fn service_prefix(&self) -> &str {
        &self.service_prefix
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ceremony_timeout(&self) -> Duration {
        Duration::from_secs(self.ceremony_timeout_secs)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}
