use std::time::Duration;

use strum_macros::{AsRefStr, EnumString};

/// Verbosity of the client's structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Tunables for a [`crate::HubClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the hub, e.g. `ws://localhost:8080/ws`.
    pub url: String,
    /// Secret presented during authentication.
    pub token: String,
    /// Client name to claim. When `None` the server assigns the name its
    /// credential store associates with the token.
    pub name: Option<String>,
    /// Reconnect attempts after a dirty close before giving up.
    pub max_reconnect_attempts: u32,
    /// Period between proactive `heartbeat_response` frames.
    pub heartbeat_interval: Duration,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Growth factor of the reconnect backoff delay.
    pub reconnect_backoff_multiplier: f64,
    pub log_level: LogLevel,
}

impl ClientConfig {
    #[must_use]
    pub fn new(url: &str, token: &str) -> Self {
        Self {
            url: url.to_string(),
            token: token.to_string(),
            name: None,
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(10_000),
            reconnect_backoff_multiplier: 1.5,
            log_level: LogLevel::Info,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[must_use]
    pub const fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_reconnect_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.reconnect_backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub const fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}
