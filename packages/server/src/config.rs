use std::time::Duration;

use strum_macros::{AsRefStr, EnumString};
use thiserror::Error;

/// Verbosity of the server's structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("heartbeat timeout ({timeout:?}) must exceed the heartbeat interval ({interval:?})")]
    HeartbeatTimeoutTooShort {
        interval: Duration,
        timeout: Duration,
    },
}

/// Tunables for a [`crate::HubServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port.
    pub port: u16,
    /// Period between heartbeat probes.
    pub heartbeat_interval: Duration,
    /// Maximum silence before a session is evicted. Must exceed the probe
    /// interval.
    pub heartbeat_timeout: Duration,
    /// Connections beyond this count are closed with 1013.
    pub max_connections: usize,
    /// Drain window between the shutdown broadcast and the hard close.
    pub graceful_shutdown_timeout: Duration,
    pub log_level: LogLevel,
}

impl ServerConfig {
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            port,
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(3000),
            max_connections: 1000,
            graceful_shutdown_timeout: Duration::from_millis(5000),
            log_level: LogLevel::Info,
        }
    }

    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub const fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// # Errors
    ///
    /// * If the heartbeat timeout does not exceed the probe interval
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::HeartbeatTimeoutTooShort {
                interval: self.heartbeat_interval,
                timeout: self.heartbeat_timeout,
            });
        }
        Ok(())
    }
}
