//! Sync client configuration.
//!
//! Every section has defaults; [`SyncConfig::from_env`] overrides them from
//! `SYNC_*` environment variables.

use crate::error::{Result, SyncError};
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the channel transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Push endpoint, `ws://` or `wss://`.
    pub url: String,
    /// Interval between ping frames.
    pub ping_interval: Duration,
    /// Timeout for each TCP connect attempt.
    pub connect_timeout: Duration,
    /// Timeout waiting for the server to accept or reject the credential.
    pub auth_timeout: Duration,
    /// Initial delay before a reconnection attempt.
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay (for exponential backoff).
    pub max_reconnect_delay: Duration,
    /// Consecutive failed attempts after which the transport gives up.
    pub max_reconnect_attempts: u32,
    /// Label used in logs.
    pub label: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8090/ws".to_string(),
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            label: "sync-transport".to_string(),
        }
    }
}

/// Gap detection settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Consecutive missing sequence numbers that trigger immediate recovery.
    pub gap_threshold: u64,
    /// Capacity of the missing-sequence set.
    pub max_missed: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            gap_threshold: 5,
            max_missed: 1000,
        }
    }
}

/// Recovery request settings.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Interval of the periodic missing-sequence sweep.
    pub sweep_interval: Duration,
    /// How long an unanswered recovery request blocks new ones.
    pub timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Listener registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Events held while the session is not yet authenticated.
    pub max_buffered_events: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_buffered_events: 1000,
        }
    }
}

/// REST collaborator settings.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL of the admin API.
    pub base_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Complete sync client configuration.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub transport: TransportConfig,
    pub tracker: TrackerConfig,
    pub recovery: RecoveryConfig,
    pub registry: RegistryConfig,
    pub rest: RestConfig,
}

fn parse_var<T: FromStr>(name: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| SyncError::Config(format!("{} must be a number, got '{}'", name, value))),
        None => Ok(default),
    }
}

impl SyncConfig {
    /// Build a config from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = SyncConfig::default();

        if let Some(url) = lookup("SYNC_WS_URL") {
            config.transport.url = url;
        }
        if let Some(url) = lookup("SYNC_REST_URL") {
            config.rest.base_url = url;
        }

        config.tracker.gap_threshold = parse_var(
            "SYNC_GAP_THRESHOLD",
            lookup("SYNC_GAP_THRESHOLD"),
            config.tracker.gap_threshold,
        )?;
        config.tracker.max_missed = parse_var(
            "SYNC_MAX_MISSED",
            lookup("SYNC_MAX_MISSED"),
            config.tracker.max_missed,
        )?;
        config.recovery.sweep_interval = Duration::from_secs(parse_var(
            "SYNC_SWEEP_INTERVAL_SECS",
            lookup("SYNC_SWEEP_INTERVAL_SECS"),
            config.recovery.sweep_interval.as_secs(),
        )?);
        config.recovery.timeout = Duration::from_secs(parse_var(
            "SYNC_RECOVERY_TIMEOUT_SECS",
            lookup("SYNC_RECOVERY_TIMEOUT_SECS"),
            config.recovery.timeout.as_secs(),
        )?);
        config.transport.max_reconnect_attempts = parse_var(
            "SYNC_MAX_RECONNECT_ATTEMPTS",
            lookup("SYNC_MAX_RECONNECT_ATTEMPTS"),
            config.transport.max_reconnect_attempts,
        )?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the sync layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tracker.max_missed == 0 {
            return Err(SyncError::Config("max_missed must be at least 1".to_string()));
        }
        if self.recovery.sweep_interval.is_zero() {
            return Err(SyncError::Config("sweep interval must be non-zero".to_string()));
        }
        if self.transport.ping_interval.is_zero() {
            return Err(SyncError::Config("ping interval must be non-zero".to_string()));
        }
        Ok(())
    }
}
