//! Session manager configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_secs, duration_secs_vec};
use crate::error::ConfigError;

/// Configuration for the tenant coordinator and its sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum number of sessions held by the coordinator
    pub max_sessions_total: usize,

    /// Maximum number of sessions establishing (connecting or waiting for a
    /// pairing scan) at the same time
    pub max_concurrent_sessions: usize,

    /// Connection attempts allowed before a successful connect resets them
    pub max_connection_attempts: u32,

    /// Minimum spacing between two transport opens in this process
    #[serde(with = "duration_secs")]
    pub creation_spacing: Duration,

    /// Lower bound of the random delay applied before each transport open
    pub startup_jitter_min_ms: u64,

    /// Upper bound of the random delay applied before each transport open
    pub startup_jitter_max_ms: u64,

    /// Age after which an unscanned pairing code is discarded
    #[serde(with = "duration_secs")]
    pub pairing_code_ttl: Duration,

    /// Inactivity after which a session is reaped
    #[serde(with = "duration_secs")]
    pub idle_threshold: Duration,

    /// Interval between idle reaping passes
    #[serde(with = "duration_secs")]
    pub reap_interval: Duration,

    /// Delay between tearing a session down and purging its credentials
    #[serde(with = "duration_secs")]
    pub purge_delay: Duration,

    /// Upper bound on waiting for a session task to exit on removal
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,

    /// Capacity of the lifecycle event broadcast channel
    pub event_capacity: usize,

    /// Directory holding persisted tenant credentials
    pub credentials_dir: PathBuf,

    /// Disconnect classification and retry schedule
    pub backoff: BackoffConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions_total: 10,
            max_concurrent_sessions: 1,
            max_connection_attempts: 3,
            creation_spacing: Duration::from_secs(5),
            startup_jitter_min_ms: 1_000,
            startup_jitter_max_ms: 5_000,
            pairing_code_ttl: Duration::from_secs(5 * 60),
            idle_threshold: Duration::from_secs(30 * 60),
            reap_interval: Duration::from_secs(5 * 60),
            purge_delay: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(10),
            event_capacity: 1024,
            credentials_dir: super::default_credentials_dir(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Startup jitter bounds as durations
    pub fn startup_jitter(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.startup_jitter_min_ms),
            Duration::from_millis(self.startup_jitter_max_ms),
        )
    }

    /// Check the configuration for values the coordinator cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions_total == 0 {
            return Err(ConfigError::Invalid(
                "max_sessions_total must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_sessions must be at least 1".to_string(),
            ));
        }
        if self.max_connection_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_connection_attempts must be at least 1".to_string(),
            ));
        }
        if self.startup_jitter_min_ms > self.startup_jitter_max_ms {
            return Err(ConfigError::Invalid(format!(
                "startup_jitter_min_ms ({}) exceeds startup_jitter_max_ms ({})",
                self.startup_jitter_min_ms, self.startup_jitter_max_ms
            )));
        }
        if self.reap_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "reap_interval must be non-zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        self.backoff.validate()
    }
}

/// Reason code that is retried once after a long fixed delay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SevereReason {
    /// Transport reason code
    pub code: u16,

    /// Delay before the single retry
    #[serde(with = "duration_secs")]
    pub delay: Duration,
}

impl SevereReason {
    pub fn new(code: u16, delay: Duration) -> Self {
        Self { code, delay }
    }
}

/// Disconnect classification and reconnection schedule
///
/// Codes that are neither terminal nor severe, including the 5xx server
/// errors 500 to 503, follow the ordinary schedule. Listing them in
/// `terminal_codes` makes them end the session and purge its credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Reason codes after which retrying cannot succeed without re-pairing
    pub terminal_codes: Vec<u16>,

    /// Retries allowed for ordinary (generic network) closes
    pub max_retries: u32,

    /// Retries allowed for severe-transient closes
    pub severe_max_retries: u32,

    /// Delay per ordinary retry; the last entry repeats
    #[serde(with = "duration_secs_vec")]
    pub delays: Vec<Duration>,

    /// Severe-transient reason codes with their fixed delays
    pub severe: Vec<SevereReason>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            terminal_codes: vec![401, 403, 404],
            max_retries: 3,
            severe_max_retries: 1,
            delays: vec![
                Duration::from_secs(15),
                Duration::from_secs(30),
                Duration::from_secs(60),
            ],
            severe: vec![
                SevereReason::new(440, Duration::from_secs(60)),
                SevereReason::new(429, Duration::from_secs(60)),
                SevereReason::new(515, Duration::from_secs(30)),
                SevereReason::new(428, Duration::from_secs(20)),
            ],
        }
    }
}

impl BackoffConfig {
    /// Check that the schedule is usable and unambiguous
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delays.is_empty() {
            return Err(ConfigError::Invalid(
                "backoff.delays must contain at least one delay".to_string(),
            ));
        }
        if self.delays.windows(2).any(|w| w[1] < w[0]) {
            return Err(ConfigError::Invalid(
                "backoff.delays must be non-decreasing".to_string(),
            ));
        }
        if let Some(rule) = self
            .severe
            .iter()
            .find(|rule| self.terminal_codes.contains(&rule.code))
        {
            return Err(ConfigError::Invalid(format!(
                "reason code {} is listed as both terminal and severe",
                rule.code
            )));
        }
        Ok(())
    }
}
