//! Disconnect classification and reconnection backoff
//!
//! Reason codes fall into three tiers. Terminal codes are never retried,
//! severe-transient codes get a bounded number of retries after a long fixed
//! delay, and everything else follows a capped, non-decreasing schedule.

use std::sync::Arc;
use std::time::Duration;

use mz_core::config::BackoffConfig;

/// Classification of a disconnect reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectTier {
    /// Retrying cannot succeed without re-pairing
    Terminal,
    /// Transport-side state needs time to settle
    Severe { delay: Duration },
    /// Generic network close
    Ordinary,
}

/// Outcome of asking the backoff what to do after a close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect after `delay`; `attempt` is 1-based
    Retry { delay: Duration, attempt: u32 },
    /// The retry budget for this tier is spent
    Exhausted { attempts: u32 },
    /// The reason code is terminal
    Terminal,
}

/// Static reason-code table built from configuration
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    terminal_codes: Vec<u16>,
    severe: Vec<(u16, Duration)>,
    delays: Vec<Duration>,
    max_retries: u32,
    severe_max_retries: u32,
}

impl ReconnectPolicy {
    /// Create a policy from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            terminal_codes: config.terminal_codes.clone(),
            severe: config.severe.iter().map(|r| (r.code, r.delay)).collect(),
            delays: config.delays.clone(),
            max_retries: config.max_retries,
            severe_max_retries: config.severe_max_retries,
        }
    }

    /// Classify a reason code. A missing code is an ordinary close.
    pub fn classify(&self, reason_code: Option<u16>) -> DisconnectTier {
        let Some(code) = reason_code else {
            return DisconnectTier::Ordinary;
        };
        if self.terminal_codes.contains(&code) {
            return DisconnectTier::Terminal;
        }
        match self.severe.iter().find(|(c, _)| *c == code) {
            Some((_, delay)) => DisconnectTier::Severe { delay: *delay },
            None => DisconnectTier::Ordinary,
        }
    }

    /// Delay for the ordinary retry following `retries` earlier retries
    pub fn ordinary_delay(&self, retries: u32) -> Duration {
        let index = (retries as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(index).copied().unwrap_or_default()
    }

    /// Retry budget for the most permissive tier
    pub fn max_retries(&self) -> u32 {
        self.max_retries.max(self.severe_max_retries)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

/// Per-session retry state over a shared policy.
///
/// Delays never decrease between two successful connects, even when the
/// tier of consecutive closes changes.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: Arc<ReconnectPolicy>,
    retries: u32,
    floor: Duration,
}

impl ReconnectBackoff {
    /// Create a fresh backoff over the given policy
    pub fn new(policy: Arc<ReconnectPolicy>) -> Self {
        Self {
            policy,
            retries: 0,
            floor: Duration::ZERO,
        }
    }

    /// Retries scheduled since the last successful connect
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Classify a reason code with the underlying policy
    pub fn classify(&self, reason_code: Option<u16>) -> DisconnectTier {
        self.policy.classify(reason_code)
    }

    /// Decide what to do after a close and advance the backoff on retry
    pub fn next_decision(&mut self, reason_code: Option<u16>) -> RetryDecision {
        let (budget, delay) = match self.policy.classify(reason_code) {
            DisconnectTier::Terminal => return RetryDecision::Terminal,
            DisconnectTier::Severe { delay } => (self.policy.severe_max_retries, delay),
            DisconnectTier::Ordinary => (
                self.policy.max_retries,
                self.policy.ordinary_delay(self.retries),
            ),
        };

        if self.retries >= budget {
            return RetryDecision::Exhausted {
                attempts: self.retries,
            };
        }

        let delay = delay.max(self.floor);
        self.floor = delay;
        self.retries += 1;

        RetryDecision::Retry {
            delay,
            attempt: self.retries,
        }
    }

    /// Reset after a successful connect
    pub fn reset(&mut self) {
        self.retries = 0;
        self.floor = Duration::ZERO;
    }
}
