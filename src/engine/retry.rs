use crate::config::Config;
use crate::model::{RunAttempt, RunResult};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

/// Exponential backoff with a hard attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, first attempt included.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.max_retries,
            base: cfg.backoff_base,
            max: cfg.backoff_max,
        }
    }

    /// Delay after the `attempts`-th failed attempt: base, 2*base, 4*base, ... capped at max.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn decide(&self, attempt: &RunAttempt, last: &RunResult) -> RetryDecision {
        if !last.state.is_retryable() || attempt.attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            after: self.backoff(attempt.attempts),
        }
    }

    /// Decide and, on retry, move the tile's next eligible time forward.
    pub fn advance(&self, attempt: &mut RunAttempt, last: &RunResult, now: Instant) -> RetryDecision {
        let decision = self.decide(attempt, last);
        if let RetryDecision::Retry { after } = decision {
            attempt.next_eligible = now + after;
        }
        decision
    }
}
