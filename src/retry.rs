//! Retry and failure escalation policy for sink writes.

use std::fmt;
use std::time::Duration;

/// Default number of retries after the first failed write.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between write attempts.
pub const DEFAULT_AWAIT_RETRY: Duration = Duration::from_millis(10);

/// Policy for retrying failed writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: DEFAULT_AWAIT_RETRY,
        }
    }
}

impl RetryPolicy {
    /// Create a fixed delay policy.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// Calculate the delay before the attempt following `attempt` (1-indexed).
    ///
    /// Returns `None` once `attempt` exceeds `max_retries`, i.e. after
    /// `max_retries + 1` attempts in total.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt <= self.max_retries {
            Some(self.delay)
        } else {
            None
        }
    }

    /// Upper bound on write attempts for one record.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// What happens to a record once its retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Escalation {
    /// Fail the message's acknowledgement and move on; the record is dropped.
    #[default]
    Propagate,
    /// Stop the whole pipeline.
    Halt,
    /// Hold the acknowledgement until the pipeline is stopped externally.
    Wait,
}

impl Escalation {
    /// Resolve the configuration flags; halting wins over waiting.
    pub fn from_flags(halt_on_error: bool, wait_on_error: bool) -> Self {
        if halt_on_error {
            Self::Halt
        } else if wait_on_error {
            Self::Wait
        } else {
            Self::Propagate
        }
    }
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Propagate => write!(f, "propagate"),
            Self::Halt => write!(f, "halt"),
            Self::Wait => write!(f, "wait"),
        }
    }
}
