//! Retry policy shared by the coordination client, the supervisor adapter,
//! and the lock loop.
//!
//! A policy describes a `backoff::ExponentialBackoff` schedule plus an
//! optional attempt cap. Fixed intervals are the degenerate schedule with a
//! multiplier of 1 and no randomization. Each retry loop calls
//! [`RetryPolicy::start`] and asks the returned [`Retry`] for the next pause
//! until it reports exhaustion.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Schedule {
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    randomization_factor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    schedule: Schedule,
    max_attempts: Option<u32>,
    max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    /// Constant interval between attempts, unbounded.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            schedule: Schedule {
                initial_interval: interval,
                multiplier: 1.0,
                max_interval: interval,
                randomization_factor: 0.0,
            },
            max_attempts: None,
            max_elapsed: None,
        }
    }

    /// Exponential backoff from 200ms, doubling up to 300s, randomized by ±15%.
    pub fn backoff() -> Self {
        Self {
            schedule: Schedule {
                initial_interval: Duration::from_millis(200),
                multiplier: 2.0,
                max_interval: Duration::from_secs(300),
                randomization_factor: 0.15,
            },
            max_attempts: None,
            max_elapsed: None,
        }
    }

    /// No waiting between attempts. Intended for tests.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = Some(budget);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.schedule.randomization_factor = 0.0;
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn max_elapsed(&self) -> Option<Duration> {
        self.max_elapsed
    }

    /// The backoff schedule this policy describes, clock started now.
    pub fn exponential(&self) -> ExponentialBackoff {
        let s = self.schedule;
        ExponentialBackoff {
            current_interval: s.initial_interval,
            initial_interval: s.initial_interval,
            multiplier: s.multiplier,
            max_interval: s.max_interval,
            randomization_factor: s.randomization_factor,
            max_elapsed_time: self.max_elapsed,
            ..ExponentialBackoff::default()
        }
    }

    /// Begin a retry loop.
    pub fn start(&self) -> Retry {
        Retry {
            backoff: self.exponential(),
            attempts: 0,
            max_attempts: self.max_attempts,
        }
    }
}

/// One running retry loop: a backoff schedule and the count of failed
/// attempts so far.
#[derive(Debug)]
pub struct Retry {
    backoff: ExponentialBackoff,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl Retry {
    /// Record a failed attempt and return the pause before the next one,
    /// or `None` once the attempt cap or the elapsed budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if let Some(max) = self.max_attempts
            && self.attempts >= max
        {
            return None;
        }
        self.backoff.next_backoff()
    }

    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
