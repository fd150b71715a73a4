//! Progressive-timeout retry schedule for health checks.
//!
//! State machine: Pending → Succeeded | Failed
//! - Attempt `i` (0-based) gets a timeout of `base + step * i`
//! - Before attempt `i > 0` the checker waits `delay_step * i`
//! - After `max_attempts` failures the state is terminal
//!
//! The schedule is pure arithmetic and the state holds no clock, so both can
//! be tested without any I/O.

use std::time::Duration;

use gantry_types::errors::TransportFailure;

/// Timeout and delay parameters of the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Timeout of the first attempt.
    pub base_timeout: Duration,
    /// Added to the timeout for every further attempt.
    pub timeout_step: Duration,
    /// Delay before attempt `i` is `delay_step * i`.
    pub delay_step: Duration,
    pub max_attempts: u32,
}

impl Default for RetrySchedule {
    /// 10s/20s/30s timeouts with 2s and 4s pauses in between.
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_secs(10),
            timeout_step: Duration::from_secs(10),
            delay_step: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

impl RetrySchedule {
    /// Per-attempt timeout for the 0-based attempt `index`.
    pub fn timeout_for(&self, index: u32) -> Duration {
        self.base_timeout + self.timeout_step * index
    }

    /// Pause before the 0-based attempt `index`; zero for the first attempt.
    pub fn delay_before(&self, index: u32) -> Duration {
        self.delay_step * index
    }

    /// Upper bound on the wall time of a check that exhausts every attempt.
    pub fn worst_case(&self) -> Duration {
        (0..self.max_attempts)
            .map(|i| self.delay_before(i) + self.timeout_for(i))
            .sum()
    }
}

/// Where one backend's check currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Pending,
    Succeeded,
    Failed,
}

/// The next attempt the schedule permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedAttempt {
    /// 0-based index into the schedule.
    pub index: u32,
    /// 1-based attempt number, as reported.
    pub number: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

/// Retry bookkeeping for a single backend.
#[derive(Debug, Clone)]
pub struct RetryState {
    schedule: RetrySchedule,
    phase: RetryPhase,
    attempts_made: u32,
    last_failure: Option<TransportFailure>,
}

impl RetryState {
    pub fn new(schedule: RetrySchedule) -> Self {
        let phase = if schedule.max_attempts == 0 {
            RetryPhase::Failed
        } else {
            RetryPhase::Pending
        };
        Self {
            schedule,
            phase,
            attempts_made: 0,
            last_failure: None,
        }
    }

    /// The attempt to make next, or `None` once the state is terminal.
    pub fn next_attempt(&self) -> Option<PlannedAttempt> {
        if self.phase != RetryPhase::Pending {
            return None;
        }
        let index = self.attempts_made;
        Some(PlannedAttempt {
            index,
            number: index + 1,
            delay: self.schedule.delay_before(index),
            timeout: self.schedule.timeout_for(index),
        })
    }

    pub fn record_success(&mut self) {
        if self.phase != RetryPhase::Pending {
            return;
        }
        self.attempts_made += 1;
        self.transition_to(RetryPhase::Succeeded);
    }

    pub fn record_failure(&mut self, failure: TransportFailure) {
        if self.phase != RetryPhase::Pending {
            return;
        }
        self.attempts_made += 1;
        self.last_failure = Some(failure);
        if self.attempts_made >= self.schedule.max_attempts {
            self.transition_to(RetryPhase::Failed);
        }
    }

    pub fn phase(&self) -> RetryPhase {
        self.phase
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn last_failure(&self) -> Option<&TransportFailure> {
        self.last_failure.as_ref()
    }

    fn transition_to(&mut self, phase: RetryPhase) {
        tracing::trace!(from = ?self.phase, to = ?phase, attempts = self.attempts_made, "retry state transition");
        self.phase = phase;
    }
}
