//! Retry/backoff engine for flaky remote calls.
//!
//! Time, sleeping, and randomness are injected through small traits so the
//! engine is deterministic under test. Production implementations live in
//! `io::clock`.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

use crate::error::{CodedError, ErrorCode};

/// Maximum relative jitter applied to a scheduled delay.
pub const JITTER_RATIO: f64 = 0.2;

/// PR lookups right after creation (host indexing lag).
pub const PR_VIEW_SCHEDULE: &[Duration] = &[
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

/// Mergeability is computed asynchronously by the host.
pub const MERGEABILITY_SCHEDULE: &[Duration] = &[
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(2),
];

/// Polls for `MERGED` after `gh pr merge` returned.
pub const MERGE_CONFIRM_SCHEDULE: &[Duration] = &[
    Duration::ZERO,
    Duration::from_millis(250),
    Duration::from_millis(750),
    Duration::from_millis(1500),
];

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn instant(&self) -> Instant;
}

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Source of jitter samples in `[-1, 1]`.
pub trait JitterSource {
    fn sample(&self) -> f64;
}

/// Absolute caller deadline. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn none() -> Self {
        Self { at: None }
    }

    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    pub fn after(now: Instant, budget: Duration) -> Self {
        Self::at(now + budget)
    }

    /// Time left, or `None` if unbounded.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(now))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.remaining(now).is_some_and(|left| left.is_zero())
    }

    /// Cap a per-call limit by the remaining deadline.
    pub fn clamp(&self, limit: Duration, now: Instant) -> Duration {
        match self.remaining(now) {
            Some(left) => limit.min(left),
            None => limit,
        }
    }
}

/// `max(0, d * (1 + 0.2 * u))` with `u` clamped to `[-1, 1]`.
pub fn jittered(delay: Duration, sample: f64) -> Duration {
    let u = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let factor = (1.0 + JITTER_RATIO * u).max(0.0);
    delay.mul_f64(factor)
}

/// Everything the engine needs to wait between attempts.
pub struct Backoff<'a> {
    pub clock: &'a dyn Clock,
    pub sleeper: &'a dyn Sleeper,
    pub jitter: &'a dyn JitterSource,
    pub deadline: Deadline,
}

/// Classification of a failed attempt.
#[derive(Debug)]
pub enum Attempt {
    /// Transient; try again if the schedule allows.
    Retry(anyhow::Error),
    /// Give up immediately and surface this error.
    Fatal(anyhow::Error),
}

impl Attempt {
    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        Attempt::Retry(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Attempt::Fatal(err.into())
    }
}

/// Run `op` once per schedule entry until it succeeds or fails fatally.
///
/// Entry `i` is the delay before attempt `i` (so entry 0 is normally zero and
/// never slept). When retries are exhausted the last retryable error is
/// returned. A pending sleep that would outlast the deadline fails with
/// `E_DEADLINE_EXCEEDED` instead of sleeping.
pub fn retry_with_schedule<T>(
    schedule: &[Duration],
    backoff: &Backoff<'_>,
    mut op: impl FnMut(usize) -> std::result::Result<T, Attempt>,
) -> Result<T> {
    let mut last_err: Option<anyhow::Error> = None;

    for (attempt, scheduled) in schedule.iter().enumerate() {
        if attempt > 0 {
            let delay = jittered(*scheduled, backoff.jitter.sample());
            if !delay.is_zero() {
                if let Some(left) = backoff.deadline.remaining(backoff.clock.instant())
                    && left < delay
                {
                    let mut err = CodedError::new(
                        ErrorCode::DeadlineExceeded,
                        format!(
                            "deadline leaves {}ms, next retry needs {}ms",
                            left.as_millis(),
                            delay.as_millis()
                        ),
                    )
                    .with_detail("attempts", attempt);
                    if let Some(last) = &last_err {
                        err = err.with_detail("last_error", format!("{last:#}"));
                    }
                    return Err(err.into());
                }
                backoff.sleeper.sleep(delay);
            }
        }

        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(err)) => return Err(err),
            Err(Attempt::Retry(err)) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("retry schedule is empty")))
}
