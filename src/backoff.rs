//! Backoff schedules for redelivery.
//!
//! Two schedules are used by the hub:
//!
//! - a **constant** schedule paces rewrites of an unacknowledged message on the wire
//!   (5 s between attempts by default);
//! - an **exponential** schedule paces re-adds of a key to a node's work queue after
//!   its retry budget is exhausted (5 ms doubling up to 1000 s by default).
//!
//! `requeues` counts how many times the key has already been pushed back, so the first
//! re-add waits exactly `base`.
//!
//! ```rust
//! use std::time::Duration;
//! use cloudhub::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(5))
//!     .with_max(Duration::from_millis(40))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(5));
//! assert_eq!(backoff.delay(2), Duration::from_millis(20));
//! assert_eq!(backoff.delay(9), Duration::from_millis(40));
//! ```

use std::time::Duration;
use thiserror::Error;

/// Upper bound used when a computation would overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    #[error("with_max is only valid for exponential backoff")]
    ConstantDoesNotSupportMax,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffKind {
    Constant { delay: Duration },
    Exponential { base: Duration, max: Option<Duration> },
}

/// A delay schedule indexed by the number of previous requeues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Same delay for every attempt.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// `base * 2^requeues`, saturating at [`MAX_BACKOFF`].
    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { base, max: None } }
    }

    /// Cap an exponential schedule.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Exponential { base, max: existing } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Delay before the attempt that follows `requeues` earlier ones.
    pub fn delay(&self, requeues: usize) -> Duration {
        match self.kind {
            BackoffKind::Constant { delay } => delay.min(MAX_BACKOFF),
            BackoffKind::Exponential { base, max } => {
                let exponent = requeues.min(u32::MAX as usize) as u32;
                let multiplier = 2u128.saturating_pow(exponent);
                let nanos = base.as_nanos().saturating_mul(multiplier);
                let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map(|m| delay.min(m)).unwrap_or(delay).min(MAX_BACKOFF)
            }
        }
    }

    /// Base delay of the schedule.
    pub fn base(&self) -> Duration {
        match self.kind {
            BackoffKind::Constant { delay } => delay,
            BackoffKind::Exponential { base, .. } => base,
        }
    }
}
