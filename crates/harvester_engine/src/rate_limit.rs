//! Token-bucket request gate with a burst of exactly one.
use std::sync::Arc;
use std::time::Duration;

use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota};
use tokio_util::sync::CancellationToken;

use crate::cancel::Cancelled;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate must be a positive number of permits per second with a representable period (got {0})")]
    InvalidRate(f64),
}

/// Shared gate; clones hand out permits from the same bucket.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<DirectLimiter>,
    period: Duration,
}

impl RateLimiter {
    /// `rate_per_sec` may be fractional, e.g. `0.5` for one permit every two seconds.
    pub fn new(rate_per_sec: f64) -> Result<Self, RateLimitError> {
        if !rate_per_sec.is_finite() || rate_per_sec <= 0.0 {
            return Err(RateLimitError::InvalidRate(rate_per_sec));
        }
        let period = Duration::try_from_secs_f64(1.0 / rate_per_sec)
            .ok()
            .filter(|period| period.as_nanos() <= u128::from(u64::MAX))
            .ok_or(RateLimitError::InvalidRate(rate_per_sec))?;
        let quota = Quota::with_period(period).ok_or(RateLimitError::InvalidRate(rate_per_sec))?;
        Ok(Self {
            inner: Arc::new(governor::RateLimiter::direct(quota)),
            period,
        })
    }

    /// Minimum spacing between two permits.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next permit, or give up when `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(Cancelled),
            _ = self.inner.until_ready() => Ok(()),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("period", &self.period)
            .finish()
    }
}
