//! Poll pacing and bounded retry.
//!
//! The poll delay is a uniform draw from a base window, plus a bounded
//! penalty once errors or rate limits pile up. It never grows
//! exponentially: a noisy day slows polling a little, not forever.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// More errors than this in the current day adds the penalty.
pub const ERROR_PENALTY_THRESHOLD: u64 = 5;
/// More rate limits than this in the current session adds the penalty.
pub const RATE_LIMIT_PENALTY_THRESHOLD: u64 = 2;

const DEFAULT_PENALTY_MIN: Duration = Duration::from_secs(10);
const DEFAULT_PENALTY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub min_base: Duration,
    pub max_base: Duration,
    pub penalty_min: Duration,
    pub penalty_max: Duration,
}

impl BackoffPolicy {
    pub fn new(min_base: Duration, max_base: Duration) -> Self {
        Self {
            min_base,
            max_base,
            penalty_min: DEFAULT_PENALTY_MIN,
            penalty_max: DEFAULT_PENALTY_MAX,
        }
    }

    pub fn with_penalty(mut self, penalty_min: Duration, penalty_max: Duration) -> Self {
        self.penalty_min = penalty_min;
        self.penalty_max = penalty_max;
        self
    }

    /// Upper bound of any delay this policy can produce.
    pub fn max_delay(&self) -> Duration {
        self.max_base.max(self.min_base) + self.penalty_max.max(self.penalty_min)
    }

    /// Delay before the next poll given the current counters.
    pub fn next_delay(&self, error_count: u64, rate_limit_count: u64) -> Duration {
        let mut rng = rand::rng();
        let base = uniform(&mut rng, self.min_base, self.max_base);
        if is_penalized(error_count, rate_limit_count) {
            let penalty = uniform(&mut rng, self.penalty_min, self.penalty_max);
            debug!(
                errors = error_count,
                rate_limits = rate_limit_count,
                penalty_secs = penalty.as_secs_f64(),
                "adding backoff penalty"
            );
            base + penalty
        } else {
            base
        }
    }
}

/// Shorthand for [`BackoffPolicy::next_delay`] with the default penalty range.
pub fn next_delay(
    error_count: u64,
    rate_limit_count: u64,
    min_base: Duration,
    max_base: Duration,
) -> Duration {
    BackoffPolicy::new(min_base, max_base).next_delay(error_count, rate_limit_count)
}

pub fn is_penalized(error_count: u64, rate_limit_count: u64) -> bool {
    error_count > ERROR_PENALTY_THRESHOLD || rate_limit_count > RATE_LIMIT_PENALTY_THRESHOLD
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, lo: Duration, hi: Duration) -> Duration {
    if hi <= lo {
        return lo;
    }
    let lo_ms = lo.as_millis() as u64;
    let hi_ms = hi.as_millis() as u64;
    Duration::from_millis(rng.random_range(lo_ms..=hi_ms))
}

/// Linear retry spacing: `base * attempt`.
pub fn linear(base: Duration) -> impl Fn(u32) -> Duration {
    move |attempt| base * attempt
}

/// Run `action` up to `max_attempts` times, sleeping `backoff(attempt)`
/// between failed attempts. Returns the first success, or the last error
/// together with the number of attempts made.
///
/// `action` receives the 1-indexed attempt number.
pub async fn retry<F, Fut, T, E, B>(
    max_attempts: u32,
    backoff: B,
    mut action: F,
) -> Result<(T, u32), (E, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    B: Fn(u32) -> Duration,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match action(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(e) if attempt >= max_attempts => return Err((e, attempt)),
            Err(_) => {
                tokio::time::sleep(backoff(attempt)).await;
                attempt += 1;
            }
        }
    }
}
