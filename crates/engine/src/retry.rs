//! Retry and backoff policy for provider sends.
//!
//! Delays grow exponentially from `base` and are capped at `max`. A uniform jitter is
//! added on top, and the jittered value is clamped back into `[base, max]`.

use std::time::Duration;

use rand::Rng;

use courier_common::config::NotifyLimits;

/// Exponential backoff delay for the given attempt number (1-based).
///
/// `attempt` values below 1 are treated as 1. The shift is capped at `max_shift` so large
/// attempt counts cannot overflow.
pub fn compute_backoff<R: Rng + ?Sized>(
    attempt: u32,
    base: Duration,
    max: Duration,
    jitter: Duration,
    max_shift: u32,
    rng: &mut R,
) -> Duration {
    let base_ms = duration_ms(base);
    let max_ms = duration_ms(max).max(base_ms);
    let jitter_ms = i128::from(duration_ms(jitter));

    let shift = (attempt.max(1) - 1).min(max_shift).min(63);
    let raw = base_ms
        .checked_shl(shift)
        .filter(|v| v >> shift == base_ms)
        .unwrap_or(u64::MAX);
    let capped = raw.min(max_ms);

    let offset = if jitter_ms > 0 {
        rng.gen_range(-jitter_ms..=jitter_ms)
    } else {
        0
    };
    let jittered = (i128::from(capped) + offset).clamp(i128::from(base_ms), i128::from(max_ms));

    Duration::from_millis(u64::try_from(jittered).unwrap_or(max_ms))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Delivery retry settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
    pub max_shift: u32,
    pub max_attempts: u32,
    /// Used when the provider throttles without saying for how long.
    pub retry_after_fallback: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&NotifyLimits::default())
    }
}

impl From<&NotifyLimits> for RetryPolicy {
    fn from(limits: &NotifyLimits) -> Self {
        Self {
            base: limits.send_base_backoff,
            max: limits.send_max_backoff,
            jitter: limits.send_jitter,
            max_shift: limits.backoff_max_shift,
            max_attempts: limits.send_max_attempts.max(1),
            retry_after_fallback: limits.retry_after_fallback,
        }
    }
}

impl RetryPolicy {
    /// Jittered delay before retrying after `attempt` failed attempts.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with(attempt, &mut rand::thread_rng())
    }

    pub fn backoff_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        compute_backoff(
            attempt,
            self.base,
            self.max,
            self.jitter,
            self.max_shift,
            rng,
        )
    }

    /// Delay without jitter; deterministic.
    pub fn backoff_without_jitter(&self, attempt: u32) -> Duration {
        compute_backoff(
            attempt,
            self.base,
            self.max,
            Duration::ZERO,
            self.max_shift,
            &mut rand::thread_rng(),
        )
    }

    /// The provider's retry-after wins; otherwise fall back to the configured delay.
    pub fn retry_after(&self, provider: Option<Duration>) -> Duration {
        provider.unwrap_or(self.retry_after_fallback)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
