//! Delay progressions between retry attempts.

use std::time::Duration;

use rand::Rng;

/// Strategy used to compute the delay before retry `n`.
///
/// All strategies are clamped to the configured maximum delay
/// (`max_delay`, 30 seconds unless overridden).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// `base * 2^(n-1)`: 100ms, 200ms, 400ms, ...
    #[default]
    Exponential,
    /// Exponential scaled by a uniform factor in `[0.5, 1.5)`.
    ///
    /// Jitter spreads out retry storms when many items fail at once.
    ExponentialJitter,
    /// `base * n`: 100ms, 200ms, 300ms, ...
    Linear,
    /// `base` every time.
    Constant,
}

impl BackoffStrategy {
    /// Delay to wait before retry `attempt` (1-based), clamped to
    /// `max_delay`.
    pub fn delay(self, base: Duration, attempt: u32, max_delay: Duration) -> Duration {
        let raw = match self {
            BackoffStrategy::Exponential => exponential(base, attempt),
            BackoffStrategy::ExponentialJitter => {
                let exp = exponential(base, attempt).min(max_delay);
                let factor: f64 = rand::rng().random_range(0.5..1.5);
                Duration::from_secs_f64(exp.as_secs_f64() * factor)
            }
            BackoffStrategy::Linear => base.saturating_mul(attempt.max(1)),
            BackoffStrategy::Constant => base,
        };
        raw.min(max_delay)
    }
}

fn exponential(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1);
    if shift >= 32 {
        return Duration::MAX;
    }
    base.saturating_mul(1u32 << shift)
}
