//! Exponential backoff with symmetric jitter.
//!
//! `raw = min(max_delay, base_delay * 2^attempt)`, then `raw` is perturbed by up
//! to `±jitter_fraction * raw` and clamped at zero. The random sample is always
//! supplied by the caller so the calculation stays deterministic under test.

use std::time::Duration;

use rand::Rng;

/// Backoff tuning shared by every retry path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the raw delay used as the jitter amplitude (0.5 = ±50%).
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter_fraction: 0.5,
        }
    }
}

/// Upper bound of any delay produced for `config`: `max_delay * (1 + jitter_fraction)`.
pub fn delay_ceiling(config: &BackoffConfig) -> Duration {
    config
        .max_delay
        .mul_f64(1.0 + config.jitter_fraction.max(0.0))
}

/// Delay before retry `attempt` (0-indexed) without jitter.
pub fn raw_delay(attempt: u32, config: &BackoffConfig) -> Duration {
    // 2^31 already dwarfs any sane max_delay; saturate instead of overflowing.
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    config
        .base_delay
        .checked_mul(factor)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

/// Delay for `attempt` given an explicit jitter sample in `[-1, 1]`.
///
/// Samples outside the range are clamped.
pub fn delay_with_sample(attempt: u32, config: &BackoffConfig, sample: f64) -> Duration {
    let raw = raw_delay(attempt, config).as_secs_f64();
    let sample = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    let jitter = raw * config.jitter_fraction.max(0.0) * sample;
    Duration::from_secs_f64((raw + jitter).max(0.0))
}

/// Delay for `attempt`, drawing the jitter sample from `rng`.
pub fn backoff_delay<R: Rng + ?Sized>(attempt: u32, config: &BackoffConfig, rng: &mut R) -> Duration {
    let sample: f64 = rng.gen_range(-1.0..=1.0);
    delay_with_sample(attempt, config, sample)
}
