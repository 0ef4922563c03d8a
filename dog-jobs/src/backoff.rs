use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay applied to `scheduled_at` when a failed job is sent back for retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// Same delay before every retry
    Fixed { delay: Duration },

    /// `initial * 2^(retries - 1)` capped at `max`. With `jitter` the delay is
    /// drawn uniformly from the upper half of that value.
    Exponential {
        initial: Duration,
        max: Duration,
        jitter: bool,
    },

    /// `step * retries` capped at `max`
    Linear { step: Duration, max: Duration },
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial,
            max,
            jitter: false,
        }
    }

    pub fn linear(step: Duration, max: Duration) -> Self {
        Self::Linear { step, max }
    }

    /// Enable jitter on an exponential policy; other policies are unchanged
    pub fn with_jitter(self) -> Self {
        match self {
            Self::Exponential { initial, max, .. } => Self::Exponential {
                initial,
                max,
                jitter: true,
            },
            other => other,
        }
    }

    /// Delay before the next attempt, given the number of failures so far (>= 1)
    pub fn delay_for(&self, retries: u32) -> Duration {
        let retries = retries.max(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { initial, max, jitter } => {
                let factor = 2u32.saturating_pow(retries - 1);
                let delay = initial.saturating_mul(factor).min(*max);
                if *jitter && !delay.is_zero() {
                    let half = delay / 2;
                    let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
                    half + Duration::from_millis(spread)
                } else {
                    delay
                }
            }
            Self::Linear { step, max } => step.saturating_mul(retries).min(*max),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(3600))
    }
}
