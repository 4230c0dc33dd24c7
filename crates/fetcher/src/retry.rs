use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff for fetch attempts within one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_by_multiplier_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay_ms: 500,
            multiplier: 3.0,
            max_delay_ms: 10_000,
        };
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| policy.delay_after(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1_500, 4_500, 10_000, 10_000]);
    }

    #[test]
    fn multiplier_of_one_keeps_delay_constant() {
        let policy = RetryPolicy {
            multiplier: 1.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(1), policy.delay_after(4));
    }
}
