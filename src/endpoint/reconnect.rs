//! Reconnect backoff policy shared by the Endpoint Connection and the
//! Endpoint Manager's fleet-wide reconnect scheduling (§4.D/§4.E).
//!
//! Grounded in the teacher's `McpManager::health_check_cycle` reconnect-count
//! tracking, generalized from "retry every health-check tick up to a cap"
//! into an explicit delay-per-attempt policy so both components can consult
//! the same schedule instead of re-deriving it.

use std::time::Duration;

use rand::Rng;

const BASE_DELAY: Duration = Duration::from_secs(3);
const MAX_DELAY: Duration = Duration::from_secs(30);
const EXPONENTIAL_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

/// Computes the delay before reconnect attempt `n` (1-indexed), optionally
/// jittered by up to ±10% so a fleet of endpoints reconnecting after the same
/// outage doesn't all retry in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base: BASE_DELAY,
            max: MAX_DELAY,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.kind {
            BackoffKind::Fixed => self.base,
            BackoffKind::Linear => self.base * attempt,
            BackoffKind::Exponential => {
                let factor = EXPONENTIAL_MULTIPLIER.powi(attempt as i32 - 1);
                Duration::from_secs_f64((self.base.as_secs_f64() * factor).min(self.max.as_secs_f64() * 10.0))
            }
        };
        let capped = raw.min(self.max);
        if self.jitter {
            jittered(capped)
        } else {
            capped
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range(0.9..=1.1);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy {
            kind: BackoffKind::Fixed,
            base: Duration::from_secs(2),
            max: Duration::from_secs(30),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let policy = BackoffPolicy {
            kind: BackoffKind::Linear,
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn exponential_backoff_grows_then_caps() {
        let policy = BackoffPolicy {
            kind: BackoffKind::Exponential,
            base: Duration::from_secs(3),
            max: Duration::from_secs(30),
            jitter: false,
        };
        let d1 = policy.delay_for_attempt(1);
        let d2 = policy.delay_for_attempt(2);
        let d10 = policy.delay_for_attempt(10);
        assert_eq!(d1, Duration::from_secs(3));
        assert!(d2 > d1);
        assert_eq!(d10, Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = BackoffPolicy {
            kind: BackoffKind::Fixed,
            base: Duration::from_secs(10),
            max: Duration::from_secs(30),
            jitter: true,
        };
        for _ in 0..50 {
            let d = policy.delay_for_attempt(1);
            assert!(d >= Duration::from_secs_f64(9.0) && d <= Duration::from_secs_f64(11.0));
        }
    }
}
