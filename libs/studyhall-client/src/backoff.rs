use std::time::Duration;

use rand::Rng;

/// Bounded-retry policy: exponential backoff from `base_delay`, capped at
/// `max_delay`, with a jitter multiplier so a fleet of clients does not
/// reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomization factor in `[0, 1]`; each delay is scaled by a uniform
    /// multiplier in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: 0.5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based). The cap applies before
    /// jitter, so a single delay can exceed `max_delay` by at most the jitter
    /// factor.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let capped = (self.base_delay.as_secs_f64() * 2f64.powi(exp))
            .min(self.max_delay.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let multiplier = if jitter == 0.0 {
            1.0
        } else {
            1.0 + jitter * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0)
        };

        Duration::from_secs_f64((capped * multiplier).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter,
        }
    }

    #[test]
    fn doubles_until_the_cap_without_jitter() {
        let policy = policy(0.0);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(5), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = policy(0.5);
        for attempt in 1..=6 {
            let base = policy.clone();
            let unjittered = ReconnectPolicy { jitter: 0.0, ..base }.delay_for(attempt);
            for _ in 0..100 {
                let delay = policy.delay_for(attempt).as_secs_f64();
                let reference = unjittered.as_secs_f64();
                assert!(delay >= reference * 0.5 - f64::EPSILON);
                assert!(delay <= reference * 1.5 + f64::EPSILON);
            }
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = policy(0.0);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }
}
