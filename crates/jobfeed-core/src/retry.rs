use std::time::Duration;

/// Publish retry schedule with capped exponential backoff.
///
/// The delay before attempt `n + 1` is `base_delay * 2^(n - 1)`, so with the
/// defaults: 500ms, 1s, 2s, 4s between five attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given failed attempt (1-indexed).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        std::cmp::min(delay, self.max_delay)
    }

    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Poll cooldown that doubles on pressure and resets on success.
#[derive(Debug, Clone)]
pub struct Cooldown {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Cooldown {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = std::cmp::max(base, max);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Double the delay, raise it to `hint` if the source asked for longer,
    /// and cap at the maximum.
    pub fn escalate(&mut self, hint: Option<Duration>) -> Duration {
        let doubled = self.current.checked_mul(2).unwrap_or(self.max);
        let wanted = match hint {
            Some(hint) => std::cmp::max(doubled, hint),
            None => doubled,
        };
        self.current = std::cmp::min(wanted, self.max);
        self.current
    }

    pub fn reset(&mut self) -> Duration {
        self.current = self.base;
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_retry_delay_schedule() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(config.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_after_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_after_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_after_attempt(4), Duration::from_secs(5));
        assert_eq!(config.delay_after_attempt(60), Duration::from_secs(5));
    }

    #[test]
    fn test_can_retry_bounds() {
        let config = RetryConfig::default();
        assert!(config.can_retry(1));
        assert!(config.can_retry(4));
        assert!(!config.can_retry(5));
    }

    #[test]
    fn test_cooldown_doubles_and_resets() {
        let mut cooldown = Cooldown::new(Duration::from_secs(60), Duration::from_secs(900));
        assert_eq!(cooldown.escalate(None), Duration::from_secs(120));
        assert_eq!(cooldown.escalate(None), Duration::from_secs(240));
        assert_eq!(cooldown.reset(), Duration::from_secs(60));
    }

    #[test]
    fn test_cooldown_honours_hint_within_cap() {
        let mut cooldown = Cooldown::new(Duration::from_secs(10), Duration::from_secs(100));
        assert_eq!(
            cooldown.escalate(Some(Duration::from_secs(50))),
            Duration::from_secs(50)
        );
        assert_eq!(
            cooldown.escalate(Some(Duration::from_secs(500))),
            Duration::from_secs(100)
        );
    }

    proptest! {
        #[test]
        fn cooldown_never_exceeds_max(
            base_ms in 1u64..10_000,
            max_ms in 1u64..1_000_000,
            steps in 1usize..80,
        ) {
            let max = Duration::from_millis(max_ms);
            let mut cooldown = Cooldown::new(Duration::from_millis(base_ms), max);
            let cap = std::cmp::max(Duration::from_millis(base_ms), max);
            let mut previous = cooldown.current();
            for _ in 0..steps {
                let next = cooldown.escalate(None);
                prop_assert!(next <= cap);
                prop_assert_eq!(next, std::cmp::min(previous * 2, cap));
                previous = next;
            }
        }
    }
}
