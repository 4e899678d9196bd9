//! Bounded exponential backoff
//!
//! A small state machine shared by the threshold manager (batch retries)
//! and the bulk loader (subprocess retries). Each failure asks the
//! [`Backoff`] for the next step: either retry after a delay or give up.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetrySettings {
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound on any single delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Start a fresh backoff sequence
    pub fn backoff(&self) -> Backoff {
        Backoff::new(*self)
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Retry after waiting `delay`; `attempt` is the 1-based retry number
    Retry { attempt: u32, delay: Duration },
    /// No retries left; `retries` were already spent
    Exhausted { retries: u32 },
}

/// Backoff state for one retried operation
#[derive(Debug, Clone)]
pub struct Backoff {
    settings: RetrySettings,
    retries: u32,
}

impl Backoff {
    pub fn new(settings: RetrySettings) -> Self {
        debug!(?settings, "Backoff::new: called");
        Self { settings, retries: 0 }
    }

    /// Record a failure and decide the next step
    pub fn next_step(&mut self) -> RetryStep {
        if self.retries >= self.settings.max_retries {
            debug!(retries = self.retries, "Backoff::next_step: exhausted");
            return RetryStep::Exhausted { retries: self.retries };
        }

        let delay = self.settings.delay_for(self.retries);
        self.retries += 1;
        debug!(attempt = self.retries, delay_ms = delay.as_millis() as u64, "Backoff::next_step: retry");
        RetryStep::Retry {
            attempt: self.retries,
            delay,
        }
    }

    /// Retries scheduled so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_exhausted(&self) -> bool {
        self.retries >= self.settings.max_retries
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let settings = RetrySettings {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        };
        assert_eq!(settings.delay_for(0), Duration::from_millis(100));
        assert_eq!(settings.delay_for(1), Duration::from_millis(200));
        assert_eq!(settings.delay_for(3), Duration::from_millis(800));
        assert_eq!(settings.delay_for(4), Duration::from_millis(1000));
        assert_eq!(settings.delay_for(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_exhausts_after_max_retries() {
        let mut backoff = RetrySettings {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 1000,
        }
        .backoff();

        assert_eq!(
            backoff.next_step(),
            RetryStep::Retry {
                attempt: 1,
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(
            backoff.next_step(),
            RetryStep::Retry {
                attempt: 2,
                delay: Duration::from_millis(20)
            }
        );
        assert_eq!(
            backoff.next_step(),
            RetryStep::Retry {
                attempt: 3,
                delay: Duration::from_millis(40)
            }
        );
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.next_step(), RetryStep::Exhausted { retries: 3 });
        assert_eq!(backoff.next_step(), RetryStep::Exhausted { retries: 3 });
    }

    #[test]
    fn test_zero_retries() {
        let mut backoff = RetrySettings {
            max_retries: 0,
            ..Default::default()
        }
        .backoff();
        assert_eq!(backoff.next_step(), RetryStep::Exhausted { retries: 0 });
    }

    #[test]
    fn test_settings_deserialize_defaults() {
        let settings: RetrySettings = serde_yaml::from_str("max-retries: 5").unwrap();
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.base_delay_ms, 1000);
        assert_eq!(settings.max_delay_ms, 60_000);
    }

    proptest! {
        #[test]
        fn delays_are_monotonic_and_bounded(base in 1u64..10_000, cap in 1u64..1_000_000, n in 1u32..20) {
            let settings = RetrySettings { max_retries: n, base_delay_ms: base, max_delay_ms: cap };
            let mut backoff = settings.backoff();
            let mut last = Duration::ZERO;
            let mut count = 0;
            while let RetryStep::Retry { delay, .. } = backoff.next_step() {
                prop_assert!(delay >= last);
                prop_assert!(delay <= Duration::from_millis(cap));
                last = delay;
                count += 1;
            }
            prop_assert_eq!(count, n);
        }
    }
}
