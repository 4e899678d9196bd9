//! ErrorThresholdManager
//!
//! Accumulates error and warning counts for one job execution and decides
//! whether the pipeline continues. Counters are atomics and only grow; the
//! breach decision is taken under a lock so exactly one caller observes the
//! first crossing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{BreachAction, Severity, ThresholdPolicy};
use crate::retry::{Backoff, RetryStep};

/// Threshold decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Stop,
    Alert,
    /// Re-run the batch after `delay`; `attempt` is 1-based
    RetryScheduled { attempt: u32, delay: Duration },
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Stop => write!(f, "stop"),
            Self::Alert => write!(f, "alert"),
            Self::RetryScheduled { attempt, delay } => {
                write!(f, "retry-scheduled (attempt {}, delay {}ms)", attempt, delay.as_millis())
            }
        }
    }
}

/// Per-execution counters
#[derive(Debug, Default)]
pub struct ThresholdCounters {
    errors: AtomicU64,
    warnings: AtomicU64,
    processed: AtomicU64,
}

impl ThresholdCounters {
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> (u64, u64, u64) {
        (self.errors(), self.warnings(), self.processed())
    }
}

/// Details of the first threshold crossing in a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreachInfo {
    pub reason: String,
    pub at: DateTime<Utc>,
    pub errors: u64,
    pub warnings: u64,
    pub processed: u64,
}

/// Statistics exposed to the audit sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdStats {
    pub errors: u64,
    pub warnings: u64,
    pub processed: u64,
    /// Last non-continue decision, if any
    pub decision: Option<String>,
    pub breach: Option<BreachInfo>,
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Open,
    Alerted,
    RetryPending { attempt: u32, delay: Duration },
    Stopped,
}

#[derive(Debug)]
struct DecisionState {
    window: Window,
    baseline: (u64, u64, u64),
    backoff: Backoff,
    breach: Option<BreachInfo>,
    last_decision: Option<Decision>,
}

impl DecisionState {
    fn new(policy: &ThresholdPolicy) -> Self {
        Self {
            window: Window::Open,
            baseline: (0, 0, 0),
            backoff: policy.retry.backoff(),
            breach: None,
            last_decision: None,
        }
    }
}

/// Error-threshold state machine for one execution
#[derive(Debug)]
pub struct ErrorThresholdManager {
    policy: ThresholdPolicy,
    counters: ThresholdCounters,
    stopped: AtomicBool,
    state: Mutex<DecisionState>,
}

impl ErrorThresholdManager {
    pub fn new(policy: ThresholdPolicy) -> Self {
        debug!(?policy, "ErrorThresholdManager::new: called");
        let state = Mutex::new(DecisionState::new(&policy));
        Self {
            policy,
            counters: ThresholdCounters::default(),
            stopped: AtomicBool::new(false),
            state,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DecisionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> &ThresholdPolicy {
        &self.policy
    }

    pub fn counters(&self) -> &ThresholdCounters {
        &self.counters
    }

    /// Register records about to be evaluated (the rate denominator)
    pub fn record_processed(&self, n: u64) {
        self.counters.processed.fetch_add(n, Ordering::SeqCst);
    }

    /// Count one failure and decide
    pub fn record_outcome(&self, severity: Severity) -> Decision {
        match severity {
            Severity::Error => self.counters.errors.fetch_add(1, Ordering::SeqCst),
            Severity::Warning => self.counters.warnings.fetch_add(1, Ordering::SeqCst),
        };
        self.evaluate()
    }

    /// Standing decision for the current window without counting anything
    pub fn decision(&self) -> Decision {
        if self.stopped.load(Ordering::SeqCst) {
            return Decision::Stop;
        }
        match self.lock().window {
            Window::Open => Decision::Continue,
            Window::Alerted => Decision::Alert,
            Window::RetryPending { attempt, delay } => Decision::RetryScheduled { attempt, delay },
            Window::Stopped => Decision::Stop,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn evaluate(&self) -> Decision {
        if self.stopped.load(Ordering::SeqCst) {
            return Decision::Stop;
        }
        if self.policy.action == BreachAction::Continue {
            return Decision::Continue;
        }

        let mut state = self.lock();
        match state.window {
            Window::Stopped => return Decision::Stop,
            Window::Alerted => return Decision::Continue,
            Window::RetryPending { attempt, delay } => return Decision::RetryScheduled { attempt, delay },
            Window::Open => {}
        }

        let (errors, warnings, processed) = self.counters.snapshot();
        let (base_errors, base_warnings, base_processed) = state.baseline;
        let window_errors = errors.saturating_sub(base_errors);
        let window_warnings = warnings.saturating_sub(base_warnings);
        let window_processed = processed.saturating_sub(base_processed);

        let Some(reason) = self.breach_reason(window_errors, window_warnings, window_processed) else {
            return Decision::Continue;
        };

        warn!(%reason, errors, warnings, processed, action = ?self.policy.action, "Threshold breached");
        state.breach = Some(BreachInfo {
            reason,
            at: Utc::now(),
            errors,
            warnings,
            processed,
        });

        let decision = match self.policy.action {
            BreachAction::Stop | BreachAction::Continue => Decision::Stop,
            BreachAction::AlertOnly => Decision::Alert,
            BreachAction::RetryWithDelay => match state.backoff.next_step() {
                RetryStep::Retry { attempt, delay } => Decision::RetryScheduled { attempt, delay },
                RetryStep::Exhausted { retries } => {
                    warn!(retries, "Threshold retries exhausted");
                    Decision::Stop
                }
            },
        };

        state.window = match decision {
            Decision::Stop => {
                self.stopped.store(true, Ordering::SeqCst);
                Window::Stopped
            }
            Decision::Alert => Window::Alerted,
            Decision::RetryScheduled { attempt, delay } => Window::RetryPending { attempt, delay },
            Decision::Continue => Window::Open,
        };
        state.last_decision = Some(decision);
        decision
    }

    fn breach_reason(&self, errors: u64, warnings: u64, processed: u64) -> Option<String> {
        if let Some(max) = self.policy.max_errors.filter(|max| errors >= *max) {
            return Some(format!("error count {} reached limit {}", errors, max));
        }
        if let Some(max) = self.policy.max_warnings.filter(|max| warnings >= *max) {
            return Some(format!("warning count {} reached limit {}", warnings, max));
        }
        if let Some(max_rate) = self.policy.max_error_rate
            && processed > 0
        {
            let rate = errors as f64 / processed as f64;
            if rate > max_rate {
                return Some(format!("error rate {:.4} exceeds {:.4}", rate, max_rate));
            }
        }
        None
    }

    /// Open a fresh window after a scheduled retry's delay
    ///
    /// Breach checks then use only counts accrued from here on. Returns the
    /// attempt number, or `None` when no retry was pending.
    pub fn begin_retry_attempt(&self) -> Option<u32> {
        let mut state = self.lock();
        let Window::RetryPending { attempt, .. } = state.window else {
            return None;
        };
        state.baseline = self.counters.snapshot();
        state.window = Window::Open;
        info!(attempt, "Threshold retry window opened");
        Some(attempt)
    }

    /// Clear all state for a fresh execution
    pub fn reset(&self) {
        debug!("ErrorThresholdManager::reset: called");
        let mut state = self.lock();
        self.counters.errors.store(0, Ordering::SeqCst);
        self.counters.warnings.store(0, Ordering::SeqCst);
        self.counters.processed.store(0, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        *state = DecisionState::new(&self.policy);
    }

    pub fn stats(&self) -> ThresholdStats {
        let state = self.lock();
        ThresholdStats {
            errors: self.counters.errors(),
            warnings: self.counters.warnings(),
            processed: self.counters.processed(),
            decision: state.last_decision.map(|d| d.to_string()),
            breach: state.breach.clone(),
            retries: state.backoff.retries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetrySettings;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn policy(action: BreachAction) -> ThresholdPolicy {
        ThresholdPolicy {
            action,
            ..Default::default()
        }
    }

    #[test]
    fn test_max_errors_stop() {
        let manager = ErrorThresholdManager::new(ThresholdPolicy {
            max_errors: Some(5),
            ..policy(BreachAction::Stop)
        });
        for _ in 0..4 {
            assert_eq!(manager.record_outcome(Severity::Error), Decision::Continue);
        }
        assert_eq!(manager.record_outcome(Severity::Error), Decision::Stop);
        for _ in 0..10 {
            assert_eq!(manager.record_outcome(Severity::Error), Decision::Stop);
            assert_eq!(manager.record_outcome(Severity::Warning), Decision::Stop);
        }
        assert_eq!(manager.decision(), Decision::Stop);
        let stats = manager.stats();
        assert_eq!(stats.errors, 15);
        assert_eq!(stats.decision.as_deref(), Some("stop"));
        assert!(stats.breach.is_some());
    }

    #[test]
    fn test_error_rate_stops_at_51st_failure() {
        let manager = ErrorThresholdManager::new(ThresholdPolicy {
            max_error_rate: Some(0.05),
            ..policy(BreachAction::Stop)
        });
        manager.record_processed(1000);
        for i in 1..=50 {
            assert_eq!(manager.record_outcome(Severity::Error), Decision::Continue, "failure {}", i);
        }
        assert_eq!(manager.record_outcome(Severity::Error), Decision::Stop);
    }

    #[test]
    fn test_max_warnings() {
        let manager = ErrorThresholdManager::new(ThresholdPolicy {
            max_warnings: Some(2),
            ..policy(BreachAction::Stop)
        });
        assert_eq!(manager.record_outcome(Severity::Warning), Decision::Continue);
        assert_eq!(manager.record_outcome(Severity::Warning), Decision::Stop);
    }

    #[test]
    fn test_alert_only_once() {
        let manager = ErrorThresholdManager::new(ThresholdPolicy {
            max_errors: Some(2),
            ..policy(BreachAction::AlertOnly)
        });
        assert_eq!(manager.record_outcome(Severity::Error), Decision::Continue);
        assert_eq!(manager.record_outcome(Severity::Error), Decision::Alert);
        assert_eq!(manager.record_outcome(Severity::Error), Decision::Continue);
        assert_eq!(manager.decision(), Decision::Alert);
    }

    #[test]
    fn test_continue_policy_never_breaches() {
        let manager = ErrorThresholdManager::new(ThresholdPolicy {
            max_errors: Some(1),
            ..policy(BreachAction::Continue)
        });
        for _ in 0..10 {
            assert_eq!(manager.record_outcome(Severity::Error), Decision::Continue);
        }
        assert_eq!(manager.stats().decision, None);
    }

    #[test]
    fn test_retry_with_delay_then_stop() {
        let manager = ErrorThresholdManager::new(ThresholdPolicy {
            max_errors: Some(1),
            retry: RetrySettings {
                max_retries: 2,
                base_delay_ms: 100,
                max_delay_ms: 1000,
            },
            ..policy(BreachAction::RetryWithDelay)
        });

        let first = Decision::RetryScheduled {
            attempt: 1,
            delay: Duration::from_millis(100),
        };
        assert_eq!(manager.record_outcome(Severity::Error), first);
        // idempotent until the window reopens
        assert_eq!(manager.record_outcome(Severity::Error), first);
        assert_eq!(manager.begin_retry_attempt(), Some(1));
        assert_eq!(manager.begin_retry_attempt(), None);

        assert_eq!(
            manager.record_outcome(Severity::Error),
            Decision::RetryScheduled {
                attempt: 2,
                delay: Duration::from_millis(200)
            }
        );
        manager.begin_retry_attempt();
        assert_eq!(manager.record_outcome(Severity::Error), Decision::Stop);
        assert_eq!(manager.stats().retries, 2);
        // cumulative counters never reset between windows
        assert_eq!(manager.counters().errors(), 4);
    }

    #[test]
    fn test_retry_window_uses_fresh_rate() {
        let manager = ErrorThresholdManager::new(ThresholdPolicy {
            max_error_rate: Some(0.5),
            ..policy(BreachAction::RetryWithDelay)
        });
        manager.record_processed(2);
        manager.record_outcome(Severity::Error);
        assert!(matches!(
            manager.record_outcome(Severity::Error),
            Decision::RetryScheduled { attempt: 1, .. }
        ));
        manager.begin_retry_attempt();
        manager.record_processed(2);
        assert_eq!(manager.record_outcome(Severity::Error), Decision::Continue);
    }

    #[test]
    fn test_reset() {
        let manager = ErrorThresholdManager::new(ThresholdPolicy {
            max_errors: Some(1),
            ..policy(BreachAction::Stop)
        });
        assert_eq!(manager.record_outcome(Severity::Error), Decision::Stop);
        manager.reset();
        assert_eq!(manager.counters().errors(), 0);
        assert_eq!(manager.decision(), Decision::Continue);
        assert_eq!(manager.stats().breach, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_stop_under_concurrency() {
        let manager = Arc::new(ErrorThresholdManager::new(ThresholdPolicy {
            max_errors: Some(100),
            ..policy(BreachAction::AlertOnly)
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    (0..50)
                        .filter(|_| manager.record_outcome(Severity::Error) == Decision::Alert)
                        .count()
                })
            })
            .collect();
        let mut alerts = 0;
        for handle in handles {
            alerts += handle.await.unwrap();
        }
        assert_eq!(alerts, 1);
        assert_eq!(manager.counters().errors(), 400);
    }

    proptest! {
        #[test]
        fn counters_monotonic_and_stop_absorbing(outcomes in proptest::collection::vec(any::<bool>(), 1..200), max in 1u64..50) {
            let manager = ErrorThresholdManager::new(ThresholdPolicy {
                max_errors: Some(max),
                ..policy(BreachAction::Stop)
            });
            let mut last = (0, 0);
            let mut stopped = false;
            for is_error in outcomes {
                let severity = if is_error { Severity::Error } else { Severity::Warning };
                let decision = manager.record_outcome(severity);
                let now = (manager.counters().errors(), manager.counters().warnings());
                prop_assert!(now.0 >= last.0 && now.1 >= last.1);
                last = now;
                if stopped {
                    prop_assert_eq!(decision, Decision::Stop);
                }
                stopped |= decision == Decision::Stop;
                prop_assert_eq!(stopped, now.0 >= max);
            }
        }
    }
}
