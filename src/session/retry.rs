//! Reconnect/backoff policy

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::FailureReason;

/// Outcome of consulting a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    No,
    After(Duration),
}

/// Exponential backoff with a capped delay and a capped attempt count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(with = "crate::config::millis")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "crate::config::millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Retries allowed per connection before giving up. Zero disables retry.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// `attempt` is 1-based: the number of the retry being considered.
    pub fn should_retry(&self, attempt: u32, reason: &FailureReason) -> RetryDecision {
        if reason.terminal || attempt == 0 || attempt > self.max_attempts {
            return RetryDecision::No;
        }
        RetryDecision::After(self.delay_for(attempt))
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }
}

/// Per-connection retry counter.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryBudget {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Consume one attempt if the policy allows it.
    pub fn consume(&mut self, reason: &FailureReason) -> RetryDecision {
        let decision = self.policy.should_retry(self.attempts + 1, reason);
        if let RetryDecision::After(_) = decision {
            self.attempts += 1;
        }
        decision
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_attempts: 6,
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let p = policy();
        let reason = FailureReason::transient("timeout");
        let delays: Vec<_> = (1..=6)
            .map(|attempt| match p.should_retry(attempt, &reason) {
                RetryDecision::After(d) => d.as_millis(),
                RetryDecision::No => panic!("attempt {} should retry", attempt),
            })
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_attempt_cap() {
        let p = policy();
        let reason = FailureReason::transient("timeout");
        assert_eq!(p.should_retry(7, &reason), RetryDecision::No);
        assert_eq!(RetryPolicy::none().should_retry(1, &reason), RetryDecision::No);
    }

    #[test]
    fn test_terminal_never_retries() {
        let p = policy();
        let reason = FailureReason::terminal(Some(8), "authorization refused");
        assert_eq!(p.should_retry(1, &reason), RetryDecision::No);
    }

    #[test]
    fn test_budget_consumes_and_resets() {
        let mut budget = RetryBudget::new(RetryPolicy {
            max_attempts: 2,
            ..policy()
        });
        let reason = FailureReason::transient("link lost");
        assert_eq!(
            budget.consume(&reason),
            RetryDecision::After(Duration::from_millis(100))
        );
        assert_eq!(
            budget.consume(&reason),
            RetryDecision::After(Duration::from_millis(200))
        );
        assert_eq!(budget.consume(&reason), RetryDecision::No);
        assert_eq!(budget.attempts(), 2);

        budget.reset();
        assert_eq!(budget.attempts(), 0);
        assert_eq!(
            budget.consume(&reason),
            RetryDecision::After(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_huge_multiplier_saturates() {
        let p = RetryPolicy {
            multiplier: 1e300,
            max_attempts: 10,
            ..policy()
        };
        let reason = FailureReason::transient("x");
        assert_eq!(
            p.should_retry(9, &reason),
            RetryDecision::After(Duration::from_millis(1000))
        );
    }
}
