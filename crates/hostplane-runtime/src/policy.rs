//! Retry and time-limit policy per task category.
//!
//! Instance lifecycle categories never retry automatically: a partially
//! applied cluster mutation is left for an operator. Maintenance and
//! monitoring work is idempotent and retries with jittered backoff.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use hostplane_core::TaskCategory;

/// Added to the hard limit so a lease outlives a task that is being killed.
const LEASE_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before redelivering after failed delivery number `attempt`
    /// (one-based): half of `base * 2^(attempt-1)` fixed, half random.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let full = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        let half_ms = (full.as_millis() / 2) as u64;
        let jitter_ms = if half_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=half_ms)
        };
        full - Duration::from_millis(half_ms) + Duration::from_millis(jitter_ms)
    }
}

/// Soft limit raises a catchable timeout; hard limit abandons the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimits {
    pub soft: Duration,
    pub hard: Duration,
}

impl TimeLimits {
    const fn minutes(soft: u64, hard: u64) -> Self {
        Self {
            soft: Duration::from_secs(soft * 60),
            hard: Duration::from_secs(hard * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryPolicy {
    pub retry: RetryPolicy,
    pub limits: TimeLimits,
}

#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<TaskCategory, CategoryPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let backoff = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
        };
        let mut policies = HashMap::new();
        policies.insert(
            TaskCategory::Provisioning,
            CategoryPolicy { retry: RetryPolicy::none(), limits: TimeLimits::minutes(10, 15) },
        );
        policies.insert(
            TaskCategory::LifecycleOperation,
            CategoryPolicy { retry: RetryPolicy::none(), limits: TimeLimits::minutes(5, 6) },
        );
        policies.insert(
            TaskCategory::Migration,
            CategoryPolicy { retry: RetryPolicy::none(), limits: TimeLimits::minutes(25, 30) },
        );
        policies.insert(
            TaskCategory::Maintenance,
            CategoryPolicy { retry: backoff, limits: TimeLimits::minutes(55, 60) },
        );
        policies.insert(
            TaskCategory::Monitoring,
            CategoryPolicy {
                retry: backoff,
                limits: TimeLimits {
                    soft: Duration::from_secs(60),
                    hard: Duration::from_secs(90),
                },
            },
        );
        Self { policies }
    }
}

impl PolicyTable {
    pub fn get(&self, category: TaskCategory) -> CategoryPolicy {
        self.policies.get(&category).copied().unwrap_or(CategoryPolicy {
            retry: RetryPolicy::none(),
            limits: TimeLimits::minutes(5, 6),
        })
    }

    pub fn max_retries(&self, category: TaskCategory) -> u32 {
        self.get(category).retry.max_retries
    }

    pub fn limits(&self, category: TaskCategory) -> TimeLimits {
        self.get(category).limits
    }

    pub fn retry_delay(&self, category: TaskCategory, attempt: u32) -> Duration {
        self.get(category).retry.delay_after(attempt)
    }

    /// How long a claimed task stays leased before it is redelivered.
    pub fn lease_for(&self, category: TaskCategory) -> Duration {
        self.limits(category).hard + LEASE_MARGIN
    }

    /// Override the first retry delay of every retrying category.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        for policy in self.policies.values_mut() {
            if policy.retry.max_retries > 0 {
                policy.retry.base_delay = base;
            }
        }
        self
    }

    pub fn with_limits(mut self, category: TaskCategory, limits: TimeLimits) -> Self {
        let mut policy = self.get(category);
        policy.limits = limits;
        self.policies.insert(category, policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_categories_never_retry() {
        let table = PolicyTable::default();
        for category in TaskCategory::all() {
            let retries = table.max_retries(*category);
            if category.is_instance_lifecycle() {
                assert_eq!(retries, 0, "{}", category.as_str());
            } else {
                assert_eq!(retries, 3, "{}", category.as_str());
            }
        }
    }

    #[test]
    fn test_soft_limit_precedes_hard_limit() {
        let table = PolicyTable::default();
        for category in TaskCategory::all() {
            let limits = table.limits(*category);
            assert!(limits.soft < limits.hard);
            assert!(table.lease_for(*category) > limits.hard);
        }
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let retry = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
        };
        for attempt in 1..=3 {
            let full = Duration::from_secs(10 * 2u64.pow(attempt - 1));
            for _ in 0..50 {
                let d = retry.delay_after(attempt);
                assert!(d >= full / 2 && d <= full, "attempt {}: {:?}", attempt, d);
            }
        }
    }

    #[test]
    fn test_zero_base_means_immediate_retry() {
        let table = PolicyTable::default().with_retry_base(Duration::ZERO);
        assert_eq!(table.retry_delay(TaskCategory::Monitoring, 2), Duration::ZERO);
        assert_eq!(table.max_retries(TaskCategory::Provisioning), 0);
    }
}
