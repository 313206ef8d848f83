//! Bounded retry of read-modify-write cycles on optimistic-concurrency conflicts

use gpuslice_core::{NodeLedger, RetryConfig, SliceError, SliceResult, Workload, WorkloadKey};
use rand::Rng;
use std::time::Duration;
use tracing::debug;

use crate::traits::ClusterStore;

/// Retry policy with capped exponential backoff and jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Build a policy from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay);
        if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
            delay + delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Re-read a ledger, apply `mutate`, and write it back, retrying on conflict.
///
/// `mutate` returns whether it changed anything; when it did not, no write is
/// issued and the fresh read is returned. An error from `mutate` aborts the
/// cycle without writing.
pub async fn mutate_ledger<F>(
    store: &dyn ClusterStore,
    policy: &RetryPolicy,
    name: &str,
    mut mutate: F,
) -> SliceResult<NodeLedger>
where
    F: FnMut(&mut NodeLedger) -> SliceResult<bool> + Send,
{
    let mut attempt = 0;
    loop {
        let mut ledger = store.get_ledger(name).await?;
        if !mutate(&mut ledger)? {
            return Ok(ledger);
        }
        match store.update_ledger(ledger).await {
            Err(SliceError::WriteConflict(msg)) if attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                attempt += 1;
                debug!(ledger = %name, attempt, conflict = %msg, "Retrying ledger update");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Re-read a workload, apply `mutate`, and write it back, retrying on conflict.
///
/// Same contract as [`mutate_ledger`].
pub async fn mutate_workload<F>(
    store: &dyn ClusterStore,
    policy: &RetryPolicy,
    key: &WorkloadKey,
    mut mutate: F,
) -> SliceResult<Workload>
where
    F: FnMut(&mut Workload) -> SliceResult<bool> + Send,
{
    let mut attempt = 0;
    loop {
        let mut workload = store.get_workload(key).await?;
        if !mutate(&mut workload)? {
            return Ok(workload);
        }
        match store.update_workload(workload).await {
            Err(SliceError::WriteConflict(msg)) if attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                attempt += 1;
                debug!(workload = %key, attempt, conflict = %msg, "Retrying workload update");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use gpuslice_core::NodeResources;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_retry_delay_calculation() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));

        // Capped
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(64), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_delay_jitter_bounds() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter: 0.5,
        });
        for _ in 0..20 {
            let d = policy.delay(0);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_mutate_ledger_retries_conflicts() {
        let store = MemoryStore::new();
        store
            .create_ledger(NodeLedger::new("node-a", NodeResources::default()))
            .await
            .unwrap();
        store.inject_ledger_conflicts(2);

        let mut calls = 0;
        let ledger = mutate_ledger(&store, &fast_policy(5), "node-a", |l| {
            calls += 1;
            l.resources.boot_id = "boot-1".to_string();
            Ok(true)
        })
        .await
        .unwrap();

        assert_eq!(calls, 3);
        assert_eq!(ledger.resources.boot_id, "boot-1");
    }

    #[tokio::test]
    async fn test_mutate_ledger_gives_up() {
        let store = MemoryStore::new();
        store
            .create_ledger(NodeLedger::new("node-a", NodeResources::default()))
            .await
            .unwrap();
        store.inject_ledger_conflicts(10);

        let err = mutate_ledger(&store, &fast_policy(2), "node-a", |_| Ok(true))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_mutate_ledger_skips_write_when_unchanged() {
        let store = MemoryStore::new();
        let created = store
            .create_ledger(NodeLedger::new("node-a", NodeResources::default()))
            .await
            .unwrap();

        let ledger = mutate_ledger(&store, &fast_policy(0), "node-a", |_| Ok(false))
            .await
            .unwrap();
        assert_eq!(ledger.resource_version, created.resource_version);
    }

    #[tokio::test]
    async fn test_mutate_ledger_propagates_closure_error() {
        let store = MemoryStore::new();
        store
            .create_ledger(NodeLedger::new("node-a", NodeResources::default()))
            .await
            .unwrap();

        let err = mutate_ledger(&store, &fast_policy(3), "node-a", |_| {
            Err(SliceError::NoCapacity("full".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SliceError::NoCapacity(_)));
    }

    #[tokio::test]
    async fn test_mutate_workload() {
        let store = MemoryStore::new();
        let workload = store
            .create_workload(Workload::new("default", "w"))
            .await
            .unwrap();

        let updated = mutate_workload(&store, &fast_policy(3), &workload.key(), |w| {
            w.finalizers.push("example.com/f".to_string());
            Ok(true)
        })
        .await
        .unwrap();
        assert!(updated.has_finalizer("example.com/f"));
    }
}
