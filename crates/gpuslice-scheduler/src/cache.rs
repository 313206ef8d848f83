//! Process-local record of recently committed allocations

use gpuslice_core::{AllocationResult, NodeLedger, WorkloadUid};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Allocation cache.
///
/// A listed snapshot of the shared objects can lag behind a write this process
/// just made; the cache closes that gap. It only ever restricts candidate
/// windows during placement and is never asked whether a workload has an
/// allocation. It starts empty, is written synchronously on every commit and is
/// only ever rebuilt wholesale.
#[derive(Default)]
pub struct AllocationCache {
    entries: RwLock<HashMap<WorkloadUid, AllocationResult>>,
}

impl AllocationCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly committed result
    pub async fn record(&self, uid: WorkloadUid, result: AllocationResult) {
        self.entries.write().await.insert(uid, result);
    }

    /// All cached results
    pub async fn results(&self) -> Vec<AllocationResult> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Copy of the cache contents
    pub async fn snapshot(&self) -> HashMap<WorkloadUid, AllocationResult> {
        self.entries.read().await.clone()
    }

    /// Number of cached results
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Replace the whole cache with the results present in `ledgers`
    pub async fn rebuild(&self, ledgers: &[NodeLedger]) {
        let fresh: HashMap<WorkloadUid, AllocationResult> = ledgers
            .iter()
            .flat_map(|l| l.results.iter().map(|(uid, r)| (*uid, r.clone())))
            .collect();

        let mut entries = self.entries.write().await;
        let previous = entries.len();
        *entries = fresh;
        debug!(previous, current = entries.len(), "Allocation cache rebuilt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{a100_ledger, commit};
    use gpuslice_core::Placement;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_record_and_read() {
        let cache = AllocationCache::new();
        assert!(cache.is_empty().await);

        let uid = Uuid::new_v4();
        cache
            .record(uid, AllocationResult::new("node-a", "GPU-0", Placement::new(0, 1)))
            .await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.results().await[0].node_name, "node-a");
    }

    #[tokio::test]
    async fn test_rebuild_equals_snapshot() {
        let cache = AllocationCache::new();
        // Stale entry the snapshot no longer holds
        cache
            .record(
                Uuid::new_v4(),
                AllocationResult::new("node-z", "GPU-0", Placement::new(0, 1)),
            )
            .await;

        let mut a = a100_ledger("node-a", 1);
        let mut b = a100_ledger("node-b", 1);
        commit(&mut a, "node-a-GPU-0", Placement::new(0, 1), "1g.5gb");
        commit(&mut a, "node-a-GPU-0", Placement::new(4, 4), "3g.20gb");
        commit(&mut b, "node-b-GPU-0", Placement::new(0, 8), "7g.40gb");

        let ledgers = vec![a, b];
        cache.rebuild(&ledgers).await;

        let expected: HashMap<WorkloadUid, AllocationResult> = ledgers
            .iter()
            .flat_map(|l| l.results.clone())
            .collect();
        assert_eq!(cache.snapshot().await, expected);
    }
}
