//! Removal of allocation records whose workload is gone, and half-pair repair

use gpuslice_core::{
    AllocationRequest, NodeLedger, SliceResult, Workload, WorkloadKey, WorkloadUid,
};
use gpuslice_store::{mutate_ledger, ClusterStore, RetryPolicy};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Request/result pairs removed because their workload is gone
    pub orphans: Vec<WorkloadUid>,
    /// Requests dropped because they had no result
    pub dangling_requests: Vec<WorkloadUid>,
    /// Requests rebuilt for results of live workloads
    pub rebuilt_requests: Vec<WorkloadUid>,
    /// Results dropped because no request could be rebuilt
    pub dropped_results: Vec<WorkloadUid>,
    /// Auxiliary bindings owned by removed orphans
    pub released_bindings: Vec<WorkloadKey>,
}

impl SweepReport {
    /// Whether any record was removed
    pub fn removed_any(&self) -> bool {
        !self.orphans.is_empty() || !self.dangling_requests.is_empty() || !self.dropped_results.is_empty()
    }

    fn merge(&mut self, other: SweepReport) {
        self.orphans.extend(other.orphans);
        self.dangling_requests.extend(other.dangling_requests);
        self.rebuilt_requests.extend(other.rebuilt_requests);
        self.dropped_results.extend(other.dropped_results);
        self.released_bindings.extend(other.released_bindings);
    }
}

/// Orphan reconciler
pub struct OrphanReconciler {
    store: Arc<dyn ClusterStore>,
    retry: RetryPolicy,
    resource_marker: String,
}

impl OrphanReconciler {
    /// Create a new reconciler
    pub fn new(store: Arc<dyn ClusterStore>, retry: RetryPolicy, resource_marker: impl Into<String>) -> Self {
        Self {
            store,
            retry,
            resource_marker: resource_marker.into(),
        }
    }

    /// Sweep every shared object once
    pub async fn sweep(&self) -> SliceResult<SweepReport> {
        let live: HashMap<WorkloadUid, Workload> = self
            .store
            .list_workloads()
            .await?
            .into_iter()
            .map(|w| (w.uid, w))
            .collect();
        let live_keys: HashSet<WorkloadKey> = live.values().map(|w| w.key()).collect();

        let mut report = SweepReport::default();
        for ledger in self.store.list_ledgers().await? {
            if repair(&mut ledger.clone(), &live, &self.resource_marker) == SweepReport::default() {
                continue;
            }

            let mut pass = SweepReport::default();
            let outcome = mutate_ledger(self.store.as_ref(), &self.retry, &ledger.name, |fresh| {
                pass = repair(fresh, &live, &self.resource_marker);
                Ok(pass != SweepReport::default())
            })
            .await;

            match outcome {
                Ok(_) => {}
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }

            for uid in &pass.orphans {
                info!(node = %ledger.name, uid = %uid, "Removed orphaned allocation");
            }
            for uid in &pass.dangling_requests {
                warn!(node = %ledger.name, uid = %uid, "Dropped request without result");
            }
            for uid in &pass.rebuilt_requests {
                warn!(node = %ledger.name, uid = %uid, "Rebuilt request for result");
            }
            for uid in &pass.dropped_results {
                warn!(node = %ledger.name, uid = %uid, "Dropped result without request");
            }

            // A live workload may have reused the name
            for key in pass.released_bindings.iter().filter(|k| !live_keys.contains(k)) {
                self.store.delete_binding(key).await?;
            }
            report.merge(pass);
        }

        Ok(report)
    }
}

/// Apply the sweep to one ledger in place
fn repair(ledger: &mut NodeLedger, live: &HashMap<WorkloadUid, Workload>, marker: &str) -> SweepReport {
    let mut report = SweepReport::default();

    let orphans: Vec<WorkloadUid> = ledger
        .requests
        .keys()
        .chain(ledger.results.keys())
        .filter(|uid| !live.contains_key(uid))
        .copied()
        .collect();
    for uid in orphans {
        if let Some(request) = ledger.requests.get(&uid) {
            report.released_bindings.push(request.workload.key());
        }
        if ledger.remove_allocation(&uid) {
            report.orphans.push(uid);
        }
    }

    let dangling: Vec<WorkloadUid> = ledger
        .requests
        .keys()
        .filter(|uid| !ledger.results.contains_key(uid))
        .copied()
        .collect();
    for uid in dangling {
        ledger.requests.remove(&uid);
        report.dangling_requests.push(uid);
    }

    let unrequested: Vec<WorkloadUid> = ledger
        .results
        .keys()
        .filter(|uid| !ledger.requests.contains_key(uid))
        .copied()
        .collect();
    for uid in unrequested {
        // Only live workloads remain at this point
        let Some(workload) = live.get(&uid) else {
            continue;
        };
        match workload.requested_profile(marker) {
            Ok(profile) => {
                ledger.requests.insert(
                    uid,
                    AllocationRequest {
                        profile,
                        workload: workload.reference(),
                    },
                );
                report.rebuilt_requests.push(uid);
            }
            Err(_) => {
                ledger.results.remove(&uid);
                report.dropped_results.push(uid);
            }
        }
    }

    report
}
