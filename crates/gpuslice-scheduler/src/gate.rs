//! Scheduling-gate and finalizer handling on workloads

use gpuslice_core::{LabelConfig, SliceResult, Workload, WorkloadKey, WorkloadPhase};
use gpuslice_store::{mutate_workload, ClusterStore, RetryPolicy};
use std::sync::Arc;
use tracing::{debug, info};

/// Condition message fragment reported while scheduling gates hold a workload
const BLOCKED_MARKER: &str = "blocked";

/// Admission gate manager
pub struct GateManager {
    store: Arc<dyn ClusterStore>,
    retry: RetryPolicy,
    labels: LabelConfig,
}

impl GateManager {
    /// Create a new gate manager
    pub fn new(store: Arc<dyn ClusterStore>, retry: RetryPolicy, labels: LabelConfig) -> Self {
        Self {
            store,
            retry,
            labels,
        }
    }

    /// Whether the workload carries our gate and is held pending by it
    pub fn is_gated(&self, workload: &Workload) -> bool {
        workload.has_gate(&self.labels.gate_name)
            && workload.phase == WorkloadPhase::Pending
            && workload
                .conditions
                .iter()
                .any(|c| c.message.contains(BLOCKED_MARKER))
    }

    /// Whether another system also gates the workload
    pub fn is_gated_by_others(&self, workload: &Workload) -> bool {
        workload
            .scheduling_gates
            .iter()
            .any(|g| g != &self.labels.gate_name)
    }

    /// Whether the workload is ours to track
    pub fn is_tracked(&self, workload: &Workload) -> bool {
        self.is_gated(workload) || workload.has_finalizer(&self.labels.finalizer_name)
    }

    /// Node the workload is pinned to, if any
    pub fn pinned_node<'a>(&self, workload: &'a Workload) -> Option<&'a str> {
        workload
            .node_selector
            .get(&self.labels.node_selector_key)
            .map(String::as_str)
    }

    /// Add our finalizer
    pub async fn add_finalizer(&self, key: &WorkloadKey) -> SliceResult<Workload> {
        let finalizer = self.labels.finalizer_name.clone();
        let workload = mutate_workload(self.store.as_ref(), &self.retry, key, |w| {
            if w.has_finalizer(&finalizer) {
                return Ok(false);
            }
            w.finalizers.push(finalizer.clone());
            Ok(true)
        })
        .await?;
        debug!(workload = %key, "Finalizer added");
        Ok(workload)
    }

    /// Remove our finalizer. A workload that is already gone counts as done.
    pub async fn release_finalizer(&self, key: &WorkloadKey) -> SliceResult<()> {
        let finalizer = self.labels.finalizer_name.clone();
        let outcome = mutate_workload(self.store.as_ref(), &self.retry, key, |w| {
            let before = w.finalizers.len();
            w.finalizers.retain(|f| f != &finalizer);
            Ok(w.finalizers.len() != before)
        })
        .await;

        match outcome {
            Ok(_) => {
                info!(workload = %key, "Finalizer released");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Pin the workload to `node` and remove our gate.
    ///
    /// Returns whether a write was needed; reapplying to an already pinned and
    /// ungated workload changes nothing.
    pub async fn pin_and_ungate(&self, key: &WorkloadKey, node: &str) -> SliceResult<bool> {
        let selector_key = self.labels.node_selector_key.clone();
        let gate = self.labels.gate_name.clone();
        let mut changed = false;

        mutate_workload(self.store.as_ref(), &self.retry, key, |w| {
            changed = false;
            if w.node_selector.get(&selector_key).map(String::as_str) != Some(node) {
                w.node_selector.insert(selector_key.clone(), node.to_string());
                changed = true;
            }
            let before = w.scheduling_gates.len();
            w.scheduling_gates.retain(|g| g != &gate);
            changed |= w.scheduling_gates.len() != before;
            Ok(changed)
        })
        .await?;

        if changed {
            info!(workload = %key, node = %node, "Workload pinned and ungated");
        }
        Ok(changed)
    }
}
