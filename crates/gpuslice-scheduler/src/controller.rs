//! Reconcile logic for workloads and nodes

use chrono::Utc;
use gpuslice_core::{
    AllocationRequest, AllocationResult, ControllerConfig, ControllerState, DaemonConfig,
    LabelConfig, NodeLedger, Profile, SliceError, SliceResult, Workload, WorkloadKey, WorkloadUid,
};
use gpuslice_store::{mutate_ledger, ClusterStore, RetryPolicy};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::AllocationCache;
use crate::gate::GateManager;
use crate::health::{NodeHealthMonitor, NodeTransition};
use crate::lifecycle::{self, Step};
use crate::orphan::{OrphanReconciler, SweepReport};
use crate::placement::{FirstFit, PlacementDecision, PlacementStrategy};

/// Outcome of a reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing further until the next event
    Done,
    /// Run again shortly
    Requeue,
    /// Run again after the delay
    RequeueAfter(Duration),
}

/// An allocation record found for a workload
struct Located {
    ledger: NodeLedger,
    result: Option<AllocationResult>,
    has_request: bool,
}

fn locate(ledgers: &[NodeLedger], uid: WorkloadUid) -> Option<Located> {
    ledgers
        .iter()
        .filter(|l| l.requests.contains_key(&uid) || l.results.contains_key(&uid))
        .min_by(|a, b| a.name.cmp(&b.name))
        .map(|l| Located {
            ledger: l.clone(),
            result: l.results.get(&uid).cloned(),
            has_request: l.requests.contains_key(&uid),
        })
}

/// Allocation lifecycle controller
pub struct Controller {
    store: Arc<dyn ClusterStore>,
    strategy: Arc<dyn PlacementStrategy>,
    cache: AllocationCache,
    gates: GateManager,
    health: NodeHealthMonitor,
    orphans: OrphanReconciler,
    retry: RetryPolicy,
    config: ControllerConfig,
    labels: LabelConfig,
    /// Serializes search-and-commit, orphan sweeps and cache rebuilds
    placement_lock: Mutex<()>,
}

impl Controller {
    /// Create a controller using first-fit placement
    pub fn new(store: Arc<dyn ClusterStore>, config: &DaemonConfig) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        Self {
            gates: GateManager::new(store.clone(), retry.clone(), config.labels.clone()),
            health: NodeHealthMonitor::new(store.clone(), config.labels.clone()),
            orphans: OrphanReconciler::new(
                store.clone(),
                retry.clone(),
                config.labels.resource_marker.clone(),
            ),
            store,
            strategy: Arc::new(FirstFit),
            cache: AllocationCache::new(),
            retry,
            config: config.controller.clone(),
            labels: config.labels.clone(),
            placement_lock: Mutex::new(()),
        }
    }

    /// The allocation cache
    pub fn cache(&self) -> &AllocationCache {
        &self.cache
    }

    /// Marker names in use
    pub fn labels(&self) -> &LabelConfig {
        &self.labels
    }

    /// Reconcile one workload
    pub async fn reconcile_workload(&self, key: &WorkloadKey) -> Action {
        match self.sync_workload(key).await {
            Ok(action) => action,
            Err(e) => self.action_for_error(key, e).await,
        }
    }

    /// Reconcile one node
    pub async fn reconcile_node(&self, name: &str) -> Action {
        let outcome = async {
            match self.health.observe(name).await? {
                NodeTransition::Unchanged => {}
                NodeTransition::BecameNotReady
                | NodeTransition::Removed
                | NodeTransition::Unmanaged => self.rebuild_cache().await?,
            }
            Ok::<_, SliceError>(())
        }
        .await;

        match outcome {
            Ok(()) => Action::Done,
            Err(e) if e.is_retryable() => {
                warn!(node = %name, error = %e, "Node reconcile failed, requeuing");
                Action::Requeue
            }
            Err(e) => {
                error!(node = %name, error = %e, "Node reconcile failed");
                Action::Done
            }
        }
    }

    /// Replace the allocation cache with the results currently listed
    pub async fn rebuild_cache(&self) -> SliceResult<()> {
        let _guard = self.placement_lock.lock().await;
        let ledgers = self.store.list_ledgers().await?;
        self.cache.rebuild(&ledgers).await;
        Ok(())
    }

    /// Remove orphaned records; rebuilds the cache when anything was removed
    pub async fn sweep_orphans(&self) -> SliceResult<SweepReport> {
        let report = {
            let _guard = self.placement_lock.lock().await;
            self.orphans.sweep().await?
        };
        if report.removed_any() {
            self.rebuild_cache().await?;
        }
        Ok(report)
    }

    async fn sync_workload(&self, key: &WorkloadKey) -> SliceResult<Action> {
        let workload = self.store.get_workload(key).await?;

        if self.gates.is_gated_by_others(&workload) {
            debug!(workload = %key, "Workload gated by another system, ignoring");
            return Ok(Action::Done);
        }
        if !self.gates.is_tracked(&workload) {
            return Ok(Action::Done);
        }

        let gated = self.gates.is_gated(&workload);
        let workload = if workload.has_finalizer(&self.labels.finalizer_name) {
            workload
        } else {
            self.gates.add_finalizer(key).await?
        };

        let ledgers = self.store.list_ledgers().await?;
        let located = locate(&ledgers, workload.uid);

        let allocation = match &located {
            Some(found) => {
                self.health.verify(&found.ledger).await?;
                match (&found.result, found.has_request) {
                    (Some(result), true) => Some(result.clone()),
                    (Some(_), false) => {
                        return Err(SliceError::Inconsistent(format!(
                            "result without request for {} on {}",
                            key, found.ledger.name
                        )))
                    }
                    (None, _) => {
                        return Err(SliceError::Inconsistent(format!(
                            "request without result for {} on {}",
                            key, found.ledger.name
                        )))
                    }
                }
            }
            None => None,
        };

        let step = lifecycle::plan(
            &workload,
            gated,
            self.gates.pinned_node(&workload),
            allocation.as_ref(),
            self.config.grace_period(),
            Utc::now(),
        );
        debug!(workload = %key, step = ?step, "Reconciling workload");

        let node = allocation.as_ref().map(|r| r.node_name.clone()).unwrap_or_default();
        match step {
            Step::Idle => Ok(Action::Done),
            Step::Place => self.place(&workload, ledgers).await,
            Step::MarkUngated => {
                self.advance(&node, workload.uid, ControllerState::Ungated).await?;
                Ok(Action::RequeueAfter(self.config.ungate_delay()))
            }
            Step::PinAndUngate => {
                self.gates.pin_and_ungate(key, &node).await?;
                Ok(Action::Done)
            }
            Step::AwaitAgent => Ok(Action::RequeueAfter(self.config.agent_wait())),
            Step::AwaitGrace(remaining) => {
                debug!(workload = %key, remaining = ?remaining, "Waiting out grace period");
                Ok(Action::RequeueAfter(remaining))
            }
            Step::MarkDeleting => {
                self.advance(&node, workload.uid, ControllerState::Deleting).await?;
                Ok(Action::RequeueAfter(self.config.agent_wait()))
            }
            Step::RemoveRecord { release_finalizer } => {
                self.remove_record(&node, &workload).await?;
                if release_finalizer {
                    self.gates.release_finalizer(key).await?;
                    Ok(Action::Done)
                } else {
                    Ok(Action::Requeue)
                }
            }
            Step::ReleaseFinalizer => {
                self.gates.release_finalizer(key).await?;
                Ok(Action::Done)
            }
        }
    }

    /// Search for a window and commit it
    async fn place(&self, workload: &Workload, listed: Vec<NodeLedger>) -> SliceResult<Action> {
        let key = workload.key();
        let profile = workload.requested_profile(&self.labels.resource_marker)?;

        {
            let _guard = self.placement_lock.lock().await;

            // The listing may lag: confirm on fresh reads that no record exists yet
            let mut fresh = Vec::with_capacity(listed.len());
            for ledger in &listed {
                match self.store.get_ledger(&ledger.name).await {
                    Ok(current)
                        if current.requests.contains_key(&workload.uid)
                            || current.results.contains_key(&workload.uid) =>
                    {
                        debug!(workload = %key, node = %current.name, "Allocation already recorded");
                        return Ok(Action::Requeue);
                    }
                    Ok(current) => fresh.push(current),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }

            // Windows released since the last commit (lost on reboot, torn
            // down) must not stay held by earlier cache entries
            self.cache.rebuild(&fresh).await;
            let split = self.health.partition(fresh).await?;
            let recent = self.cache.results().await;
            let decision = match self.strategy.place(&profile, &split.trusted, &recent) {
                Ok(decision) => decision,
                Err(SliceError::NoCapacity(reason)) => {
                    // Capacity may exist behind a fenced node
                    return Err(split
                        .into_fencing_error()
                        .unwrap_or(SliceError::NoCapacity(reason)));
                }
                Err(e) => return Err(e),
            };

            let boot_id = split
                .trusted
                .iter()
                .find(|l| l.name == decision.node_name)
                .map(|l| l.resources.boot_id.clone())
                .unwrap_or_default();
            let result = self.commit(workload, profile, &decision, &boot_id).await?;
            self.cache.record(workload.uid, result).await;

            info!(
                workload = %key,
                profile = %profile,
                node = %decision.node_name,
                gpu = %decision.gpu_uuid,
                placement = %decision.placement,
                "Slice allocated"
            );
        }

        if let Err(e) = self.sweep_orphans().await {
            warn!(error = %e, "Orphan sweep after placement failed");
        }
        Ok(Action::Done)
    }

    /// Write the request/result pair, revalidating the window on a fresh read
    async fn commit(
        &self,
        workload: &Workload,
        profile: Profile,
        decision: &PlacementDecision,
        boot_id: &str,
    ) -> SliceResult<AllocationResult> {
        let uid = workload.uid;
        let request = AllocationRequest {
            profile,
            workload: workload.reference(),
        };
        let result = AllocationResult::new(
            decision.node_name.clone(),
            decision.gpu_uuid.clone(),
            decision.placement,
        );

        mutate_ledger(self.store.as_ref(), &self.retry, &decision.node_name, |ledger| {
            if ledger.resources.boot_id != boot_id {
                return Err(SliceError::StaleBootId {
                    node: ledger.name.clone(),
                    recorded: ledger.resources.boot_id.clone(),
                    live: boot_id.to_string(),
                });
            }
            if ledger.requests.contains_key(&uid) || ledger.results.contains_key(&uid) {
                return Err(SliceError::WriteConflict(format!(
                    "allocation for {} already recorded on {}",
                    uid, ledger.name
                )));
            }
            if !ledger.resources.has_gpu(&decision.gpu_uuid)
                || !ledger.is_window_free(&decision.gpu_uuid, &decision.placement)
            {
                return Err(SliceError::NoCapacity(format!(
                    "window {} on {} taken before commit",
                    decision.placement, decision.gpu_uuid
                )));
            }
            ledger.insert_allocation(request.clone(), result.clone());
            Ok(true)
        })
        .await?;

        Ok(result)
    }

    /// Advance the controller half of a workload's status
    async fn advance(&self, node: &str, uid: WorkloadUid, next: ControllerState) -> SliceResult<()> {
        mutate_ledger(self.store.as_ref(), &self.retry, node, |ledger| {
            let result = ledger.results.get_mut(&uid).ok_or_else(|| {
                SliceError::Inconsistent(format!("allocation for {} vanished from {}", uid, node))
            })?;
            result.status.advance_controller(next)
        })
        .await?;
        info!(node = %node, uid = %uid, state = %next, "Allocation advanced");
        Ok(())
    }

    /// Remove a torn-down record and everything hanging off it
    async fn remove_record(&self, node: &str, workload: &Workload) -> SliceResult<()> {
        let uid = workload.uid;
        let outcome = mutate_ledger(self.store.as_ref(), &self.retry, node, |ledger| {
            Ok(ledger.remove_allocation(&uid))
        })
        .await;
        match outcome {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.store.delete_binding(&workload.key()).await?;
        info!(workload = %workload.key(), node = %node, "Allocation removed");

        self.rebuild_cache().await?;
        if let Err(e) = self.sweep_orphans().await {
            warn!(error = %e, "Orphan sweep after removal failed");
        }
        Ok(())
    }

    async fn action_for_error(&self, key: &WorkloadKey, err: SliceError) -> Action {
        match &err {
            SliceError::NotFound(_) => {
                debug!(workload = %key, reason = %err, "Object gone, nothing to do");
                Action::Done
            }
            SliceError::WriteConflict(_) | SliceError::Store(_) => {
                debug!(workload = %key, reason = %err, "Transient failure, requeuing");
                Action::Requeue
            }
            SliceError::NoCapacity(_) => {
                let min = self.config.no_capacity_min_secs;
                let max = self.config.no_capacity_max_secs.max(min);
                let secs = rand::thread_rng().gen_range(min..=max);
                info!(workload = %key, retry_in_secs = secs, "No capacity for workload");
                Action::RequeueAfter(Duration::from_secs(secs))
            }
            SliceError::StaleBootId { .. } => {
                warn!(workload = %key, reason = %err, "Node boot id out of sync");
                Action::RequeueAfter(self.config.stale_boot_requeue())
            }
            SliceError::NotPublished(_) => {
                info!(workload = %key, reason = %err, "Node resources not published yet");
                Action::RequeueAfter(self.config.unpublished_requeue())
            }
            SliceError::MalformedWorkload(_) | SliceError::InvalidTransition(_) => {
                error!(workload = %key, reason = %err, "Workload cannot be served");
                Action::Done
            }
            SliceError::Inconsistent(_) => {
                warn!(workload = %key, reason = %err, "Inconsistent allocation record, repairing");
                if let Err(e) = self.sweep_orphans().await {
                    warn!(error = %e, "Orphan sweep failed");
                }
                Action::Requeue
            }
            _ if err.is_retryable() => Action::Requeue,
            _ => {
                error!(workload = %key, reason = %err, "Reconcile failed");
                Action::Done
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{a100_ledger, gated_workload, managed_node};
    use gpuslice_agent::{EmulatedBackend, NodeAgent, PartitionBackend};
    use gpuslice_core::{AgentState, Placement, WorkloadPhase};
    use gpuslice_store::MemoryStore;
    use std::collections::HashSet;

    struct Cluster {
        store: Arc<MemoryStore>,
        controller: Controller,
        agents: Vec<NodeAgent>,
        backends: Vec<Arc<EmulatedBackend>>,
        labels: LabelConfig,
    }

    fn config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.controller.grace_period_secs = 0;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config
    }

    /// Nodes backed by emulated agents, one GPU each
    async fn cluster(nodes: &[&str]) -> Cluster {
        let config = config();
        let labels = config.labels.clone();
        let store = Arc::new(MemoryStore::new());
        let mut agents = Vec::new();
        let mut backends = Vec::new();

        for name in nodes {
            let backend = Arc::new(EmulatedBackend::new(*name, 1, "NVIDIA A100-PCIE-40GB"));
            let mut node = managed_node(name, &labels);
            node.boot_id = backend.boot_id().await;
            store.put_node(node).await;

            let agent = NodeAgent::new(*name, store.clone(), backend.clone(), RetryPolicy::default());
            agent.publish().await.unwrap();
            agents.push(agent);
            backends.push(backend);
        }

        Cluster {
            controller: Controller::new(store.clone(), &config),
            store,
            agents,
            backends,
            labels,
        }
    }

    impl Cluster {
        async fn submit(&self, name: &str, profile: &str) -> Workload {
            self.store
                .create_workload(gated_workload(name, profile, &self.labels))
                .await
                .unwrap()
        }

        async fn sync_agents(&self) {
            for agent in &self.agents {
                agent.sync().await.unwrap();
            }
        }

        /// Alternate controller and agent passes; returns the last controller action
        async fn drive(&self, key: &WorkloadKey) -> Action {
            let mut action = Action::Requeue;
            for _ in 0..8 {
                action = self.controller.reconcile_workload(key).await;
                self.sync_agents().await;
            }
            action
        }

        async fn result(&self, uid: WorkloadUid) -> Option<AllocationResult> {
            for ledger in self.store.list_ledgers().await.unwrap() {
                if let Some(r) = ledger.results.get(&uid) {
                    return Some(r.clone());
                }
            }
            None
        }

        async fn result_count(&self, uid: WorkloadUid) -> usize {
            self.store
                .list_ledgers()
                .await
                .unwrap()
                .iter()
                .filter(|l| l.results.contains_key(&uid))
                .count()
        }
    }

    #[tokio::test]
    async fn test_full_creation_lifecycle() {
        let c = cluster(&["node-a"]).await;
        let w = c.submit("w", "1g.5gb").await;

        // Placement: finalizer first, then Creating
        assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Done);
        let placed = c.store.get_workload(&w.key()).await.unwrap();
        assert!(placed.has_finalizer(&c.labels.finalizer_name));
        let r = c.result(w.uid).await.unwrap();
        assert_eq!(r.status.controller, ControllerState::Creating);
        assert_eq!(r.status.agent, AgentState::Pending);
        assert_eq!(r.placement, Placement::new(0, 1));
        assert_eq!(c.controller.cache().len().await, 1);

        // Agent has not acted yet
        assert_eq!(
            c.controller.reconcile_workload(&w.key()).await,
            Action::RequeueAfter(Duration::from_secs(2))
        );

        c.sync_agents().await;
        assert!(matches!(
            c.controller.reconcile_workload(&w.key()).await,
            Action::RequeueAfter(_)
        ));
        assert_eq!(
            c.result(w.uid).await.unwrap().status.controller,
            ControllerState::Ungated
        );

        assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Done);
        let running = c.store.get_workload(&w.key()).await.unwrap();
        assert!(!running.has_gate(&c.labels.gate_name));
        assert_eq!(
            running.node_selector.get(&c.labels.node_selector_key),
            Some(&"node-a".to_string())
        );
        assert!(c.store.get_binding(&w.key()).await.is_some());
    }

    #[tokio::test]
    async fn test_replay_after_ungate_changes_nothing() {
        let c = cluster(&["node-a"]).await;
        let w = c.submit("w", "1g.5gb").await;
        assert_eq!(c.drive(&w.key()).await, Action::Done);

        let ledger_before = c.store.get_ledger("node-a").await.unwrap();
        let workload_before = c.store.get_workload(&w.key()).await.unwrap();

        for _ in 0..3 {
            assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Done);
        }
        assert_eq!(c.store.get_ledger("node-a").await.unwrap(), ledger_before);
        assert_eq!(c.store.get_workload(&w.key()).await.unwrap(), workload_before);
    }

    #[tokio::test]
    async fn test_repin_is_idempotent_after_lost_ungate_write() {
        let c = cluster(&["node-a"]).await;
        let w = c.submit("w", "1g.5gb").await;
        c.controller.reconcile_workload(&w.key()).await;
        c.sync_agents().await;
        // Ungated recorded, then the controller "crashes" before pinning
        c.controller.reconcile_workload(&w.key()).await;

        let fresh = Controller::new(c.store.clone(), &config());
        assert_eq!(fresh.reconcile_workload(&w.key()).await, Action::Done);
        assert_eq!(fresh.reconcile_workload(&w.key()).await, Action::Done);
        let w = c.store.get_workload(&w.key()).await.unwrap();
        assert!(!w.has_gate(&c.labels.gate_name));
        assert_eq!(c.result(w.uid).await.unwrap().status.controller, ControllerState::Ungated);
    }

    #[tokio::test]
    async fn test_deletion_lifecycle() {
        let c = cluster(&["node-a"]).await;
        let w = c.submit("w", "3g.20gb").await;
        c.drive(&w.key()).await;

        let mut running = c.store.get_workload(&w.key()).await.unwrap();
        running.phase = WorkloadPhase::Running;
        c.store.update_workload(running).await.unwrap();
        c.store.delete_workload(&w.key()).await.unwrap();

        // Grace period is zero in tests
        assert!(matches!(
            c.controller.reconcile_workload(&w.key()).await,
            Action::RequeueAfter(_)
        ));
        assert_eq!(
            c.result(w.uid).await.unwrap().status.controller,
            ControllerState::Deleting
        );

        c.sync_agents().await;
        assert_eq!(c.result(w.uid).await.unwrap().status.agent, AgentState::Deleted);

        assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Done);
        assert!(c.result(w.uid).await.is_none());
        assert!(c.store.get_workload(&w.key()).await.unwrap_err().is_not_found());
        assert!(c.store.get_binding(&w.key()).await.is_none());
        assert!(c.backends[0].partitions().await.unwrap().is_empty());
        assert!(c.controller.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_grace_period_defers_deleting() {
        let mut config = config();
        config.controller.grace_period_secs = 30;
        let c = cluster(&["node-a"]).await;
        let controller = Controller::new(c.store.clone(), &config);
        let w = c.submit("w", "1g.5gb").await;
        c.drive(&w.key()).await;

        let mut running = c.store.get_workload(&w.key()).await.unwrap();
        running.phase = WorkloadPhase::Running;
        c.store.update_workload(running).await.unwrap();
        c.store.delete_workload(&w.key()).await.unwrap();

        match controller.reconcile_workload(&w.key()).await {
            Action::RequeueAfter(d) => assert!(d <= Duration::from_secs(30) && d > Duration::from_secs(25)),
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(
            c.result(w.uid).await.unwrap().status.controller,
            ControllerState::Ungated
        );
    }

    #[tokio::test]
    async fn test_failed_workload_without_allocation_loses_finalizer() {
        let c = cluster(&[]).await;
        let w = c.submit("w", "1g.5gb").await;

        // No nodes: finalizer added, no capacity
        assert!(matches!(
            c.controller.reconcile_workload(&w.key()).await,
            Action::RequeueAfter(_)
        ));
        let mut failed = c.store.get_workload(&w.key()).await.unwrap();
        assert!(failed.has_finalizer(&c.labels.finalizer_name));
        failed.phase = WorkloadPhase::Failed;
        c.store.update_workload(failed).await.unwrap();

        assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Done);
        let w = c.store.get_workload(&w.key()).await.unwrap();
        assert!(!w.has_finalizer(&c.labels.finalizer_name));
    }

    #[tokio::test]
    async fn test_failed_workload_waits_for_agent_before_deleting() {
        let c = cluster(&["node-a"]).await;
        let w = c.submit("w", "1g.5gb").await;
        c.controller.reconcile_workload(&w.key()).await;

        let mut failed = c.store.get_workload(&w.key()).await.unwrap();
        failed.phase = WorkloadPhase::Failed;
        c.store.update_workload(failed).await.unwrap();

        assert_eq!(
            c.controller.reconcile_workload(&w.key()).await,
            Action::RequeueAfter(Duration::from_secs(2))
        );
        assert_eq!(
            c.result(w.uid).await.unwrap().status.controller,
            ControllerState::Creating
        );

        assert_eq!(c.drive(&w.key()).await, Action::Done);
        assert!(c.result(w.uid).await.is_none());
        let w = c.store.get_workload(&w.key()).await.unwrap();
        assert!(!w.has_finalizer(&c.labels.finalizer_name));
    }

    #[tokio::test]
    async fn test_deleted_while_gated_skips_grace() {
        let c = cluster(&["node-a"]).await;
        let w = c.submit("w", "1g.5gb").await;
        c.controller.reconcile_workload(&w.key()).await;
        c.sync_agents().await;

        c.store.delete_workload(&w.key()).await.unwrap();
        assert!(matches!(
            c.controller.reconcile_workload(&w.key()).await,
            Action::RequeueAfter(_)
        ));
        assert_eq!(
            c.result(w.uid).await.unwrap().status.controller,
            ControllerState::Deleting
        );

        assert_eq!(c.drive(&w.key()).await, Action::Done);
        assert!(c.store.get_workload(&w.key()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_exactly_k_of_n_requests_succeed() {
        let c = cluster(&["node-a"]).await;
        // 3g.20gb offers two disjoint windows per GPU
        let mut workloads = Vec::new();
        for i in 0..4 {
            workloads.push(c.submit(&format!("w-{}", i), "3g.20gb").await);
        }

        let mut placed = Vec::new();
        let mut refused = 0;
        for w in &workloads {
            match c.controller.reconcile_workload(&w.key()).await {
                Action::Done => placed.push(c.result(w.uid).await.unwrap().placement),
                Action::RequeueAfter(d) => {
                    assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(10));
                    assert!(c.result(w.uid).await.is_none());
                    refused += 1;
                }
                other => panic!("unexpected action {:?}", other),
            }
        }

        assert_eq!(placed.len(), 2);
        assert_eq!(refused, 2);
        let distinct: HashSet<Placement> = placed.into_iter().collect();
        assert_eq!(distinct.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_for_single_window() {
        let config = config();
        let store = Arc::new(MemoryStore::new());
        let labels = config.labels.clone();
        store.put_node(managed_node("node-a", &labels)).await;

        // One GPU offering a single free 1g.5gb window at (0,1)
        let mut ledger = a100_ledger("node-a", 1);
        let profile: Profile = "1g.5gb".parse().unwrap();
        if let Some(p) = ledger.resources.profiles.get_mut(&profile) {
            p.placements = vec![Placement::new(0, 1)];
        }
        store.create_ledger(ledger).await.unwrap();

        let controller = Arc::new(Controller::new(store.clone(), &config));
        let a = store.create_workload(gated_workload("a", "1g.5gb", &labels)).await.unwrap();
        let b = store.create_workload(gated_workload("b", "1g.5gb", &labels)).await.unwrap();

        // The listing never shows the first commit
        store.freeze_ledger_list().await;

        let (ka, kb) = (a.key(), b.key());
        let (ra, rb) = tokio::join!(
            controller.reconcile_workload(&ka),
            controller.reconcile_workload(&kb)
        );
        store.thaw_ledger_list().await;

        let ledger = store.get_ledger("node-a").await.unwrap();
        assert_eq!(ledger.results.len(), 1);
        let winner = ledger.results.values().next().unwrap();
        assert_eq!(winner.placement, Placement::new(0, 1));
        assert_eq!(winner.status.controller, ControllerState::Creating);

        let mut actions = vec![ra, rb];
        actions.sort_by_key(|a| matches!(a, Action::Done));
        assert!(matches!(actions[0], Action::RequeueAfter(_)));
        assert_eq!(actions[1], Action::Done);
    }

    #[tokio::test]
    async fn test_cache_blocks_double_booking_under_stale_listing() {
        let c = cluster(&["node-a"]).await;
        c.store.freeze_ledger_list().await;

        let a = c.submit("a", "7g.40gb").await;
        let b = c.submit("b", "7g.40gb").await;
        assert_eq!(c.controller.reconcile_workload(&a.key()).await, Action::Done);
        // The frozen listing still shows the GPU empty
        assert!(matches!(
            c.controller.reconcile_workload(&b.key()).await,
            Action::RequeueAfter(_)
        ));
        c.store.thaw_ledger_list().await;

        assert_eq!(c.result_count(a.uid).await, 1);
        assert_eq!(c.result_count(b.uid).await, 0);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let c = cluster(&["node-a"]).await;
        let w = c.submit("w", "1g.5gb").await;
        c.store.inject_ledger_conflicts(2);

        assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Done);
        assert_eq!(c.result_count(w.uid).await, 1);
    }

    #[tokio::test]
    async fn test_stale_boot_id_rejects_placement_until_republished() {
        let c = cluster(&["node-a"]).await;

        // Node rebooted; the agent has not republished yet
        let fresh = c.backends[0].reboot().await;
        let mut node = c.store.get_node("node-a").await.unwrap();
        node.boot_id = fresh;
        c.store.put_node(node).await;

        let w = c.submit("w", "1g.5gb").await;
        assert_eq!(
            c.controller.reconcile_workload(&w.key()).await,
            Action::RequeueAfter(Duration::from_secs(10))
        );
        assert!(c.result(w.uid).await.is_none());

        c.sync_agents().await;
        assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Done);
        assert!(c.result(w.uid).await.is_some());
    }

    #[tokio::test]
    async fn test_reboot_loses_partition_and_gated_workload_is_replaced() {
        let c = cluster(&["node-a"]).await;
        let w = c.submit("w", "1g.5gb").await;
        c.controller.reconcile_workload(&w.key()).await;
        c.sync_agents().await;

        let fresh = c.backends[0].reboot().await;
        let mut node = c.store.get_node("node-a").await.unwrap();
        node.boot_id = fresh;
        c.store.put_node(node).await;
        c.sync_agents().await;
        assert_eq!(c.result(w.uid).await.unwrap().status.agent, AgentState::Deleted);

        // Record discarded, then placed again on the republished node
        assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Requeue);
        assert!(c.result(w.uid).await.is_none());
        assert_eq!(c.drive(&w.key()).await, Action::Done);
        let r = c.result(w.uid).await.unwrap();
        assert_eq!(r.status.controller, ControllerState::Ungated);
        assert_eq!(r.status.agent, AgentState::Created);
    }

    #[tokio::test]
    async fn test_unpublished_ledger_requeues() {
        let config = config();
        let store = Arc::new(MemoryStore::new());
        store.put_node(managed_node("node-a", &config.labels)).await;
        let mut ledger = a100_ledger("node-a", 1);
        ledger.resources.boot_id.clear();
        store.create_ledger(ledger).await.unwrap();

        let controller = Controller::new(store.clone(), &config);
        let w = store
            .create_workload(gated_workload("w", "1g.5gb", &config.labels))
            .await
            .unwrap();
        assert_eq!(
            controller.reconcile_workload(&w.key()).await,
            Action::RequeueAfter(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn test_malformed_workload_is_not_retried() {
        let c = cluster(&["node-a"]).await;
        let mut w = gated_workload("w", "1g.5gb", &c.labels);
        let second = w.containers[0].clone();
        w.containers.push(second);
        let w = c.store.create_workload(w).await.unwrap();

        assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Done);
        assert!(c.result(w.uid).await.is_none());
    }

    #[tokio::test]
    async fn test_workloads_gated_by_others_are_ignored() {
        let c = cluster(&["node-a"]).await;
        let mut w = gated_workload("w", "1g.5gb", &c.labels);
        w.scheduling_gates.push("example.com/quota".to_string());
        let w = c.store.create_workload(w).await.unwrap();

        assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Done);
        let w = c.store.get_workload(&w.key()).await.unwrap();
        assert!(w.finalizers.is_empty());
        assert!(c.result(w.uid).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_workload_is_done() {
        let c = cluster(&["node-a"]).await;
        assert_eq!(
            c.controller
                .reconcile_workload(&WorkloadKey::new("default", "ghost"))
                .await,
            Action::Done
        );
    }

    #[tokio::test]
    async fn test_inconsistent_record_is_repaired() {
        let c = cluster(&["node-a"]).await;
        let w = c.submit("w", "2g.10gb").await;
        c.controller.reconcile_workload(&w.key()).await;

        // Lose the request half
        let mut ledger = c.store.get_ledger("node-a").await.unwrap();
        ledger.requests.remove(&w.uid);
        c.store.update_ledger(ledger).await.unwrap();

        assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Requeue);
        let ledger = c.store.get_ledger("node-a").await.unwrap();
        assert_eq!(ledger.requests[&w.uid].profile.to_string(), "2g.10gb");
    }

    #[tokio::test]
    async fn test_node_not_ready_rebuilds_cache() {
        let c = cluster(&["node-a", "node-b"]).await;
        let a = c.submit("a", "1g.5gb").await;
        let b = c.submit("b", "4g.20gb").await;
        c.controller.reconcile_workload(&a.key()).await;
        c.controller.reconcile_workload(&b.key()).await;

        // Drop an allocation behind the controller's back
        let mut ledger = c.store.get_ledger("node-a").await.unwrap();
        ledger.remove_allocation(&a.uid);
        c.store.update_ledger(ledger).await.unwrap();
        assert_eq!(c.controller.cache().len().await, 2);

        let mut node = c.store.get_node("node-b").await.unwrap();
        node.ready = false;
        c.store.put_node(node).await;
        assert_eq!(c.controller.reconcile_node("node-b").await, Action::Done);

        let expected: std::collections::HashMap<_, _> = c
            .store
            .list_ledgers()
            .await
            .unwrap()
            .into_iter()
            .flat_map(|l| l.results)
            .collect();
        assert_eq!(c.controller.cache().snapshot().await, expected);
        assert_eq!(expected.len(), 1);
    }

    #[tokio::test]
    async fn test_unmanaged_node_loses_ledger() {
        let c = cluster(&["node-a"]).await;
        let mut node = c.store.get_node("node-a").await.unwrap();
        node.labels.clear();
        c.store.put_node(node).await;

        assert_eq!(c.controller.reconcile_node("node-a").await, Action::Done);
        assert!(c.store.get_ledger("node-a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_placement_sweeps_orphans() {
        let c = cluster(&["node-a"]).await;
        let gone = c.submit("gone", "1g.5gb").await;
        c.controller.reconcile_workload(&gone.key()).await;
        // Removed without the controller seeing it
        let mut w = c.store.get_workload(&gone.key()).await.unwrap();
        w.finalizers.clear();
        c.store.update_workload(w).await.unwrap();
        c.store.delete_workload(&gone.key()).await.unwrap();

        let next = c.submit("next", "1g.5gb").await;
        assert_eq!(c.controller.reconcile_workload(&next.key()).await, Action::Done);
        assert!(c.result(gone.uid).await.is_none());
        assert!(c.result(next.uid).await.is_some());
    }

    #[tokio::test]
    async fn test_window_lost_on_reboot_is_placed_again() {
        let c = cluster(&["node-a"]).await;
        let w = c.submit("w", "7g.40gb").await;
        assert_eq!(c.drive(&w.key()).await, Action::Done);

        let fresh = c.backends[0].reboot().await;
        let mut node = c.store.get_node("node-a").await.unwrap();
        node.boot_id = fresh;
        c.store.put_node(node).await;
        c.sync_agents().await;

        // The running workload keeps its lost record; its window is free
        let lost = c.result(w.uid).await.unwrap();
        assert_eq!(lost.status.controller, ControllerState::Ungated);
        assert_eq!(lost.status.agent, AgentState::Deleted);
        assert_eq!(c.controller.reconcile_workload(&w.key()).await, Action::Done);

        let n = c.submit("n", "7g.40gb").await;
        assert_eq!(c.controller.reconcile_workload(&n.key()).await, Action::Done);
        assert_eq!(c.result(n.uid).await.unwrap().placement, Placement::new(0, 8));
        assert_eq!(c.drive(&n.key()).await, Action::Done);
        assert_eq!(c.result(n.uid).await.unwrap().status.agent, AgentState::Created);
    }

    #[tokio::test]
    async fn test_swept_partition_does_not_block_overlapping_window() {
        let c = cluster(&["node-a"]).await;
        let w1 = c.submit("w1", "1g.5gb").await;
        c.controller.reconcile_workload(&w1.key()).await;
        c.sync_agents().await;
        assert_eq!(c.result(w1.uid).await.unwrap().status.agent, AgentState::Created);

        // Removed without the controller tearing anything down
        let mut gone = c.store.get_workload(&w1.key()).await.unwrap();
        gone.finalizers.clear();
        c.store.update_workload(gone).await.unwrap();
        c.store.delete_workload(&w1.key()).await.unwrap();
        assert!(c.controller.sweep_orphans().await.unwrap().removed_any());
        assert!(c.result(w1.uid).await.is_none());

        c.sync_agents().await;
        assert!(c.backends[0].partitions().await.unwrap().is_empty());

        let w3 = c.submit("w3", "2g.10gb").await;
        assert_eq!(c.drive(&w3.key()).await, Action::Done);
        let r = c.result(w3.uid).await.unwrap();
        assert_eq!(r.placement, Placement::new(0, 2));
        assert_eq!(r.status.controller, ControllerState::Ungated);
        assert_eq!(r.status.agent, AgentState::Created);
    }
}
