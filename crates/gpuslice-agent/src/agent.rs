//! Node agent: the node-side writer of the shared per-node object
//!
//! The agent owns `status.agent` on every result of its node and the published
//! capacity. It never touches the controller's half of the status or the
//! request map.

use gpuslice_core::{
    AgentState, AllocationResult, ControllerState, NodeLedger, Placement, SliceBinding,
    SliceError, SliceResult, WorkloadUid,
};
use gpuslice_store::{mutate_ledger, ClusterEvent, ClusterStore, RetryPolicy};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::traits::{PartitionBackend, PartitionSpec};

/// Condition kind the agent maintains on results
const PARTITION_CONDITION: &str = "PartitionReady";

/// What one sync pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Capacity was (re)published
    pub republished: bool,
    /// Results acknowledged as created
    pub created: Vec<WorkloadUid>,
    /// Results acknowledged as deleted after teardown
    pub deleted: Vec<WorkloadUid>,
    /// Results marked deleted because a reboot lost their partition
    pub lost: Vec<WorkloadUid>,
    /// Partitions destroyed because no live result holds their window
    pub reclaimed: Vec<(String, Placement)>,
}

impl SyncReport {
    /// Whether the pass changed anything
    pub fn is_empty(&self) -> bool {
        !self.republished
            && self.created.is_empty()
            && self.deleted.is_empty()
            && self.lost.is_empty()
            && self.reclaimed.is_empty()
    }
}

/// Partition agent for one node
pub struct NodeAgent {
    node_name: String,
    store: Arc<dyn ClusterStore>,
    backend: Arc<dyn PartitionBackend>,
    retry: RetryPolicy,
}

impl NodeAgent {
    /// Create a new agent
    pub fn new(
        node_name: impl Into<String>,
        store: Arc<dyn ClusterStore>,
        backend: Arc<dyn PartitionBackend>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            backend,
            retry,
        }
    }

    /// Node this agent serves
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Publish discovered capacity.
    ///
    /// A changed boot id means every partition was lost with the reboot: each
    /// result still holding a window is acknowledged as deleted and its binding
    /// removed. Returns the ledger as written, whether anything was published
    /// and the results marked lost.
    pub async fn publish(&self) -> SliceResult<(NodeLedger, bool, Vec<WorkloadUid>)> {
        let resources = self.backend.discover().await?;

        match self.store.get_ledger(&self.node_name).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                let ledger = self
                    .store
                    .create_ledger(NodeLedger::new(self.node_name.clone(), resources))
                    .await?;
                info!(
                    node = %self.node_name,
                    boot_id = %ledger.resources.boot_id,
                    gpus = ledger.resources.gpus.len(),
                    backend = self.backend.name(),
                    "Node capacity published"
                );
                return Ok((ledger, true, Vec::new()));
            }
            Err(e) => return Err(e),
        }

        let mut republished = false;
        let mut lost = Vec::new();
        let ledger = mutate_ledger(self.store.as_ref(), &self.retry, &self.node_name, |ledger| {
            republished = false;
            lost.clear();
            if ledger.resources == resources {
                return Ok(false);
            }
            if ledger.resources.boot_id != resources.boot_id {
                for (uid, result) in ledger.results.iter_mut() {
                    if result.status.advance_agent(AgentState::Deleted)? {
                        result.set_condition(PARTITION_CONDITION, false, "NodeRebooted", "partition lost on reboot");
                        lost.push(*uid);
                    }
                }
            }
            ledger.resources = resources.clone();
            republished = true;
            Ok(true)
        })
        .await?;

        if republished {
            info!(
                node = %self.node_name,
                boot_id = %ledger.resources.boot_id,
                lost = lost.len(),
                "Node capacity republished"
            );
        }
        for uid in &lost {
            if let Some(request) = ledger.requests.get(uid) {
                self.store.delete_binding(&request.workload.key()).await?;
            }
        }
        Ok((ledger, republished, lost))
    }

    /// One pass over the node's results
    pub async fn sync(&self) -> SliceResult<SyncReport> {
        let (ledger, republished, lost) = self.publish().await?;
        let mut report = SyncReport {
            republished,
            lost,
            ..Default::default()
        };

        for (uid, result) in &ledger.results {
            let status = result.status;
            let outcome = match (status.controller, status.agent) {
                (ControllerState::Creating, AgentState::Pending) => {
                    self.realize(&ledger, *uid, result).await.map(|done| {
                        if done {
                            report.created.push(*uid);
                        }
                    })
                }
                (ControllerState::Deleting, AgentState::Pending | AgentState::Created) => {
                    self.teardown(&ledger, *uid, result).await.map(|done| {
                        if done {
                            report.deleted.push(*uid);
                        }
                    })
                }
                _ => Ok(()),
            };

            if let Err(e) = outcome {
                warn!(node = %self.node_name, uid = %uid, error = %e, "Failed to process allocation");
            }
        }

        match self.reclaim().await {
            Ok(reclaimed) => report.reclaimed = reclaimed,
            Err(e) => warn!(node = %self.node_name, error = %e, "Failed to reclaim dangling partitions"),
        }

        Ok(report)
    }

    /// Run sync passes on every change to this node's object and on a timer
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut events = self.store.subscribe();
        let mut ticker = tokio::time::interval(interval);
        info!(node = %self.node_name, backend = self.backend.name(), "Node agent started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                event = events.recv() => match event {
                    Ok(ClusterEvent::Ledger(name)) if name == self.node_name => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(node = %self.node_name, skipped, "Agent event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }

            match self.sync().await {
                Ok(report) if !report.is_empty() => {
                    debug!(node = %self.node_name, report = ?report, "Agent sync pass");
                }
                Ok(_) => {}
                Err(e) => warn!(node = %self.node_name, error = %e, "Agent sync failed"),
            }
        }

        info!(node = %self.node_name, "Node agent stopped");
    }

    async fn realize(&self, ledger: &NodeLedger, uid: WorkloadUid, result: &AllocationResult) -> SliceResult<bool> {
        let Some(request) = ledger.requests.get(&uid) else {
            debug!(node = %self.node_name, uid = %uid, "Result without request, skipping");
            return Ok(false);
        };
        let ids = ledger.resources.profile(&request.profile).ok_or_else(|| {
            SliceError::MalformedWorkload(format!(
                "profile {} not offered by node {}",
                request.profile, self.node_name
            ))
        })?;

        let spec = PartitionSpec {
            gpu_uuid: result.gpu_uuid.clone(),
            placement: result.placement,
            gi_profile_id: ids.gi_profile_id,
            ci_profile_id: ids.ci_profile_id,
            ci_eng_profile_id: ids.ci_eng_profile_id,
        };
        let partition_id = self.backend.create_partition(&spec).await?;

        self.store
            .apply_binding(SliceBinding {
                key: request.workload.key(),
                workload_uid: uid,
                resource_identifier: result.resource_identifier,
                node_name: self.node_name.clone(),
                gpu_uuid: result.gpu_uuid.clone(),
                partition_id: partition_id.clone(),
            })
            .await?;

        let message = format!("partition {}", partition_id);
        let acked = self
            .acknowledge(uid, AgentState::Created, true, "Created", &message)
            .await?;
        if acked {
            info!(
                node = %self.node_name,
                workload = %request.workload.key(),
                profile = %request.profile,
                placement = %result.placement,
                partition = %partition_id,
                "Partition realized"
            );
        }
        Ok(acked)
    }

    async fn teardown(&self, ledger: &NodeLedger, uid: WorkloadUid, result: &AllocationResult) -> SliceResult<bool> {
        self.backend
            .destroy_partition(&result.gpu_uuid, result.placement)
            .await?;
        if let Some(request) = ledger.requests.get(&uid) {
            self.store.delete_binding(&request.workload.key()).await?;
        }

        let acked = self
            .acknowledge(uid, AgentState::Deleted, false, "Deleted", "partition destroyed")
            .await?;
        if acked {
            info!(node = %self.node_name, uid = %uid, placement = %result.placement, "Partition torn down");
        }
        Ok(acked)
    }

    /// Destroy partitions whose window no live result on this node holds,
    /// such as those left behind by records the controller removed.
    async fn reclaim(&self) -> SliceResult<Vec<(String, Placement)>> {
        let ledger = self.store.get_ledger(&self.node_name).await?;
        let held: HashSet<(&str, Placement)> = ledger
            .results
            .values()
            .filter(|r| r.status.is_active())
            .map(|r| (r.gpu_uuid.as_str(), r.placement))
            .collect();

        let mut reclaimed = Vec::new();
        for (gpu, placement) in self.backend.partitions().await? {
            if held.contains(&(gpu.as_str(), placement)) {
                continue;
            }
            self.backend.destroy_partition(&gpu, placement).await?;
            info!(node = %self.node_name, gpu = %gpu, placement = %placement, "Dangling partition destroyed");
            reclaimed.push((gpu, placement));
        }
        Ok(reclaimed)
    }

    async fn acknowledge(
        &self,
        uid: WorkloadUid,
        state: AgentState,
        ready: bool,
        reason: &str,
        message: &str,
    ) -> SliceResult<bool> {
        let mut changed = false;
        mutate_ledger(self.store.as_ref(), &self.retry, &self.node_name, |ledger| {
            changed = false;
            let Some(result) = ledger.results.get_mut(&uid) else {
                return Ok(false);
            };
            changed = result.status.advance_agent(state)?;
            if changed {
                result.set_condition(PARTITION_CONDITION, ready, reason, message);
            }
            Ok(changed)
        })
        .await?;
        Ok(changed)
    }
}
