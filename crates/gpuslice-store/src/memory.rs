//! In-memory cluster object store
//!
//! Mirrors the semantics the controller relies on from a real object-store API:
//! monotonically increasing resource versions, conflict detection on stale
//! writes, finalizer-gated deletion of workloads, and change notifications.

use async_trait::async_trait;
use chrono::Utc;
use gpuslice_core::{
    Node, NodeLedger, SliceBinding, SliceError, SliceResult, Workload, WorkloadKey,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::traits::{ClusterEvent, ClusterStore};

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    version: u64,
    ledgers: BTreeMap<String, NodeLedger>,
    workloads: BTreeMap<WorkloadKey, Workload>,
    nodes: BTreeMap<String, Node>,
    bindings: BTreeMap<WorkloadKey, SliceBinding>,
    /// Ledger list served while a lagging view is simulated
    frozen_ledgers: Option<Vec<NodeLedger>>,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// In-memory object store
pub struct MemoryStore {
    state: RwLock<State>,
    events: broadcast::Sender<ClusterEvent>,
    /// Number of upcoming ledger updates to reject with a conflict
    injected_conflicts: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            events,
            injected_conflicts: AtomicU32::new(0),
        }
    }

    fn emit(&self, event: ClusterEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Create a workload
    pub async fn create_workload(&self, mut workload: Workload) -> SliceResult<Workload> {
        let key = workload.key();
        {
            let mut state = self.state.write().await;
            if state.workloads.contains_key(&key) {
                return Err(SliceError::WriteConflict(format!("workload {} exists", key)));
            }
            workload.resource_version = state.next_version();
            state.workloads.insert(key.clone(), workload.clone());
        }
        self.emit(ClusterEvent::Workload(key));
        Ok(workload)
    }

    /// Request deletion of a workload.
    ///
    /// A workload holding finalizers only gets a deletion timestamp; it is
    /// removed once the last finalizer is cleared.
    pub async fn delete_workload(&self, key: &WorkloadKey) -> SliceResult<()> {
        {
            let mut state = self.state.write().await;
            let version = state.next_version();
            let workload = state
                .workloads
                .get_mut(key)
                .ok_or_else(|| SliceError::NotFound(format!("workload {}", key)))?;

            if workload.finalizers.is_empty() {
                state.workloads.remove(key);
                debug!(workload = %key, "Workload removed");
            } else if workload.deletion_timestamp.is_none() {
                workload.deletion_timestamp = Some(Utc::now());
                workload.resource_version = version;
                debug!(workload = %key, "Workload marked for deletion");
            }
        }
        self.emit(ClusterEvent::Workload(key.clone()));
        Ok(())
    }

    /// Create or replace a node
    pub async fn put_node(&self, mut node: Node) -> Node {
        let name = node.name.clone();
        {
            let mut state = self.state.write().await;
            node.resource_version = state.next_version();
            state.nodes.insert(name.clone(), node.clone());
        }
        self.emit(ClusterEvent::Node(name));
        node
    }

    /// Remove a node
    pub async fn remove_node(&self, name: &str) -> SliceResult<()> {
        {
            let mut state = self.state.write().await;
            state
                .nodes
                .remove(name)
                .ok_or_else(|| SliceError::NotFound(format!("node {}", name)))?;
        }
        self.emit(ClusterEvent::Node(name.to_string()));
        Ok(())
    }

    /// Get the auxiliary binding of a workload
    pub async fn get_binding(&self, key: &WorkloadKey) -> Option<SliceBinding> {
        self.state.read().await.bindings.get(key).cloned()
    }

    /// Reject the next `count` ledger updates with a write conflict
    pub fn inject_ledger_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Serve the current ledger list to every `list_ledgers` call until thawed,
    /// simulating a lagging read path. Point reads stay authoritative.
    pub async fn freeze_ledger_list(&self) {
        let mut state = self.state.write().await;
        let snapshot = state.ledgers.values().cloned().collect();
        state.frozen_ledgers = Some(snapshot);
    }

    /// Stop serving the frozen ledger list
    pub async fn thaw_ledger_list(&self) {
        self.state.write().await.frozen_ledgers = None;
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn list_ledgers(&self) -> SliceResult<Vec<NodeLedger>> {
        let state = self.state.read().await;
        if let Some(frozen) = &state.frozen_ledgers {
            return Ok(frozen.clone());
        }
        Ok(state.ledgers.values().cloned().collect())
    }

    async fn get_ledger(&self, name: &str) -> SliceResult<NodeLedger> {
        self.state
            .read()
            .await
            .ledgers
            .get(name)
            .cloned()
            .ok_or_else(|| SliceError::NotFound(format!("ledger {}", name)))
    }

    async fn create_ledger(&self, mut ledger: NodeLedger) -> SliceResult<NodeLedger> {
        let name = ledger.name.clone();
        {
            let mut state = self.state.write().await;
            if state.ledgers.contains_key(&name) {
                return Err(SliceError::WriteConflict(format!("ledger {} exists", name)));
            }
            ledger.resource_version = state.next_version();
            state.ledgers.insert(name.clone(), ledger.clone());
        }
        self.emit(ClusterEvent::Ledger(name));
        Ok(ledger)
    }

    async fn update_ledger(&self, mut ledger: NodeLedger) -> SliceResult<NodeLedger> {
        let name = ledger.name.clone();
        if self.take_injected_conflict() {
            return Err(SliceError::WriteConflict(format!("ledger {} (injected)", name)));
        }
        {
            let mut state = self.state.write().await;
            let current = state
                .ledgers
                .get(&name)
                .ok_or_else(|| SliceError::NotFound(format!("ledger {}", name)))?;
            if current.resource_version != ledger.resource_version {
                return Err(SliceError::WriteConflict(format!(
                    "ledger {} at version {}, write based on {}",
                    name, current.resource_version, ledger.resource_version
                )));
            }
            ledger.resource_version = state.next_version();
            state.ledgers.insert(name.clone(), ledger.clone());
        }
        self.emit(ClusterEvent::Ledger(name));
        Ok(ledger)
    }

    async fn delete_ledger(&self, name: &str) -> SliceResult<()> {
        {
            let mut state = self.state.write().await;
            state
                .ledgers
                .remove(name)
                .ok_or_else(|| SliceError::NotFound(format!("ledger {}", name)))?;
        }
        self.emit(ClusterEvent::Ledger(name.to_string()));
        Ok(())
    }

    async fn get_workload(&self, key: &WorkloadKey) -> SliceResult<Workload> {
        self.state
            .read()
            .await
            .workloads
            .get(key)
            .cloned()
            .ok_or_else(|| SliceError::NotFound(format!("workload {}", key)))
    }

    async fn list_workloads(&self) -> SliceResult<Vec<Workload>> {
        Ok(self.state.read().await.workloads.values().cloned().collect())
    }

    async fn update_workload(&self, mut workload: Workload) -> SliceResult<Workload> {
        let key = workload.key();
        {
            let mut state = self.state.write().await;
            let current = state
                .workloads
                .get(&key)
                .ok_or_else(|| SliceError::NotFound(format!("workload {}", key)))?;
            if current.resource_version != workload.resource_version {
                return Err(SliceError::WriteConflict(format!(
                    "workload {} at version {}, write based on {}",
                    key, current.resource_version, workload.resource_version
                )));
            }
            // Deletion is requested through delete_workload only
            workload.deletion_timestamp = current.deletion_timestamp;

            if workload.deletion_timestamp.is_some() && workload.finalizers.is_empty() {
                state.workloads.remove(&key);
                debug!(workload = %key, "Workload removed after last finalizer");
            } else {
                workload.resource_version = state.next_version();
                state.workloads.insert(key.clone(), workload.clone());
            }
        }
        self.emit(ClusterEvent::Workload(key));
        Ok(workload)
    }

    async fn get_node(&self, name: &str) -> SliceResult<Node> {
        self.state
            .read()
            .await
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| SliceError::NotFound(format!("node {}", name)))
    }

    async fn list_nodes(&self) -> SliceResult<Vec<Node>> {
        Ok(self.state.read().await.nodes.values().cloned().collect())
    }

    async fn apply_binding(&self, binding: SliceBinding) -> SliceResult<()> {
        let key = binding.key.clone();
        self.state.write().await.bindings.insert(key.clone(), binding);
        debug!(workload = %key, "Binding applied");
        Ok(())
    }

    async fn delete_binding(&self, key: &WorkloadKey) -> SliceResult<bool> {
        let existed = self.state.write().await.bindings.remove(key).is_some();
        if existed {
            debug!(workload = %key, "Binding deleted");
        }
        Ok(existed)
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}
