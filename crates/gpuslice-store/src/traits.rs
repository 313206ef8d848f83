//! Object store trait definitions

use async_trait::async_trait;
use gpuslice_core::{NodeLedger, Node, SliceBinding, SliceResult, Workload, WorkloadKey};
use tokio::sync::broadcast;

/// Change notification emitted after every successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A workload was created, updated or removed
    Workload(WorkloadKey),
    /// A per-node shared object was created, updated or removed
    Ledger(String),
    /// A node was created, updated or removed
    Node(String),
}

/// Access to the cluster objects shared by the controller and node agents.
///
/// Updates carry the `resource_version` they were read at; a write based on a
/// stale read fails with `SliceError::WriteConflict` and must be retried from a
/// fresh read, never merged.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// List every per-node shared object
    async fn list_ledgers(&self) -> SliceResult<Vec<NodeLedger>>;

    /// Get the shared object for a node
    async fn get_ledger(&self, name: &str) -> SliceResult<NodeLedger>;

    /// Create the shared object for a node
    async fn create_ledger(&self, ledger: NodeLedger) -> SliceResult<NodeLedger>;

    /// Conditionally replace a shared object
    async fn update_ledger(&self, ledger: NodeLedger) -> SliceResult<NodeLedger>;

    /// Delete a shared object
    async fn delete_ledger(&self, name: &str) -> SliceResult<()>;

    /// Get a workload
    async fn get_workload(&self, key: &WorkloadKey) -> SliceResult<Workload>;

    /// List every workload
    async fn list_workloads(&self) -> SliceResult<Vec<Workload>>;

    /// Conditionally replace a workload
    async fn update_workload(&self, workload: Workload) -> SliceResult<Workload>;

    /// Get a node
    async fn get_node(&self, name: &str) -> SliceResult<Node>;

    /// List every node
    async fn list_nodes(&self) -> SliceResult<Vec<Node>>;

    /// Create or replace the auxiliary binding of a workload
    async fn apply_binding(&self, binding: SliceBinding) -> SliceResult<()>;

    /// Delete the auxiliary binding of a workload. Returns whether one existed.
    async fn delete_binding(&self, key: &WorkloadKey) -> SliceResult<bool>;

    /// Subscribe to change notifications
    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}
