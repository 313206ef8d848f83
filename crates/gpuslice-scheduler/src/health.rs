//! Node readiness tracking, boot-id fencing and node lifecycle

use gpuslice_core::{LabelConfig, Node, NodeLedger, SliceError, SliceResult};
use gpuslice_store::ClusterStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Value of the managed label on nodes this system operates on
const MANAGED_VALUE: &str = "true";

/// What a node event meant for the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTransition {
    /// Nothing relevant changed
    Unchanged,
    /// The node flipped to not-ready; the allocation cache must be rebuilt
    BecameNotReady,
    /// The node is gone; its shared object was deleted if present
    Removed,
    /// The node is no longer managed; its shared object was deleted if present
    Unmanaged,
}

/// Ledgers split by whether their node can be trusted
#[derive(Debug, Default)]
pub struct TrustedLedgers {
    /// Ledgers whose boot id matches the live node
    pub trusted: Vec<NodeLedger>,
    /// Ledgers excluded from decisions, with the reason
    pub fenced: Vec<SliceError>,
}

impl TrustedLedgers {
    /// The error to report when nothing trusted could serve a request.
    ///
    /// Stale boot ids win over unpublished ledgers.
    pub fn into_fencing_error(mut self) -> Option<SliceError> {
        if self.fenced.is_empty() {
            return None;
        }
        let index = self
            .fenced
            .iter()
            .position(|e| matches!(e, SliceError::StaleBootId { .. }))
            .unwrap_or(0);
        Some(self.fenced.swap_remove(index))
    }
}

/// Node health monitor
pub struct NodeHealthMonitor {
    store: Arc<dyn ClusterStore>,
    labels: LabelConfig,
    /// Last observed readiness per node
    readiness: RwLock<HashMap<String, bool>>,
}

impl NodeHealthMonitor {
    /// Create a new monitor
    pub fn new(store: Arc<dyn ClusterStore>, labels: LabelConfig) -> Self {
        Self {
            store,
            labels,
            readiness: RwLock::new(HashMap::new()),
        }
    }

    /// Whether this system operates on the node
    pub fn is_managed(&self, node: &Node) -> bool {
        node.labels.get(&self.labels.managed_label).map(String::as_str) == Some(MANAGED_VALUE)
    }

    /// Check a ledger against its live node before trusting it
    pub fn check(ledger: &NodeLedger, node: Option<&Node>) -> SliceResult<()> {
        if !ledger.resources.is_published() {
            return Err(SliceError::NotPublished(ledger.name.clone()));
        }
        let live = node.map(|n| n.boot_id.as_str()).unwrap_or_default();
        if ledger.resources.boot_id != live {
            return Err(SliceError::StaleBootId {
                node: ledger.name.clone(),
                recorded: ledger.resources.boot_id.clone(),
                live: live.to_string(),
            });
        }
        Ok(())
    }

    /// Check one ledger against a fresh read of its node
    pub async fn verify(&self, ledger: &NodeLedger) -> SliceResult<()> {
        let node = match self.store.get_node(&ledger.name).await {
            Ok(node) => Some(node),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        Self::check(ledger, node.as_ref())
    }

    /// Split ledgers into trusted and fenced using one node listing
    pub async fn partition(&self, ledgers: Vec<NodeLedger>) -> SliceResult<TrustedLedgers> {
        let nodes: HashMap<String, Node> = self
            .store
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect();

        let mut split = TrustedLedgers::default();
        for ledger in ledgers {
            match Self::check(&ledger, nodes.get(&ledger.name)) {
                Ok(()) => split.trusted.push(ledger),
                Err(e) => {
                    warn!(node = %ledger.name, reason = %e, "Ledger fenced");
                    split.fenced.push(e);
                }
            }
        }
        Ok(split)
    }

    /// Handle a node event
    pub async fn observe(&self, name: &str) -> SliceResult<NodeTransition> {
        let node = match self.store.get_node(name).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                self.readiness.write().await.remove(name);
                self.delete_ledger(name).await?;
                info!(node = %name, "Node removed");
                return Ok(NodeTransition::Removed);
            }
            Err(e) => return Err(e),
        };

        if !self.is_managed(&node) {
            self.readiness.write().await.remove(name);
            self.delete_ledger(name).await?;
            info!(node = %name, "Node not managed");
            return Ok(NodeTransition::Unmanaged);
        }

        let previous = self
            .readiness
            .write()
            .await
            .insert(name.to_string(), node.ready);

        if !node.ready && previous != Some(false) {
            warn!(node = %name, "Node became not ready");
            return Ok(NodeTransition::BecameNotReady);
        }
        Ok(NodeTransition::Unchanged)
    }

    async fn delete_ledger(&self, name: &str) -> SliceResult<()> {
        match self.store.delete_ledger(name).await {
            Ok(()) => {
                info!(node = %name, "Deleted shared object for node");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
