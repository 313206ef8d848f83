//! Event-driven worker loop around the controller

use gpuslice_core::{AgentState, NodeLedger, SliceResult, WorkloadKey};
use gpuslice_store::{ClusterEvent, ClusterStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{Action, Controller};
use crate::queue::WorkQueue;

/// Delay applied to plain requeues
const REQUEUE_DELAY: Duration = Duration::from_millis(100);

/// Feeds store events to a pool of reconcile workers
pub struct ControllerManager {
    store: Arc<dyn ClusterStore>,
    controller: Arc<Controller>,
    workloads: Arc<WorkQueue<WorkloadKey>>,
    nodes: Arc<WorkQueue<String>>,
    workers: usize,
}

impl ControllerManager {
    /// Create a manager running `workers` workload workers
    pub fn new(store: Arc<dyn ClusterStore>, controller: Arc<Controller>, workers: usize) -> Self {
        Self {
            store,
            controller,
            workloads: Arc::new(WorkQueue::new()),
            nodes: Arc::new(WorkQueue::new()),
            workers: workers.max(1),
        }
    }

    /// Run until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> SliceResult<()> {
        // Subscribe before the initial listing so nothing falls in between
        let mut events = self.store.subscribe();

        self.controller.rebuild_cache().await?;
        self.resync().await?;

        let mut tasks = JoinSet::new();
        for id in 0..self.workers {
            tasks.spawn(workload_worker(
                id,
                self.controller.clone(),
                self.workloads.clone(),
            ));
        }
        tasks.spawn(node_worker(self.controller.clone(), self.nodes.clone()));
        info!(workers = self.workers, "Controller manager started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.dispatch(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event stream lagged, resyncing");
                        if let Err(e) = self.resync().await {
                            warn!(error = %e, "Resync failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.workloads.shutdown();
        self.nodes.shutdown();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Worker task failed");
            }
        }
        info!("Controller manager stopped");
        Ok(())
    }

    /// Enqueue every tracked workload and every node
    async fn resync(&self) -> SliceResult<()> {
        let mutated = &self.controller.labels().mutated_label;
        for workload in self.store.list_workloads().await? {
            if workload.labels.contains_key(mutated) {
                self.workloads.add(workload.key()).await;
            }
        }
        for node in self.store.list_nodes().await? {
            self.nodes.add(node.name).await;
        }
        Ok(())
    }

    async fn dispatch(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::Workload(key) => match self.store.get_workload(&key).await {
                Ok(workload) if !workload.labels.contains_key(&self.controller.labels().mutated_label) => {}
                // A vanished workload may still own a record
                Ok(_) | Err(_) => self.workloads.add(key).await,
            },
            ClusterEvent::Ledger(name) => match self.store.get_ledger(&name).await {
                Ok(ledger) => {
                    for key in workloads_for_ledger(&ledger) {
                        self.workloads.add(key).await;
                    }
                }
                Err(e) if e.is_not_found() => {
                    debug!(node = %name, "Ledger deleted, requeuing tracked workloads");
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "Resync failed");
                    }
                }
                Err(e) => warn!(node = %name, error = %e, "Failed to read ledger"),
            },
            ClusterEvent::Node(name) => self.nodes.add(name).await,
        }
    }
}

/// Workloads whose record an agent has just acted on
pub fn workloads_for_ledger(ledger: &NodeLedger) -> Vec<WorkloadKey> {
    ledger
        .results
        .iter()
        .filter(|(_, r)| matches!(r.status.agent, AgentState::Created | AgentState::Deleted))
        .filter_map(|(uid, _)| ledger.requests.get(uid))
        .map(|req| req.workload.key())
        .collect()
}

async fn workload_worker(id: usize, controller: Arc<Controller>, queue: Arc<WorkQueue<WorkloadKey>>) {
    debug!(worker = id, "Workload worker started");
    while let Some(key) = queue.next().await {
        let action = controller.reconcile_workload(&key).await;
        queue.done(&key).await;
        requeue(&queue, key, action);
    }
    debug!(worker = id, "Workload worker stopped");
}

async fn node_worker(controller: Arc<Controller>, queue: Arc<WorkQueue<String>>) {
    while let Some(name) = queue.next().await {
        let action = controller.reconcile_node(&name).await;
        queue.done(&name).await;
        requeue(&queue, name, action);
    }
}

fn requeue<K>(queue: &Arc<WorkQueue<K>>, key: K, action: Action)
where
    K: Clone + Eq + std::hash::Hash + Send + Sync + 'static,
{
    match action {
        Action::Done => {}
        Action::Requeue => queue.add_after(key, REQUEUE_DELAY),
        Action::RequeueAfter(delay) => queue.add_after(key, delay),
    }
}
