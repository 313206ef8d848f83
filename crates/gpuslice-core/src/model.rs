//! Shared-object, allocation, workload and node type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{decode_profile, requests_slice, LabelConfig, NodeResources, Placement, Profile};
use crate::{SliceError, SliceResult};

/// Domain prefix of slice resource limits
pub const RESOURCE_DOMAIN: &str = "gpuslice.io/";

/// Condition message the scheduler leaves on a workload held by its gates
pub const GATES_BLOCKED_MESSAGE: &str = "Scheduling is blocked due to non-empty scheduling gates";

/// Identity of a workload across its lifetime
pub type WorkloadUid = Uuid;

/// Namespaced name of a workload object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    /// Create a new workload key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference from an allocation back to its workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
    pub uid: WorkloadUid,
}

impl WorkloadRef {
    /// Namespaced name of the referenced workload
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Controller-owned half of the dual status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ControllerState {
    Creating,
    Ungated,
    Deleting,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Creating => write!(f, "Creating"),
            ControllerState::Ungated => write!(f, "Ungated"),
            ControllerState::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Agent-owned half of the dual status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentState {
    /// Agent has not acted yet
    #[default]
    #[serde(rename = "")]
    Pending,
    Created,
    Deleted,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Pending => write!(f, ""),
            AgentState::Created => write!(f, "Created"),
            AgentState::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Dual status of an allocation.
///
/// Each field has exactly one writer: `controller` is written only by the
/// controller, `agent` only by the node agent. Both only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationStatus {
    pub controller: ControllerState,
    #[serde(default)]
    pub agent: AgentState,
}

impl AllocationStatus {
    /// Status written when a placement is committed
    pub fn creating() -> Self {
        Self {
            controller: ControllerState::Creating,
            agent: AgentState::Pending,
        }
    }

    /// Advance the controller half. Returns whether anything changed.
    pub fn advance_controller(&mut self, next: ControllerState) -> SliceResult<bool> {
        if next < self.controller {
            return Err(SliceError::InvalidTransition(format!(
                "controller state {} -> {}",
                self.controller, next
            )));
        }
        let changed = next != self.controller;
        self.controller = next;
        Ok(changed)
    }

    /// Advance the agent half. Returns whether anything changed.
    pub fn advance_agent(&mut self, next: AgentState) -> SliceResult<bool> {
        if next < self.agent {
            return Err(SliceError::InvalidTransition(format!(
                "agent state {:?} -> {:?}",
                self.agent, next
            )));
        }
        let changed = next != self.agent;
        self.agent = next;
        Ok(changed)
    }

    /// Whether the allocation still holds its placement window
    pub fn is_active(&self) -> bool {
        self.agent != AgentState::Deleted
    }
}

/// Demand side of an allocation, owned by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    pub profile: Profile,
    pub workload: WorkloadRef,
}

/// Condition attached to an allocation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub kind: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition: DateTime<Utc>,
}

/// Supply side of an allocation, mutated by both processes on disjoint fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub placement: Placement,
    pub gpu_uuid: String,
    pub node_name: String,
    pub status: AllocationStatus,
    /// Identifier of the auxiliary per-workload binding
    pub resource_identifier: Uuid,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl AllocationResult {
    /// Create a result in the `Creating` state
    pub fn new(node_name: impl Into<String>, gpu_uuid: impl Into<String>, placement: Placement) -> Self {
        Self {
            placement,
            gpu_uuid: gpu_uuid.into(),
            node_name: node_name.into(),
            status: AllocationStatus::creating(),
            resource_identifier: Uuid::new_v4(),
            conditions: Vec::new(),
        }
    }

    /// Set or replace a condition by kind
    pub fn set_condition(&mut self, kind: &str, status: bool, reason: &str, message: &str) {
        let condition = Condition {
            kind: kind.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition: Utc::now(),
        };
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

/// Per-node shared object: the only channel between controller and node agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLedger {
    /// Node name
    pub name: String,
    /// Optimistic-concurrency version assigned by the store
    #[serde(default)]
    pub resource_version: u64,
    /// Capacity published by the node agent
    pub resources: NodeResources,
    /// Allocation requests keyed by workload identity
    #[serde(default)]
    pub requests: BTreeMap<WorkloadUid, AllocationRequest>,
    /// Allocation results keyed by workload identity
    #[serde(default)]
    pub results: BTreeMap<WorkloadUid, AllocationResult>,
}

impl NodeLedger {
    /// Create a ledger for a node
    pub fn new(name: impl Into<String>, resources: NodeResources) -> Self {
        Self {
            name: name.into(),
            resource_version: 0,
            resources,
            requests: BTreeMap::new(),
            results: BTreeMap::new(),
        }
    }

    /// Windows on a GPU held by active results
    pub fn active_windows<'a>(&'a self, gpu_uuid: &'a str) -> impl Iterator<Item = Placement> + 'a {
        self.results
            .values()
            .filter(move |r| r.gpu_uuid == gpu_uuid && r.status.is_active())
            .map(|r| r.placement)
    }

    /// Whether a window on a GPU intersects no active result
    pub fn is_window_free(&self, gpu_uuid: &str, placement: &Placement) -> bool {
        !self
            .active_windows(gpu_uuid)
            .any(|held| held.overlaps(placement))
    }

    /// Record a committed request/result pair
    pub fn insert_allocation(&mut self, request: AllocationRequest, result: AllocationResult) {
        let uid = request.workload.uid;
        self.requests.insert(uid, request);
        self.results.insert(uid, result);
    }

    /// Remove the request/result pair for a workload. Returns whether anything was removed.
    pub fn remove_allocation(&mut self, uid: &WorkloadUid) -> bool {
        let request = self.requests.remove(uid).is_some();
        let result = self.results.remove(uid).is_some();
        request || result
    }

    /// How many more slices of a profile fit on this node, placed first-fit
    pub fn free_windows(&self, profile: &Profile) -> usize {
        let Some(placements) = self.resources.profile(profile) else {
            return 0;
        };
        let ordered = placements.ordered();

        let mut count = 0;
        for gpu in &self.resources.gpus {
            let mut held: Vec<Placement> = self.active_windows(&gpu.uuid).collect();
            for candidate in &ordered {
                if held.iter().all(|h| !h.overlaps(candidate)) {
                    held.push(*candidate);
                    count += 1;
                }
            }
        }
        count
    }
}

/// Workload lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Condition reported on a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadCondition {
    pub kind: String,
    pub status: bool,
    pub message: String,
}

/// A container and its resource limits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Workload object as seen by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub uid: WorkloadUid,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub scheduling_gates: Vec<String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub phase: WorkloadPhase,
    #[serde(default)]
    pub conditions: Vec<WorkloadCondition>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl Workload {
    /// Create a pending workload with a fresh identity
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: Uuid::new_v4(),
            namespace: namespace.into(),
            name: name.into(),
            resource_version: 0,
            labels: BTreeMap::new(),
            scheduling_gates: Vec::new(),
            finalizers: Vec::new(),
            node_selector: BTreeMap::new(),
            containers: Vec::new(),
            phase: WorkloadPhase::Pending,
            conditions: Vec::new(),
            deletion_timestamp: None,
        }
    }

    /// A workload as admission leaves it: marked, gated and asking for one
    /// slice of `profile` from a single container
    pub fn admitted(
        namespace: impl Into<String>,
        name: impl Into<String>,
        profile: Profile,
        labels: &LabelConfig,
    ) -> Self {
        let mut workload = Self::new(namespace, name);
        workload
            .labels
            .insert(labels.mutated_label.clone(), "true".to_string());
        workload.scheduling_gates.push(labels.gate_name.clone());
        workload.conditions.push(WorkloadCondition {
            kind: "PodScheduled".to_string(),
            status: false,
            message: GATES_BLOCKED_MESSAGE.to_string(),
        });

        let mut container = Container {
            name: "main".to_string(),
            ..Default::default()
        };
        container.limits.insert(
            format!("{}{}{}", RESOURCE_DOMAIN, labels.resource_marker, profile),
            "1".to_string(),
        );
        workload.containers.push(container);
        workload
    }

    /// Namespaced name
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Reference used in allocation requests
    pub fn reference(&self) -> WorkloadRef {
        WorkloadRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            uid: self.uid,
        }
    }

    /// Whether a scheduling gate with this name is present
    pub fn has_gate(&self, gate: &str) -> bool {
        self.scheduling_gates.iter().any(|g| g == gate)
    }

    /// Whether a finalizer with this name is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Whether the workload is finished or on its way out
    pub fn is_terminating(&self) -> bool {
        self.is_deleting()
            || matches!(self.phase, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }

    /// The single container that needs a slice
    pub fn slice_container(&self, marker: &str) -> SliceResult<&Container> {
        let mut needing = self
            .containers
            .iter()
            .filter(|c| requests_slice(&c.limits, marker));

        match (needing.next(), needing.next()) {
            (Some(container), None) => Ok(container),
            (None, _) => Err(SliceError::MalformedWorkload(format!(
                "workload {} has no container requesting a slice",
                self.key()
            ))),
            (Some(_), Some(_)) => Err(SliceError::MalformedWorkload(format!(
                "workload {} has more than one container requesting a slice",
                self.key()
            ))),
        }
    }

    /// Profile requested by the workload's slice container
    pub fn requested_profile(&self, marker: &str) -> SliceResult<Profile> {
        decode_profile(&self.slice_container(marker)?.limits, marker)
    }
}

/// Node object as seen by the controller (read-only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Live boot identifier
    pub boot_id: String,
    /// Readiness condition
    pub ready: bool,
}

impl Node {
    /// Create a ready node
    pub fn new(name: impl Into<String>, boot_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_version: 0,
            labels: BTreeMap::new(),
            boot_id: boot_id.into(),
            ready: true,
        }
    }
}

/// Auxiliary per-workload object carrying the assigned slice identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceBinding {
    pub key: WorkloadKey,
    pub workload_uid: WorkloadUid,
    pub resource_identifier: Uuid,
    pub node_name: String,
    pub gpu_uuid: String,
    /// Identity of the realized hardware partition
    pub partition_id: String,
}
