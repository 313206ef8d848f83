//! Allocation state machine: the next controller step for a workload
//!
//! The controller owns `status.controller`, the node agent owns `status.agent`.
//! This module only decides; the controller performs the writes.

use chrono::{DateTime, Utc};
use gpuslice_core::{AgentState, AllocationResult, ControllerState, Workload, WorkloadPhase};
use std::time::Duration;

/// Next step for a tracked workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing to do until something changes
    Idle,
    /// Gated workload without an allocation: search and commit a window
    Place,
    /// Agent has realized the partition: record `Ungated`
    MarkUngated,
    /// Pin the workload to its node and clear the gate
    PinAndUngate,
    /// Waiting for the node agent to act
    AwaitAgent,
    /// Grace period still running; check again after this long
    AwaitGrace(Duration),
    /// Record `Deleting` so the agent tears the partition down
    MarkDeleting,
    /// Agent has torn the partition down: remove the record
    RemoveRecord {
        /// Whether the finalizer is released afterwards
        release_finalizer: bool,
    },
    /// No allocation remains: release the finalizer
    ReleaseFinalizer,
}

/// Decide the next step.
///
/// `gated` is whether the workload still carries this system's gate in a
/// blocked state, `pinned_to` is its current node-selector value.
pub fn plan(
    workload: &Workload,
    gated: bool,
    pinned_to: Option<&str>,
    allocation: Option<&AllocationResult>,
    grace_period: Duration,
    now: DateTime<Utc>,
) -> Step {
    if workload.is_terminating() {
        plan_termination(workload, gated, allocation, grace_period, now)
    } else {
        plan_active(gated, pinned_to, allocation)
    }
}

fn plan_active(gated: bool, pinned_to: Option<&str>, allocation: Option<&AllocationResult>) -> Step {
    let Some(result) = allocation else {
        return if gated { Step::Place } else { Step::Idle };
    };

    let status = result.status;
    match (status.controller, status.agent) {
        // Partition lost (node reboot): drop the record and place again
        (_, AgentState::Deleted) if gated => Step::RemoveRecord {
            release_finalizer: false,
        },
        (_, AgentState::Deleted) => Step::Idle,
        (ControllerState::Creating, AgentState::Pending) => Step::AwaitAgent,
        (ControllerState::Creating, AgentState::Created) => Step::MarkUngated,
        (ControllerState::Ungated, _) => {
            if gated || pinned_to != Some(result.node_name.as_str()) {
                Step::PinAndUngate
            } else {
                Step::Idle
            }
        }
        (ControllerState::Deleting, _) => Step::AwaitAgent,
    }
}

fn plan_termination(
    workload: &Workload,
    gated: bool,
    allocation: Option<&AllocationResult>,
    grace_period: Duration,
    now: DateTime<Utc>,
) -> Step {
    let Some(result) = allocation else {
        return Step::ReleaseFinalizer;
    };

    let status = result.status;
    if status.agent == AgentState::Deleted {
        return Step::RemoveRecord {
            release_finalizer: true,
        };
    }
    if status.controller == ControllerState::Deleting {
        return Step::AwaitAgent;
    }
    if status.controller == ControllerState::Creating && status.agent == AgentState::Pending {
        return Step::AwaitAgent;
    }

    // Deletion of a workload that may be running: allow a voluntary shutdown
    let finished = matches!(workload.phase, WorkloadPhase::Succeeded | WorkloadPhase::Failed);
    if let Some(requested) = workload.deletion_timestamp {
        if !gated && !finished {
            let elapsed = (now - requested).to_std().unwrap_or_default();
            if elapsed < grace_period {
                return Step::AwaitGrace(grace_period - elapsed);
            }
        }
    }

    Step::MarkDeleting
}
