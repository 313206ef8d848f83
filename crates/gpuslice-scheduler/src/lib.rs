//! gpuslice-scheduler: Slice allocator and lifecycle controller
//!
//! This crate decides where GPU slices go and drives each allocation through
//! its lifecycle:
//! - First-fit placement over published node capacity
//! - An allocation cache covering lagging ledger listings
//! - The dual-writer status protocol with node agents
//! - Scheduling-gate and finalizer handling on workloads
//! - Orphan repair and boot-id fencing of rebooted nodes

pub mod cache;
pub mod controller;
pub mod gate;
pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod orphan;
pub mod placement;
pub mod queue;

#[cfg(test)]
mod testutil;

pub use cache::AllocationCache;
pub use controller::{Action, Controller};
pub use gate::GateManager;
pub use health::{NodeHealthMonitor, NodeTransition, TrustedLedgers};
pub use lifecycle::Step;
pub use manager::ControllerManager;
pub use orphan::{OrphanReconciler, SweepReport};
pub use placement::{FirstFit, PlacementDecision, PlacementStrategy};
pub use queue::WorkQueue;
