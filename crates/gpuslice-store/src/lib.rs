//! gpuslice-store: Cluster object store
//!
//! This crate provides access to the objects the controller and node agents share:
//! - The `ClusterStore` trait with optimistic-concurrency writes
//! - An in-memory store with change events
//! - Bounded retry on write conflicts

pub mod memory;
pub mod retry;
pub mod traits;

pub use memory::MemoryStore;
pub use retry::{mutate_ledger, mutate_workload, RetryPolicy};
pub use traits::{ClusterEvent, ClusterStore};
