//! gpuslice-agent: Node-side partition agent
//!
//! This crate provides the node half of the allocation lifecycle:
//! - Publishing node capacity and boot identity to the shared object
//! - Realizing and tearing down hardware partitions
//! - Acknowledging both through the agent-owned status field

pub mod agent;
pub mod emulator;
pub mod traits;

pub use agent::{NodeAgent, SyncReport};
pub use emulator::{a100_40gb_profiles, EmulatedBackend};
pub use traits::{PartitionBackend, PartitionSpec};
