//! gpuslice-core: Core types for the gpuslice allocator
//!
//! This crate provides the fundamental types shared by the controller and node agents:
//! - Per-node capacity ledger and placement windows
//! - Allocation requests, results and the dual status
//! - Workload and node views of cluster objects
//! - Validated slice profiles
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod gpu;
pub mod model;
pub mod profile;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use model::*;
pub use profile::*;
