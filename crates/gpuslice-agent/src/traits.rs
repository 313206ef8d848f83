//! Partition backend trait definitions

use async_trait::async_trait;
use gpuslice_core::{NodeResources, Placement, SliceResult};

/// A hardware partition to realize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    /// Target GPU
    pub gpu_uuid: String,
    /// Window on that GPU
    pub placement: Placement,
    /// GPU instance profile id
    pub gi_profile_id: u32,
    /// Compute instance profile id
    pub ci_profile_id: u32,
    /// Compute instance engine profile id
    pub ci_eng_profile_id: u32,
}

/// Backend performing hardware partitioning on one node
#[async_trait]
pub trait PartitionBackend: Send + Sync {
    /// Enumerate GPUs and supported profiles, stamped with the live boot id
    async fn discover(&self) -> SliceResult<NodeResources>;

    /// Create a partition. Returns its identity.
    ///
    /// Creating a partition that already exists returns the existing identity.
    async fn create_partition(&self, spec: &PartitionSpec) -> SliceResult<String>;

    /// Destroy the partition occupying a window. Destroying nothing succeeds.
    async fn destroy_partition(&self, gpu_uuid: &str, placement: Placement) -> SliceResult<()>;

    /// Live partitions as (GPU, window) pairs
    async fn partitions(&self) -> SliceResult<Vec<(String, Placement)>>;

    /// Get the backend name
    fn name(&self) -> &'static str;
}
