//! Emulated partition backend
//!
//! Models an A100-40GB node in memory: device enumeration, the per-profile
//! placement catalogue, window-exclusive partitions and reboots that lose every
//! partition.

use async_trait::async_trait;
use gpuslice_core::{
    EmulatorConfig, GpuDevice, NodeResources, Placement, Profile, ProfilePlacements, SliceError,
    SliceResult,
};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::traits::{PartitionBackend, PartitionSpec};

const A100_40GB_MEMORY: u64 = 40 << 30;

/// Profile catalogue of an A100-40GB: hardware ids and valid windows
pub fn a100_40gb_profiles() -> BTreeMap<Profile, ProfilePlacements> {
    // (compute, memory, media extensions, gi id, ci id, starts, size)
    let table: [(u8, u16, bool, u32, u32, &[u32], u32); 7] = [
        (1, 5, false, 0, 0, &[0, 1, 2, 3, 4, 5, 6], 1),
        (1, 5, true, 7, 0, &[0, 1, 2, 3, 4, 5, 6], 1),
        (1, 10, false, 9, 0, &[0, 2, 4, 6], 2),
        (2, 10, false, 1, 1, &[0, 2, 4], 2),
        (3, 20, false, 2, 2, &[0, 4], 4),
        (4, 20, false, 3, 3, &[0], 4),
        (7, 40, false, 4, 4, &[0], 8),
    ];

    table
        .iter()
        .filter_map(|(compute, memory, me, gi, ci, starts, size)| {
            let profile = Profile::new(*compute, *memory, *me).ok()?;
            let placements = ProfilePlacements {
                gi_profile_id: *gi,
                ci_profile_id: *ci,
                ci_eng_profile_id: 0,
                placements: starts.iter().map(|s| Placement::new(*s, *size)).collect(),
            };
            Some((profile, placements))
        })
        .collect()
}

/// In-memory partition backend for one node
pub struct EmulatedBackend {
    node_name: String,
    gpus: Vec<GpuDevice>,
    profiles: BTreeMap<Profile, ProfilePlacements>,
    boot_id: RwLock<String>,
    /// Live partitions keyed by GPU and window
    partitions: RwLock<BTreeMap<(String, Placement), String>>,
}

impl EmulatedBackend {
    /// Create a backend with `gpu_count` GPUs of `model`
    pub fn new(node_name: impl Into<String>, gpu_count: u32, model: impl Into<String>) -> Self {
        let node_name = node_name.into();
        let model = model.into();
        let gpus = (0..gpu_count)
            .map(|i| GpuDevice {
                uuid: format!("GPU-{}-{}", node_name, i),
                model: model.clone(),
                memory_total: A100_40GB_MEMORY,
            })
            .collect();

        Self {
            node_name,
            gpus,
            profiles: a100_40gb_profiles(),
            boot_id: RwLock::new(Uuid::new_v4().to_string()),
            partitions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a backend from emulator configuration
    pub fn from_config(node_name: impl Into<String>, config: &EmulatorConfig) -> Self {
        Self::new(node_name, config.gpus_per_node, config.gpu_model.clone())
    }

    /// Current boot id
    pub async fn boot_id(&self) -> String {
        self.boot_id.read().await.clone()
    }

    /// Simulate a reboot: new boot id, every partition lost
    pub async fn reboot(&self) -> String {
        let fresh = Uuid::new_v4().to_string();
        *self.boot_id.write().await = fresh.clone();
        self.partitions.write().await.clear();
        info!(node = %self.node_name, boot_id = %fresh, "Emulated node rebooted");
        fresh
    }
}

#[async_trait]
impl PartitionBackend for EmulatedBackend {
    async fn discover(&self) -> SliceResult<NodeResources> {
        Ok(NodeResources {
            boot_id: self.boot_id().await,
            gpus: self.gpus.clone(),
            profiles: self.profiles.clone(),
        })
    }

    async fn create_partition(&self, spec: &PartitionSpec) -> SliceResult<String> {
        if !self.gpus.iter().any(|g| g.uuid == spec.gpu_uuid) {
            return Err(SliceError::NotFound(format!("GPU {}", spec.gpu_uuid)));
        }

        let mut partitions = self.partitions.write().await;
        let key = (spec.gpu_uuid.clone(), spec.placement);
        if let Some(existing) = partitions.get(&key) {
            return Ok(existing.clone());
        }
        if partitions
            .keys()
            .any(|(gpu, held)| gpu == &spec.gpu_uuid && held.overlaps(&spec.placement))
        {
            return Err(SliceError::Internal(format!(
                "window {} on {} intersects a live partition",
                spec.placement, spec.gpu_uuid
            )));
        }

        let id = format!("MIG-{}", Uuid::new_v4());
        partitions.insert(key, id.clone());
        debug!(
            node = %self.node_name,
            gpu = %spec.gpu_uuid,
            placement = %spec.placement,
            gi_profile = spec.gi_profile_id,
            partition = %id,
            "Partition created"
        );
        Ok(id)
    }

    async fn destroy_partition(&self, gpu_uuid: &str, placement: Placement) -> SliceResult<()> {
        let removed = self
            .partitions
            .write()
            .await
            .remove(&(gpu_uuid.to_string(), placement));
        if let Some(id) = removed {
            debug!(node = %self.node_name, gpu = %gpu_uuid, partition = %id, "Partition destroyed");
        }
        Ok(())
    }

    async fn partitions(&self) -> SliceResult<Vec<(String, Placement)>> {
        Ok(self.partitions.read().await.keys().cloned().collect())
    }

    fn name(&self) -> &'static str {
        "emulated"
    }
}
