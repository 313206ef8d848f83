//! GPU capacity ledger published by node agents

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Profile;

/// A contiguous slice-index range on one GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Placement {
    /// First slice index
    pub start: u32,
    /// Number of slice indices covered
    pub size: u32,
}

impl Placement {
    /// Create a new placement window
    pub fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }

    /// One past the last slice index
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.size)
    }

    /// Whether the two index ranges intersect
    pub fn overlaps(&self, other: &Placement) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.start, self.size)
    }
}

/// Represents a GPU discovered by a node agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevice {
    /// Device UUID
    pub uuid: String,
    /// Device model name
    pub model: String,
    /// Total memory in bytes
    pub memory_total: u64,
}

/// Hardware identifiers and valid windows for one profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePlacements {
    /// GPU instance profile id
    pub gi_profile_id: u32,
    /// Compute instance profile id
    pub ci_profile_id: u32,
    /// Compute instance engine profile id
    pub ci_eng_profile_id: u32,
    /// Valid placement windows on every GPU of the node
    pub placements: Vec<Placement>,
}

impl ProfilePlacements {
    /// Placements in ascending start order
    pub fn ordered(&self) -> Vec<Placement> {
        let mut placements = self.placements.clone();
        placements.sort();
        placements
    }
}

/// Capacity ledger for one node.
///
/// Published once by the node agent and immutable until the node reboots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResources {
    /// Boot identifier of the node when this ledger was published
    pub boot_id: String,
    /// GPUs in discovery order
    pub gpus: Vec<GpuDevice>,
    /// Supported profiles and their placement windows
    pub profiles: BTreeMap<Profile, ProfilePlacements>,
}

impl NodeResources {
    /// Whether the agent has published a boot id yet
    pub fn is_published(&self) -> bool {
        !self.boot_id.is_empty()
    }

    /// Placement data for a profile
    pub fn profile(&self, profile: &Profile) -> Option<&ProfilePlacements> {
        self.profiles.get(profile)
    }

    /// Whether a GPU with this UUID was discovered on the node
    pub fn has_gpu(&self, uuid: &str) -> bool {
        self.gpus.iter().any(|g| g.uuid == uuid)
    }
}
