//! Slice placement decisions

use gpuslice_core::{AllocationResult, NodeLedger, Placement, Profile, SliceError, SliceResult};
use tracing::debug;

/// Placement decision for a slice request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    /// Node holding the chosen GPU
    pub node_name: String,
    /// Chosen GPU
    pub gpu_uuid: String,
    /// Chosen window on that GPU
    pub placement: Placement,
}

/// Strategy for choosing a free window
pub trait PlacementStrategy: Send + Sync {
    /// Choose a window for `profile` among `ledgers`.
    ///
    /// `recent` holds results committed by this process that a listed snapshot
    /// may not show yet; their windows count as held. Fails with
    /// `SliceError::NoCapacity` when nothing fits.
    fn place(
        &self,
        profile: &Profile,
        ledgers: &[NodeLedger],
        recent: &[AllocationResult],
    ) -> SliceResult<PlacementDecision>;
}

/// First-fit placement.
///
/// Visits nodes in ascending name order, GPUs in discovery order and windows in
/// ascending start order, and returns the first window that intersects no held
/// window on its GPU.
pub struct FirstFit;

impl PlacementStrategy for FirstFit {
    fn place(
        &self,
        profile: &Profile,
        ledgers: &[NodeLedger],
        recent: &[AllocationResult],
    ) -> SliceResult<PlacementDecision> {
        let mut ordered: Vec<&NodeLedger> = ledgers.iter().collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name));

        for ledger in ordered {
            let Some(placements) = ledger.resources.profile(profile) else {
                continue;
            };
            let windows = placements.ordered();

            for gpu in &ledger.resources.gpus {
                let mut held: Vec<Placement> = ledger.active_windows(&gpu.uuid).collect();
                held.extend(
                    recent
                        .iter()
                        .filter(|r| {
                            r.node_name == ledger.name
                                && r.gpu_uuid == gpu.uuid
                                && r.status.is_active()
                        })
                        .map(|r| r.placement),
                );

                if let Some(window) = windows
                    .iter()
                    .find(|candidate| !held.iter().any(|h| h.overlaps(candidate)))
                {
                    debug!(
                        node = %ledger.name,
                        gpu = %gpu.uuid,
                        profile = %profile,
                        placement = %window,
                        "Found free window"
                    );
                    return Ok(PlacementDecision {
                        node_name: ledger.name.clone(),
                        gpu_uuid: gpu.uuid.clone(),
                        placement: *window,
                    });
                }
            }
        }

        Err(SliceError::NoCapacity(format!("no free window for profile {}", profile)))
    }
}
