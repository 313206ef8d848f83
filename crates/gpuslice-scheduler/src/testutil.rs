//! Shared fixtures for scheduler tests

use gpuslice_agent::a100_40gb_profiles;
use gpuslice_core::{
    AllocationRequest, AllocationResult, GpuDevice, LabelConfig, Node, NodeLedger, NodeResources,
    Placement, Workload, WorkloadUid,
};

pub fn boot_id(node: &str) -> String {
    format!("{}-boot", node)
}

/// Ledger for a node with `gpus` A100-40GB devices, published with [`boot_id`]
pub fn a100_ledger(node: &str, gpus: u32) -> NodeLedger {
    NodeLedger::new(
        node,
        NodeResources {
            boot_id: boot_id(node),
            gpus: (0..gpus)
                .map(|i| GpuDevice {
                    uuid: format!("{}-GPU-{}", node, i),
                    model: "NVIDIA A100-PCIE-40GB".to_string(),
                    memory_total: 40 << 30,
                })
                .collect(),
            profiles: a100_40gb_profiles(),
        },
    )
}

/// Managed, ready node matching [`a100_ledger`]
pub fn managed_node(name: &str, labels: &LabelConfig) -> Node {
    let mut node = Node::new(name, boot_id(name));
    node.labels
        .insert(labels.managed_label.clone(), "true".to_string());
    node
}

/// Record an allocation for a fresh workload identity
pub fn commit(ledger: &mut NodeLedger, gpu: &str, placement: Placement, profile: &str) -> WorkloadUid {
    let workload = Workload::new("default", format!("w-{}-{}", gpu, placement.start));
    let request = AllocationRequest {
        profile: profile.parse().unwrap(),
        workload: workload.reference(),
    };
    let result = AllocationResult::new(ledger.name.clone(), gpu, placement);
    ledger.insert_allocation(request, result);
    workload.uid
}

/// Workload as left by the admission webhook: gated, labelled and blocked
pub fn gated_workload(name: &str, profile: &str, labels: &LabelConfig) -> Workload {
    Workload::admitted("default", name, profile.parse().unwrap(), labels)
}
