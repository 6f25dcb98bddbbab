//! Type conversions between state types and placement candidates.
//!
//! Reserved memory is recomputed from the service snapshots the caller
//! knows about, so it reflects services created since the node's last
//! heartbeat.

use servgrid_state::{NodeInfo, ServiceInfoSnapshot};

use crate::scorer::NodeCandidate;

/// Convert a [`NodeInfo`] into a [`NodeCandidate`].
///
/// `connected` is passed externally because reachability is tracked by the
/// cluster layer, not the node record.
pub fn node_info_to_candidate(
    node: &NodeInfo,
    connected: bool,
    services: &[ServiceInfoSnapshot],
) -> NodeCandidate {
    let reserved_memory_mb = services
        .iter()
        .filter(|s| s.node_id() == Some(node.id.as_str()))
        .map(|s| u64::from(s.configuration.max_heap_memory_mb()))
        .sum();

    NodeCandidate {
        node_id: node.id.clone(),
        connected,
        draining: node.snapshot.draining,
        max_memory_mb: node.max_memory_mb,
        used_memory_mb: node.snapshot.used_memory_mb,
        reserved_memory_mb,
        cpu_load: node.snapshot.cpu_load,
    }
}

/// Candidates for every `(node, connected)` pair.
pub fn node_candidates(
    nodes: &[(NodeInfo, bool)],
    services: &[ServiceInfoSnapshot],
) -> Vec<NodeCandidate> {
    nodes
        .iter()
        .map(|(node, connected)| node_info_to_candidate(node, *connected, services))
        .collect()
}
