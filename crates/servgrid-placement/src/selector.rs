//! Node selection for new services and reuse of prepared ones.

use tracing::debug;

use servgrid_state::{ServiceConfiguration, ServiceInfoSnapshot, ServiceLifecycle, ServiceTask};

use crate::error::{PlacementError, PlacementResult};
use crate::scorer::{NodeCandidate, compare_by_memory_usage, compare_by_reserved_memory};

/// Choose the node that should run `config`.
///
/// A pinned node must be available. Otherwise the available nodes inside the
/// allow-list (empty = all) are ranked by reserved memory, then CPU.
pub fn select_node_for_service(
    config: &ServiceConfiguration,
    candidates: &[NodeCandidate],
) -> PlacementResult<String> {
    let name = config.name();

    if let Some(pinned) = &config.service_id.node_id {
        return match candidates.iter().find(|c| &c.node_id == pinned) {
            Some(candidate) if candidate.available() => Ok(pinned.clone()),
            _ => {
                debug!(service = %name, node = %pinned, "pinned node unavailable");
                Err(PlacementError::PinnedNodeUnavailable(pinned.clone()))
            }
        };
    }

    let selected = candidates
        .iter()
        .filter(|c| c.available())
        .filter(|c| config.allowed_nodes.is_empty() || config.allowed_nodes.contains(&c.node_id))
        .min_by(|a, b| compare_by_reserved_memory(a, b));

    match selected {
        Some(candidate) => {
            debug!(
                service = %name,
                node = %candidate.node_id,
                reserved_pct = candidate.reserved_memory_percentage(),
                cpu = candidate.cpu_load,
                "node selected"
            );
            Ok(candidate.node_id.clone())
        }
        None => Err(PlacementError::NoEligibleNode(name)),
    }
}

/// Find a PREPARED service of `task` on a node that could start it now.
///
/// Nodes must be available, associated with the task, and have room for the
/// task's heap. Among matching services the one on the least loaded node
/// (used memory %, then CPU) wins.
pub fn select_prepared_service<'a>(
    task: &ServiceTask,
    services: &'a [ServiceInfoSnapshot],
    candidates: &[NodeCandidate],
) -> Option<&'a ServiceInfoSnapshot> {
    let heap = u64::from(task.process.max_heap_memory_mb);
    let eligible: Vec<&NodeCandidate> = candidates
        .iter()
        .filter(|c| c.available() && task.allows_node(&c.node_id) && c.fits(heap))
        .collect();

    services
        .iter()
        .filter(|s| s.task_name() == task.name && s.lifecycle == ServiceLifecycle::Prepared)
        .filter_map(|s| {
            let node_id = s.node_id()?;
            let node = eligible.iter().find(|c| c.node_id == node_id)?;
            Some((s, *node))
        })
        .min_by(|(_, a), (_, b)| compare_by_memory_usage(a, b))
        .map(|(service, _)| service)
}
