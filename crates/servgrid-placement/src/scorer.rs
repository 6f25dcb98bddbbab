//! Node candidates and the comparison chain used to rank them.
//!
//! Lower is better everywhere: the chosen node is the minimum.

use std::cmp::Ordering;

/// What the selector needs to know about one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCandidate {
    pub node_id: String,
    /// Reachable from this node.
    pub connected: bool,
    pub draining: bool,
    pub max_memory_mb: u64,
    /// Heap of the node's running services.
    pub used_memory_mb: u64,
    /// Heap of every service assigned to the node.
    pub reserved_memory_mb: u64,
    /// Percent, negative when unknown.
    pub cpu_load: f64,
}

impl NodeCandidate {
    /// Connected and accepting new services.
    pub fn available(&self) -> bool {
        self.connected && !self.draining
    }

    /// Integer percentage of max memory already reserved.
    pub fn reserved_memory_percentage(&self) -> u64 {
        percentage(self.reserved_memory_mb, self.max_memory_mb)
    }

    /// Integer percentage of max memory used by running services.
    pub fn memory_usage_percentage(&self) -> u64 {
        percentage(self.used_memory_mb, self.max_memory_mb)
    }

    /// Whether `heap_mb` more fits under the node's max memory.
    pub fn fits(&self, heap_mb: u64) -> bool {
        self.used_memory_mb + heap_mb <= self.max_memory_mb
    }
}

fn percentage(part: u64, whole: u64) -> u64 {
    if whole == 0 {
        return u64::MAX;
    }
    part.saturating_mul(100) / whole
}

/// CPU loads only decide when both nodes report one.
fn compare_cpu(a: f64, b: f64) -> Ordering {
    if a >= 0.0 && b >= 0.0 {
        a.total_cmp(&b)
    } else {
        Ordering::Equal
    }
}

/// Reserved memory %, then CPU load.
pub fn compare_by_reserved_memory(a: &NodeCandidate, b: &NodeCandidate) -> Ordering {
    a.reserved_memory_percentage()
        .cmp(&b.reserved_memory_percentage())
        .then_with(|| compare_cpu(a.cpu_load, b.cpu_load))
}

/// Used memory %, then CPU load.
pub fn compare_by_memory_usage(a: &NodeCandidate, b: &NodeCandidate) -> Ordering {
    a.memory_usage_percentage()
        .cmp(&b.memory_usage_percentage())
        .then_with(|| compare_cpu(a.cpu_load, b.cpu_load))
}
