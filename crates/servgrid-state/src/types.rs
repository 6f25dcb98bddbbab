//! Runtime status types: lifecycle, snapshots, node records and creation
//! results.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use servgrid_core::{HostAndPort, NodeId};

use crate::configuration::ServiceConfiguration;

// ── Lifecycle ──────────────────────────────────────────────────────

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLifecycle {
    Defined,
    Prepared,
    Running,
    Stopped,
    Deleted,
}

impl ServiceLifecycle {
    /// Whether a service in this state may move to `target`.
    pub fn can_change_to(self, target: ServiceLifecycle) -> bool {
        use ServiceLifecycle::*;
        matches!(
            (self, target),
            (Defined, Prepared | Deleted)
                | (Prepared, Running | Stopped | Deleted)
                | (Running, Stopped | Deleted)
                | (Stopped, Prepared | Deleted)
        )
    }
}

impl fmt::Display for ServiceLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceLifecycle::Defined => "DEFINED",
            ServiceLifecycle::Prepared => "PREPARED",
            ServiceLifecycle::Running => "RUNNING",
            ServiceLifecycle::Stopped => "STOPPED",
            ServiceLifecycle::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

// ── Snapshots ──────────────────────────────────────────────────────

/// Resource usage of a service process at capture time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSnapshot {
    pub pid: Option<u32>,
    /// Percent, `-1.0` when unknown.
    pub cpu_usage: f64,
    pub used_memory_bytes: u64,
    pub max_heap_memory_mb: u32,
}

impl ProcessSnapshot {
    /// Snapshot of a service without a live process.
    pub fn empty() -> Self {
        Self {
            pid: None,
            cpu_usage: -1.0,
            used_memory_bytes: 0,
            max_heap_memory_mb: 0,
        }
    }
}

impl Default for ProcessSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Point-in-time view of one service. Replaced on every change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInfoSnapshot {
    /// Unix millis when the service was created.
    pub creation_time: u64,
    pub address: HostAndPort,
    /// Unix millis of the last connect back from the process, `-1` if never.
    pub connected_time: i64,
    pub lifecycle: ServiceLifecycle,
    pub process: ProcessSnapshot,
    pub configuration: ServiceConfiguration,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ServiceInfoSnapshot {
    pub fn unique_id(&self) -> Uuid {
        self.configuration.service_id.unique_id
    }

    pub fn name(&self) -> String {
        self.configuration.name()
    }

    pub fn task_name(&self) -> &str {
        self.configuration.task_name()
    }

    pub fn node_id(&self) -> Option<&str> {
        self.configuration.service_id.node_id.as_deref()
    }

    pub fn connected(&self) -> bool {
        self.connected_time >= 0
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == ServiceLifecycle::Running
    }
}

// ── Nodes ──────────────────────────────────────────────────────────

/// Resource report a node publishes with every heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeSnapshot {
    /// Heap (MB) of the node's running services.
    pub used_memory_mb: u64,
    /// Heap (MB) of every service on the node, running or not.
    pub reserved_memory_mb: u64,
    /// System CPU load in percent, `-1.0` when unknown.
    pub cpu_load: f64,
    pub service_count: u32,
    pub draining: bool,
}

/// Cluster view of one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub listeners: Vec<HostAndPort>,
    pub max_memory_mb: u64,
    /// Unix millis the node process started. Oldest node is head.
    pub startup_time: u64,
    pub snapshot: NodeSnapshot,
    /// Unix seconds of the last heartbeat.
    pub last_heartbeat: u64,
}

impl NodeInfo {
    /// Used memory as a percentage of max memory.
    pub fn memory_usage_percentage(&self) -> u64 {
        if self.max_memory_mb == 0 {
            return 100;
        }
        self.snapshot.used_memory_mb * 100 / self.max_memory_mb
    }
}

// ── Creation result ────────────────────────────────────────────────

/// Outcome of a creation request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServiceCreateResult {
    Created { snapshot: Box<ServiceInfoSnapshot> },
    /// Queued for retry; the outcome is announced under `creation_id`.
    Deferred { creation_id: Uuid },
    Failed,
}

impl ServiceCreateResult {
    pub fn created(snapshot: ServiceInfoSnapshot) -> Self {
        Self::Created {
            snapshot: Box::new(snapshot),
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }

    pub fn snapshot(&self) -> Option<&ServiceInfoSnapshot> {
        match self {
            Self::Created { snapshot } => Some(snapshot),
            _ => None,
        }
    }

    pub fn creation_id(&self) -> Option<Uuid> {
        match self {
            Self::Deferred { creation_id } => Some(*creation_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServiceLifecycle::*;

    const ALL: [ServiceLifecycle; 5] = [Defined, Prepared, Running, Stopped, Deleted];

    #[test]
    fn legal_transitions() {
        assert!(Defined.can_change_to(Prepared));
        assert!(Prepared.can_change_to(Running));
        assert!(Running.can_change_to(Stopped));
        assert!(Stopped.can_change_to(Prepared));
        assert!(Stopped.can_change_to(Deleted));
    }

    #[test]
    fn defined_cannot_jump_to_running() {
        assert!(!Defined.can_change_to(Running));
        assert!(!Defined.can_change_to(Stopped));
    }

    #[test]
    fn deleted_is_terminal() {
        for target in ALL {
            assert!(!Deleted.can_change_to(target), "DELETED -> {target}");
        }
    }

    #[test]
    fn every_live_state_can_be_deleted() {
        for state in [Defined, Prepared, Running, Stopped] {
            assert!(state.can_change_to(Deleted));
        }
    }

    #[test]
    fn create_result_serializes_with_state_tag() {
        let deferred = ServiceCreateResult::Deferred {
            creation_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&deferred).unwrap();
        assert_eq!(json["state"], "deferred");

        let failed = serde_json::to_value(ServiceCreateResult::Failed).unwrap();
        assert_eq!(failed["state"], "failed");
    }

    #[test]
    fn memory_usage_of_node() {
        let node = NodeInfo {
            id: "node-1".into(),
            listeners: vec![],
            max_memory_mb: 4096,
            startup_time: 0,
            snapshot: NodeSnapshot {
                used_memory_mb: 1024,
                ..NodeSnapshot::default()
            },
            last_heartbeat: 0,
        };
        assert_eq!(node.memory_usage_percentage(), 25);
    }
}
