//! Membership manager: tracks cluster node state.
//!
//! Keeps the last known [`NodeInfo`] of every node, derives liveness from
//! heartbeat age, and elects the head node.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use servgrid_core::epoch_secs;
use servgrid_state::{NodeInfo, NodeSnapshot, StateResult, StateStore};

/// Status of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Ready,
    Draining,
    Dead,
}

/// In-memory view of a cluster member.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Member {
    pub info: NodeInfo,
    pub status: MemberStatus,
}

impl Member {
    pub fn node_id(&self) -> &str {
        &self.info.id
    }

    /// Reachable, draining or not.
    pub fn connected(&self) -> bool {
        self.status != MemberStatus::Dead
    }

    /// Connected and accepting new services.
    pub fn available(&self) -> bool {
        self.status == MemberStatus::Ready
    }
}

/// Manages cluster membership state.
///
/// Persists node records to the `StateStore` so a restarted node still
/// knows its peers.
pub struct MembershipManager {
    state: StateStore,
    local_node: String,
    /// Dead node detection threshold.
    dead_timeout: Duration,
}

impl MembershipManager {
    pub fn new(state: StateStore, local_node: impl Into<String>) -> Self {
        Self {
            state,
            local_node: local_node.into(),
            dead_timeout: Duration::from_secs(30),
        }
    }

    /// Set the dead node detection timeout.
    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Register (or re-register) a node.
    pub fn join(&self, mut node: NodeInfo) -> StateResult<()> {
        node.last_heartbeat = epoch_secs();
        self.state.put_node(&node)?;
        info!(node_id = %node.id, max_memory_mb = node.max_memory_mb, "node joined cluster");
        Ok(())
    }

    /// Accept a full node record from a heartbeat, joining unknown nodes.
    pub fn observe(&self, mut node: NodeInfo) -> StateResult<()> {
        let known = self.state.get_node(&node.id)?.is_some();
        node.last_heartbeat = epoch_secs();
        self.state.put_node(&node)?;
        if known {
            debug!(node_id = %node.id, "heartbeat received");
        } else {
            info!(node_id = %node.id, "node joined cluster");
        }
        Ok(())
    }

    /// Process a heartbeat carrying only the resource snapshot.
    pub fn heartbeat(&self, node_id: &str, snapshot: NodeSnapshot) -> StateResult<bool> {
        match self.state.get_node(node_id)? {
            Some(mut node) => {
                node.snapshot = snapshot;
                node.last_heartbeat = epoch_secs();
                self.state.put_node(&node)?;
                debug!(%node_id, "heartbeat received");
                Ok(true)
            }
            None => {
                warn!(%node_id, "heartbeat from unknown node");
                Ok(false)
            }
        }
    }

    /// Mark a node as draining (or not). Draining nodes take no new services.
    pub fn set_draining(&self, node_id: &str, draining: bool) -> StateResult<bool> {
        match self.state.get_node(node_id)? {
            Some(mut node) => {
                node.snapshot.draining = draining;
                self.state.put_node(&node)?;
                info!(%node_id, draining, "node drain state changed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove a node from the cluster.
    pub fn leave(&self, node_id: &str) -> StateResult<bool> {
        let existed = self.state.delete_node(node_id)?;
        if existed {
            info!(%node_id, "node left cluster");
        }
        Ok(existed)
    }

    fn to_member(&self, info: NodeInfo, now: u64) -> Member {
        let expired = now.saturating_sub(info.last_heartbeat) > self.dead_timeout.as_secs();
        let status = if expired && info.id != self.local_node {
            MemberStatus::Dead
        } else if info.snapshot.draining {
            MemberStatus::Draining
        } else {
            MemberStatus::Ready
        };
        Member { info, status }
    }

    /// List all current members with their status.
    pub fn list_members(&self) -> StateResult<Vec<Member>> {
        let now = epoch_secs();
        Ok(self
            .state
            .list_nodes()?
            .into_iter()
            .map(|n| self.to_member(n, now))
            .collect())
    }

    /// Get a single member by ID.
    pub fn get_member(&self, node_id: &str) -> StateResult<Option<Member>> {
        let now = epoch_secs();
        Ok(self
            .state
            .get_node(node_id)?
            .map(|n| self.to_member(n, now)))
    }

    /// Connected member with the earliest startup time; node id breaks ties.
    pub fn head_node(&self) -> StateResult<Option<Member>> {
        Ok(self
            .list_members()?
            .into_iter()
            .filter(Member::connected)
            .min_by(|a, b| {
                a.info
                    .startup_time
                    .cmp(&b.info.startup_time)
                    .then_with(|| a.info.id.cmp(&b.info.id))
            }))
    }

    /// Whether the local node currently is the head.
    pub fn is_local_head(&self) -> StateResult<bool> {
        Ok(self
            .head_node()?
            .is_some_and(|head| head.info.id == self.local_node))
    }

    /// `(node, connected)` pairs for placement.
    pub fn placement_view(&self) -> StateResult<Vec<(NodeInfo, bool)>> {
        Ok(self
            .list_members()?
            .into_iter()
            .map(|m| {
                let connected = m.connected();
                (m.info, connected)
            })
            .collect())
    }

    /// Detect and remove dead nodes.
    ///
    /// Returns the IDs of nodes that were removed.
    pub fn reap_dead_nodes(&self) -> StateResult<Vec<String>> {
        let mut reaped = Vec::new();
        for member in self.list_members()? {
            if member.status == MemberStatus::Dead {
                self.state.delete_node(&member.info.id)?;
                warn!(node_id = %member.info.id, "reaped dead node");
                reaped.push(member.info.id);
            }
        }
        Ok(reaped)
    }

    /// Count of connected nodes.
    pub fn connected_count(&self) -> StateResult<usize> {
        Ok(self
            .list_members()?
            .iter()
            .filter(|m| m.connected())
            .count())
    }
}
