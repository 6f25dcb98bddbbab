//! Node agent: local participation in cluster membership.
//!
//! On every beat the agent records the local [`NodeInfo`], broadcasts it to
//! the other nodes, and reaps members whose heartbeats stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ClusterResult;
use crate::membership::MembershipManager;
use crate::message::ClusterMessage;
use crate::transport::{Target, Transport};

/// Produces the current record of the local node.
pub type NodeInfoSource = Arc<dyn Fn() -> servgrid_state::NodeInfo + Send + Sync>;

/// Called with the id of every reaped node.
pub type NodeLostCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Configuration for the node agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub heartbeat_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Keeps the local node visible to its peers.
pub struct NodeAgent {
    config: AgentConfig,
    membership: Arc<MembershipManager>,
    transport: Arc<dyn Transport>,
    source: NodeInfoSource,
    on_node_lost: Option<NodeLostCallback>,
}

impl NodeAgent {
    pub fn new(
        config: AgentConfig,
        membership: Arc<MembershipManager>,
        transport: Arc<dyn Transport>,
        source: NodeInfoSource,
    ) -> Self {
        Self {
            config,
            membership,
            transport,
            source,
            on_node_lost: None,
        }
    }

    /// Set the callback invoked for reaped nodes.
    pub fn with_node_lost_callback(mut self, callback: NodeLostCallback) -> Self {
        self.on_node_lost = Some(callback);
        self
    }

    /// Join with the current local record and announce it.
    pub async fn join(&self) -> ClusterResult<()> {
        let info = (self.source)();
        self.membership.join(info.clone())?;
        if let Err(e) = self
            .transport
            .send(Target::All, ClusterMessage::NodeHeartbeat { info })
            .await
        {
            warn!(error = %e, "initial node announcement failed");
        }
        Ok(())
    }

    /// One heartbeat round.
    pub async fn beat(&self) {
        let info = (self.source)();
        let node_id = info.id.clone();

        if let Err(e) = self.membership.observe(info.clone()) {
            warn!(%node_id, error = %e, "failed to record local heartbeat");
        }
        if let Err(e) = self
            .transport
            .send(Target::All, ClusterMessage::NodeHeartbeat { info })
            .await
        {
            warn!(%node_id, error = %e, "heartbeat broadcast failed");
        }

        match self.membership.reap_dead_nodes() {
            Ok(reaped) => {
                for lost in &reaped {
                    if let Some(callback) = &self.on_node_lost {
                        callback(lost);
                    }
                }
            }
            Err(e) => warn!(error = %e, "dead node reaping failed"),
        }
        debug!(%node_id, "heartbeat sent");
    }

    /// Run the heartbeat loop until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let node_id = self.membership.local_node().to_string();
        info!(%node_id, interval = ?self.config.heartbeat_interval, "heartbeat loop started");

        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.beat().await,
                _ = shutdown.changed() => {
                    info!(%node_id, "heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}
