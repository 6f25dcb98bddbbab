//! In-process network connecting nodes that share one address space.
//!
//! Handlers run inline on the sender's task, so once `send` returns every
//! reachable receiver has processed the message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use servgrid_core::NodeId;

use crate::error::{ClusterError, ClusterResult};
use crate::message::ClusterMessage;
use crate::transport::{MessageHandler, Target, Transport};

struct Peer {
    handler: Option<Arc<dyn MessageHandler>>,
    reachable: bool,
}

/// Registry of the nodes attached to one in-process cluster.
#[derive(Default)]
pub struct InMemoryNetwork {
    peers: RwLock<HashMap<NodeId, Peer>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport sending as `node_id`. The node is attached without a
    /// handler until [`InMemoryNetwork::register`] is called.
    pub async fn transport(self: &Arc<Self>, node_id: impl Into<NodeId>) -> InMemoryTransport {
        let node_id = node_id.into();
        self.peers
            .write()
            .await
            .entry(node_id.clone())
            .or_insert(Peer {
                handler: None,
                reachable: true,
            });
        InMemoryTransport {
            node_id,
            network: Arc::clone(self),
        }
    }

    /// Attach the message handler of `node_id`.
    pub async fn register(&self, node_id: &str, handler: Arc<dyn MessageHandler>) {
        let mut peers = self.peers.write().await;
        let peer = peers.entry(node_id.to_string()).or_insert(Peer {
            handler: None,
            reachable: true,
        });
        peer.handler = Some(handler);
        debug!(%node_id, "handler attached to in-memory network");
    }

    /// Cut (or restore) a node's connectivity in both directions.
    pub async fn set_reachable(&self, node_id: &str, reachable: bool) {
        if let Some(peer) = self.peers.write().await.get_mut(node_id) {
            peer.reachable = reachable;
            debug!(%node_id, reachable, "in-memory reachability changed");
        }
    }

    pub async fn remove(&self, node_id: &str) {
        self.peers.write().await.remove(node_id);
    }

    async fn receivers(
        &self,
        from: &str,
        target: &Target,
    ) -> ClusterResult<Vec<(NodeId, Arc<dyn MessageHandler>)>> {
        let peers = self.peers.read().await;
        if !peers.get(from).is_some_and(|p| p.reachable) {
            return Err(ClusterError::Unreachable(from.to_string()));
        }

        let live = |id: &NodeId, peer: &Peer| -> Option<(NodeId, Arc<dyn MessageHandler>)> {
            if !peer.reachable {
                return None;
            }
            peer.handler.clone().map(|h| (id.clone(), h))
        };

        match target {
            Target::Node(id) => match peers.get(id).and_then(|p| live(id, p)) {
                Some(receiver) => Ok(vec![receiver]),
                None => Err(ClusterError::Unreachable(id.clone())),
            },
            Target::All => Ok(peers
                .iter()
                .filter(|(id, _)| id.as_str() != from)
                .filter_map(|(id, p)| live(id, p))
                .collect()),
            // Every node sees it; only the owner acts on it.
            Target::Service(_) => Ok(peers.iter().filter_map(|(id, p)| live(id, p)).collect()),
        }
    }
}

/// [`Transport`] over an [`InMemoryNetwork`].
#[derive(Clone)]
pub struct InMemoryTransport {
    node_id: NodeId,
    network: Arc<InMemoryNetwork>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_node(&self) -> &str {
        &self.node_id
    }

    async fn send(&self, target: Target, message: ClusterMessage) -> ClusterResult<()> {
        let receivers = self.network.receivers(&self.node_id, &target).await?;
        trace!(from = %self.node_id, %target, kind = message.kind(), "send");
        for (_, handler) in receivers {
            handler.handle(&self.node_id, message.clone()).await;
        }
        Ok(())
    }

    async fn send_query(
        &self,
        target: Target,
        message: ClusterMessage,
        timeout: Duration,
    ) -> Option<ClusterMessage> {
        let receivers = match self.network.receivers(&self.node_id, &target).await {
            Ok(receivers) => receivers,
            Err(e) => {
                debug!(from = %self.node_id, %target, error = %e, "query not delivered");
                return None;
            }
        };
        trace!(from = %self.node_id, %target, kind = message.kind(), "query");

        let ask = async {
            for (_, handler) in receivers {
                if let Some(reply) = handler.handle(&self.node_id, message.clone()).await {
                    return Some(reply);
                }
            }
            None
        };

        match tokio::time::timeout(timeout, ask).await {
            Ok(reply) => reply,
            Err(_) => {
                debug!(from = %self.node_id, %target, ?timeout, "query timed out");
                None
            }
        }
    }
}
