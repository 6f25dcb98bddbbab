//! Transport contract between nodes.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use servgrid_core::NodeId;

use crate::error::ClusterResult;
use crate::message::ClusterMessage;

/// Who a message is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Node(NodeId),
    /// Whichever node owns the service.
    Service(Uuid),
    /// Every other connected node.
    All,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Node(id) => write!(f, "node:{id}"),
            Target::Service(id) => write!(f, "service:{id}"),
            Target::All => f.write_str("all"),
        }
    }
}

/// Request/response and broadcast primitive used by the scheduler.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Id of the node this transport sends from.
    fn local_node(&self) -> &str;

    /// Fire-and-forget delivery.
    async fn send(&self, target: Target, message: ClusterMessage) -> ClusterResult<()>;

    /// Deliver and wait up to `timeout` for the first answer.
    ///
    /// `None` covers timeouts, unreachable targets and handlers with nothing
    /// to say.
    async fn send_query(
        &self,
        target: Target,
        message: ClusterMessage,
        timeout: Duration,
    ) -> Option<ClusterMessage>;
}

/// Receiving side of a [`Transport`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, source: &str, message: ClusterMessage) -> Option<ClusterMessage>;
}
