//! Inbound cluster messages of a node.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use servgrid_cluster::{ClusterMessage, MembershipManager, MessageHandler, OperationOutcome};

use crate::events::EventManager;
use crate::factory::ServiceFactory;
use crate::registry::ServiceRegistry;

pub struct NodeMessageHandler {
    membership: Arc<MembershipManager>,
    registry: Arc<ServiceRegistry>,
    factory: Arc<ServiceFactory>,
    events: Arc<EventManager>,
}

impl NodeMessageHandler {
    pub fn new(
        membership: Arc<MembershipManager>,
        registry: Arc<ServiceRegistry>,
        factory: Arc<ServiceFactory>,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            membership,
            registry,
            factory,
            events,
        }
    }
}

#[async_trait]
impl MessageHandler for NodeMessageHandler {
    async fn handle(&self, source: &str, message: ClusterMessage) -> Option<ClusterMessage> {
        match message {
            ClusterMessage::NodeHeartbeat { info } => {
                if let Err(e) = self.membership.observe(info) {
                    warn!(%source, error = %e, "heartbeat not recorded");
                }
                None
            }
            ClusterMessage::NodeToHeadStartService { configuration } => {
                let result = self.factory.create_service(&configuration).await;
                Some(ClusterMessage::StartServiceResult { result })
            }
            ClusterMessage::HeadToNodeStartService { configuration } => {
                let result = self.factory.accept_remote(configuration);
                Some(ClusterMessage::StartServiceResult { result })
            }
            ClusterMessage::FinishServiceRegistration { unique_id } => {
                let snapshot = self.factory.finish_registration(unique_id).await;
                Some(ClusterMessage::OperationReply {
                    outcome: OperationOutcome::Snapshot {
                        snapshot: snapshot.map(Box::new),
                    },
                })
            }
            ClusterMessage::AbortServiceRegistration { unique_id } => {
                let snapshot = self.factory.abort_registration(unique_id).await;
                Some(ClusterMessage::OperationReply {
                    outcome: OperationOutcome::Snapshot {
                        snapshot: snapshot.map(Box::new),
                    },
                })
            }
            ClusterMessage::ServiceLifecycleUpdate { snapshot, .. } => {
                self.registry.handle_service_update(*snapshot, source);
                None
            }
            ClusterMessage::ServiceOperation {
                unique_id,
                operation,
            } => {
                let service = self.registry.local_service(unique_id)?;
                let outcome = service.execute(operation).await;
                Some(ClusterMessage::OperationReply { outcome })
            }
            ClusterMessage::DeferredCreateResult {
                creation_id,
                channels,
                result,
            } => {
                let channels: Vec<String> = channels.into_iter().collect();
                self.events
                    .deferred_create_result(creation_id, &channels, &result);
                None
            }
            ClusterMessage::ServiceConsoleLine {
                service_name,
                channel,
                line,
                error_stream,
                ..
            } => {
                self.events
                    .console_line(&service_name, &channel, &line, error_stream);
                None
            }
            other @ (ClusterMessage::StartServiceResult { .. }
            | ClusterMessage::OperationReply { .. }) => {
                debug!(%source, kind = other.kind(), "unsolicited reply ignored");
                None
            }
        }
    }
}
