//! Payloads exchanged between nodes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use servgrid_core::NodeId;
use servgrid_state::{
    NodeInfo, ServiceConfiguration, ServiceCreateResult, ServiceDeployment, ServiceInfoSnapshot,
    ServiceLifecycle, ServiceRemoteInclusion, ServiceTemplate,
};

/// Every message a node can send or answer with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    /// Periodic node record broadcast.
    NodeHeartbeat { info: NodeInfo },

    /// A non-head node hands a creation request to the head.
    NodeToHeadStartService { configuration: ServiceConfiguration },

    /// The head asks the selected node to instantiate a finalized configuration.
    HeadToNodeStartService { configuration: ServiceConfiguration },

    /// Reply to either start request.
    StartServiceResult { result: ServiceCreateResult },

    /// The head registered the service; the owner moves it to PREPARED.
    FinishServiceRegistration { unique_id: Uuid },

    /// The head gave up on a creation; the owner drops the service whether
    /// it is still pending or already registered.
    AbortServiceRegistration { unique_id: Uuid },

    /// A service changed state on its owning node.
    ServiceLifecycleUpdate {
        previous: ServiceLifecycle,
        snapshot: Box<ServiceInfoSnapshot>,
    },

    /// Forwarded call on a service owned by the receiving node.
    ServiceOperation {
        unique_id: Uuid,
        operation: ServiceOperation,
    },

    /// Reply to [`ClusterMessage::ServiceOperation`].
    OperationReply { outcome: OperationOutcome },

    /// Terminal outcome of a deferred creation.
    DeferredCreateResult {
        creation_id: Uuid,
        channels: BTreeSet<String>,
        result: ServiceCreateResult,
    },

    /// One line of console output forwarded to a log target.
    ServiceConsoleLine {
        unique_id: Uuid,
        service_name: String,
        channel: String,
        line: String,
        error_stream: bool,
    },
}

/// Operations callable on any service provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServiceOperation {
    Start,
    Stop,
    Restart,
    Delete,
    /// Delete including the directory of a static service.
    DeleteFiles,
    RunCommand { line: String },
    AddTemplate { template: ServiceTemplate },
    AddInclusion { inclusion: ServiceRemoteInclusion },
    AddDeployment { deployment: ServiceDeployment },
    IncludeWaitingTemplates { force: bool },
    IncludeWaitingInclusions,
    DeployResources { remove_deployments: bool },
    ForceUpdateSnapshot,
    ToggleLogStreaming { node_id: NodeId, channel: String },
    CachedLogLines,
}

/// Result of a [`ServiceOperation`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationOutcome {
    /// The service after the operation; `None` when the owner did not know it.
    Snapshot { snapshot: Option<Box<ServiceInfoSnapshot>> },
    /// New state of a toggle.
    Toggled { enabled: bool },
    LogLines { lines: Vec<String> },
}

impl ClusterMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeHeartbeat { .. } => "node_heartbeat",
            Self::NodeToHeadStartService { .. } => "node_to_head_start_service",
            Self::HeadToNodeStartService { .. } => "head_to_node_start_service",
            Self::StartServiceResult { .. } => "start_service_result",
            Self::FinishServiceRegistration { .. } => "finish_service_registration",
            Self::AbortServiceRegistration { .. } => "abort_service_registration",
            Self::ServiceLifecycleUpdate { .. } => "service_lifecycle_update",
            Self::ServiceOperation { .. } => "service_operation",
            Self::OperationReply { .. } => "operation_reply",
            Self::DeferredCreateResult { .. } => "deferred_create_result",
            Self::ServiceConsoleLine { .. } => "service_console_line",
        }
    }
}
