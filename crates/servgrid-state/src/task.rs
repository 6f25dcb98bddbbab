//! Tasks, groups and the read-only providers that expose them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use servgrid_core::{DEFAULT_NAME_SPLITTER, DEFAULT_RUNTIME, DEFAULT_SERVICE_PORT, NodeId};

use crate::configuration::ProcessConfiguration;
use crate::error::StateResult;
use crate::resources::{ServiceDeployment, ServiceRemoteInclusion, ServiceTemplate};

/// Named blueprint from which services are instantiated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceTask {
    pub name: String,
    pub runtime: String,
    pub environment: String,
    pub java_command: Option<String>,
    pub host_address: Option<String>,
    pub name_splitter: String,
    pub start_port: u16,
    pub static_services: bool,
    pub auto_delete_on_stop: bool,
    /// No automatic starts while set.
    pub maintenance: bool,
    /// The head node keeps at least this many services running.
    pub min_service_count: u32,
    /// Nodes allowed to run this task. Empty means every node.
    pub associated_nodes: BTreeSet<NodeId>,
    pub groups: BTreeSet<String>,
    pub deleted_files_after_stop: BTreeSet<String>,
    pub process: ProcessConfiguration,
    pub templates: Vec<ServiceTemplate>,
    pub inclusions: Vec<ServiceRemoteInclusion>,
    pub deployments: Vec<ServiceDeployment>,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Default for ServiceTask {
    fn default() -> Self {
        Self {
            name: String::new(),
            runtime: DEFAULT_RUNTIME.to_string(),
            environment: "MINECRAFT_SERVER".to_string(),
            java_command: None,
            host_address: None,
            name_splitter: DEFAULT_NAME_SPLITTER.to_string(),
            start_port: DEFAULT_SERVICE_PORT,
            static_services: false,
            auto_delete_on_stop: true,
            maintenance: false,
            min_service_count: 0,
            associated_nodes: BTreeSet::new(),
            groups: BTreeSet::new(),
            deleted_files_after_stop: BTreeSet::new(),
            process: ProcessConfiguration::default(),
            templates: Vec::new(),
            inclusions: Vec::new(),
            deployments: Vec::new(),
            properties: serde_json::Map::new(),
        }
    }
}

impl ServiceTask {
    pub fn new(name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            environment: environment.into(),
            ..Self::default()
        }
    }

    /// Whether `node` may run services of this task.
    pub fn allows_node(&self, node: &str) -> bool {
        self.associated_nodes.is_empty() || self.associated_nodes.contains(node)
    }
}

/// Reusable bundle of provisioning and process settings.
///
/// A group applies to a service that lists it by name, or whose environment
/// is one of the group's target environments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GroupConfiguration {
    pub name: String,
    pub target_environments: BTreeSet<String>,
    pub templates: Vec<ServiceTemplate>,
    pub inclusions: Vec<ServiceRemoteInclusion>,
    pub deployments: Vec<ServiceDeployment>,
    pub jvm_options: Vec<String>,
    pub process_parameters: Vec<String>,
    pub environment_variables: BTreeMap<String, String>,
}

impl GroupConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn targets(&self, environment: &str) -> bool {
        self.target_environments.contains(environment)
    }
}

/// Read access to group configurations.
pub trait GroupProvider: Send + Sync {
    fn groups(&self) -> StateResult<Vec<GroupConfiguration>>;

    fn group(&self, name: &str) -> StateResult<Option<GroupConfiguration>>;
}

/// Read access to service tasks.
pub trait TaskProvider: Send + Sync {
    fn tasks(&self) -> StateResult<Vec<ServiceTask>>;

    fn task(&self, name: &str) -> StateResult<Option<ServiceTask>>;
}
