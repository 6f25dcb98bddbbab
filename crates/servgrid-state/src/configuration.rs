//! Service identity and configuration.
//!
//! A [`ServiceConfiguration`] is immutable once built. Anything that needs a
//! changed copy goes through [`ServiceConfiguration::to_builder`], which clones
//! the original, so a caller's configuration is never touched.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use servgrid_core::{
    DEFAULT_NAME_SPLITTER, DEFAULT_RUNTIME, DEFAULT_SERVICE_PORT, NodeId, is_valid_name,
};

use crate::error::{StateError, StateResult};
use crate::resources::{ServiceDeployment, ServiceRemoteInclusion, ServiceTemplate};
use crate::task::ServiceTask;

/// Default max heap (MB) of a service process.
pub const DEFAULT_MAX_HEAP_MB: u32 = 512;

// ── ServiceId ──────────────────────────────────────────────────────

/// Identity of one service instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceId {
    pub unique_id: Uuid,
    pub task_name: String,
    pub name_splitter: String,
    /// Per-task instance number. Values `<= 0` ask for the next free one.
    pub task_service_id: i32,
    /// Node that owns the service. Set before creation, it pins placement.
    pub node_id: Option<NodeId>,
    pub environment: String,
}

impl ServiceId {
    pub fn new(task_name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            unique_id: Uuid::new_v4(),
            task_name: task_name.into(),
            name_splitter: DEFAULT_NAME_SPLITTER.to_string(),
            task_service_id: -1,
            node_id: None,
            environment: environment.into(),
        }
    }

    /// Human readable name, e.g. `Lobby-1`.
    pub fn name(&self) -> String {
        format!(
            "{}{}{}",
            self.task_name, self.name_splitter, self.task_service_id
        )
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name(), self.unique_id)
    }
}

// ── Process and retry settings ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessConfiguration {
    pub max_heap_memory_mb: u32,
    pub jvm_options: Vec<String>,
    pub process_parameters: Vec<String>,
    pub environment_variables: BTreeMap<String, String>,
}

impl Default for ProcessConfiguration {
    fn default() -> Self {
        Self {
            max_heap_memory_mb: DEFAULT_MAX_HEAP_MB,
            jvm_options: Vec::new(),
            process_parameters: Vec::new(),
            environment_variables: BTreeMap::new(),
        }
    }
}

/// Backoff policy for creations that could not be placed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfiguration {
    pub max_retries: u32,
    pub backoff_ms: Vec<u64>,
    /// Nodes (and the channels on them) told about deferred outcomes.
    pub event_receivers: BTreeMap<NodeId, BTreeSet<String>>,
}

impl RetryConfiguration {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::default()
    }

    pub fn new(max_retries: u32, backoff_ms: Vec<u64>) -> Self {
        Self {
            max_retries,
            backoff_ms,
            event_receivers: BTreeMap::new(),
        }
    }

    pub fn with_event_receiver(mut self, node: impl Into<NodeId>, channel: impl Into<String>) -> Self {
        self.event_receivers
            .entry(node.into())
            .or_default()
            .insert(channel.into());
        self
    }

    pub fn enabled(&self) -> bool {
        self.max_retries > 0 && !self.backoff_ms.is_empty()
    }
}

// ── ServiceConfiguration ───────────────────────────────────────────

/// Everything needed to provision and launch one service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfiguration {
    pub service_id: ServiceId,
    pub runtime: String,
    #[serde(default)]
    pub java_command: Option<String>,
    #[serde(default)]
    pub host_address: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub static_service: bool,
    pub auto_delete_on_stop: bool,
    /// Allow-list for placement. Empty means every node.
    #[serde(default)]
    pub allowed_nodes: BTreeSet<NodeId>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub deleted_files_after_stop: BTreeSet<String>,
    #[serde(default)]
    pub process: ProcessConfiguration,
    #[serde(default)]
    pub retry: RetryConfiguration,
    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,
    #[serde(default)]
    pub inclusions: Vec<ServiceRemoteInclusion>,
    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ServiceConfiguration {
    /// Start a new configuration for `task` in `environment`.
    pub fn builder(
        task: impl Into<String>,
        environment: impl Into<String>,
    ) -> ServiceConfigurationBuilder {
        ServiceConfigurationBuilder {
            inner: ServiceConfiguration {
                service_id: ServiceId::new(task, environment),
                runtime: DEFAULT_RUNTIME.to_string(),
                java_command: None,
                host_address: None,
                port: DEFAULT_SERVICE_PORT,
                static_service: false,
                auto_delete_on_stop: true,
                allowed_nodes: BTreeSet::new(),
                groups: BTreeSet::new(),
                deleted_files_after_stop: BTreeSet::new(),
                process: ProcessConfiguration::default(),
                retry: RetryConfiguration::no_retry(),
                templates: Vec::new(),
                inclusions: Vec::new(),
                deployments: Vec::new(),
                properties: serde_json::Map::new(),
            },
        }
    }

    /// Builder seeded with every setting of `task`.
    pub fn from_task(task: &ServiceTask) -> ServiceConfigurationBuilder {
        let mut builder = Self::builder(&task.name, &task.environment)
            .runtime(&task.runtime)
            .name_splitter(&task.name_splitter)
            .port(task.start_port)
            .static_service(task.static_services)
            .auto_delete_on_stop(task.auto_delete_on_stop)
            .allowed_nodes(task.associated_nodes.iter().cloned())
            .groups(task.groups.iter().cloned())
            .templates(task.templates.iter().cloned())
            .inclusions(task.inclusions.iter().cloned())
            .deployments(task.deployments.iter().cloned())
            .process(task.process.clone());
        builder.inner.java_command = task.java_command.clone();
        builder.inner.host_address = task.host_address.clone();
        builder.inner.deleted_files_after_stop = task.deleted_files_after_stop.clone();
        builder.inner.properties = task.properties.clone();
        builder
    }

    /// A builder holding a clone of this configuration.
    pub fn to_builder(&self) -> ServiceConfigurationBuilder {
        ServiceConfigurationBuilder {
            inner: self.clone(),
        }
    }

    pub fn name(&self) -> String {
        self.service_id.name()
    }

    pub fn task_name(&self) -> &str {
        &self.service_id.task_name
    }

    pub fn environment(&self) -> &str {
        &self.service_id.environment
    }

    pub fn max_heap_memory_mb(&self) -> u32 {
        self.process.max_heap_memory_mb
    }
}

/// Produces [`ServiceConfiguration`]s. Collection setters append and skip
/// entries that are already present.
#[derive(Debug, Clone)]
pub struct ServiceConfigurationBuilder {
    inner: ServiceConfiguration,
}

fn push_unique<T: PartialEq>(target: &mut Vec<T>, items: impl IntoIterator<Item = T>) {
    for item in items {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

impl ServiceConfigurationBuilder {
    /// The configuration as built so far.
    pub fn peek(&self) -> &ServiceConfiguration {
        &self.inner
    }

    pub fn task_name(mut self, task: impl Into<String>) -> Self {
        self.inner.service_id.task_name = task.into();
        self
    }

    pub fn name_splitter(mut self, splitter: impl Into<String>) -> Self {
        self.inner.service_id.name_splitter = splitter.into();
        self
    }

    pub fn task_service_id(mut self, id: i32) -> Self {
        self.inner.service_id.task_service_id = id;
        self
    }

    pub fn unique_id(mut self, id: Uuid) -> Self {
        self.inner.service_id.unique_id = id;
        self
    }

    pub fn node(mut self, node: Option<NodeId>) -> Self {
        self.inner.service_id.node_id = node;
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.inner.service_id.environment = environment.into();
        self
    }

    pub fn runtime(mut self, runtime: impl Into<String>) -> Self {
        self.inner.runtime = runtime.into();
        self
    }

    pub fn java_command(mut self, command: impl Into<String>) -> Self {
        self.inner.java_command = Some(command.into());
        self
    }

    pub fn host_address(mut self, host: impl Into<String>) -> Self {
        self.inner.host_address = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.inner.port = port;
        self
    }

    pub fn static_service(mut self, static_service: bool) -> Self {
        self.inner.static_service = static_service;
        self
    }

    pub fn auto_delete_on_stop(mut self, auto_delete: bool) -> Self {
        self.inner.auto_delete_on_stop = auto_delete;
        self
    }

    pub fn allowed_nodes(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.inner.allowed_nodes.extend(nodes);
        self
    }

    pub fn groups(mut self, groups: impl IntoIterator<Item = String>) -> Self {
        self.inner.groups.extend(groups);
        self
    }

    pub fn deleted_files_after_stop(mut self, files: impl IntoIterator<Item = String>) -> Self {
        self.inner.deleted_files_after_stop.extend(files);
        self
    }

    pub fn process(mut self, process: ProcessConfiguration) -> Self {
        self.inner.process = process;
        self
    }

    pub fn max_heap_memory(mut self, mb: u32) -> Self {
        self.inner.process.max_heap_memory_mb = mb;
        self
    }

    pub fn jvm_options(mut self, options: impl IntoIterator<Item = String>) -> Self {
        push_unique(&mut self.inner.process.jvm_options, options);
        self
    }

    pub fn process_parameters(mut self, parameters: impl IntoIterator<Item = String>) -> Self {
        push_unique(&mut self.inner.process.process_parameters, parameters);
        self
    }

    /// Adds variables that are not set yet; existing values win.
    pub fn environment_variables(
        mut self,
        variables: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        for (key, value) in variables {
            self.inner
                .process
                .environment_variables
                .entry(key)
                .or_insert(value);
        }
        self
    }

    pub fn retry(mut self, retry: RetryConfiguration) -> Self {
        self.inner.retry = retry;
        self
    }

    pub fn templates(mut self, templates: impl IntoIterator<Item = ServiceTemplate>) -> Self {
        push_unique(&mut self.inner.templates, templates);
        self
    }

    pub fn inclusions(
        mut self,
        inclusions: impl IntoIterator<Item = ServiceRemoteInclusion>,
    ) -> Self {
        push_unique(&mut self.inner.inclusions, inclusions);
        self
    }

    pub fn deployments(mut self, deployments: impl IntoIterator<Item = ServiceDeployment>) -> Self {
        push_unique(&mut self.inner.deployments, deployments);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inner.properties.insert(key.into(), value);
        self
    }

    /// Validate names and produce the configuration.
    pub fn build(self) -> StateResult<ServiceConfiguration> {
        let id = &self.inner.service_id;
        if !is_valid_name(&id.task_name) {
            return Err(StateError::InvalidName(id.task_name.clone()));
        }
        if let Some(group) = self.inner.groups.iter().find(|g| !is_valid_name(g)) {
            return Err(StateError::InvalidName(group.clone()));
        }
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lobby() -> ServiceConfiguration {
        ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
            .task_service_id(3)
            .max_heap_memory(1024)
            .build()
            .unwrap()
    }

    #[test]
    fn name_joins_task_and_id() {
        let config = lobby();
        assert_eq!(config.name(), "Lobby-3");

        let custom = config.to_builder().name_splitter("_").build().unwrap();
        assert_eq!(custom.name(), "Lobby_3");
    }

    #[test]
    fn to_builder_never_touches_original() {
        let original = lobby();
        let changed = original
            .to_builder()
            .task_service_id(9)
            .jvm_options(["-XX:+UseG1GC".to_string()])
            .build()
            .unwrap();

        assert_eq!(original.service_id.task_service_id, 3);
        assert!(original.process.jvm_options.is_empty());
        assert_eq!(changed.service_id.task_service_id, 9);
        assert_eq!(changed.service_id.unique_id, original.service_id.unique_id);
    }

    #[test]
    fn collection_setters_skip_duplicates() {
        let template = ServiceTemplate::new("Lobby", "default");
        let config = lobby()
            .to_builder()
            .templates([template.clone()])
            .templates([template])
            .process_parameters(["--nojline".to_string(), "--nojline".to_string()])
            .environment_variables([("A".to_string(), "1".to_string())])
            .environment_variables([("A".to_string(), "2".to_string())])
            .build()
            .unwrap();

        assert_eq!(config.templates.len(), 1);
        assert_eq!(config.process.process_parameters, vec!["--nojline"]);
        assert_eq!(config.process.environment_variables["A"], "1");
    }

    #[test]
    fn build_rejects_invalid_task_name() {
        let result = ServiceConfiguration::builder("Lobby 1", "MINECRAFT_SERVER").build();
        assert!(matches!(result, Err(StateError::InvalidName(_))));
    }

    #[test]
    fn retry_enabled_needs_attempts_and_backoff() {
        assert!(!RetryConfiguration::no_retry().enabled());
        assert!(!RetryConfiguration::new(3, vec![]).enabled());
        assert!(!RetryConfiguration::new(0, vec![500]).enabled());
        assert!(RetryConfiguration::new(3, vec![500]).enabled());
    }

    #[test]
    fn defaults_match_node_conventions() {
        let config = lobby();
        assert_eq!(config.runtime, "jvm");
        assert_eq!(config.port, 44955);
        assert!(config.auto_delete_on_stop);
        assert!(config.service_id.node_id.is_none());
    }
}
