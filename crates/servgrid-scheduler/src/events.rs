//! Extension hooks around creation, provisioning and lifecycle.
//!
//! Listeners are called synchronously on the path that fires them. Hooks
//! returning `bool` report cancellation: `true` vetoes the step.

use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use servgrid_core::NodeId;
use servgrid_state::{
    ServiceConfiguration, ServiceConfigurationBuilder, ServiceCreateResult, ServiceDeployment,
    ServiceInfoSnapshot, ServiceLifecycle, ServiceRemoteInclusion, ServiceTemplate,
};

/// Decision of a node-select hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSelection {
    /// Let placement decide.
    Default,
    /// Place on this node without consulting placement.
    Force(NodeId),
    /// Do not place the service at all.
    Cancel,
}

/// Observer of service events. Every method has a no-op default.
#[allow(unused_variables)]
pub trait ServiceListener: Send + Sync {
    /// Rewrite a configuration before the head finalizes it.
    fn configure(&self, builder: ServiceConfigurationBuilder) -> ServiceConfigurationBuilder {
        builder
    }

    fn select_node(&self, configuration: &ServiceConfiguration) -> NodeSelection {
        NodeSelection::Default
    }

    fn pre_prepare(&self, snapshot: &ServiceInfoSnapshot) {}

    fn post_prepare(&self, snapshot: &ServiceInfoSnapshot) {}

    fn pre_lifecycle(&self, snapshot: &ServiceInfoSnapshot, target: ServiceLifecycle) -> bool {
        false
    }

    fn post_lifecycle(&self, snapshot: &ServiceInfoSnapshot, previous: ServiceLifecycle) {}

    /// A RUNNING service lost its process and is about to be stopped.
    fn pre_force_stop(&self, snapshot: &ServiceInfoSnapshot) {}

    fn template_load(&self, snapshot: &ServiceInfoSnapshot, template: &ServiceTemplate) -> bool {
        false
    }

    fn inclusion_load(
        &self,
        snapshot: &ServiceInfoSnapshot,
        inclusion: &ServiceRemoteInclusion,
    ) -> bool {
        false
    }

    fn deployment(&self, snapshot: &ServiceInfoSnapshot, deployment: &ServiceDeployment) -> bool {
        false
    }

    fn deferred_create_result(
        &self,
        creation_id: Uuid,
        channels: &[String],
        result: &ServiceCreateResult,
    ) {
    }

    /// A console line streamed from a service to this node.
    fn console_line(&self, service_name: &str, channel: &str, line: &str, error_stream: bool) {}
}

/// Fan-out over the registered listeners.
#[derive(Default)]
pub struct EventManager {
    listeners: RwLock<Vec<Arc<dyn ServiceListener>>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ServiceListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn snapshot(&self) -> Vec<Arc<dyn ServiceListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `true` if any listener cancelled.
    fn any(&self, f: impl Fn(&dyn ServiceListener) -> bool) -> bool {
        self.snapshot().iter().any(|l| f(l.as_ref()))
    }

    pub fn configure(&self, builder: ServiceConfigurationBuilder) -> ServiceConfigurationBuilder {
        self.snapshot()
            .iter()
            .fold(builder, |builder, l| l.configure(builder))
    }

    /// First listener that does not return [`NodeSelection::Default`] wins.
    pub fn select_node(&self, configuration: &ServiceConfiguration) -> NodeSelection {
        self.snapshot()
            .iter()
            .map(|l| l.select_node(configuration))
            .find(|s| *s != NodeSelection::Default)
            .unwrap_or(NodeSelection::Default)
    }

    pub fn pre_prepare(&self, snapshot: &ServiceInfoSnapshot) {
        self.snapshot().iter().for_each(|l| l.pre_prepare(snapshot));
    }

    pub fn post_prepare(&self, snapshot: &ServiceInfoSnapshot) {
        self.snapshot().iter().for_each(|l| l.post_prepare(snapshot));
    }

    pub fn pre_lifecycle(&self, snapshot: &ServiceInfoSnapshot, target: ServiceLifecycle) -> bool {
        self.any(|l| l.pre_lifecycle(snapshot, target))
    }

    pub fn post_lifecycle(&self, snapshot: &ServiceInfoSnapshot, previous: ServiceLifecycle) {
        self.snapshot()
            .iter()
            .for_each(|l| l.post_lifecycle(snapshot, previous));
    }

    pub fn pre_force_stop(&self, snapshot: &ServiceInfoSnapshot) {
        self.snapshot().iter().for_each(|l| l.pre_force_stop(snapshot));
    }

    pub fn template_load(&self, snapshot: &ServiceInfoSnapshot, template: &ServiceTemplate) -> bool {
        self.any(|l| l.template_load(snapshot, template))
    }

    pub fn inclusion_load(
        &self,
        snapshot: &ServiceInfoSnapshot,
        inclusion: &ServiceRemoteInclusion,
    ) -> bool {
        self.any(|l| l.inclusion_load(snapshot, inclusion))
    }

    pub fn deployment(&self, snapshot: &ServiceInfoSnapshot, deployment: &ServiceDeployment) -> bool {
        self.any(|l| l.deployment(snapshot, deployment))
    }

    pub fn deferred_create_result(
        &self,
        creation_id: Uuid,
        channels: &[String],
        result: &ServiceCreateResult,
    ) {
        self.snapshot()
            .iter()
            .for_each(|l| l.deferred_create_result(creation_id, channels, result));
    }

    pub fn console_line(&self, service_name: &str, channel: &str, line: &str, error_stream: bool) {
        self.snapshot()
            .iter()
            .for_each(|l| l.console_line(service_name, channel, line, error_stream));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Pin(&'static str);

    impl ServiceListener for Pin {
        fn select_node(&self, _: &ServiceConfiguration) -> NodeSelection {
            NodeSelection::Force(self.0.to_string())
        }

        fn configure(&self, builder: ServiceConfigurationBuilder) -> ServiceConfigurationBuilder {
            builder.jvm_options([format!("-Dpinned={}", self.0)])
        }
    }

    struct Veto(AtomicUsize);

    impl ServiceListener for Veto {
        fn pre_lifecycle(&self, _: &ServiceInfoSnapshot, target: ServiceLifecycle) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            target == ServiceLifecycle::Running
        }
    }

    #[test]
    fn defaults_do_nothing() {
        let events = EventManager::new();
        let configuration = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
            .build()
            .unwrap();
        assert_eq!(events.select_node(&configuration), NodeSelection::Default);
    }

    #[test]
    fn first_decisive_selection_wins_and_configure_chains() {
        let events = EventManager::new();
        events.register(Arc::new(Pin("node-b")));
        events.register(Arc::new(Pin("node-c")));

        let builder = events.configure(ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER"));
        let configuration = builder.build().unwrap();
        assert_eq!(
            configuration.process.jvm_options,
            vec!["-Dpinned=node-b", "-Dpinned=node-c"]
        );
        assert_eq!(
            events.select_node(&configuration),
            NodeSelection::Force("node-b".into())
        );
    }

    #[test]
    fn any_listener_can_veto() {
        let events = EventManager::new();
        let veto = Arc::new(Veto(AtomicUsize::new(0)));
        events.register(veto.clone());

        let configuration = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
            .build()
            .unwrap();
        let snapshot = ServiceInfoSnapshot {
            creation_time: 0,
            address: servgrid_core::HostAndPort::new("127.0.0.1", 44955),
            connected_time: -1,
            lifecycle: ServiceLifecycle::Prepared,
            process: Default::default(),
            configuration,
            properties: Default::default(),
        };
        assert!(events.pre_lifecycle(&snapshot, ServiceLifecycle::Running));
        assert!(!events.pre_lifecycle(&snapshot, ServiceLifecycle::Stopped));
        assert_eq!(veto.0.load(Ordering::SeqCst), 2);
    }
}
