//! Cluster-wide view of services.
//!
//! Every node keeps a provider for every service it knows about: local
//! providers own the process, remote ones cache the owner's last snapshot
//! and forward operations to it. Updates from the cluster keep the remote
//! snapshots current.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};
use uuid::Uuid;

use servgrid_cluster::{ClusterMessage, OperationOutcome, ServiceOperation, Target, Transport};
use servgrid_core::NodeId;
use servgrid_state::{ServiceInfoSnapshot, ServiceLifecycle};

use crate::service::LocalService;

/// Proxy for a service owned by another node.
#[derive(Clone)]
pub struct RemoteService {
    node_id: NodeId,
    snapshot: ServiceInfoSnapshot,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl RemoteService {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn execute(&self, operation: ServiceOperation) -> Option<OperationOutcome> {
        let message = ClusterMessage::ServiceOperation {
            unique_id: self.snapshot.unique_id(),
            operation,
        };
        match self
            .transport
            .send_query(Target::Node(self.node_id.clone()), message, self.timeout)
            .await
        {
            Some(ClusterMessage::OperationReply { outcome }) => Some(outcome),
            Some(other) => {
                debug!(kind = other.kind(), "unexpected reply to service operation");
                None
            }
            None => None,
        }
    }
}

/// Handle on a service, wherever it runs.
#[derive(Clone)]
pub enum ServiceProvider {
    Local(Arc<LocalService>),
    Remote(RemoteService),
}

impl ServiceProvider {
    pub fn snapshot(&self) -> ServiceInfoSnapshot {
        match self {
            Self::Local(service) => service.snapshot(),
            Self::Remote(remote) => remote.snapshot.clone(),
        }
    }

    pub fn unique_id(&self) -> Uuid {
        match self {
            Self::Local(service) => service.unique_id(),
            Self::Remote(remote) => remote.snapshot.unique_id(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Run `operation` on the owning node. `None` if the owner did not
    /// answer.
    pub async fn execute(&self, operation: ServiceOperation) -> Option<OperationOutcome> {
        match self {
            Self::Local(service) => Some(service.execute(operation).await),
            Self::Remote(remote) => remote.execute(operation).await,
        }
    }

    /// Run `operation` and return the service's snapshot afterwards.
    async fn execute_for_snapshot(&self, operation: ServiceOperation) -> Option<ServiceInfoSnapshot> {
        match self.execute(operation).await {
            Some(OperationOutcome::Snapshot { snapshot }) => snapshot.map(|s| *s),
            _ => None,
        }
    }

    pub async fn start(&self) -> Option<ServiceInfoSnapshot> {
        self.execute_for_snapshot(ServiceOperation::Start).await
    }

    pub async fn stop(&self) -> Option<ServiceInfoSnapshot> {
        self.execute_for_snapshot(ServiceOperation::Stop).await
    }

    pub async fn restart(&self) -> Option<ServiceInfoSnapshot> {
        self.execute_for_snapshot(ServiceOperation::Restart).await
    }

    pub async fn delete(&self) -> Option<ServiceInfoSnapshot> {
        self.execute_for_snapshot(ServiceOperation::Delete).await
    }

    pub async fn run_command(&self, line: impl Into<String>) -> Option<ServiceInfoSnapshot> {
        self.execute_for_snapshot(ServiceOperation::RunCommand { line: line.into() })
            .await
    }

    pub async fn cached_log_lines(&self) -> Vec<String> {
        match self.execute(ServiceOperation::CachedLogLines).await {
            Some(OperationOutcome::LogLines { lines }) => lines,
            _ => Vec::new(),
        }
    }
}

/// Predicate over snapshots for registry queries.
#[derive(Debug, Clone, Default)]
pub struct ServiceFilter {
    pub task: Option<String>,
    pub group: Option<String>,
    pub environment: Option<String>,
    pub node: Option<NodeId>,
    pub lifecycle: Option<ServiceLifecycle>,
}

impl ServiceFilter {
    pub fn matches(&self, snapshot: &ServiceInfoSnapshot) -> bool {
        let configuration = &snapshot.configuration;
        self.task.as_deref().is_none_or(|t| configuration.task_name() == t)
            && self.group.as_ref().is_none_or(|g| configuration.groups.contains(g))
            && self
                .environment
                .as_deref()
                .is_none_or(|e| configuration.environment() == e)
            && self.node.as_deref().is_none_or(|n| snapshot.node_id() == Some(n))
            && self.lifecycle.is_none_or(|l| snapshot.lifecycle == l)
    }
}

pub struct ServiceRegistry {
    local_node: NodeId,
    services: DashMap<Uuid, ServiceProvider>,
    transport: Arc<dyn Transport>,
    query_timeout: Duration,
}

impl ServiceRegistry {
    pub fn new(local_node: impl Into<NodeId>, transport: Arc<dyn Transport>, query_timeout: Duration) -> Self {
        Self {
            local_node: local_node.into(),
            services: DashMap::new(),
            transport,
            query_timeout,
        }
    }

    // ── Registration ───────────────────────────────────────────────

    /// Insert a local service. `None` if the id is already taken.
    pub fn register_local(&self, service: Arc<LocalService>) -> Option<ServiceProvider> {
        match self.services.entry(service.unique_id()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let provider = ServiceProvider::Local(service);
                slot.insert(provider.clone());
                Some(provider)
            }
        }
    }

    /// Insert a proxy for a service owned by `node`. `None` if the id is
    /// already taken.
    pub fn register_remote(&self, snapshot: ServiceInfoSnapshot, node: impl Into<NodeId>) -> Option<ServiceProvider> {
        match self.services.entry(snapshot.unique_id()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let provider = ServiceProvider::Remote(self.remote(snapshot, node.into()));
                slot.insert(provider.clone());
                Some(provider)
            }
        }
    }

    fn remote(&self, snapshot: ServiceInfoSnapshot, node_id: NodeId) -> RemoteService {
        RemoteService {
            node_id,
            snapshot,
            transport: self.transport.clone(),
            timeout: self.query_timeout,
        }
    }

    pub fn unregister(&self, unique_id: Uuid) -> Option<ServiceProvider> {
        self.services.remove(&unique_id).map(|(_, provider)| provider)
    }

    /// Apply a snapshot broadcast by the owner of a service.
    ///
    /// Unknown services get a remote provider, known ones take the
    /// snapshot, DELETED removes the entry.
    pub fn handle_service_update(&self, snapshot: ServiceInfoSnapshot, source: &str) {
        let unique_id = snapshot.unique_id();
        if snapshot.lifecycle == ServiceLifecycle::Deleted {
            if self.unregister(unique_id).is_some() {
                debug!(service = %snapshot.name(), "service removed after deletion");
            }
            return;
        }

        match self.services.entry(unique_id) {
            Entry::Vacant(slot) => {
                let owner = snapshot.node_id().unwrap_or(source).to_string();
                debug!(service = %snapshot.name(), node = %owner, "remote service discovered");
                slot.insert(ServiceProvider::Remote(self.remote(snapshot, owner)));
            }
            Entry::Occupied(mut slot) => match slot.get_mut() {
                ServiceProvider::Remote(remote) => remote.snapshot = snapshot,
                ServiceProvider::Local(service) => service.ingest_snapshot(snapshot),
            },
        }
    }

    /// Drop every remote provider owned by `node`.
    pub fn remove_node_services(&self, node: &str) -> usize {
        let before = self.services.len();
        self.services.retain(|_, provider| match provider {
            ServiceProvider::Remote(remote) => remote.node_id != node,
            ServiceProvider::Local(_) => true,
        });
        let removed = before.saturating_sub(self.services.len());
        if removed > 0 {
            info!(%node, removed, "removed services of lost node");
        }
        removed
    }

    // ── Lookup ─────────────────────────────────────────────────────

    pub fn contains(&self, unique_id: Uuid) -> bool {
        self.services.contains_key(&unique_id)
    }

    pub fn provider(&self, unique_id: Uuid) -> Option<ServiceProvider> {
        self.services.get(&unique_id).map(|p| p.value().clone())
    }

    pub fn provider_by_name(&self, name: &str) -> Option<ServiceProvider> {
        self.services
            .iter()
            .find(|p| p.snapshot().name() == name)
            .map(|p| p.value().clone())
    }

    pub fn local_service(&self, unique_id: Uuid) -> Option<Arc<LocalService>> {
        match self.provider(unique_id)? {
            ServiceProvider::Local(service) => Some(service),
            ServiceProvider::Remote(_) => None,
        }
    }

    pub fn local_services(&self) -> Vec<Arc<LocalService>> {
        self.services
            .iter()
            .filter_map(|p| match p.value() {
                ServiceProvider::Local(service) => Some(service.clone()),
                ServiceProvider::Remote(_) => None,
            })
            .collect()
    }

    pub fn service(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot> {
        self.services.get(&unique_id).map(|p| p.snapshot())
    }

    pub fn service_by_name(&self, name: &str) -> Option<ServiceInfoSnapshot> {
        self.provider_by_name(name).map(|p| p.snapshot())
    }

    pub fn services(&self) -> Vec<ServiceInfoSnapshot> {
        self.services.iter().map(|p| p.snapshot()).collect()
    }

    pub fn services_matching(&self, filter: &ServiceFilter) -> Vec<ServiceInfoSnapshot> {
        self.services
            .iter()
            .map(|p| p.snapshot())
            .filter(|s| filter.matches(s))
            .collect()
    }

    pub fn running_services(&self) -> Vec<ServiceInfoSnapshot> {
        self.services_matching(&ServiceFilter {
            lifecycle: Some(ServiceLifecycle::Running),
            ..ServiceFilter::default()
        })
    }

    pub fn services_by_task(&self, task: &str) -> Vec<ServiceInfoSnapshot> {
        self.services_matching(&ServiceFilter {
            task: Some(task.to_string()),
            ..ServiceFilter::default()
        })
    }

    pub fn services_by_group(&self, group: &str) -> Vec<ServiceInfoSnapshot> {
        self.services_matching(&ServiceFilter {
            group: Some(group.to_string()),
            ..ServiceFilter::default()
        })
    }

    pub fn services_by_environment(&self, environment: &str) -> Vec<ServiceInfoSnapshot> {
        self.services_matching(&ServiceFilter {
            environment: Some(environment.to_string()),
            ..ServiceFilter::default()
        })
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn service_count_by_task(&self, task: &str) -> usize {
        self.services_by_task(task).len()
    }

    pub fn service_count_by_group(&self, group: &str) -> usize {
        self.services_by_group(group).len()
    }

    // ── Local resources ────────────────────────────────────────────

    fn local_heap(&self, only_running: bool) -> u64 {
        self.local_services()
            .iter()
            .map(|s| s.snapshot())
            .filter(|s| !only_running || s.is_running())
            .map(|s| u64::from(s.configuration.max_heap_memory_mb()))
            .sum()
    }

    /// Heap (MB) of local RUNNING services.
    pub fn current_used_heap_memory(&self) -> u64 {
        self.local_heap(true)
    }

    /// Heap (MB) of every local service.
    pub fn current_reserved_heap_memory(&self) -> u64 {
        self.local_heap(false)
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servgrid_cluster::InMemoryNetwork;
    use servgrid_core::HostAndPort;
    use servgrid_state::ServiceConfiguration;

    async fn registry() -> ServiceRegistry {
        let network = InMemoryNetwork::new();
        let transport = Arc::new(network.transport("node-a").await);
        ServiceRegistry::new("node-a", transport, Duration::from_secs(1))
    }

    fn snapshot(task: &str, id: i32, node: &str, lifecycle: ServiceLifecycle) -> ServiceInfoSnapshot {
        let configuration = ServiceConfiguration::builder(task, "MINECRAFT_SERVER")
            .task_service_id(id)
            .node(Some(node.to_string()))
            .groups(["Global".to_string()])
            .build()
            .unwrap();
        ServiceInfoSnapshot {
            creation_time: 0,
            address: HostAndPort::new("127.0.0.1", 44955),
            connected_time: -1,
            lifecycle,
            process: Default::default(),
            configuration,
            properties: Default::default(),
        }
    }

    #[tokio::test]
    async fn updates_discover_refresh_and_remove() {
        let registry = registry().await;
        let prepared = snapshot("Lobby", 1, "node-b", ServiceLifecycle::Prepared);
        let id = prepared.unique_id();

        registry.handle_service_update(prepared.clone(), "node-b");
        let provider = registry.provider(id).unwrap();
        assert!(!provider.is_local());
        assert_eq!(registry.service_by_name("Lobby-1").unwrap().lifecycle, ServiceLifecycle::Prepared);

        let mut running = prepared.clone();
        running.lifecycle = ServiceLifecycle::Running;
        registry.handle_service_update(running, "node-b");
        assert_eq!(registry.running_services().len(), 1);

        let mut deleted = prepared;
        deleted.lifecycle = ServiceLifecycle::Deleted;
        registry.handle_service_update(deleted, "node-b");
        assert!(!registry.contains(id));
    }

    #[tokio::test]
    async fn duplicate_remote_registration_is_rejected() {
        let registry = registry().await;
        let s = snapshot("Lobby", 1, "node-b", ServiceLifecycle::Prepared);
        assert!(registry.register_remote(s.clone(), "node-b").is_some());
        assert!(registry.register_remote(s, "node-b").is_none());
        assert_eq!(registry.service_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_of_one_id_admit_a_single_provider() {
        let root = tempfile::tempdir().unwrap();
        let test = crate::context::testing::context(root.path()).await;
        let registry = test.ctx.registry.clone();
        let configuration = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
            .task_service_id(1)
            .build()
            .unwrap();

        let contenders = 32;
        let barrier = Arc::new(tokio::sync::Barrier::new(contenders * 2));
        let mut handles = Vec::new();
        for _ in 0..contenders {
            let service = LocalService::new(test.ctx.clone(), configuration.clone());
            handles.push({
                let (registry, barrier) = (registry.clone(), barrier.clone());
                tokio::spawn(async move {
                    barrier.wait().await;
                    registry.register_local(service).is_some()
                })
            });

            let mut remote = snapshot("Lobby", 1, "node-b", ServiceLifecycle::Prepared);
            remote.configuration = configuration.clone();
            let (registry, barrier) = (registry.clone(), barrier.clone());
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.register_remote(remote, "node-b").is_some()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(registry.service_count(), 1);
        assert!(registry.provider(configuration.service_id.unique_id).is_some());
    }

    #[tokio::test]
    async fn lost_node_services_are_dropped() {
        let registry = registry().await;
        registry.handle_service_update(snapshot("Lobby", 1, "node-b", ServiceLifecycle::Running), "node-b");
        registry.handle_service_update(snapshot("Lobby", 2, "node-b", ServiceLifecycle::Prepared), "node-b");
        registry.handle_service_update(snapshot("Proxy", 1, "node-c", ServiceLifecycle::Running), "node-c");

        assert_eq!(registry.remove_node_services("node-b"), 2);
        assert_eq!(registry.service_count(), 1);
        assert_eq!(registry.service_count_by_task("Proxy"), 1);
    }

    #[tokio::test]
    async fn filters_combine() {
        let registry = registry().await;
        registry.handle_service_update(snapshot("Lobby", 1, "node-b", ServiceLifecycle::Running), "node-b");
        registry.handle_service_update(snapshot("Lobby", 2, "node-c", ServiceLifecycle::Prepared), "node-c");

        assert_eq!(registry.service_count_by_group("Global"), 2);
        assert_eq!(registry.services_by_environment("MINECRAFT_SERVER").len(), 2);
        let filter = ServiceFilter {
            task: Some("Lobby".into()),
            node: Some("node-c".into()),
            ..ServiceFilter::default()
        };
        let matched = registry.services_matching(&filter);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name(), "Lobby-2");
    }

    #[tokio::test]
    async fn unanswered_remote_operations_yield_none() {
        let registry = registry().await;
        let s = snapshot("Lobby", 1, "node-b", ServiceLifecycle::Prepared);
        let provider = registry.register_remote(s, "node-b").unwrap();
        assert!(provider.start().await.is_none());
        assert!(provider.cached_log_lines().await.is_empty());
    }
}
