//! Node assembly and the main loop.
//!
//! A [`Node`] wires registry, factory, cluster agent and message handler
//! together and runs the tick loop:
//!
//! ```text
//!   every tick (100ms)   run queued tasks
//!   every 10 ticks       watchdog, minimum service counts (head only),
//!                        drain shutdown
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use servgrid_cluster::{
    AgentConfig, MembershipManager, MessageHandler, NodeAgent, NodeInfoSource, Transport,
};
use servgrid_core::{NodeConfig, epoch_millis};
use servgrid_placement::{node_candidates, select_prepared_service};
use servgrid_runtime::{JvmRuntime, ServiceRuntime, SysinfoMonitor, SystemMonitor};
use servgrid_state::{
    NodeInfo, NodeSnapshot, ServiceConfiguration, ServiceCreateResult, ServiceTask, StateStore,
};

use crate::context::ServiceContext;
use crate::error::SchedulerResult;
use crate::events::{EventManager, ServiceListener};
use crate::factory::ServiceFactory;
use crate::handler::NodeMessageHandler;
use crate::preparer::{ConfigurationPreparer, PreparerRegistry};
use crate::registry::{ServiceProvider, ServiceRegistry};
use crate::storage::{LocalTemplateStorage, TemplateStorage, TemplateStorageRegistry};
use crate::tick::{TICK_INTERVAL, TickQueue, WATCHDOG_EVERY_TICKS, tick_channel};
use crate::watchdog;

fn node_info(ctx: &ServiceContext, startup_time: u64, draining: bool) -> NodeInfo {
    NodeInfo {
        id: ctx.node_id.clone(),
        listeners: ctx.config.listeners.clone(),
        max_memory_mb: ctx.config.max_memory_mb,
        startup_time,
        snapshot: NodeSnapshot {
            used_memory_mb: ctx.registry.current_used_heap_memory(),
            reserved_memory_mb: ctx.registry.current_reserved_heap_memory(),
            cpu_load: ctx.monitor.cpu_load(),
            service_count: u32::try_from(ctx.registry.local_services().len()).unwrap_or(u32::MAX),
            draining,
        },
        last_heartbeat: 0,
    }
}

/// Builder for [`Node`].
pub struct NodeBuilder {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    store: Option<StateStore>,
    runtimes: Vec<Arc<dyn ServiceRuntime>>,
    monitor: Option<Arc<dyn SystemMonitor>>,
    listeners: Vec<Arc<dyn ServiceListener>>,
    storages: Vec<Arc<dyn TemplateStorage>>,
    preparers: Vec<(String, Arc<dyn ConfigurationPreparer>)>,
    agent: AgentConfig,
}

impl NodeBuilder {
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Add a runtime. Replaces the default JVM runtime when names match.
    pub fn with_runtime(mut self, runtime: Arc<dyn ServiceRuntime>) -> Self {
        self.runtimes.push(runtime);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn SystemMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ServiceListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn TemplateStorage>) -> Self {
        self.storages.push(storage);
        self
    }

    pub fn with_preparer(
        mut self,
        environment: impl Into<String>,
        preparer: Arc<dyn ConfigurationPreparer>,
    ) -> Self {
        self.preparers.push((environment.into(), preparer));
        self
    }

    pub fn with_agent_config(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    /// Assemble the node. Must run inside a Tokio runtime.
    pub fn build(self) -> SchedulerResult<Arc<Node>> {
        let config = Arc::new(self.config);
        let store = match self.store {
            Some(store) => store,
            None => match &config.state_path {
                Some(path) => StateStore::open(path)?,
                None => StateStore::open_in_memory()?,
            },
        };

        let mut runtimes: HashMap<String, Arc<dyn ServiceRuntime>> = HashMap::new();
        let jvm: Arc<dyn ServiceRuntime> = Arc::new(JvmRuntime::new(config.launcher.clone()));
        for runtime in std::iter::once(jvm).chain(self.runtimes) {
            runtimes.insert(runtime.name().to_string(), runtime);
        }

        let mut storages = TemplateStorageRegistry::new();
        storages.register(Arc::new(LocalTemplateStorage::new(config.template_dir.clone())));
        for storage in self.storages {
            storages.register(storage);
        }

        let mut preparers = PreparerRegistry::from_config(&config);
        for (environment, preparer) in self.preparers {
            preparers.register(environment, preparer);
        }

        let events = Arc::new(EventManager::new());
        for listener in self.listeners {
            events.register(listener);
        }

        let registry = Arc::new(ServiceRegistry::new(
            config.node_id.clone(),
            self.transport.clone(),
            config.start_timeout(),
        ));
        let (tick, queue) = tick_channel();
        let monitor: Arc<dyn SystemMonitor> = match self.monitor {
            Some(monitor) => monitor,
            None => Arc::new(SysinfoMonitor::new()),
        };
        let ctx = Arc::new(ServiceContext {
            node_id: config.node_id.clone(),
            config: config.clone(),
            registry: registry.clone(),
            transport: self.transport.clone(),
            events: events.clone(),
            storages,
            runtimes,
            preparers,
            monitor,
            tick,
        });

        let membership = Arc::new(
            MembershipManager::new(store.clone(), config.node_id.clone())
                .with_dead_timeout(config.heartbeat_timeout()),
        );
        let factory = ServiceFactory::new(ctx.clone(), membership.clone(), Arc::new(store.clone()));
        let handler = Arc::new(NodeMessageHandler::new(
            membership.clone(),
            registry.clone(),
            factory.clone(),
            events,
        ));

        let startup_time = epoch_millis();
        let draining = Arc::new(AtomicBool::new(false));
        let source: NodeInfoSource = {
            let ctx = ctx.clone();
            let draining = draining.clone();
            Arc::new(move || node_info(&ctx, startup_time, draining.load(Ordering::Relaxed)))
        };
        let lost_registry = registry.clone();
        let agent = NodeAgent::new(self.agent, membership.clone(), self.transport, source)
            .with_node_lost_callback(Arc::new(move |node: &str| {
                lost_registry.remove_node_services(node);
            }));

        let (shutdown, _) = watch::channel(false);
        info!(node_id = %config.node_id, "node assembled");
        Ok(Arc::new(Node {
            ctx,
            store,
            membership,
            factory,
            handler,
            agent,
            tick_queue: Mutex::new(Some(queue)),
            draining,
            shutdown,
        }))
    }
}

/// One orchestrator node.
pub struct Node {
    ctx: Arc<ServiceContext>,
    store: StateStore,
    membership: Arc<MembershipManager>,
    factory: Arc<ServiceFactory>,
    handler: Arc<NodeMessageHandler>,
    agent: NodeAgent,
    tick_queue: Mutex<Option<TickQueue>>,
    draining: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    pub fn builder(config: NodeConfig, transport: Arc<dyn Transport>) -> NodeBuilder {
        NodeBuilder {
            config,
            transport,
            store: None,
            runtimes: Vec::new(),
            monitor: None,
            listeners: Vec::new(),
            storages: Vec::new(),
            preparers: Vec::new(),
            agent: AgentConfig::default(),
        }
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn node_id(&self) -> &str {
        &self.ctx.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.ctx.registry
    }

    pub fn membership(&self) -> &Arc<MembershipManager> {
        &self.membership
    }

    pub fn factory(&self) -> &Arc<ServiceFactory> {
        &self.factory
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.ctx.events
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Handler to attach to the cluster transport.
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.handler.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    // ── Cluster ────────────────────────────────────────────────────

    /// Join the cluster and announce the local node.
    pub async fn join(&self) -> SchedulerResult<()> {
        self.agent.join().await?;
        Ok(())
    }

    /// One heartbeat round outside the main loop.
    pub async fn heartbeat(&self) {
        self.agent.beat().await;
    }

    /// Stop taking new services. The node shuts down once it runs none.
    pub fn set_draining(&self, draining: bool) -> SchedulerResult<()> {
        self.draining.store(draining, Ordering::Relaxed);
        self.membership.set_draining(self.node_id(), draining)?;
        Ok(())
    }

    // ── Services ───────────────────────────────────────────────────

    pub async fn create_service(&self, configuration: &ServiceConfiguration) -> ServiceCreateResult {
        self.factory.create_service(configuration).await
    }

    /// Create and, once created, start the service.
    pub async fn create_and_start(&self, configuration: &ServiceConfiguration) -> ServiceCreateResult {
        let result = self.factory.create_service(configuration).await;
        let Some(created) = result.snapshot() else {
            return result;
        };
        match self.provider(created.unique_id()) {
            Some(provider) => match provider.start().await {
                Some(started) => ServiceCreateResult::created(started),
                None => result,
            },
            None => result,
        }
    }

    /// Reuse a PREPARED service of `task` on a node with room, or create one.
    pub async fn select_or_create_service(&self, task: &ServiceTask) -> ServiceCreateResult {
        let services = self.ctx.registry.services();
        match self.membership.placement_view() {
            Ok(nodes) => {
                let candidates = node_candidates(&nodes, &services);
                if let Some(prepared) = select_prepared_service(task, &services, &candidates) {
                    debug!(task = %task.name, service = %prepared.name(), "reusing prepared service");
                    return ServiceCreateResult::created(prepared.clone());
                }
            }
            Err(e) => warn!(error = %e, "cannot read cluster members"),
        }

        match ServiceConfiguration::from_task(task).build() {
            Ok(configuration) => self.create_service(&configuration).await,
            Err(e) => {
                warn!(task = %task.name, error = %e, "invalid task");
                ServiceCreateResult::Failed
            }
        }
    }

    pub fn watch_creation(
        &self,
        creation_id: Uuid,
    ) -> Option<watch::Receiver<Option<ServiceCreateResult>>> {
        self.factory.watch_creation(creation_id)
    }

    pub fn provider(&self, unique_id: Uuid) -> Option<ServiceProvider> {
        self.ctx.registry.provider(unique_id)
    }

    pub fn provider_by_name(&self, name: &str) -> Option<ServiceProvider> {
        self.ctx.registry.provider_by_name(name)
    }

    /// Delete every local service.
    pub async fn delete_local_services(&self) {
        for service in self.ctx.registry.local_services() {
            service.delete().await;
        }
    }

    // ── Main loop ──────────────────────────────────────────────────

    /// Stop local services whose process died.
    pub async fn run_watchdog(&self) -> usize {
        watchdog::stop_dead_services(&self.ctx.registry, &self.ctx.events).await
    }

    /// Start services for tasks below their minimum count. Head only.
    pub async fn ensure_min_services(&self) {
        match self.membership.is_local_head() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(error = %e, "cannot determine head node");
                return;
            }
        }
        let tasks = match self.store.list_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "cannot load tasks");
                return;
            }
        };

        for task in tasks
            .iter()
            .filter(|t| !t.maintenance && t.min_service_count > 0)
        {
            let running = self
                .ctx
                .registry
                .services_by_task(&task.name)
                .iter()
                .filter(|s| s.is_running())
                .count();
            if running >= task.min_service_count as usize {
                continue;
            }
            debug!(task = %task.name, running, min = task.min_service_count, "task below minimum");
            if let ServiceCreateResult::Created { snapshot } = self.select_or_create_service(task).await {
                if let Some(provider) = self.provider(snapshot.unique_id()) {
                    provider.start().await;
                }
            }
        }
    }

    /// One maintenance pass of the main loop.
    pub async fn maintain(&self) {
        self.run_watchdog().await;
        self.factory.expire_pending();
        self.ensure_min_services().await;

        if self.is_draining() && self.ctx.registry.local_services().is_empty() {
            info!(node_id = %self.node_id(), "drained node has no services left, shutting down");
            self.shutdown();
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Run heartbeats and the tick loop until [`Node::shutdown`], then
    /// delete local services.
    pub async fn run(self: Arc<Self>) {
        let queue = self
            .tick_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut queue) = queue else {
            warn!(node_id = %self.node_id(), "node loop already running");
            return;
        };

        let agent = {
            let node = self.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { node.agent.run(shutdown).await })
        };

        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        let mut tick: u64 = 0;
        info!(node_id = %self.node_id(), "node loop started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    tick += 1;
                    queue.drain();
                    if tick % WATCHDOG_EVERY_TICKS == 0 {
                        self.maintain().await;
                    }
                }
                _ = shutdown.changed() => {}
            }
        }

        info!(node_id = %self.node_id(), "node loop shutting down");
        self.delete_local_services().await;
        if let Err(e) = agent.await {
            warn!(error = %e, "heartbeat task failed");
        }
        if let Err(e) = self.membership.leave(self.node_id()) {
            warn!(error = %e, "leaving cluster failed");
        }
    }
}

/// Wait for a deferred creation to finish.
pub async fn await_creation(
    mut receiver: watch::Receiver<Option<ServiceCreateResult>>,
    timeout: Duration,
) -> Option<ServiceCreateResult> {
    let wait = async {
        loop {
            if let Some(result) = receiver.borrow_and_update().clone() {
                return Some(result);
            }
            if receiver.changed().await.is_err() {
                return receiver.borrow().clone();
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}
