//! Locally owned services.
//!
//! ```text
//!   DEFINED ──► PREPARED ◄──────────────┐
//!                  │                    │
//!                  ▼                    │
//!               RUNNING ──► STOPPED ────┘
//!                  │
//!                  ▼
//!               DELETED   (reachable from every non-terminal state)
//! ```
//!
//! Every transition runs under the service's lifecycle gate, so concurrent
//! requests apply one after another.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use servgrid_cluster::{ClusterMessage, OperationOutcome, ServiceOperation, Target};
use servgrid_core::{HostAndPort, NodeId, epoch_millis};
use servgrid_runtime::{ConsoleLine, ConsoleLog, LaunchRequest, ServiceProcess};
use servgrid_state::{ProcessSnapshot, ServiceConfiguration, ServiceInfoSnapshot, ServiceLifecycle};

use crate::context::ServiceContext;
use crate::provisioning::ProvisioningQueues;
use crate::storage::blocking;

struct Snapshots {
    current: ServiceInfoSnapshot,
    last: ServiceInfoSnapshot,
}

/// A service whose process runs on this node.
pub struct LocalService {
    me: Weak<LocalService>,
    pub(crate) ctx: Arc<ServiceContext>,
    directory: PathBuf,
    connection_key: String,
    console: Arc<ConsoleLog>,
    gate: tokio::sync::Mutex<()>,
    snapshots: RwLock<Snapshots>,
    queues: Mutex<ProvisioningQueues>,
    process: tokio::sync::Mutex<Option<Arc<dyn ServiceProcess>>>,
    log_targets: Mutex<BTreeSet<(NodeId, String)>>,
    logged_start_block: AtomicBool,
}

fn service_directory(ctx: &ServiceContext, configuration: &ServiceConfiguration) -> PathBuf {
    let name = configuration.name();
    if configuration.static_service {
        ctx.config.persistent_services_dir.join(name)
    } else {
        ctx.config
            .temp_services_dir
            .join(format!("{name}_{}", configuration.service_id.unique_id))
    }
}

fn connection_key() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

impl LocalService {
    /// Create the service in DEFINED. It is not registered until
    /// [`LocalService::handle_register`] runs.
    pub fn new(ctx: Arc<ServiceContext>, configuration: ServiceConfiguration) -> Arc<Self> {
        let name = configuration.name();
        let host = configuration
            .host_address
            .clone()
            .or_else(|| ctx.config.listeners.first().map(|l| l.host.clone()))
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let snapshot = ServiceInfoSnapshot {
            creation_time: epoch_millis(),
            address: HostAndPort::new(host, configuration.port),
            connected_time: -1,
            lifecycle: ServiceLifecycle::Defined,
            process: ProcessSnapshot::empty(),
            properties: configuration.properties.clone(),
            configuration,
        };

        let directory = service_directory(&ctx, &snapshot.configuration);
        let console = Arc::new(ConsoleLog::new(name, ctx.config.log_cache_lines));
        let feed = console.subscribe();

        let service = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ctx,
            directory,
            connection_key: connection_key(),
            console,
            gate: tokio::sync::Mutex::new(()),
            snapshots: RwLock::new(Snapshots {
                current: snapshot.clone(),
                last: snapshot,
            }),
            queues: Mutex::new(ProvisioningQueues::default()),
            process: tokio::sync::Mutex::new(None),
            log_targets: Mutex::new(BTreeSet::new()),
            logged_start_block: AtomicBool::new(false),
        });
        tokio::spawn(forward_console(Arc::downgrade(&service), feed));
        service
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn unique_id(&self) -> Uuid {
        self.read_snapshots().current.unique_id()
    }

    pub fn name(&self) -> String {
        self.read_snapshots().current.name()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn connection_key(&self) -> &str {
        &self.connection_key
    }

    pub fn snapshot(&self) -> ServiceInfoSnapshot {
        self.read_snapshots().current.clone()
    }

    /// Snapshot before the most recent change.
    pub fn last_snapshot(&self) -> ServiceInfoSnapshot {
        self.read_snapshots().last.clone()
    }

    pub fn lifecycle(&self) -> ServiceLifecycle {
        self.read_snapshots().current.lifecycle
    }

    pub fn configuration(&self) -> ServiceConfiguration {
        self.read_snapshots().current.configuration.clone()
    }

    pub fn console(&self) -> &Arc<ConsoleLog> {
        &self.console
    }

    fn read_snapshots(&self) -> std::sync::RwLockReadGuard<'_, Snapshots> {
        self.snapshots.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn queues(&self) -> MutexGuard<'_, ProvisioningQueues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the snapshot with one received from the cluster.
    pub fn ingest_snapshot(&self, snapshot: ServiceInfoSnapshot) {
        let mut guard = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        let snapshots = &mut *guard;
        snapshots.last = std::mem::replace(&mut snapshots.current, snapshot);
    }

    // ── Registration ───────────────────────────────────────────────

    /// Register with the local registry and move to PREPARED.
    ///
    /// Returns `None` if a service with the same id is already registered.
    pub async fn handle_register(&self) -> Option<ServiceInfoSnapshot> {
        let me = self.me.upgrade()?;
        if self.ctx.registry.register_local(me).is_none() {
            warn!(service = %self.name(), id = %self.unique_id(), "service id already registered");
            return None;
        }
        let _gate = self.gate.lock().await;
        self.transition(ServiceLifecycle::Prepared).await;
        info!(service = %self.name(), node = %self.ctx.node_id, "service registered");
        Some(self.snapshot())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    pub async fn update_lifecycle(&self, target: ServiceLifecycle) {
        let _gate = self.gate.lock().await;
        self.transition(target).await;
    }

    pub async fn start(&self) {
        self.update_lifecycle(ServiceLifecycle::Running).await;
    }

    pub async fn stop(&self) {
        self.update_lifecycle(ServiceLifecycle::Stopped).await;
    }

    pub async fn delete(&self) {
        self.update_lifecycle(ServiceLifecycle::Deleted).await;
    }

    /// Stop without auto-delete, then start again.
    pub async fn restart(&self) {
        let _gate = self.gate.lock().await;
        self.stop_locked(false).await;
        self.transition(ServiceLifecycle::Running).await;
    }

    /// Delete, removing the directory even for static services.
    pub async fn delete_files(&self) {
        let _gate = self.gate.lock().await;
        if !self.lifecycle().can_change_to(ServiceLifecycle::Deleted)
            || self.vetoed(ServiceLifecycle::Deleted)
        {
            return;
        }
        self.remove(true).await;
        self.push_snapshot(ServiceLifecycle::Deleted).await;
    }

    async fn transition(&self, target: ServiceLifecycle) {
        let current = self.lifecycle();
        if current == ServiceLifecycle::Running && target == ServiceLifecycle::Prepared {
            // A running service reaches PREPARED only through STOPPED.
            self.stop_locked(false).await;
            return;
        }
        if !current.can_change_to(target) {
            debug!(service = %self.name(), from = %current, to = %target, "lifecycle change ignored");
            return;
        }
        match target {
            ServiceLifecycle::Deleted => {
                if !self.vetoed(target) {
                    self.remove(false).await;
                    self.push_snapshot(target).await;
                    info!(service = %self.name(), "service deleted");
                }
            }
            ServiceLifecycle::Running => {
                if !self.vetoed(target) && self.admit() && self.prepare().await && self.launch().await {
                    self.push_snapshot(target).await;
                    info!(service = %self.name(), "service started");
                }
            }
            ServiceLifecycle::Stopped => {
                let auto_delete = self.configuration().auto_delete_on_stop;
                self.stop_locked(auto_delete).await;
            }
            ServiceLifecycle::Prepared => {
                self.queues().clear_installed();
                self.push_snapshot(target).await;
            }
            ServiceLifecycle::Defined => {}
        }
    }

    async fn stop_locked(&self, delete_on_stop: bool) {
        if !self.lifecycle().can_change_to(ServiceLifecycle::Stopped)
            || self.vetoed(ServiceLifecycle::Stopped)
        {
            return;
        }
        if delete_on_stop {
            self.remove(false).await;
            self.push_snapshot(ServiceLifecycle::Deleted).await;
            info!(service = %self.name(), "service stopped and deleted");
        } else if self.lifecycle() == ServiceLifecycle::Running {
            self.stop_process().await;
            self.remove_files_after_stop().await;
            self.execute_deployments(true).await;
            self.push_snapshot(ServiceLifecycle::Stopped).await;
            self.queues().clear_installed();
            self.push_snapshot(ServiceLifecycle::Prepared).await;
            info!(service = %self.name(), "service stopped");
        }
    }

    /// `true` if a listener cancelled the change.
    fn vetoed(&self, target: ServiceLifecycle) -> bool {
        let cancelled = self.ctx.events.pre_lifecycle(&self.snapshot(), target);
        if cancelled {
            debug!(service = %self.name(), %target, "lifecycle change cancelled by listener");
        }
        cancelled
    }

    /// Node resource check before a start.
    fn admit(&self) -> bool {
        let heap = u64::from(self.configuration().max_heap_memory_mb());
        let used = self.ctx.registry.current_used_heap_memory();
        let max = self.ctx.config.max_memory_mb;
        let cpu = self.ctx.monitor.cpu_load();
        let cpu_limit = self.ctx.config.max_cpu_usage_to_start_services;

        let reason = if used + heap >= max {
            "memory"
        } else if cpu >= cpu_limit {
            "cpu"
        } else {
            self.logged_start_block.store(false, Ordering::Relaxed);
            return true;
        };

        let first = !self.logged_start_block.swap(true, Ordering::Relaxed);
        if self.ctx.config.run_blocked_service_start_later {
            if first {
                info!(service = %self.name(), reason, used_mb = used, heap_mb = heap, cpu, "start blocked, retrying on next tick");
            }
            if let Some(me) = self.me.upgrade() {
                self.ctx.tick.run_next_tick(async move { me.start().await });
            }
        } else {
            warn!(service = %self.name(), reason, used_mb = used, heap_mb = heap, cpu, "start blocked by node resources");
        }
        false
    }

    /// Materialize the directory and write everything the process needs.
    async fn prepare(&self) -> bool {
        let first_startup = !tokio::fs::try_exists(&self.directory).await.unwrap_or(false);
        if let Err(e) = tokio::fs::create_dir_all(&self.directory).await {
            warn!(service = %self.name(), dir = ?self.directory, error = %e, "cannot create service directory");
            return false;
        }

        let ssl_config = self.ctx.config.ssl.clone();
        let directory = self.directory.clone();
        let ssl = match blocking(move || crate::bootstrap::copy_ssl_material(&ssl_config, &directory)).await {
            Ok(ssl) => ssl,
            Err(e) => {
                warn!(service = %self.name(), error = %e, "copying ssl material failed");
                None
            }
        };

        let configuration = self.configuration();
        self.queues().enqueue_configured(&configuration);
        self.ctx.events.pre_prepare(&self.snapshot());

        self.include_waiting_inclusions().await;
        self.include_waiting_templates(first_startup).await;

        if let Some(preparer) = self.ctx.preparers.get(configuration.environment()) {
            let directory = self.directory.clone();
            let snapshot = self.snapshot();
            if let Err(e) = blocking(move || preparer.configure(&directory, &snapshot)).await {
                warn!(service = %self.name(), error = %e, "configuration rewrite failed");
            }
        }

        match crate::bootstrap::select_connect_listener(&self.ctx.config.listeners) {
            Some(target_listener) => {
                let descriptor = crate::bootstrap::BootstrapDescriptor {
                    target_listener,
                    connection_key: self.connection_key.clone(),
                    service_info_snapshot: self.snapshot(),
                    service_configuration: configuration,
                    ssl_configuration: ssl,
                };
                let directory = self.directory.clone();
                if let Err(e) = blocking(move || descriptor.write_to(&directory)).await {
                    warn!(service = %self.name(), error = %e, "writing bootstrap descriptor failed");
                }
            }
            None => warn!(service = %self.name(), "node has no listeners, skipping bootstrap descriptor"),
        }

        self.ctx.events.post_prepare(&self.snapshot());
        true
    }

    async fn launch(&self) -> bool {
        let configuration = self.configuration();
        let Some(runtime) = self.ctx.runtime(&configuration.runtime) else {
            warn!(service = %self.name(), runtime = %configuration.runtime, "unknown runtime");
            return false;
        };
        let request = LaunchRequest {
            environment: self.ctx.config.environment(configuration.environment()),
            java_command: configuration
                .java_command
                .clone()
                .unwrap_or_else(|| self.ctx.config.java_command.clone()),
            working_dir: self.directory.clone(),
            configuration,
        };
        match runtime.launch(&request, self.console.clone()).await {
            Ok(process) => {
                *self.process.lock().await = Some(process);
                true
            }
            Err(e) => {
                warn!(service = %self.name(), error = %e, "process launch failed");
                false
            }
        }
    }

    async fn stop_process(&self) {
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            let settings = self.ctx.config.environment(self.configuration().environment());
            process
                .stop(
                    &settings.shutdown_commands,
                    self.ctx.config.process_termination_timeout(),
                )
                .await;
        }
    }

    /// Stop the process and tear down files; the directory survives for
    /// static services unless `force_directory`.
    async fn remove(&self, force_directory: bool) {
        self.stop_process().await;
        self.remove_files_after_stop().await;
        self.execute_deployments(true).await;

        if !self.configuration().static_service || force_directory {
            match tokio::fs::remove_dir_all(&self.directory).await {
                Ok(()) => debug!(service = %self.name(), dir = ?self.directory, "service directory removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(service = %self.name(), error = %e, "removing service directory failed"),
            }
        }
    }

    async fn process_snapshot(&self) -> ProcessSnapshot {
        let process = self.process.lock().await.clone();
        match process {
            Some(process) if process.alive().await => {
                let pid = process.pid();
                let (cpu_usage, used_memory_bytes) = pid
                    .and_then(|pid| self.ctx.monitor.process_usage(pid))
                    .unwrap_or((-1.0, 0));
                ProcessSnapshot {
                    pid,
                    cpu_usage,
                    used_memory_bytes,
                    max_heap_memory_mb: self.configuration().max_heap_memory_mb(),
                }
            }
            _ => ProcessSnapshot::empty(),
        }
    }

    /// Record a new snapshot in `lifecycle` and announce it.
    async fn push_snapshot(&self, lifecycle: ServiceLifecycle) -> ServiceInfoSnapshot {
        let process = self.process_snapshot().await;
        let (previous, snapshot) = {
            let mut guard = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
            let snapshots = &mut *guard;
            let previous = snapshots.current.lifecycle;
            let mut next = snapshots.current.clone();
            next.lifecycle = lifecycle;
            next.process = process;
            snapshots.last = std::mem::replace(&mut snapshots.current, next.clone());
            (previous, next)
        };

        if lifecycle == ServiceLifecycle::Deleted {
            self.ctx.registry.unregister(snapshot.unique_id());
        }
        self.ctx.events.post_lifecycle(&snapshot, previous);

        let message = ClusterMessage::ServiceLifecycleUpdate {
            previous,
            snapshot: Box::new(snapshot.clone()),
        };
        if let Err(e) = self.ctx.transport.send(Target::All, message).await {
            warn!(service = %snapshot.name(), error = %e, "lifecycle update not broadcast");
        }
        snapshot
    }

    // ── Process interaction ────────────────────────────────────────

    pub async fn alive(&self) -> bool {
        let process = self.process.lock().await.clone();
        match process {
            Some(process) => process.alive().await,
            None => false,
        }
    }

    /// Write a line to the process's stdin. Ignored without a process.
    pub async fn run_command(&self, line: &str) {
        let process = self.process.lock().await.clone();
        match process {
            Some(process) => {
                if let Err(e) = process.write_line(line).await {
                    warn!(service = %self.name(), error = %e, "command not delivered");
                }
            }
            None => debug!(service = %self.name(), "no process, command ignored"),
        }
    }

    /// Re-sample the process and broadcast the result.
    pub async fn force_update_snapshot(&self) -> ServiceInfoSnapshot {
        let _gate = self.gate.lock().await;
        self.push_snapshot(self.lifecycle()).await
    }

    /// Toggle forwarding of console output to `channel` on `node`. Returns
    /// whether forwarding is now enabled.
    pub fn toggle_log_streaming(&self, node: NodeId, channel: String) -> bool {
        let mut targets = self.log_targets.lock().unwrap_or_else(PoisonError::into_inner);
        let target = (node, channel);
        if targets.remove(&target) {
            false
        } else {
            targets.insert(target);
            true
        }
    }

    pub fn cached_log_lines(&self) -> Vec<String> {
        self.console.lines()
    }

    async fn forward_line(&self, line: &ConsoleLine) {
        let targets: Vec<(NodeId, String)> = self
            .log_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }
        let name = self.name();
        for (node, channel) in targets {
            if node == self.ctx.node_id {
                self.ctx
                    .events
                    .console_line(&name, &channel, &line.line, line.error_stream);
                continue;
            }
            let message = ClusterMessage::ServiceConsoleLine {
                unique_id: self.unique_id(),
                service_name: name.clone(),
                channel,
                line: line.line.clone(),
                error_stream: line.error_stream,
            };
            if let Err(e) = self.ctx.transport.send(Target::Node(node), message).await {
                debug!(service = %name, error = %e, "console line not forwarded");
            }
        }
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Apply a provider operation to this service.
    pub async fn execute(&self, operation: ServiceOperation) -> OperationOutcome {
        match operation {
            ServiceOperation::Start => self.start().await,
            ServiceOperation::Stop => self.stop().await,
            ServiceOperation::Restart => self.restart().await,
            ServiceOperation::Delete => self.delete().await,
            ServiceOperation::DeleteFiles => self.delete_files().await,
            ServiceOperation::RunCommand { line } => self.run_command(&line).await,
            ServiceOperation::AddTemplate { template } => self.add_template(template),
            ServiceOperation::AddInclusion { inclusion } => self.add_inclusion(inclusion),
            ServiceOperation::AddDeployment { deployment } => self.add_deployment(deployment),
            ServiceOperation::IncludeWaitingTemplates { force } => {
                self.include_waiting_templates(force).await
            }
            ServiceOperation::IncludeWaitingInclusions => self.include_waiting_inclusions().await,
            ServiceOperation::DeployResources { remove_deployments } => {
                self.execute_deployments(remove_deployments).await
            }
            ServiceOperation::ForceUpdateSnapshot => {
                return OperationOutcome::Snapshot {
                    snapshot: Some(Box::new(self.force_update_snapshot().await)),
                };
            }
            ServiceOperation::ToggleLogStreaming { node_id, channel } => {
                return OperationOutcome::Toggled {
                    enabled: self.toggle_log_streaming(node_id, channel),
                };
            }
            ServiceOperation::CachedLogLines => {
                return OperationOutcome::LogLines {
                    lines: self.cached_log_lines(),
                };
            }
        }
        OperationOutcome::Snapshot {
            snapshot: Some(Box::new(self.snapshot())),
        }
    }
}

async fn forward_console(service: Weak<LocalService>, mut feed: broadcast::Receiver<ConsoleLine>) {
    loop {
        match feed.recv().await {
            Ok(line) => {
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.forward_line(&line).await;
            }
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "console forwarding lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;

    fn lobby() -> ServiceConfiguration {
        ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
            .task_service_id(1)
            .max_heap_memory(512)
            .auto_delete_on_stop(false)
            .deleted_files_after_stop(["crash.log".to_string()])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn defined_service_does_not_launch() {
        let root = tempfile::tempdir().unwrap();
        let test = context(root.path()).await;
        let service = LocalService::new(test.ctx.clone(), lobby());

        service.update_lifecycle(ServiceLifecycle::Running).await;

        assert_eq!(service.lifecycle(), ServiceLifecycle::Defined);
        assert_eq!(test.runtime.launched(), 0);
        assert!(!service.directory().exists());
    }

    #[tokio::test]
    async fn deleted_service_ignores_start() {
        let root = tempfile::tempdir().unwrap();
        let test = context(root.path()).await;
        let service = LocalService::new(test.ctx.clone(), lobby());
        assert!(service.handle_register().await.is_some());

        service.delete().await;
        assert_eq!(service.lifecycle(), ServiceLifecycle::Deleted);
        assert!(test.ctx.registry.provider(service.unique_id()).is_none());

        service.start().await;
        assert_eq!(service.lifecycle(), ServiceLifecycle::Deleted);
        assert_eq!(test.runtime.launched(), 0);
    }

    #[tokio::test]
    async fn running_service_is_stopped_on_its_way_to_prepared() {
        let root = tempfile::tempdir().unwrap();
        let test = context(root.path()).await;
        let service = LocalService::new(test.ctx.clone(), lobby());
        service.handle_register().await.unwrap();
        service.start().await;
        assert_eq!(service.lifecycle(), ServiceLifecycle::Running);
        assert_eq!(test.runtime.launched(), 1);
        std::fs::write(service.directory().join("crash.log"), "boom").unwrap();

        service.update_lifecycle(ServiceLifecycle::Prepared).await;

        assert_eq!(service.lifecycle(), ServiceLifecycle::Prepared);
        assert_eq!(service.last_snapshot().lifecycle, ServiceLifecycle::Stopped);
        assert!(!test.runtime.last().is_alive());
        assert!(!service.alive().await);
        assert!(!service.directory().join("crash.log").exists());
        assert!(service.directory().exists());
        assert!(test.ctx.registry.provider(service.unique_id()).is_some());

        service.start().await;
        assert_eq!(service.lifecycle(), ServiceLifecycle::Running);
        assert_eq!(test.runtime.launched(), 2);
    }
}
