//! Multi-node scenarios over the in-memory network.
//!
//! Processes are faked: the runtime hands out handles whose liveness the
//! tests flip by hand, so lifecycle, watchdog and placement paths run
//! without spawning anything.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use servgrid_cluster::{
    ClusterMessage, ClusterResult, InMemoryNetwork, InMemoryTransport, Target, Transport,
};
use servgrid_core::{DEFAULT_RUNTIME, NodeConfig};
use servgrid_runtime::{
    ConsoleLog, LaunchRequest, RuntimeResult, ServiceProcess, ServiceRuntime, SystemMonitor,
};
use servgrid_scheduler::{Node, ServiceListener, await_creation};
use servgrid_state::{
    RetryConfiguration, ServiceConfiguration, ServiceCreateResult, ServiceInfoSnapshot,
    ServiceLifecycle,
};

// ── Fakes ──────────────────────────────────────────────────────

struct FakeProcess {
    alive: AtomicBool,
    commands: Mutex<Vec<String>>,
}

#[async_trait]
impl ServiceProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn write_line(&self, line: &str) -> RuntimeResult<()> {
        self.commands.lock().unwrap().push(line.to_string());
        Ok(())
    }

    async fn stop(&self, _shutdown_commands: &[String], _timeout: Duration) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeRuntime {
    processes: Mutex<Vec<Arc<FakeProcess>>>,
}

impl FakeRuntime {
    fn launched(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    fn last(&self) -> Arc<FakeProcess> {
        self.processes.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ServiceRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        DEFAULT_RUNTIME
    }

    async fn launch(
        &self,
        _request: &LaunchRequest,
        _console: Arc<ConsoleLog>,
    ) -> RuntimeResult<Arc<dyn ServiceProcess>> {
        let process = Arc::new(FakeProcess {
            alive: AtomicBool::new(true),
            commands: Mutex::new(Vec::new()),
        });
        self.processes.lock().unwrap().push(process.clone());
        Ok(process)
    }
}

struct IdleMonitor;

impl SystemMonitor for IdleMonitor {
    fn cpu_load(&self) -> f64 {
        0.0
    }

    fn process_usage(&self, _pid: u32) -> Option<(f64, u64)> {
        None
    }
}

#[derive(Default)]
struct Recorder {
    lifecycles: Mutex<Vec<ServiceLifecycle>>,
    force_stops: AtomicUsize,
    deferred: Mutex<Vec<(Uuid, Vec<String>, ServiceCreateResult)>>,
}

impl ServiceListener for Recorder {
    fn post_lifecycle(&self, snapshot: &ServiceInfoSnapshot, _previous: ServiceLifecycle) {
        self.lifecycles.lock().unwrap().push(snapshot.lifecycle);
    }

    fn pre_force_stop(&self, _snapshot: &ServiceInfoSnapshot) {
        self.force_stops.fetch_add(1, Ordering::SeqCst);
    }

    fn deferred_create_result(
        &self,
        creation_id: Uuid,
        channels: &[String],
        result: &ServiceCreateResult,
    ) {
        self.deferred
            .lock()
            .unwrap()
            .push((creation_id, channels.to_vec(), result.clone()));
    }
}

/// Delivers every message but loses the replies to the first
/// `FinishServiceRegistration` queries.
struct LostFinishReplies {
    inner: InMemoryTransport,
    remaining: AtomicUsize,
}

#[async_trait]
impl Transport for LostFinishReplies {
    fn local_node(&self) -> &str {
        self.inner.local_node()
    }

    async fn send(&self, target: Target, message: ClusterMessage) -> ClusterResult<()> {
        self.inner.send(target, message).await
    }

    async fn send_query(
        &self,
        target: Target,
        message: ClusterMessage,
        timeout: Duration,
    ) -> Option<ClusterMessage> {
        let finish = matches!(message, ClusterMessage::FinishServiceRegistration { .. });
        let reply = self.inner.send_query(target, message, timeout).await;
        let lose = finish
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if lose { None } else { reply }
    }
}

// ── Harness ────────────────────────────────────────────────────

struct TestNode {
    node: Arc<Node>,
    runtime: Arc<FakeRuntime>,
    recorder: Arc<Recorder>,
}

fn node_config(root: &Path, id: &str) -> NodeConfig {
    let base = root.join(id);
    NodeConfig {
        node_id: id.to_string(),
        temp_services_dir: base.join("temp/services"),
        persistent_services_dir: base.join("local/services"),
        inclusion_cache_dir: base.join("temp/caches"),
        template_dir: base.join("local/templates"),
        start_timeout_secs: 5,
        ..NodeConfig::default()
    }
}

async fn spawn_node(network: &Arc<InMemoryNetwork>, config: NodeConfig) -> TestNode {
    let transport = Arc::new(network.transport(config.node_id.clone()).await);
    spawn_node_on(network, config, transport).await
}

async fn spawn_node_on(
    network: &Arc<InMemoryNetwork>,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
) -> TestNode {
    let id = config.node_id.clone();
    let runtime = Arc::new(FakeRuntime::default());
    let recorder = Arc::new(Recorder::default());
    let node = Node::builder(config, transport)
        .with_runtime(runtime.clone())
        .with_monitor(Arc::new(IdleMonitor))
        .with_listener(recorder.clone())
        .build()
        .unwrap();
    network.register(&id, node.handler()).await;
    node.join().await.unwrap();
    TestNode {
        node,
        runtime,
        recorder,
    }
}

/// Two nodes that know each other; `node-1` is the head.
async fn two_nodes(root: &Path) -> (TestNode, TestNode) {
    let network = InMemoryNetwork::new();
    let head = spawn_node(&network, node_config(root, "node-1")).await;
    let other = spawn_node(&network, node_config(root, "node-2")).await;
    head.node.heartbeat().await;
    (head, other)
}

async fn single_node(root: &Path, tweak: impl FnOnce(&mut NodeConfig)) -> TestNode {
    let network = InMemoryNetwork::new();
    let mut config = node_config(root, "node-1");
    tweak(&mut config);
    spawn_node(&network, config).await
}

fn lobby() -> ServiceConfiguration {
    ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
        .max_heap_memory(512)
        .build()
        .unwrap()
}

fn created(result: ServiceCreateResult) -> ServiceInfoSnapshot {
    match result {
        ServiceCreateResult::Created { snapshot } => *snapshot,
        other => panic!("expected a created service, got {other:?}"),
    }
}

// ── Creation ───────────────────────────────────────────────────

#[tokio::test]
async fn head_is_the_earliest_node() {
    let dir = TempDir::new().unwrap();
    let (head, other) = two_nodes(dir.path()).await;

    assert!(head.node.membership().is_local_head().unwrap());
    assert!(!other.node.membership().is_local_head().unwrap());
    assert_eq!(
        other.node.membership().head_node().unwrap().unwrap().node_id(),
        "node-1"
    );
}

#[tokio::test]
async fn creation_prefers_node_with_least_reserved_memory() {
    let dir = TempDir::new().unwrap();
    let (head, other) = two_nodes(dir.path()).await;

    let pinned = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
        .allowed_nodes(["node-1".to_string()])
        .build()
        .unwrap();
    let first = created(head.node.create_service(&pinned).await);
    assert_eq!(first.node_id(), Some("node-1"));

    let second = created(head.node.create_service(&lobby()).await);
    assert_eq!(second.node_id(), Some("node-2"));
    assert_eq!(second.lifecycle, ServiceLifecycle::Prepared);
    assert_eq!(second.configuration.service_id.task_service_id, 2);

    let owned = other.node.registry().local_service(second.unique_id()).unwrap();
    assert_eq!(owned.lifecycle(), ServiceLifecycle::Prepared);
    let known = head.node.provider(second.unique_id()).unwrap();
    assert!(!known.is_local());
    assert_eq!(known.snapshot().lifecycle, ServiceLifecycle::Prepared);

    // The first service was broadcast to node-2 as a remote one.
    assert!(other.node.registry().contains(first.unique_id()));
}

#[tokio::test]
async fn non_head_forwards_creation_to_head() {
    let dir = TempDir::new().unwrap();
    let (head, other) = two_nodes(dir.path()).await;

    let config = ServiceConfiguration::builder("Proxy", "MINECRAFT_PROXY")
        .allowed_nodes(["node-1".to_string()])
        .build()
        .unwrap();
    let snapshot = created(other.node.create_service(&config).await);

    assert_eq!(snapshot.node_id(), Some("node-1"));
    assert!(head.node.registry().local_service(snapshot.unique_id()).is_some());
    assert!(other.node.registry().contains(snapshot.unique_id()));
}

#[tokio::test]
async fn concurrent_creations_get_distinct_task_ids() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..5 {
        let node = head.node.clone();
        tasks.spawn(async move { node.create_service(&lobby()).await });
    }

    let mut ids = Vec::new();
    while let Some(result) = tasks.join_next().await {
        ids.push(created(result.unwrap()).configuration.service_id.task_service_id);
    }
    ids.sort();
    assert_eq!(ids, [1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn duplicate_unique_ids_are_reassigned() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;

    let id = Uuid::new_v4();
    let config = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
        .unique_id(id)
        .build()
        .unwrap();
    let first = created(head.node.create_service(&config).await);
    let second = created(head.node.create_service(&config).await);

    assert_eq!(first.unique_id(), id);
    assert_ne!(second.unique_id(), id);
    assert_eq!(head.node.registry().service_count(), 2);
}

#[tokio::test]
async fn owner_refuses_a_second_pending_registration() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;

    let config = lobby();
    assert!(head.node.factory().accept_remote(config.clone()).is_created());
    assert_eq!(
        head.node.factory().accept_remote(config.clone()),
        ServiceCreateResult::Failed
    );

    let unique_id = config.service_id.unique_id;
    let snapshot = head.node.factory().finish_registration(unique_id).await.unwrap();
    assert_eq!(snapshot.lifecycle, ServiceLifecycle::Prepared);
    assert!(head.node.factory().finish_registration(unique_id).await.is_none());
}

#[tokio::test]
async fn lost_finish_reply_aborts_the_remote_service() {
    let dir = TempDir::new().unwrap();
    let network = InMemoryNetwork::new();
    let lossy = Arc::new(LostFinishReplies {
        inner: network.transport("node-1").await,
        remaining: AtomicUsize::new(1),
    });
    let head = spawn_node_on(&network, node_config(dir.path(), "node-1"), lossy).await;
    let other = spawn_node(&network, node_config(dir.path(), "node-2")).await;
    head.node.heartbeat().await;

    let pinned = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
        .allowed_nodes(["node-2".to_string()])
        .build()
        .unwrap();
    assert_eq!(head.node.create_service(&pinned).await, ServiceCreateResult::Failed);
    assert!(other.node.registry().services_by_task("Lobby").is_empty());
    assert!(head.node.registry().services_by_task("Lobby").is_empty());

    let snapshot = created(head.node.create_service(&pinned).await);
    assert_eq!(snapshot.configuration.service_id.task_service_id, 1);
    let owned: Vec<i32> = other
        .node
        .registry()
        .services_by_task("Lobby")
        .iter()
        .map(|s| s.configuration.service_id.task_service_id)
        .collect();
    assert_eq!(owned, [1]);
}

#[tokio::test(start_paused = true)]
async fn unregistered_pending_services_expire() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;
    let factory = head.node.factory();

    let config = lobby();
    assert!(factory.accept_remote(config.clone()).is_created());
    assert_eq!(factory.expire_pending(), 0);

    tokio::time::advance(factory.pending_timeout() + Duration::from_secs(1)).await;
    assert_eq!(factory.expire_pending(), 1);
    assert!(factory.finish_registration(config.service_id.unique_id).await.is_none());
    assert_eq!(head.node.registry().service_count(), 0);
}

#[tokio::test]
async fn owner_refuses_task_ids_in_use() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;

    let existing = created(head.node.create_service(&lobby()).await);
    let task_service_id = existing.configuration.service_id.task_service_id;

    let clash = lobby().to_builder().task_service_id(task_service_id).build().unwrap();
    assert_eq!(head.node.factory().accept_remote(clash), ServiceCreateResult::Failed);

    let pending = lobby().to_builder().task_service_id(7).build().unwrap();
    assert!(head.node.factory().accept_remote(pending).is_created());
    let same_slot = lobby().to_builder().task_service_id(7).build().unwrap();
    assert_eq!(head.node.factory().accept_remote(same_slot), ServiceCreateResult::Failed);
}

#[tokio::test(start_paused = true)]
async fn unplaceable_creation_is_deferred_then_fails() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;

    let config = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
        .allowed_nodes(["node-9".to_string()])
        .retry(RetryConfiguration::new(3, vec![10]).with_event_receiver("node-1", "lobby-watch"))
        .build()
        .unwrap();

    let creation_id = match head.node.create_service(&config).await {
        ServiceCreateResult::Deferred { creation_id } => creation_id,
        other => panic!("expected a deferred creation, got {other:?}"),
    };
    let receiver = head.node.watch_creation(creation_id).unwrap();
    let outcome = await_creation(receiver, Duration::from_secs(30)).await;

    assert_eq!(outcome, Some(ServiceCreateResult::Failed));
    assert!(head.node.registry().services_by_task("Lobby").is_empty());

    let deferred = head.recorder.deferred.lock().unwrap().clone();
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].0, creation_id);
    assert_eq!(deferred[0].1, ["lobby-watch".to_string()]);
    assert_eq!(deferred[0].2, ServiceCreateResult::Failed);
}

#[tokio::test]
async fn creation_without_retry_fails_immediately() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;

    let config = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
        .allowed_nodes(["node-9".to_string()])
        .build()
        .unwrap();
    assert_eq!(head.node.create_service(&config).await, ServiceCreateResult::Failed);
}

// ── Lifecycle ──────────────────────────────────────────────────

#[tokio::test]
async fn stop_returns_to_prepared_and_delete_unregisters() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;

    let config = lobby().to_builder().auto_delete_on_stop(false).build().unwrap();
    let snapshot = created(head.node.create_and_start(&config).await);
    assert_eq!(snapshot.lifecycle, ServiceLifecycle::Running);
    assert_eq!(head.runtime.launched(), 1);

    let service = head.node.registry().local_service(snapshot.unique_id()).unwrap();
    assert!(service.directory().join(".wrapper/wrapper.json").exists());
    assert_eq!(head.node.registry().current_used_heap_memory(), 512);

    service.stop().await;
    assert_eq!(service.lifecycle(), ServiceLifecycle::Prepared);
    assert!(!head.runtime.last().alive.load(Ordering::SeqCst));
    assert_eq!(
        *head.recorder.lifecycles.lock().unwrap(),
        [
            ServiceLifecycle::Prepared,
            ServiceLifecycle::Running,
            ServiceLifecycle::Stopped,
            ServiceLifecycle::Prepared,
        ]
    );

    let directory = service.directory().to_path_buf();
    service.delete().await;
    assert_eq!(service.lifecycle(), ServiceLifecycle::Deleted);
    assert!(!head.node.registry().contains(snapshot.unique_id()));
    assert!(!directory.exists());
}

#[tokio::test]
async fn stop_with_auto_delete_removes_the_service() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;

    let snapshot = created(head.node.create_and_start(&lobby()).await);
    let provider = head.node.provider(snapshot.unique_id()).unwrap();
    let stopped = provider.stop().await.unwrap();

    assert_eq!(stopped.lifecycle, ServiceLifecycle::Deleted);
    assert!(head.node.provider(snapshot.unique_id()).is_none());
}

#[tokio::test]
async fn start_is_blocked_when_memory_is_exhausted() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |config| {
        config.max_memory_mb = 1024;
        config.run_blocked_service_start_later = false;
    })
    .await;

    let big = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
        .max_heap_memory(1024)
        .build()
        .unwrap();
    let snapshot = created(head.node.create_and_start(&big).await);

    assert_eq!(snapshot.lifecycle, ServiceLifecycle::Prepared);
    assert_eq!(head.runtime.launched(), 0);
}

#[tokio::test]
async fn watchdog_force_stops_dead_processes_once() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;

    let config = lobby().to_builder().auto_delete_on_stop(false).build().unwrap();
    let snapshot = created(head.node.create_and_start(&config).await);
    assert_eq!(head.node.run_watchdog().await, 0);

    head.runtime.last().alive.store(false, Ordering::SeqCst);
    assert_eq!(head.node.run_watchdog().await, 1);
    assert_eq!(head.node.run_watchdog().await, 0);

    assert_eq!(head.recorder.force_stops.load(Ordering::SeqCst), 1);
    let service = head.node.registry().local_service(snapshot.unique_id()).unwrap();
    assert_eq!(service.lifecycle(), ServiceLifecycle::Prepared);
}

#[tokio::test]
async fn remote_provider_drives_the_owner() {
    let dir = TempDir::new().unwrap();
    let (head, other) = two_nodes(dir.path()).await;

    let config = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
        .allowed_nodes(["node-2".to_string()])
        .build()
        .unwrap();
    let snapshot = created(head.node.create_service(&config).await);
    let remote = head.node.provider(snapshot.unique_id()).unwrap();

    let started = remote.start().await.unwrap();
    assert_eq!(started.lifecycle, ServiceLifecycle::Running);
    assert_eq!(other.runtime.launched(), 1);
    assert_eq!(head.runtime.launched(), 0);

    remote.run_command("say hello").await;
    assert_eq!(*other.runtime.last().commands.lock().unwrap(), ["say hello"]);

    // The owner's broadcast updated the head's view.
    assert_eq!(
        head.node.registry().service(snapshot.unique_id()).unwrap().lifecycle,
        ServiceLifecycle::Running
    );
}

#[tokio::test]
async fn prepared_services_are_reused_before_creating() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;

    let task = servgrid_state::ServiceTask::new("Lobby", "MINECRAFT_SERVER");
    let first = created(head.node.select_or_create_service(&task).await);
    let again = created(head.node.select_or_create_service(&task).await);

    assert_eq!(first.unique_id(), again.unique_id());
    assert_eq!(head.node.registry().service_count(), 1);
}

#[tokio::test]
async fn head_keeps_minimum_service_count_running() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;

    let mut task = servgrid_state::ServiceTask::new("Lobby", "MINECRAFT_SERVER");
    task.min_service_count = 2;
    head.node.store().put_task(&task).unwrap();

    head.node.ensure_min_services().await;
    head.node.ensure_min_services().await;
    head.node.ensure_min_services().await;

    let running = head
        .node
        .registry()
        .services_by_task("Lobby")
        .into_iter()
        .filter(|s| s.is_running())
        .count();
    assert_eq!(running, 2);
    assert_eq!(head.runtime.launched(), 2);
}

#[tokio::test]
async fn draining_node_shuts_down_once_empty() {
    let dir = TempDir::new().unwrap();
    let head = single_node(dir.path(), |_| {}).await;
    let shutdown = head.node.subscribe_shutdown();

    let snapshot = created(head.node.create_service(&lobby()).await);
    head.node.set_draining(true).unwrap();
    head.node.maintain().await;
    assert!(!*shutdown.borrow());

    head.node.provider(snapshot.unique_id()).unwrap().delete().await;
    head.node.maintain().await;
    assert!(*shutdown.borrow());
}
