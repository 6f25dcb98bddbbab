//! Shared collaborators of every local service on a node.

use std::collections::HashMap;
use std::sync::Arc;

use servgrid_cluster::Transport;
use servgrid_core::{NodeConfig, NodeId};
use servgrid_runtime::{ServiceRuntime, SystemMonitor};

use crate::events::EventManager;
use crate::preparer::PreparerRegistry;
use crate::registry::ServiceRegistry;
use crate::storage::TemplateStorageRegistry;
use crate::tick::TickHandle;

pub struct ServiceContext {
    pub node_id: NodeId,
    pub config: Arc<NodeConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub transport: Arc<dyn Transport>,
    pub events: Arc<EventManager>,
    pub storages: TemplateStorageRegistry,
    /// Runtimes by [`ServiceRuntime::name`].
    pub runtimes: HashMap<String, Arc<dyn ServiceRuntime>>,
    pub preparers: PreparerRegistry,
    pub monitor: Arc<dyn SystemMonitor>,
    pub tick: TickHandle,
}

impl ServiceContext {
    pub fn runtime(&self, name: &str) -> Option<Arc<dyn ServiceRuntime>> {
        self.runtimes.get(name).cloned()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A single-node context whose runtime hands out fake processes.

    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use servgrid_cluster::InMemoryNetwork;
    use servgrid_core::DEFAULT_RUNTIME;
    use servgrid_runtime::{ConsoleLog, LaunchRequest, RuntimeResult, ServiceProcess};

    use super::*;
    use crate::storage::LocalTemplateStorage;
    use crate::tick::{TickQueue, tick_channel};

    pub(crate) struct FakeProcess {
        alive: AtomicBool,
    }

    impl FakeProcess {
        pub(crate) fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ServiceProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        async fn alive(&self) -> bool {
            self.is_alive()
        }

        async fn write_line(&self, _line: &str) -> RuntimeResult<()> {
            Ok(())
        }

        async fn stop(&self, _shutdown_commands: &[String], _timeout: Duration) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeRuntime {
        processes: Mutex<Vec<Arc<FakeProcess>>>,
    }

    impl FakeRuntime {
        pub(crate) fn launched(&self) -> usize {
            self.processes.lock().unwrap().len()
        }

        pub(crate) fn last(&self) -> Arc<FakeProcess> {
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

    pub(crate) struct TestContext {
        pub ctx: Arc<ServiceContext>,
        pub runtime: Arc<FakeRuntime>,
        _network: Arc<InMemoryNetwork>,
        _ticks: TickQueue,
    }

    pub(crate) async fn context(root: &Path) -> TestContext {
        let config = Arc::new(NodeConfig {
            node_id: "node-1".to_string(),
            temp_services_dir: root.join("temp/services"),
            persistent_services_dir: root.join("local/services"),
            inclusion_cache_dir: root.join("temp/caches"),
            template_dir: root.join("local/templates"),
            ..NodeConfig::default()
        });
        let network = InMemoryNetwork::new();
        let transport: Arc<dyn Transport> = Arc::new(network.transport("node-1").await);

        let runtime = Arc::new(FakeRuntime::default());
        let mut runtimes: HashMap<String, Arc<dyn ServiceRuntime>> = HashMap::new();
        runtimes.insert(DEFAULT_RUNTIME.to_string(), runtime.clone());

        let mut storages = TemplateStorageRegistry::new();
        storages.register(Arc::new(LocalTemplateStorage::new(config.template_dir.clone())));

        let (tick, ticks) = tick_channel();
        let ctx = Arc::new(ServiceContext {
            node_id: config.node_id.clone(),
            registry: Arc::new(ServiceRegistry::new(
                config.node_id.clone(),
                transport.clone(),
                config.start_timeout(),
            )),
            transport,
            events: Arc::new(EventManager::new()),
            storages,
            runtimes,
            preparers: PreparerRegistry::from_config(&config),
            monitor: Arc::new(IdleMonitor),
            tick,
            config,
        });
        TestContext {
            ctx,
            runtime,
            _network: network,
            _ticks: ticks,
        }
    }
}
