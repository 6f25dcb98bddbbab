//! Detection of services whose process died.

use tracing::warn;

use servgrid_state::ServiceLifecycle;

use crate::events::EventManager;
use crate::registry::ServiceRegistry;

/// Stop every local RUNNING service without a live process. Returns how
/// many were stopped.
pub async fn stop_dead_services(registry: &ServiceRegistry, events: &EventManager) -> usize {
    let mut stopped = 0;
    for service in registry.local_services() {
        if service.lifecycle() != ServiceLifecycle::Running || service.alive().await {
            continue;
        }
        let snapshot = service.snapshot();
        warn!(service = %snapshot.name(), "process is gone, stopping service");
        events.pre_force_stop(&snapshot);
        service.stop().await;
        stopped += 1;
    }
    stopped
}
