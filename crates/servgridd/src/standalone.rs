//! Standalone mode: one node on an in-process network, serving the API.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use servgrid_cluster::InMemoryNetwork;
use servgrid_core::NodeConfig;
use servgrid_scheduler::Node;

/// Run the node until Ctrl-C or until it drained, then stop every local
/// service.
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    info!(node_id = %config.node_id, "ServGrid daemon starting in standalone mode");

    for dir in [
        &config.temp_services_dir,
        &config.persistent_services_dir,
        &config.inclusion_cache_dir,
        &config.template_dir,
    ] {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    if let Some(parent) = config.state_path.as_ref().and_then(|p| p.parent()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let addr = format!("{}:{}", config.api.bind, config.api.port);

    // ── Node ───────────────────────────────────────────────────

    let network = InMemoryNetwork::new();
    let transport = Arc::new(network.transport(config.node_id.clone()).await);
    let node = Node::builder(config, transport)
        .build()
        .context("assembling node")?;
    network.register(node.node_id(), node.handler()).await;
    node.join().await.context("joining cluster")?;
    info!(node_id = %node.node_id(), "node joined");

    let node_loop = tokio::spawn(node.clone().run());

    // ── API server ─────────────────────────────────────────────

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding API on {addr}"))?;
    info!(%addr, "API server starting");

    let mut drained = node.subscribe_shutdown();
    let server = axum::serve(listener, servgrid_api::build_router(node.clone()))
        .with_graceful_shutdown(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!(error = %e, "cannot listen for Ctrl-C");
                    }
                    info!("shutdown signal received");
                }
                _ = drained.wait_for(|stop| *stop) => info!("node drained"),
            }
        });

    let served = server.await;
    node.shutdown();
    if let Err(e) = node_loop.await {
        warn!(error = %e, "node loop failed");
    }

    served.context("API server")?;
    info!("ServGrid daemon stopped");
    Ok(())
}
