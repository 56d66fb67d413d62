use clap::Parser;
use kvraft_node::config::NodeConfig;
use kvraft_node::coordinator::Coordinator;
use kvraft_node::{ingress, mgmt};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = NodeConfig::parse();
    let coordinator = Coordinator::start(&config).await?;

    let mgmt_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.mgmt_port)).await?;
    let mgmt_router = mgmt::router(Arc::clone(&coordinator));
    let mgmt_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(mgmt_listener, mgmt_router).await {
            tracing::error!("management endpoint stopped: {}", e);
        }
    });
    tracing::info!("management endpoint listening on :{}", config.mgmt_port);

    let ingress_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.ingress_port)).await?;
    let ingress_router = ingress::router(Arc::clone(&coordinator));
    let ingress_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(ingress_listener, ingress_router).await {
            tracing::error!("ingress endpoint stopped: {}", e);
        }
    });
    tracing::info!("ingress endpoint listening on :{}", config.ingress_port);

    if let Some(join_addr) = config.join_addr.clone() {
        tokio::spawn(Arc::clone(&coordinator).run_join_routine(join_addr));
    }

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining ingress");

    ingress_handle.abort();
    mgmt_handle.abort();
    coordinator.shutdown().await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("failed to install SIGTERM handler: {}", e);
            let _ = ctrl_c.await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }
}
