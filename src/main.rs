use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use tokio::sync::watch;

use erspan_hub::capture::CaptureInstance;
use erspan_hub::forward::manager::ForwardSessionManager;
use erspan_hub::forward::session::SessionFactories;
use erspan_hub::forward::udp;
use erspan_hub::types::CloseKind;
use erspan_hub::{config, grpc, logging, rest};

/// How long shutdown waits for subscribers and servers to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = config::load_config()?;
    logging::setup(cfg.log.verbose, cfg.log.json)?;

    let mut factories = SessionFactories::new();
    udp::register(&mut factories);
    grpc::forward::register(&mut factories);
    let manager = Arc::new(ForwardSessionManager::new(factories));

    let capture = CaptureInstance::new(manager.clone())?;
    let (read_handle, dispatch_handle) = capture.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let rest_handle = rest::dispatch_server(cfg.rest_addr()?, manager.clone(), shutdown_rx.clone());
    let grpc_handle = grpc::dispatch_server(cfg.grpc_addr()?, manager.clone(), shutdown_rx);

    wait_for_signal().await;
    info!("shutting down");

    capture.shutdown();
    manager.close_all(CloseKind::Shutdown).await;
    let _ = shutdown_tx.send(true);

    let drain = async {
        let _ = read_handle.await;
        let _ = rest_handle.await;
        let _ = grpc_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period elapsed, abandoning stragglers");
    }
    dispatch_handle.abort();
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
