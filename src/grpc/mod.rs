pub mod forward;
pub mod streams;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::Server;

use crate::forward::manager::ForwardSessionManager;
use crate::proto_pcap::pcap_forwarder_server::PcapForwarderServer;
use crate::proto_streams::streams_service_server::StreamsServiceServer;

/// Spawns the gRPC server in the background; it serves until the shutdown
/// signal flips.
pub fn dispatch_server(
    addr: SocketAddr,
    manager: Arc<ForwardSessionManager>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        info!("gRPC server listening on {}", addr);
        Server::builder()
            .add_service(StreamsServiceServer::new(streams::StreamsApi::new(
                manager.clone(),
            )))
            .add_service(PcapForwarderServer::new(forward::PcapForwarderApi::new(
                manager,
            )))
            .serve_with_shutdown(addr, async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        Ok(())
    })
}
