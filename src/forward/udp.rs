use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::UdpSocket;

use super::session::{
    cfg_str, cfg_u16, ForwardSession, FwdMsgReceiver, SessionBase, SessionError, SessionFactories,
    SessionHandle, SessionParams,
};
use crate::types::FwdMsg;

pub fn register(factories: &mut SessionFactories) {
    factories.register("udp", new_udp_session);
}

/// Pushes matching frames as raw Ethernet payloads over a connected UDP
/// socket. IPv4 destinations only.
struct UdpSession {
    base: SessionBase,
    dest: SocketAddrV4,
}

impl ForwardSession for UdpSession {
    fn base(&self) -> &SessionBase {
        &self.base
    }

    fn info(&self) -> HashMap<String, String> {
        HashMap::from([("dest".to_string(), self.dest.to_string())])
    }
}

fn new_udp_session(params: SessionParams<'_>) -> Result<SessionHandle, SessionError> {
    let dest_ip = cfg_str(params.cfg, "dest_ip")
        .ok_or_else(|| SessionError::Config("missing dest_ip".to_string()))?;
    let dest_port = cfg_u16(params.cfg, "dest_port")
        .ok_or_else(|| SessionError::Config("missing or invalid dest_port".to_string()))?;
    let dest_ip: Ipv4Addr = dest_ip.parse().map_err(|_| {
        SessionError::Config(format!(
            "only IPv4 is supported for UDP forwarding, got {dest_ip:?}"
        ))
    })?;
    let dest = SocketAddrV4::new(dest_ip, dest_port);

    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(dest)?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket)?;

    let (base, rx) = SessionBase::new(&params)?;
    let session = Arc::new(UdpSession { base, dest });
    info!("UDP forward session {} -> {}", session.id(), dest);

    tokio::spawn(run_worker(rx, socket, dest));
    Ok(SessionHandle {
        session,
        queue_rx: None,
    })
}

/// Drains the queue until a close message arrives or the queue is dropped.
/// Send errors never stop the loop; frames are not retried.
async fn run_worker(mut rx: FwdMsgReceiver, socket: UdpSocket, dest: SocketAddrV4) {
    let mut warned_refused = false;
    while let Some(msg) = rx.recv().await {
        match msg {
            FwdMsg::Packet { data, .. } => {
                if let Err(e) = socket.send(&data).await {
                    if e.kind() == io::ErrorKind::ConnectionRefused {
                        // Report the first refusal only; an absent receiver
                        // would otherwise flood the log.
                        if !warned_refused {
                            warn!(
                                "connection refused forwarding to {} (will not warn again): {}",
                                dest, e
                            );
                            warned_refused = true;
                        }
                    } else {
                        error!("error forwarding UDP packet to {}: {}", dest, e);
                    }
                }
            }
            FwdMsg::Close | FwdMsg::Shutdown => break,
        }
    }
}
