pub mod erspan;
pub mod gre_socket;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use bytes::Bytes;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

use crate::forward::manager::ForwardSessionManager;
use crate::metrics;
use crate::types::StreamKey;
use self::gre_socket::GreSocket;

/// Largest datagram a single read can deliver.
const READ_BUF_LEN: usize = 65535;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open raw GRE socket: {0}")]
    SocketOpen(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl CaptureState {
    fn from_u8(v: u8) -> CaptureState {
        match v {
            1 => CaptureState::Running,
            2 => CaptureState::Stopping,
            3 => CaptureState::Stopped,
            _ => CaptureState::Idle,
        }
    }
}

/// One decoded ingress frame on its way to the fan-out path.
#[derive(Debug)]
pub struct DecodedFrame {
    pub key: StreamKey,
    pub version: u8,
    pub ts: SystemTime,
    pub data: Bytes,
}

/// Terminates the raw GRE ingress: a blocking read loop decodes each datagram
/// and hands the inner frame to a dispatch task that drives the manager. The
/// read loop never blocks on a subscriber; the channel between the two is
/// unbounded.
pub struct CaptureInstance {
    manager: Arc<ForwardSessionManager>,
    socket: Arc<GreSocket>,
    state: Arc<AtomicU8>,
}

impl CaptureInstance {
    /// Opens the raw socket; failing to do so is fatal for the ingress.
    pub fn new(manager: Arc<ForwardSessionManager>) -> Result<Self, CaptureError> {
        let socket = Arc::new(GreSocket::open()?);
        Ok(CaptureInstance {
            manager,
            socket,
            state: Arc::new(AtomicU8::new(CaptureState::Idle as u8)),
        })
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Spawn the blocking read loop and the async dispatch task.
    pub fn start(&self) -> (JoinHandle<Result<()>>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<DecodedFrame>();

        let socket = self.socket.clone();
        let state = self.state.clone();
        state.store(CaptureState::Running as u8, Ordering::SeqCst);
        info!("started packet capture on raw GRE socket");

        let read_handle = task::spawn_blocking(move || -> Result<()> {
            let mut buf = vec![0u8; READ_BUF_LEN];
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((n, peer)) => {
                        let ts = SystemTime::now();
                        match erspan::decode(&buf[..n]) {
                            Ok(frame) => {
                                metrics::TOTAL_PACKETS.inc();
                                metrics::TOTAL_BYTES.add(frame.inner.len() as u64);
                                let msg = DecodedFrame {
                                    key: StreamKey::new(peer, frame.session_id),
                                    version: frame.version,
                                    ts,
                                    data: Bytes::copy_from_slice(frame.inner),
                                };
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                metrics::DECODE_ERRORS.inc();
                                debug!("dropping datagram from {}: {}", peer, e);
                            }
                        }
                    }
                    Err(e) => {
                        // A read failing after shutdown() is expected, not an error.
                        if state.load(Ordering::SeqCst) == CaptureState::Stopping as u8 {
                            break;
                        }
                        warn!("packet read error: {}", e);
                    }
                }
            }
            state.store(CaptureState::Stopped as u8, Ordering::SeqCst);
            Ok(())
        });

        let manager = self.manager.clone();
        let dispatch_handle = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                manager
                    .process_packet(frame.key, frame.version, frame.ts, frame.data)
                    .await;
            }
        });

        (read_handle, dispatch_handle)
    }

    /// Flip to `Stopping` and close the socket out-of-band, unblocking the
    /// read loop.
    pub fn shutdown(&self) {
        self.state
            .store(CaptureState::Stopping as u8, Ordering::SeqCst);
        self.socket.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_state_round_trip() {
        for state in [
            CaptureState::Idle,
            CaptureState::Running,
            CaptureState::Stopping,
            CaptureState::Stopped,
        ] {
            assert_eq!(CaptureState::from_u8(state as u8), state);
        }
    }
}
