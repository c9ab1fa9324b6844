use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::buf::Writer;
use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use log::{debug, error, info};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::forward::filter;
use crate::forward::manager::{ForwardSessionManager, FwdError};
use crate::forward::pcapng::{InterfaceSpec, PcapNgWriter};
use crate::forward::session::{
    ForwardSession, FwdMsgReceiver, SessionBase, SessionError, SessionFactories, SessionHandle,
    SessionParams,
};
use crate::proto_pcap::pcap_forwarder_server::PcapForwarder;
use crate::proto_pcap::{
    BpfInstruction, ForwardRequest, Packet as PcapPacket, ValidateFilterRequest,
    ValidateFilterResponse,
};
use crate::types::{unix_nanos, FwdMsg};

/// Upper bound on subscriber latency for low-rate streams.
const FLUSH_INTERVAL: Duration = Duration::from_millis(200);
/// Depth of the outbound gRPC message channel per subscriber.
const OUTBOUND_DEPTH: usize = 16;

/// Sentinel timestamps terminating a subscriber stream.
const SENTINEL_CLOSE: i64 = -1;
const SENTINEL_SHUTDOWN: i64 = -2;

pub fn register(factories: &mut SessionFactories) {
    factories.register("rpc_pcap", new_rpc_pcap_session);
}

/// Session whose worker serializes matching frames into a pcapng stream
/// shipped over the `ForwardStream` RPC.
struct RpcPcapSession {
    base: SessionBase,
    client_info: HashMap<String, String>,
}

impl ForwardSession for RpcPcapSession {
    fn base(&self) -> &SessionBase {
        &self.base
    }

    fn info(&self) -> HashMap<String, String> {
        self.client_info.clone()
    }
}

fn new_rpc_pcap_session(params: SessionParams<'_>) -> Result<SessionHandle, SessionError> {
    let client_info = params
        .cfg
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect();
    let (base, rx) = SessionBase::new(&params)?;
    Ok(SessionHandle {
        session: Arc::new(RpcPcapSession { base, client_info }),
        queue_rx: Some(rx),
    })
}

/// pcapng blocks accumulated since the last outbound message, plus the number
/// of enhanced packet blocks among them. Shared between the drain task and
/// the periodic flusher; the mutex is held only for the pcapng call.
struct CoalescingWriter {
    ngw: PcapNgWriter<Writer<BytesMut>>,
    pending: u32,
}

impl CoalescingWriter {
    fn new(iface: &InterfaceSpec) -> io::Result<CoalescingWriter> {
        Ok(CoalescingWriter {
            ngw: PcapNgWriter::new(BytesMut::with_capacity(8192).writer(), iface)?,
            pending: 0,
        })
    }

    fn push(&mut self, ts: SystemTime, frame: &[u8]) -> io::Result<()> {
        self.ngw.write_packet(ts, frame)?;
        self.pending += 1;
        Ok(())
    }

    /// Everything buffered since the last take, or None when idle.
    fn take(&mut self) -> Option<(Bytes, u32)> {
        let buf = self.ngw.sink_mut().get_mut();
        if buf.is_empty() {
            return None;
        }
        let data = buf.split().freeze();
        let count = self.pending;
        self.pending = 0;
        Some((data, count))
    }
}

type OutboundSender = mpsc::Sender<Result<PcapPacket, Status>>;

fn spawn_flusher(writer: Arc<Mutex<CoalescingWriter>>, tx: OutboundSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let taken = writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some((data, count)) = taken {
                let pkt = PcapPacket {
                    timestamp: unix_nanos(SystemTime::now()),
                    packet_count: count,
                    raw_data: data.to_vec(),
                };
                if tx.send(Ok(pkt)).await.is_err() {
                    break;
                }
            }
        }
    })
}

async fn flush_and_finish(
    writer: &Arc<Mutex<CoalescingWriter>>,
    tx: &OutboundSender,
    sentinel: i64,
) {
    let taken = writer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some((data, count)) = taken {
        let pkt = PcapPacket {
            timestamp: unix_nanos(SystemTime::now()),
            packet_count: count,
            raw_data: data.to_vec(),
        };
        if tx.send(Ok(pkt)).await.is_err() {
            return;
        }
    }
    let _ = tx
        .send(Ok(PcapPacket {
            timestamp: sentinel,
            packet_count: 0,
            raw_data: Vec::new(),
        }))
        .await;
}

/// Drain one rpc_pcap session's queue until it is closed, the client goes
/// away, or a close/shutdown message arrives. Always detaches the session
/// from the manager on the way out.
async fn run_session(
    manager: Arc<ForwardSessionManager>,
    session: Arc<dyn ForwardSession>,
    mut rx: FwdMsgReceiver,
    writer: Arc<Mutex<CoalescingWriter>>,
    tx: OutboundSender,
) {
    let flusher = spawn_flusher(writer.clone(), tx.clone());
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(FwdMsg::Packet { data, ts }) => {
                    let res = writer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(ts, &data);
                    if let Err(e) = res {
                        error!("failed to serialize packet for session {}: {}", session.id(), e);
                    }
                }
                Some(FwdMsg::Close) | None => {
                    flush_and_finish(&writer, &tx, SENTINEL_CLOSE).await;
                    break;
                }
                Some(FwdMsg::Shutdown) => {
                    flush_and_finish(&writer, &tx, SENTINEL_SHUTDOWN).await;
                    break;
                }
            },
            _ = tx.closed() => {
                debug!("client gone, ending rpc_pcap session {}", session.id());
                break;
            }
        }
    }
    flusher.abort();
    manager.delete(session.as_ref());
}

pub struct PcapForwarderApi {
    manager: Arc<ForwardSessionManager>,
}

impl PcapForwarderApi {
    pub fn new(manager: Arc<ForwardSessionManager>) -> Self {
        PcapForwarderApi { manager }
    }
}

#[tonic::async_trait]
impl PcapForwarder for PcapForwarderApi {
    type ForwardStreamStream =
        Pin<Box<dyn Stream<Item = Result<PcapPacket, Status>> + Send + 'static>>;

    async fn forward_stream(
        &self,
        request: Request<ForwardRequest>,
    ) -> Result<Response<Self::ForwardStreamStream>, Status> {
        let remote = request.remote_addr();
        let req = request.into_inner();
        info!(
            "forward stream requested for {} (filter {:?})",
            req.stream_info_id, req.filter
        );

        let mut cfg = serde_json::Map::new();
        for (k, v) in &req.client_info {
            cfg.insert(k.clone(), Value::String(v.clone()));
        }
        if let Some(addr) = remote {
            cfg.insert("peer_addr".to_string(), Value::String(addr.to_string()));
        }

        let mut handle = self
            .manager
            .create_by_stream_id(&req.stream_info_id, "rpc_pcap", &req.filter, &cfg)
            .map_err(status_from_fwd)?;
        let rx = handle
            .queue_rx
            .take()
            .ok_or_else(|| Status::internal("rpc_pcap session has no queue"))?;

        let iface = InterfaceSpec::for_stream(
            handle.session.stream_key(),
            handle.session.filter_string(),
        );
        let writer = match CoalescingWriter::new(&iface) {
            Ok(w) => w,
            Err(e) => {
                self.manager.delete(handle.session.as_ref());
                return Err(Status::internal(format!("pcapng writer: {e}")));
            }
        };

        let (tx, out_rx) = mpsc::channel(OUTBOUND_DEPTH);
        tokio::spawn(run_session(
            self.manager.clone(),
            handle.session,
            rx,
            Arc::new(Mutex::new(writer)),
            tx,
        ));
        Ok(Response::new(Box::pin(ReceiverStream::new(out_rx))))
    }

    async fn validate_filter(
        &self,
        request: Request<ValidateFilterRequest>,
    ) -> Result<Response<ValidateFilterResponse>, Status> {
        let req = request.into_inner();
        let (valid, error_message, insns) = filter::validate(&req.filter);
        Ok(Response::new(ValidateFilterResponse {
            valid,
            error_message,
            bpf: insns
                .into_iter()
                .map(|i| BpfInstruction {
                    code: i.code,
                    jt: i.jt,
                    jf: i.jf,
                    k: i.k,
                })
                .collect(),
        }))
    }
}

fn status_from_fwd(err: FwdError) -> Status {
    match &err {
        FwdError::StreamNotFound(_) => Status::not_found(err.to_string()),
        FwdError::UnknownType(_) | FwdError::Session(_) => {
            Status::invalid_argument(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CloseKind, StreamKey};
    use std::net::Ipv4Addr;

    fn iface() -> InterfaceSpec {
        InterfaceSpec::for_stream(StreamKey::new(Ipv4Addr::new(10, 0, 0, 1), 7), "")
    }

    async fn manager_with_stream() -> (Arc<ForwardSessionManager>, StreamKey) {
        let mut factories = SessionFactories::new();
        register(&mut factories);
        let manager = Arc::new(ForwardSessionManager::new(factories));
        let key = StreamKey::new(Ipv4Addr::new(10, 0, 0, 1), 7);
        manager
            .process_packet(key, 2, SystemTime::now(), Bytes::from_static(&[0u8; 40]))
            .await;
        (manager, key)
    }

    fn spawn_worker(
        manager: Arc<ForwardSessionManager>,
        handle: &mut SessionHandle,
    ) -> mpsc::Receiver<Result<PcapPacket, Status>> {
        let rx = handle.queue_rx.take().unwrap();
        let writer = Arc::new(Mutex::new(CoalescingWriter::new(&iface()).unwrap()));
        let (tx, out_rx) = mpsc::channel(OUTBOUND_DEPTH);
        tokio::spawn(run_session(
            manager,
            handle.session.clone(),
            rx,
            writer,
            tx,
        ));
        out_rx
    }

    async fn last_message(out_rx: &mut mpsc::Receiver<Result<PcapPacket, Status>>) -> PcapPacket {
        let mut last = None;
        while let Some(msg) = out_rx.recv().await {
            last = Some(msg.unwrap());
        }
        last.expect("stream ended without a message")
    }

    #[test]
    fn test_coalescing_counts_packet_blocks() {
        let mut writer = CoalescingWriter::new(&iface()).unwrap();
        writer.push(SystemTime::now(), &[0u8; 60]).unwrap();
        writer.push(SystemTime::now(), &[0u8; 60]).unwrap();

        let (data, count) = writer.take().unwrap();
        assert_eq!(count, 2);
        // The first take carries the section header.
        assert_eq!(&data[..4], &[0x0A, 0x0D, 0x0D, 0x0A]);
        assert!(writer.take().is_none(), "drained writer is idle");

        writer.push(SystemTime::now(), &[0u8; 60]).unwrap();
        let (data, count) = writer.take().unwrap();
        assert_eq!(count, 1);
        // Later takes start directly at an enhanced packet block.
        assert_eq!(&data[..4], &[0x06, 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_close_emits_minus_one_sentinel() {
        let (manager, key) = manager_with_stream().await;
        let cfg = serde_json::Map::new();
        let mut handle = manager.create_by_key(key, "rpc_pcap", "", &cfg).unwrap();
        let queue = handle.session.queue().clone();
        let mut out_rx = spawn_worker(manager.clone(), &mut handle);

        queue
            .send(FwdMsg::Packet {
                data: Bytes::from_static(&[0u8; 60]),
                ts: SystemTime::now(),
            })
            .await
            .unwrap();
        queue.send(FwdMsg::Close).await.unwrap();

        let last = last_message(&mut out_rx).await;
        assert_eq!(last.timestamp, SENTINEL_CLOSE);
        assert_eq!(last.packet_count, 0);
        assert!(last.raw_data.is_empty());
        // The worker detached the session on its way out.
        assert!(manager.get(key).unwrap().forward_sessions.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_emits_minus_two_sentinel() {
        let (manager, key) = manager_with_stream().await;
        let cfg = serde_json::Map::new();
        let mut handle = manager.create_by_key(key, "rpc_pcap", "", &cfg).unwrap();
        let mut out_rx = spawn_worker(manager.clone(), &mut handle);

        manager.close_all(CloseKind::Shutdown).await;
        let last = last_message(&mut out_rx).await;
        assert_eq!(last.timestamp, SENTINEL_SHUTDOWN);
    }

    #[tokio::test]
    async fn test_validate_filter_rpc() {
        let (manager, _) = manager_with_stream().await;
        let api = PcapForwarderApi::new(manager);

        let resp = api
            .validate_filter(Request::new(ValidateFilterRequest {
                filter: "tcp port 80".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.valid);
        assert!(resp.error_message.is_empty());
        assert!(!resp.bpf.is_empty());

        let resp = api
            .validate_filter(Request::new(ValidateFilterRequest {
                filter: "bad syntax (".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.valid);
        assert!(!resp.error_message.is_empty());
        assert!(resp.bpf.is_empty());
    }

    #[tokio::test]
    async fn test_forward_stream_unknown_stream_is_not_found() {
        let (manager, _) = manager_with_stream().await;
        let api = PcapForwarderApi::new(manager);
        let result = api
            .forward_stream(Request::new(ForwardRequest {
                stream_info_id: "missing".to_string(),
                filter: String::new(),
                client_info: HashMap::new(),
            }))
            .await;
        let err = match result {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.code(), tonic::Code::NotFound);
    }
}
