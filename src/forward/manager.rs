use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::future::join_all;
use log::{debug, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;

use super::session::{
    ForwardSession, SessionError, SessionFactories, SessionHandle, SessionParams,
};
use crate::types::{CloseKind, FwdMsg, StreamEntry, StreamKey, StreamView};

/// How long the fan-out path waits on a full subscriber queue before dropping
/// the frame for that subscriber.
const SEND_DEADLINE: Duration = Duration::from_millis(100);

/// Per-queue deadline for `close_all` at shutdown.
const CLOSE_DEADLINE: Duration = Duration::from_secs(1);

const STREAM_ID_LEN: usize = 26;

#[derive(Debug, Error)]
pub enum FwdError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("unknown forward session type: {0}")]
    UnknownType(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Registry record for one discovered ERSPAN stream. Owned by the manager;
/// all fields are mutated only under the registry write lock.
pub struct StreamInfo {
    pub id: String,
    pub key: StreamKey,
    pub erspan_version: u8,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub packets: u64,
    pub bytes: u64,
    pub sessions: HashMap<u64, Arc<dyn ForwardSession>>,
}

impl StreamInfo {
    fn view(&self) -> StreamView {
        StreamView {
            id: self.id.clone(),
            src_ip: self.key.src_ip,
            erspan_id: self.key.erspan_id,
            erspan_version: self.erspan_version,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            packets: self.packets,
            bytes: self.bytes,
            forward_sessions: self.sessions.values().map(|s| s.describe()).collect(),
        }
    }
}

/// Owns the stream registry and routes every ingress frame to the matching
/// subscribers. Readers (the fan-out path) take the lock only long enough to
/// snapshot target sessions; no send happens with the lock held.
pub struct ForwardSessionManager {
    streams: RwLock<HashMap<StreamKey, StreamInfo>>,
    factories: SessionFactories,
}

impl ForwardSessionManager {
    pub fn new(factories: SessionFactories) -> Self {
        ForwardSessionManager {
            streams: RwLock::new(HashMap::new()),
            factories,
        }
    }

    pub fn get(&self, key: StreamKey) -> Option<StreamView> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams.get(&key).map(StreamInfo::view)
    }

    /// Linear scan; control-plane only.
    pub fn get_by_id(&self, id: &str) -> Option<(StreamKey, StreamView)> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .values()
            .find(|si| si.id == id)
            .map(|si| (si.key, si.view()))
    }

    pub fn list(&self) -> Vec<StreamEntry> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .values()
            .map(|si| StreamEntry {
                id: si.key.to_string(),
                stream_info: si.view(),
            })
            .collect()
    }

    /// Register a discovered stream or advance an existing one. Races resolve
    /// under the write lock; exactly one creation happens per key and it is
    /// logged once.
    pub fn upsert(&self, key: StreamKey, version: u8, now: SystemTime, inner_len: usize) {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(si) = streams.get_mut(&key) {
            si.last_seen = now;
            si.packets += 1;
            si.bytes += inner_len as u64;
            return;
        }
        let si = StreamInfo {
            id: new_stream_id(),
            key,
            erspan_version: version,
            first_seen: now,
            last_seen: now,
            packets: 1,
            bytes: inner_len as u64,
            sessions: HashMap::new(),
        };
        info!("registered new stream {} ({})", si.id, key);
        streams.insert(key, si);
    }

    /// Ingress entry point: update the registry, then deliver the frame to
    /// every attached session whose filter matches. Each delivery is bounded
    /// by `SEND_DEADLINE`; a slow subscriber only loses its own frames.
    pub async fn process_packet(&self, key: StreamKey, version: u8, ts: SystemTime, data: Bytes) {
        self.upsert(key, version, ts, data.len());

        let targets: Vec<Arc<dyn ForwardSession>> = {
            let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
            match streams.get(&key) {
                Some(si) => si
                    .sessions
                    .values()
                    .filter(|s| s.accepts(&data))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };
        if targets.is_empty() {
            return;
        }

        let msg = FwdMsg::Packet { data, ts };
        let sends = targets.iter().map(|sess| {
            let msg = msg.clone();
            async move {
                sess.stats().total_packets.fetch_add(1, Ordering::Relaxed);
                match sess.queue().send_timeout(msg, SEND_DEADLINE).await {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        sess.stats().filtered_packets.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "dropping packet for slow forward session {} (stream {})",
                            sess.id(),
                            sess.stream_key()
                        );
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        sess.stats().filtered_packets.fetch_add(1, Ordering::Relaxed);
                        debug!("forward session {} queue closed, dropping", sess.id());
                    }
                }
            }
        });
        join_all(sends).await;
    }

    /// Create a session for a stream the control plane knows by id.
    pub fn create_by_stream_id(
        &self,
        stream_id: &str,
        session_type: &str,
        filter: &str,
        cfg: &Map<String, Value>,
    ) -> Result<SessionHandle, FwdError> {
        let (key, _) = self
            .get_by_id(stream_id)
            .ok_or_else(|| FwdError::StreamNotFound(stream_id.to_string()))?;
        self.create(key, stream_id.to_string(), session_type, filter, cfg)
    }

    /// Create a session for a stream known by key. Subscribing before the
    /// first packet of a stream has arrived is rejected.
    // TODO: pending-stream attachment (buffer the subscription until the key
    // shows up) once a client needs it.
    pub fn create_by_key(
        &self,
        key: StreamKey,
        session_type: &str,
        filter: &str,
        cfg: &Map<String, Value>,
    ) -> Result<SessionHandle, FwdError> {
        let view = self
            .get(key)
            .ok_or_else(|| FwdError::StreamNotFound(key.to_string()))?;
        self.create(key, view.id, session_type, filter, cfg)
    }

    fn create(
        &self,
        key: StreamKey,
        stream_info_id: String,
        session_type: &str,
        filter: &str,
        cfg: &Map<String, Value>,
    ) -> Result<SessionHandle, FwdError> {
        let factory = self
            .factories
            .get(session_type)
            .ok_or_else(|| FwdError::UnknownType(session_type.to_string()))?;
        let handle = factory(SessionParams {
            key,
            stream_info_id,
            session_type,
            filter,
            cfg,
        })?;

        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let si = streams
            .get_mut(&key)
            .ok_or_else(|| FwdError::StreamNotFound(key.to_string()))?;
        si.sessions.insert(handle.session.id(), handle.session.clone());
        info!(
            "created forward session {} type {} (stream {})",
            handle.session.id(),
            session_type,
            si.id
        );
        Ok(handle)
    }

    /// Detach a session and tell its worker to stop. Safe to call more than
    /// once; the worker may already have exited through its own cancellation.
    pub fn delete(&self, session: &dyn ForwardSession) {
        {
            let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(si) = streams.get_mut(&session.stream_key()) {
                si.sessions.remove(&session.id());
            }
        }
        let _ = session.queue().try_send(FwdMsg::Close);
        info!(
            "deleted forward session {} (stream {})",
            session.id(),
            session.stream_key()
        );
    }

    /// Tell every live session to wind down, giving each queue up to one
    /// second to accept the message. Slower subscribers are abandoned.
    pub async fn close_all(&self, kind: CloseKind) {
        let queues: Vec<_> = {
            let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
            streams
                .values()
                .flat_map(|si| si.sessions.values().map(|s| (s.id(), s.queue().clone())))
                .collect()
        };
        let msg = kind.msg();
        let sends = queues.into_iter().map(|(id, queue)| {
            let msg = msg.clone();
            async move {
                if queue.send_timeout(msg, CLOSE_DEADLINE).await.is_err() {
                    warn!("forward session {} did not accept {:?} in time", id, kind);
                }
            }
        });
        join_all(sends).await;
    }
}

fn new_stream_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STREAM_ID_LEN)
        .map(char::from)
        .collect()
}
