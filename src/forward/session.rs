use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use super::filter::{BpfFilter, FilterError};
use crate::types::{FwdMsg, SessionDescription, SessionStats, StreamKey};

/// Queue depth between the fan-out path and each session worker.
pub const SESSION_QUEUE_CAPACITY: usize = 32;

pub type FwdMsgSender = mpsc::Sender<FwdMsg>;
pub type FwdMsgReceiver = mpsc::Receiver<FwdMsg>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("bad session config: {0}")]
    Config(String),
    #[error("failed to set up session sink: {0}")]
    Sink(#[from] std::io::Error),
}

/// Arguments handed to a session factory. `cfg` is the caller-supplied opaque
/// configuration object (JSON for REST callers, client_info for gRPC ones).
pub struct SessionParams<'a> {
    pub key: StreamKey,
    pub stream_info_id: String,
    pub session_type: &'a str,
    pub filter: &'a str,
    pub cfg: &'a Map<String, Value>,
}

/// What a factory hands back: the session itself plus, for types whose worker
/// is driven by an external handler (rpc_pcap), the queue's receive half.
/// Types that spawn their own worker (udp) consume the receiver themselves.
pub struct SessionHandle {
    pub session: Arc<dyn ForwardSession>,
    pub queue_rx: Option<FwdMsgReceiver>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", self.session.base())
            .field("queue_rx", &self.queue_rx)
            .finish()
    }
}

pub type SessionFactory = fn(SessionParams<'_>) -> Result<SessionHandle, SessionError>;

/// Immutable `type name -> factory` table, built once at startup. Each
/// session-type module contributes through `register`.
#[derive(Default)]
pub struct SessionFactories {
    factories: HashMap<&'static str, SessionFactory>,
}

impl SessionFactories {
    pub fn new() -> Self {
        SessionFactories::default()
    }

    pub fn register(&mut self, name: &'static str, factory: SessionFactory) {
        self.factories.insert(name, factory);
    }

    pub fn get(&self, name: &str) -> Option<SessionFactory> {
        self.factories.get(name).copied()
    }
}

/// State common to every session type. Concrete types embed this and delegate
/// the trait to it.
#[derive(Debug)]
pub struct SessionBase {
    pub id: u64,
    pub stream_key: StreamKey,
    pub stream_info_id: String,
    pub session_type: String,
    pub filter: Option<BpfFilter>,
    pub queue: FwdMsgSender,
    pub stats: SessionStats,
}

impl SessionBase {
    /// Allocate the bounded queue and compile the filter. An empty filter
    /// expression means "match everything".
    pub fn new(params: &SessionParams<'_>) -> Result<(SessionBase, FwdMsgReceiver), SessionError> {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let filter = if params.filter.is_empty() {
            None
        } else {
            Some(BpfFilter::compile(params.filter)?)
        };
        let base = SessionBase {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            stream_key: params.key,
            stream_info_id: params.stream_info_id.clone(),
            session_type: params.session_type.to_string(),
            filter,
            queue: tx,
            stats: SessionStats::new(),
        };
        Ok((base, rx))
    }
}

/// A live subscriber attached to one stream. Object-safe so the manager can
/// hold a heterogeneous subscriber set.
pub trait ForwardSession: Send + Sync {
    fn base(&self) -> &SessionBase;

    /// Type-specific descriptive details (peer address, destination, ...).
    fn info(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn id(&self) -> u64 {
        self.base().id
    }

    fn stream_key(&self) -> StreamKey {
        self.base().stream_key
    }

    fn stream_info_id(&self) -> &str {
        &self.base().stream_info_id
    }

    fn session_type(&self) -> &str {
        &self.base().session_type
    }

    fn filter(&self) -> Option<&BpfFilter> {
        self.base().filter.as_ref()
    }

    fn filter_string(&self) -> &str {
        self.base().filter.as_ref().map_or("", |f| f.source())
    }

    fn queue(&self) -> &FwdMsgSender {
        &self.base().queue
    }

    fn stats(&self) -> &SessionStats {
        &self.base().stats
    }

    /// True when the frame passes this session's filter (or there is none).
    fn accepts(&self, frame: &[u8]) -> bool {
        self.base().filter.as_ref().map_or(true, |f| f.matches(frame))
    }

    fn describe(&self) -> SessionDescription {
        SessionDescription {
            stream_key: self.stream_key(),
            stream_info_id: self.stream_info_id().to_string(),
            session_type: self.session_type().to_string(),
            filter: self.filter_string().to_string(),
            info: self.info(),
            stats: self.stats().view(),
        }
    }
}

/// Helpers for reading factory `cfg` maps.
pub fn cfg_str<'a>(cfg: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    cfg.get(key).and_then(Value::as_str)
}

pub fn cfg_u16(cfg: &Map<String, Value>, key: &str) -> Option<u16> {
    cfg.get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u16::try_from(v).ok())
}
