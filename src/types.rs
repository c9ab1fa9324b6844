use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifies an ERSPAN stream by tunnel source address and ERSPAN session id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub src_ip: Ipv4Addr,
    pub erspan_id: u16,
}

/// Reserved "no stream" sentinel.
pub const NULL_STREAM_KEY: StreamKey = StreamKey {
    src_ip: Ipv4Addr::UNSPECIFIED,
    erspan_id: 65535,
};

impl StreamKey {
    pub fn new(src_ip: Ipv4Addr, erspan_id: u16) -> Self {
        StreamKey { src_ip, erspan_id }
    }

    pub fn is_null(&self) -> bool {
        *self == NULL_STREAM_KEY
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.src_ip, self.erspan_id)
    }
}

/// Message delivered to a forward session's queue. `Packet` is built once per
/// ingress frame; the payload is refcounted so per-queue clones stay cheap.
#[derive(Clone, Debug)]
pub enum FwdMsg {
    Packet { data: Bytes, ts: SystemTime },
    Close,
    Shutdown,
}

/// What `close_all` tells every live session at teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseKind {
    Close,
    Shutdown,
}

impl CloseKind {
    pub fn msg(self) -> FwdMsg {
        match self {
            CloseKind::Close => FwdMsg::Close,
            CloseKind::Shutdown => FwdMsg::Shutdown,
        }
    }
}

/// Per-session delivery counters. `total_packets` counts every frame that
/// matched the session's filter; `filtered_packets` counts the subset dropped
/// because the bounded queue send timed out or the queue was gone.
#[derive(Debug)]
pub struct SessionStats {
    pub start_time: SystemTime,
    pub total_packets: AtomicU64,
    pub filtered_packets: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        SessionStats {
            start_time: SystemTime::now(),
            total_packets: AtomicU64::new(0),
            filtered_packets: AtomicU64::new(0),
        }
    }

    pub fn view(&self) -> SessionStatsView {
        SessionStatsView {
            start_time: self.start_time,
            total_packets: self.total_packets.load(Ordering::Relaxed),
            filtered_packets: self.filtered_packets.load(Ordering::Relaxed),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        SessionStats::new()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStatsView {
    #[serde(with = "rfc3339")]
    pub start_time: SystemTime,
    pub total_packets: u64,
    pub filtered_packets: u64,
}

/// Serializable description of a forward session, used by the REST and gRPC
/// listing surfaces.
#[derive(Clone, Debug, Serialize)]
pub struct SessionDescription {
    pub stream_key: StreamKey,
    pub stream_info_id: String,
    #[serde(rename = "type")]
    pub session_type: String,
    pub filter: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub info: HashMap<String, String>,
    pub stats: SessionStatsView,
}

/// Snapshot of one registry entry.
#[derive(Clone, Debug, Serialize)]
pub struct StreamView {
    pub id: String,
    pub src_ip: Ipv4Addr,
    pub erspan_id: u16,
    pub erspan_version: u8,
    #[serde(with = "rfc3339")]
    pub first_seen: SystemTime,
    #[serde(with = "rfc3339")]
    pub last_seen: SystemTime,
    pub packets: u64,
    pub bytes: u64,
    pub forward_sessions: Vec<SessionDescription>,
}

/// One element of the `/streams` listing: the key rendered as `"ip/id"` plus
/// the full stream snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct StreamEntry {
    pub id: String,
    pub stream_info: StreamView,
}

pub fn unix_nanos(ts: SystemTime) -> i64 {
    match ts.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(_) => 0,
    }
}

/// SystemTime <-> RFC 3339 for JSON surfaces.
mod rfc3339 {
    use chrono::{DateTime, Utc};
    use serde::Serializer;
    use std::time::SystemTime;

    pub fn serialize<S: Serializer>(ts: &SystemTime, ser: S) -> Result<S::Ok, S::Error> {
        let dt: DateTime<Utc> = (*ts).into();
        ser.serialize_str(&dt.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_u32_round_trip() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(Ipv4Addr::from(u32::from(ip)), ip);
        assert_eq!(u32::from(ip), 0x0A000001);

        let ip: Ipv4Addr = "192.168.1.254".parse().unwrap();
        assert_eq!(ip.to_string().parse::<Ipv4Addr>().unwrap(), ip);
    }

    #[test]
    fn test_stream_key_display() {
        let key = StreamKey::new(Ipv4Addr::new(10, 0, 0, 1), 7);
        assert_eq!(key.to_string(), "10.0.0.1/7");
    }

    #[test]
    fn test_null_stream_key() {
        assert!(NULL_STREAM_KEY.is_null());
        assert_eq!(NULL_STREAM_KEY.erspan_id, 65535);
        assert!(!StreamKey::new(Ipv4Addr::new(10, 0, 0, 1), 7).is_null());
    }

    #[test]
    fn test_stream_key_json() {
        let key = StreamKey::new(Ipv4Addr::new(10, 0, 0, 1), 7);
        let json = serde_json::to_value(key).unwrap();
        assert_eq!(json["src_ip"], "10.0.0.1");
        assert_eq!(json["erspan_id"], 7);

        let back: StreamKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_session_stats_view() {
        let stats = SessionStats::new();
        stats.total_packets.fetch_add(3, Ordering::Relaxed);
        stats.filtered_packets.fetch_add(1, Ordering::Relaxed);
        let view = stats.view();
        assert_eq!(view.total_packets, 3);
        assert_eq!(view.filtered_packets, 1);
    }
}
