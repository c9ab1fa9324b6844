use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::forward::manager::ForwardSessionManager;
use crate::proto_streams::streams_service_server::StreamsService;
use crate::proto_streams::{ListStreamsRequest, ListStreamsResponse};
use crate::types::unix_nanos;

pub struct StreamsApi {
    manager: Arc<ForwardSessionManager>,
}

impl StreamsApi {
    pub fn new(manager: Arc<ForwardSessionManager>) -> Self {
        StreamsApi { manager }
    }
}

#[tonic::async_trait]
impl StreamsService for StreamsApi {
    async fn list_streams(
        &self,
        _request: Request<ListStreamsRequest>,
    ) -> Result<Response<ListStreamsResponse>, Status> {
        let streams = self
            .manager
            .list()
            .into_iter()
            .map(|entry| {
                let si = entry.stream_info;
                crate::proto_streams::StreamInfo {
                    id: si.id,
                    src_ip: u32::from(si.src_ip),
                    erspan_id: si.erspan_id as u32,
                    erspan_version: si.erspan_version as u32,
                    first_seen: unix_nanos(si.first_seen),
                    last_seen: unix_nanos(si.last_seen),
                    packets: si.packets,
                    bytes: si.bytes,
                    forward_sessions: si
                        .forward_sessions
                        .into_iter()
                        .map(|fs| crate::proto_streams::ForwardSession {
                            src_ip: u32::from(fs.stream_key.src_ip),
                            erspan_id: fs.stream_key.erspan_id as u32,
                            stream_info_id: fs.stream_info_id,
                            r#type: fs.session_type,
                            filter: fs.filter,
                            info: fs.info.into_iter().collect(),
                        })
                        .collect(),
                }
            })
            .collect();
        Ok(Response::new(ListStreamsResponse { streams }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::session::SessionFactories;
    use crate::types::StreamKey;
    use bytes::Bytes;
    use std::net::Ipv4Addr;
    use std::time::{Duration, SystemTime};

    #[tokio::test]
    async fn test_list_streams_reports_discovered_streams() {
        let manager = Arc::new(ForwardSessionManager::new(SessionFactories::new()));
        let key = StreamKey::new(Ipv4Addr::new(10, 0, 0, 1), 7);
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        manager
            .process_packet(key, 2, t, Bytes::from_static(&[0u8; 100]))
            .await;

        let api = StreamsApi::new(manager);
        let resp = api
            .list_streams(Request::new(ListStreamsRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(resp.streams.len(), 1);
        let si = &resp.streams[0];
        assert_eq!(si.src_ip, u32::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(si.erspan_id, 7);
        assert_eq!(si.erspan_version, 2);
        assert_eq!(si.packets, 1);
        assert_eq!(si.bytes, 100);
        assert_eq!(si.first_seen, si.last_seen);
        assert_eq!(si.first_seen, 1_700_000_000_000_000_000);
        assert!(si.forward_sessions.is_empty());
        assert!(!si.id.is_empty());
    }
}
