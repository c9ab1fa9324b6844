use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use crate::forward::manager::{ForwardSessionManager, FwdError};
use crate::forward::session::ForwardSession;
use crate::metrics;
use crate::types::{StreamEntry, StreamKey};

#[derive(Clone)]
struct AppState {
    manager: Arc<ForwardSessionManager>,
}

pub fn router(manager: Arc<ForwardSessionManager>) -> Router {
    Router::new()
        .route("/streams", get(list_streams))
        .route("/streams/sse", get(list_streams_sse))
        .route("/forward", post(create_forward_session))
        .route("/metrics", get(render_metrics))
        .with_state(AppState { manager })
}

/// Spawns the HTTP server in the background; it serves until the shutdown
/// signal flips.
pub fn dispatch_server(
    addr: SocketAddr,
    manager: Arc<ForwardSessionManager>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("HTTP server listening on {}", addr);
        axum::serve(listener, router(manager))
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        Ok(())
    })
}

#[derive(Serialize)]
struct ApiError {
    code: &'static str,
    message: String,
}

fn error_response(status: StatusCode, code: &'static str, message: String) -> Response {
    (status, Json(ApiError { code, message })).into_response()
}

async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamEntry>> {
    Json(state.manager.list())
}

/// Same payload as `/streams`, pushed as one SSE event per second.
async fn list_streams_sse(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let manager = state.manager.clone();
    let stream = IntervalStream::new(tokio::time::interval(Duration::from_secs(1))).filter_map(
        move |_| match serde_json::to_string(&manager.list()) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(_) => None,
        },
    );
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// JSON body of `POST /forward`. Either `stream_info_id` or the
/// `(src_ip, erspan_id)` pair selects the stream.
#[derive(Debug, Deserialize)]
struct ForwardReq {
    #[serde(default)]
    src_ip: String,
    #[serde(default)]
    erspan_id: u16,
    #[serde(default)]
    stream_info_id: String,
    #[serde(rename = "type")]
    session_type: String,
    #[serde(default)]
    filter: String,
    #[serde(default)]
    cfg: Map<String, Value>,
}

async fn create_forward_session(
    State(state): State<AppState>,
    Json(req): Json<ForwardReq>,
) -> Response {
    info!(
        "forward request: stream {:?}/{:?} id {:?} type {} filter {:?}",
        req.src_ip, req.erspan_id, req.stream_info_id, req.session_type, req.filter
    );

    let result = if !req.stream_info_id.is_empty() {
        state.manager.create_by_stream_id(
            &req.stream_info_id,
            &req.session_type,
            &req.filter,
            &req.cfg,
        )
    } else {
        match req.src_ip.parse::<Ipv4Addr>() {
            Ok(src_ip) => state.manager.create_by_key(
                StreamKey::new(src_ip, req.erspan_id),
                &req.session_type,
                &req.filter,
                &req.cfg,
            ),
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "BAD_REQUEST",
                    format!("invalid src_ip: {:?}", req.src_ip),
                )
            }
        }
    };

    match result {
        Ok(handle) => (StatusCode::OK, Json(handle.session.describe())).into_response(),
        Err(e @ FwdError::StreamNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "STREAM_NOT_FOUND", e.to_string())
        }
        Err(e @ FwdError::UnknownType(_)) => {
            error_response(StatusCode::BAD_REQUEST, "UNKNOWN_TYPE", e.to_string())
        }
        Err(e @ FwdError::Session(_)) => {
            error_response(StatusCode::BAD_REQUEST, "SESSION_CREATE", e.to_string())
        }
    }
}

async fn render_metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_prometheus(),
    )
        .into_response()
}
