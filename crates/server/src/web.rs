use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use hivestream_protocol::config::{Config, NetworkConfig};

use crate::hub::{self, ViewerRegistry};
use crate::ms::MsClient;
use crate::stream::{StreamError, StreamSupervisor};

/// Browser offers can be large; signaling frames are capped well above them.
const VIEWER_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub ms: Arc<MsClient>,
    pub supervisor: Arc<StreamSupervisor>,
    pub viewers: Arc<ViewerRegistry>,
    pub started_at: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/streams", get(list_streams))
        .route("/streams/{camera_id}", get(get_stream))
        .route("/streams/{camera_id}/start", post(start_stream))
        .route("/streams/{camera_id}/stop", post(stop_stream))
        .route("/viewers", get(list_all_viewers))
        .route("/viewers/{camera_id}", get(list_camera_viewers))
        .route("/metrics", get(metrics))
        .route("/ice-config", get(ice_config))
        .route("/ws/viewer", get(viewer_ws_upgrade))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health — media-server connectivity and session counts.
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let connected = state.ms.is_connected();
    Json(json!({
        "status": if connected { "healthy" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339(),
        "media_server_connected": connected,
        "active_streams": state.supervisor.session_count().await,
        "total_viewers": state.viewers.count(None).await,
    }))
}

/// GET /streams — session enumeration with per-camera viewer counts.
async fn list_streams(State(state): State<Arc<AppState>>) -> Json<Value> {
    let infos = state.supervisor.list().await;
    let mut streams = Vec::with_capacity(infos.len());
    for info in infos {
        let viewer_count = state.viewers.count(Some(&info.camera_id)).await;
        let mut entry = serde_json::to_value(&info).unwrap_or_default();
        if let Some(map) = entry.as_object_mut() {
            map.insert("viewer_count".to_string(), json!(viewer_count));
        }
        streams.push(entry);
    }
    Json(json!({ "count": streams.len(), "streams": streams }))
}

/// GET /streams/{camera_id} — session detail including its viewers.
async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> Response {
    match state.supervisor.get(&camera_id).await {
        Some(detail) => {
            let viewers = state.viewers.snapshot(Some(&camera_id)).await;
            Json(json!({
                "stream": detail,
                "viewer_count": viewers.len(),
                "viewers": viewers,
            }))
            .into_response()
        }
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("No active stream for camera {camera_id}"),
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    max_bandwidth: Option<u32>,
    min_bandwidth: Option<u32>,
}

/// POST /streams/{camera_id}/start
///
/// The requesting peer decides which address the camera is told to send to:
/// local-network peers get the LAN address, everyone else the external one.
async fn start_stream(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> Response {
    // Optional body; anything unparseable falls back to configured bounds
    let request: StartRequest = if body.is_empty() {
        StartRequest::default()
    } else {
        serde_json::from_slice(&body).unwrap_or_default()
    };
    let max_kbps = request
        .max_bandwidth
        .unwrap_or(state.config.bandwidth.max_video_kbps);
    let min_kbps = request
        .min_bandwidth
        .unwrap_or(state.config.bandwidth.min_video_kbps);

    let target_ip = select_camera_ip(&state.config.network, &headers, peer);

    match state
        .supervisor
        .start(&camera_id, target_ip, max_kbps, min_kbps)
        .await
    {
        Ok(info) => (StatusCode::CREATED, Json(json!(info))).into_response(),
        Err(StreamError::AlreadyActive {
            camera_id,
            session_id,
        }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("Stream already active for camera {camera_id}"),
                "session_id": session_id,
            })),
        )
            .into_response(),
        Err(e) => stream_error_response(e),
    }
}

/// POST /streams/{camera_id}/stop — 200 with final statistics.
async fn stop_stream(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> Response {
    match state.supervisor.stop(&camera_id).await {
        Ok(summary) => Json(json!(summary)).into_response(),
        Err(e) => stream_error_response(e),
    }
}

/// GET /viewers — every connected viewer.
async fn list_all_viewers(State(state): State<Arc<AppState>>) -> Json<Value> {
    let viewers = state.viewers.snapshot(None).await;
    Json(json!({ "count": viewers.len(), "viewers": viewers }))
}

/// GET /viewers/{camera_id} — viewers of one camera.
async fn list_camera_viewers(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> Json<Value> {
    let viewers = state.viewers.snapshot(Some(&camera_id)).await;
    Json(json!({
        "camera_id": camera_id,
        "count": viewers.len(),
        "viewers": viewers,
    }))
}

/// GET /metrics — Prometheus text format.
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let active_streams = state.supervisor.session_count().await;
    let viewers = state.viewers.count(None).await;
    let ms_up = if state.ms.is_connected() { 1 } else { 0 };
    let pending = state.ms.pending_requests();
    let uptime = state.started_at.elapsed().as_secs();

    let mut body = format!(
        "# HELP hivestream_active_streams Number of stream sessions\n\
         # TYPE hivestream_active_streams gauge\n\
         hivestream_active_streams {active_streams}\n\
         # HELP hivestream_connected_viewers Number of connected viewers\n\
         # TYPE hivestream_connected_viewers gauge\n\
         hivestream_connected_viewers {viewers}\n\
         # HELP hivestream_media_server_up Media server connectivity\n\
         # TYPE hivestream_media_server_up gauge\n\
         hivestream_media_server_up {ms_up}\n\
         # HELP hivestream_ms_pending_requests Outstanding media server requests\n\
         # TYPE hivestream_ms_pending_requests gauge\n\
         hivestream_ms_pending_requests {pending}\n\
         # HELP hivestream_uptime_seconds Seconds since process start\n\
         # TYPE hivestream_uptime_seconds gauge\n\
         hivestream_uptime_seconds {uptime}\n\
         # HELP hivestream_streams_state Stream sessions by state\n\
         # TYPE hivestream_streams_state gauge\n"
    );
    for (stream_state, count) in state.supervisor.state_counts().await {
        body.push_str(&format!(
            "hivestream_streams_state{{state=\"{}\"}} {count}\n",
            stream_state.as_str()
        ));
    }

    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

/// GET /ice-config — STUN servers viewers should use, passed through from
/// configuration.
async fn ice_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "iceServers": [
            { "urls": [state.config.network.stun_url.clone()] }
        ]
    }))
}

/// GET /ws/viewer — signaling WebSocket upgrade, any origin.
async fn viewer_ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let send_max_kbps = state.config.bandwidth.max_video_kbps;
    let send_min_kbps = state.config.bandwidth.min_video_kbps;
    ws.max_message_size(VIEWER_MAX_FRAME_BYTES)
        .on_upgrade(move |socket| {
            hub::handle_viewer_ws(
                socket,
                Arc::clone(&state.ms),
                Arc::clone(&state.supervisor),
                Arc::clone(&state.viewers),
                send_max_kbps,
                send_min_kbps,
            )
        })
}

fn stream_error_response(e: StreamError) -> Response {
    let status = match &e {
        StreamError::AlreadyActive { .. } | StreamError::StillStarting(_) => StatusCode::CONFLICT,
        StreamError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Pick the camera-facing address for a start request: `X-Forwarded-For`
/// first token, else the peer address. Local-prefix and loopback peers get
/// the LAN address; everyone else the external one.
pub(crate) fn select_camera_ip(
    network: &NetworkConfig,
    headers: &HeaderMap,
    peer: SocketAddr,
) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let viewer_ip = forwarded
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string());

    let is_local = viewer_ip.starts_with(&network.local_network_prefix)
        || viewer_ip == "127.0.0.1"
        || viewer_ip == "::1"
        || viewer_ip == "localhost";

    let selected = if is_local {
        network.local_ip.clone()
    } else {
        network.external_ip.clone()
    };
    info!(%viewer_ip, local = is_local, camera_ip = %selected, "Selected camera-facing address");
    selected
}
