use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hivestream_protocol::messages::{HubMessage, ViewerMessage};
use hivestream_protocol::rpc::MediaEvent;

use crate::ms::{MsClient, MsError};
use crate::stream::StreamSupervisor;

/// Interval between WebSocket ping frames.
const WS_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Grace period after a ping before the connection counts as dead.
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a fresh connection may idle before its first viewer request.
const VIEWER_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Missing required fields: cameraId, streamId, sdpOffer")]
    MissingFields,
    #[error("No active stream found for camera {0}")]
    NoActiveStream(String),
    #[error("Maximum viewers ({0}) reached for stream")]
    ViewerCapReached(usize),
    #[error("media server: {0}")]
    Ms(#[from] MsError),
}

#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Message(HubMessage),
    Close,
}

/// One connected browser viewer: its per-viewer sink endpoint on the media
/// server and the outbox its WebSocket task drains.
pub struct ViewerSession {
    pub viewer_id: Uuid,
    pub camera_id: String,
    pub stream_id: String,
    pub sink_id: String,
    pub created_at: DateTime<Utc>,
    outbox: mpsc::UnboundedSender<OutboundFrame>,
}

/// Serializable viewer snapshot for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct ViewerInfo {
    pub viewer_id: Uuid,
    pub camera_id: String,
    pub stream_id: String,
    pub sink_id: String,
    pub created_at: DateTime<Utc>,
}

/// Registry of connected viewers. Owns each viewer's sink endpoint: removing
/// a viewer releases exactly that sink, never the shared receiver or the
/// pipeline.
pub struct ViewerRegistry {
    ms: Arc<MsClient>,
    viewers: RwLock<HashMap<Uuid, ViewerSession>>,
    max_per_stream: usize,
}

impl ViewerRegistry {
    pub fn new(ms: Arc<MsClient>, max_per_stream: usize) -> Self {
        Self {
            ms,
            viewers: RwLock::new(HashMap::new()),
            max_per_stream,
        }
    }

    pub async fn count(&self, camera_id: Option<&str>) -> usize {
        let viewers = self.viewers.read().await;
        match camera_id {
            Some(camera_id) => viewers
                .values()
                .filter(|v| v.camera_id == camera_id)
                .count(),
            None => viewers.len(),
        }
    }

    /// Snapshot for enumeration endpoints; copied under the lock, consumed
    /// outside it.
    pub async fn snapshot(&self, camera_id: Option<&str>) -> Vec<ViewerInfo> {
        let viewers = self.viewers.read().await;
        let mut infos: Vec<ViewerInfo> = viewers
            .values()
            .filter(|v| camera_id.is_none_or(|c| v.camera_id == c))
            .map(|v| ViewerInfo {
                viewer_id: v.viewer_id,
                camera_id: v.camera_id.clone(),
                stream_id: v.stream_id.clone(),
                sink_id: v.sink_id.clone(),
                created_at: v.created_at,
            })
            .collect();
        infos.sort_by_key(|v| v.created_at);
        infos
    }

    async fn insert(&self, session: ViewerSession) {
        let mut viewers = self.viewers.write().await;
        viewers.insert(session.viewer_id, session);
    }

    async fn sink_of(&self, viewer_id: Uuid) -> Option<String> {
        let viewers = self.viewers.read().await;
        viewers.get(&viewer_id).map(|v| v.sink_id.clone())
    }

    /// Outbox of the viewer owning this sink endpoint, if any.
    pub async fn sender_for_sink(
        &self,
        endpoint_id: &str,
    ) -> Option<(Uuid, mpsc::UnboundedSender<OutboundFrame>)> {
        let viewers = self.viewers.read().await;
        viewers
            .values()
            .find(|v| v.sink_id == endpoint_id)
            .map(|v| (v.viewer_id, v.outbox.clone()))
    }

    /// Remove a viewer and release its sink. The map entry goes first so no
    /// late ICE relay targets a freed endpoint. Returns false if unknown.
    pub async fn release(&self, viewer_id: Uuid) -> bool {
        let removed = {
            let mut viewers = self.viewers.write().await;
            viewers.remove(&viewer_id)
        };
        match removed {
            Some(session) => {
                self.ms.release_endpoint(&session.sink_id).await;
                info!(%viewer_id, "Viewer released");
                true
            }
            None => false,
        }
    }

    /// Tear down every viewer bound to a camera's session: error message,
    /// socket close, sink release.
    pub async fn release_for_camera(&self, camera_id: &str) {
        let doomed: Vec<Uuid> = {
            let viewers = self.viewers.read().await;
            viewers
                .values()
                .filter(|v| v.camera_id == camera_id)
                .map(|v| v.viewer_id)
                .collect()
        };
        for viewer_id in doomed {
            let removed = {
                let mut viewers = self.viewers.write().await;
                viewers.remove(&viewer_id)
            };
            if let Some(session) = removed {
                let _ = session.outbox.send(OutboundFrame::Message(HubMessage::Error {
                    message: "Stream stopped".to_string(),
                }));
                let _ = session.outbox.send(OutboundFrame::Close);
                self.ms.release_endpoint(&session.sink_id).await;
                info!(%viewer_id, camera = %camera_id, "Viewer released with stream");
            }
        }
    }
}

/// Relay media-server ICE events to the owning viewer's socket.
///
/// The single process-wide listener: unwraps the event envelope, matches the
/// endpoint to a viewer sink, forwards the candidate. Candidates for unknown
/// endpoints are logged and dropped.
pub fn spawn_ice_relay(ms: &Arc<MsClient>, registry: Arc<ViewerRegistry>) -> JoinHandle<()> {
    let mut events = ms.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(value) => match MediaEvent::from_value(value) {
                    MediaEvent::IceCandidateFound {
                        endpoint,
                        candidate,
                    } => match registry.sender_for_sink(&endpoint).await {
                        Some((viewer_id, outbox)) => {
                            let _ = outbox.send(OutboundFrame::Message(
                                HubMessage::IceCandidate { candidate },
                            ));
                            debug!(%viewer_id, "Relayed ICE candidate to viewer");
                        }
                        None => {
                            warn!(%endpoint, "ICE candidate for unknown endpoint, dropped");
                        }
                    },
                    MediaEvent::Unknown { kind, endpoint } => {
                        debug!(%kind, %endpoint, "Ignoring media event");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "ICE relay lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("ICE relay stopped");
    })
}

/// Handle one viewer WebSocket connection.
///
/// Single-writer discipline: everything sent to the browser flows through the
/// per-viewer outbox so the response, relayed candidates, and errors cannot
/// interleave mid-frame.
pub async fn handle_viewer_ws(
    mut socket: WebSocket,
    ms: Arc<MsClient>,
    supervisor: Arc<StreamSupervisor>,
    registry: Arc<ViewerRegistry>,
    send_max_kbps: u32,
    send_min_kbps: u32,
) {
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let mut viewer_id: Option<Uuid> = None;

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_pong = Instant::now();
    let connect_deadline = Instant::now() + VIEWER_CONNECT_TIMEOUT;

    debug!("Viewer WebSocket connected");

    loop {
        tokio::select! {
            // A connection that never asks to view anything gets dropped
            _ = tokio::time::sleep_until(connect_deadline), if viewer_id.is_none() => {
                debug!("No viewer request within the connect window, closing");
                break;
            }
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PING_INTERVAL + WS_PONG_TIMEOUT {
                    debug!("Viewer WebSocket ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            frame = outbox_rx.recv() => {
                match frame {
                    Some(OutboundFrame::Message(msg)) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to serialize hub message: {e}");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close) | None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let message = match serde_json::from_str::<ViewerMessage>(&text) {
                            Ok(message) => message,
                            Err(e) => {
                                debug!("Invalid viewer message: {e}");
                                send_error(&mut socket, format!("Invalid message format: {e}")).await;
                                continue;
                            }
                        };
                        match message {
                            ViewerMessage::Viewer { camera_id, stream_id, sdp_offer } => {
                                if viewer_id.is_some() {
                                    send_error(&mut socket, "Viewer already attached".to_string()).await;
                                    continue;
                                }
                                if camera_id.is_empty() || stream_id.is_empty() || sdp_offer.is_empty() {
                                    send_error(&mut socket, SignalingError::MissingFields.to_string()).await;
                                    continue;
                                }
                                match attach_viewer(
                                    &ms,
                                    &supervisor,
                                    &registry,
                                    &outbox_tx,
                                    &camera_id,
                                    &stream_id,
                                    &sdp_offer,
                                    send_max_kbps,
                                    send_min_kbps,
                                ).await {
                                    Ok(id) => viewer_id = Some(id),
                                    Err(e) => {
                                        warn!(camera = %camera_id, "Viewer attach failed: {e}");
                                        send_error(&mut socket, e.to_string()).await;
                                        break;
                                    }
                                }
                            }
                            ViewerMessage::OnIceCandidate { candidate } => {
                                let Some(id) = viewer_id else {
                                    debug!("ICE candidate from unattached viewer, dropped");
                                    continue;
                                };
                                let Some(sink_id) = registry.sink_of(id).await else {
                                    debug!(viewer = %id, "ICE candidate for released viewer, dropped");
                                    continue;
                                };
                                if let Err(e) = ms.add_ice_candidate(&sink_id, &candidate).await {
                                    warn!(viewer = %id, "Failed to add ICE candidate: {e}");
                                    send_error(&mut socket, format!("Failed to add ICE candidate: {e}")).await;
                                }
                            }
                            ViewerMessage::Stop => {
                                debug!(viewer = ?viewer_id, "Viewer requested stop");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Viewer WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Remove from the map before releasing the sink; a concurrent stream stop
    // may already have done both.
    if let Some(id) = viewer_id {
        registry.release(id).await;
    }
    debug!("Viewer WebSocket disconnected");
}

async fn send_error(socket: &mut WebSocket, message: String) {
    let frame = HubMessage::Error { message };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}

/// The viewer-attach protocol, strictly ordered:
/// validate session and cap, create the sink, subscribe to ICE events before
/// any gathering, bound send bandwidth, connect the shared receiver, record
/// the viewer (ICE events may fire immediately after), process the offer,
/// then start gathering.
#[allow(clippy::too_many_arguments)]
async fn attach_viewer(
    ms: &Arc<MsClient>,
    supervisor: &StreamSupervisor,
    registry: &ViewerRegistry,
    outbox: &mpsc::UnboundedSender<OutboundFrame>,
    camera_id: &str,
    stream_id: &str,
    sdp_offer: &str,
    send_max_kbps: u32,
    send_min_kbps: u32,
) -> Result<Uuid, SignalingError> {
    let (pipeline_id, receiver_id, _session_stream) = supervisor
        .connection_info(camera_id)
        .await
        .ok_or_else(|| SignalingError::NoActiveStream(camera_id.to_string()))?;

    if registry.count(Some(camera_id)).await >= registry.max_per_stream {
        return Err(SignalingError::ViewerCapReached(registry.max_per_stream));
    }

    let viewer_id = Uuid::new_v4();
    let sink_id = ms.create_webrtc_endpoint(&pipeline_id).await?;
    info!(%viewer_id, camera = %camera_id, sink = %sink_id, "Viewer sink created");

    match configure_sink(
        ms,
        registry,
        outbox,
        viewer_id,
        camera_id,
        stream_id,
        &receiver_id,
        &sink_id,
        sdp_offer,
        send_max_kbps,
        send_min_kbps,
    )
    .await
    {
        Ok(()) => Ok(viewer_id),
        Err(e) => {
            // Per-viewer cleanup only; the session itself is unaffected
            registry.release(viewer_id).await;
            ms.release_endpoint(&sink_id).await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn configure_sink(
    ms: &Arc<MsClient>,
    registry: &ViewerRegistry,
    outbox: &mpsc::UnboundedSender<OutboundFrame>,
    viewer_id: Uuid,
    camera_id: &str,
    stream_id: &str,
    receiver_id: &str,
    sink_id: &str,
    sdp_offer: &str,
    send_max_kbps: u32,
    send_min_kbps: u32,
) -> Result<(), SignalingError> {
    // Older server lines only know the legacy event name; 6.x renamed it.
    if ms.subscribe(sink_id, "OnIceCandidate").await.is_err() {
        ms.subscribe(sink_id, "IceCandidateFound").await?;
    }

    ms.set_max_video_send_bandwidth(sink_id, send_max_kbps).await?;
    ms.set_min_video_send_bandwidth(sink_id, send_min_kbps).await?;

    ms.connect_endpoints(receiver_id, sink_id).await?;

    // Recorded before the offer is processed: candidates found during
    // gathering must already resolve to this viewer.
    registry
        .insert(ViewerSession {
            viewer_id,
            camera_id: camera_id.to_string(),
            stream_id: stream_id.to_string(),
            sink_id: sink_id.to_string(),
            created_at: Utc::now(),
            outbox: outbox.clone(),
        })
        .await;

    let sdp_answer = ms.process_offer(sink_id, sdp_offer).await?;
    let _ = outbox.send(OutboundFrame::Message(HubMessage::ViewerResponse {
        sdp_answer,
        viewer_id: viewer_id.to_string(),
    }));

    ms.gather_candidates(sink_id).await?;

    info!(%viewer_id, camera = %camera_id, "Viewer attached");
    Ok(())
}
