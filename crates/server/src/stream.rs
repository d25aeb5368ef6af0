use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

use hivestream_protocol::config::Config;
use hivestream_protocol::sdp::{self, DYNAMIC_PORT, SdpError, VendorSdpMetadata};

use crate::hub::ViewerRegistry;
use crate::keepalive::{CameraKeepalive, KeepalivePump, KeepaliveStats};
use crate::mqtt::{MqttError, MqttGateway};
use crate::ms::{MsClient, MsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Starting,
    Active,
    Stopping,
    Stopped,
    Error,
}

/// Every reportable state, for state-distribution metrics.
pub const STREAM_STATES: [StreamState; 6] = [
    StreamState::Idle,
    StreamState::Starting,
    StreamState::Active,
    StreamState::Stopping,
    StreamState::Stopped,
    StreamState::Error,
];

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Starting => "starting",
            StreamState::Active => "active",
            StreamState::Stopping => "stopping",
            StreamState::Stopped => "stopped",
            StreamState::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream already active for camera {camera_id}")]
    AlreadyActive {
        camera_id: String,
        session_id: String,
    },
    #[error("stream for camera {0} is still starting")]
    StillStarting(String),
    #[error("no active stream for camera {0}")]
    NotFound(String),
    #[error("media server: {0}")]
    Ms(#[from] MsError),
    #[error("camera command: {0}")]
    Mqtt(#[from] MqttError),
    #[error("vendor SDP: {0}")]
    Sdp(#[from] SdpError),
}

/// Serializable session descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub camera_id: String,
    pub session_id: String,
    pub stream_id: String,
    pub state: StreamState,
    pub pipeline_id: Option<String>,
    pub receiver_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub errors: u64,
}

/// Session detail with live keepalive statistics and the vendor SDP values
/// negotiated with the camera.
#[derive(Debug, Clone, Serialize)]
pub struct StreamDetail {
    #[serde(flatten)]
    pub info: StreamInfo,
    pub media: VendorSdpMetadata,
    pub keepalive: Option<KeepaliveStats>,
}

/// Final statistics returned by `stop`.
#[derive(Debug, Clone, Serialize)]
pub struct StopSummary {
    #[serde(flatten)]
    pub info: StreamInfo,
    pub duration_seconds: Option<f64>,
    pub keepalive: Option<KeepaliveStats>,
}

struct StreamSession {
    info: StreamInfo,
    media: VendorSdpMetadata,
    pump: Option<KeepalivePump>,
}

/// Owns every camera's session lifecycle: builds the pipeline on the media
/// server, negotiates the vendor SDP with the camera over MQTT, runs the
/// keepalive pump, and tears everything down on stop or keepalive exhaustion.
pub struct StreamSupervisor {
    ms: Arc<MsClient>,
    mqtt: Arc<MqttGateway>,
    viewers: Arc<ViewerRegistry>,
    config: Arc<Config>,
    sessions: RwLock<HashMap<String, StreamSession>>,
    weak: Weak<StreamSupervisor>,
}

impl StreamSupervisor {
    pub fn new(
        ms: Arc<MsClient>,
        mqtt: Arc<MqttGateway>,
        viewers: Arc<ViewerRegistry>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ms,
            mqtt,
            viewers,
            config,
            sessions: RwLock::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    /// Start a camera session. `target_ip` is the address written into the
    /// rewritten SDP, chosen by the control API from the requesting peer.
    ///
    /// The start protocol is strictly serial: pipeline, receiver endpoint,
    /// vendor offer, answer, REMB bounds, SDP rewrite, play publish,
    /// keepalive. Any failure releases the pipeline and parks the session in
    /// Error.
    pub async fn start(
        &self,
        camera_id: &str,
        target_ip: String,
        max_kbps: u32,
        min_kbps: u32,
    ) -> Result<StreamInfo, StreamError> {
        let stream_id = Uuid::new_v4().to_string();
        let session_id = format!("stream-{}-{}", short(camera_id), &stream_id[..8]);
        let media = VendorSdpMetadata::generate(DYNAMIC_PORT, DYNAMIC_PORT);

        // Reserve the slot under the write lock so concurrent starts for the
        // same camera cannot both pass the check.
        {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(camera_id) {
                match existing.info.state {
                    StreamState::Starting | StreamState::Active | StreamState::Stopping => {
                        return Err(StreamError::AlreadyActive {
                            camera_id: camera_id.to_string(),
                            session_id: existing.info.session_id.clone(),
                        });
                    }
                    // A session parked in Error has already released its
                    // resources; replace it.
                    _ => {
                        info!(camera = %short(camera_id), "Replacing stale stream session");
                        sessions.remove(camera_id);
                    }
                }
            }
            sessions.insert(
                camera_id.to_string(),
                StreamSession {
                    info: StreamInfo {
                        camera_id: camera_id.to_string(),
                        session_id: session_id.clone(),
                        stream_id: stream_id.clone(),
                        state: StreamState::Starting,
                        pipeline_id: None,
                        receiver_id: None,
                        started_at: None,
                        stopped_at: None,
                        error_message: None,
                        errors: 0,
                    },
                    media: media.clone(),
                    pump: None,
                },
            );
        }

        info!(camera = %short(camera_id), %session_id, "Starting stream");

        match self
            .drive_start(camera_id, &stream_id, &media, &target_ip, max_kbps, min_kbps)
            .await
        {
            Ok((pipeline_id, receiver_id)) => {
                let pump = self.spawn_keepalive(camera_id, &stream_id);
                let mut sessions = self.sessions.write().await;
                match sessions.get_mut(camera_id) {
                    Some(session) => {
                        session.info.state = StreamState::Active;
                        session.info.pipeline_id = Some(pipeline_id);
                        session.info.receiver_id = Some(receiver_id);
                        session.info.started_at = Some(Utc::now());
                        session.pump = Some(pump);
                        info!(camera = %short(camera_id), %session_id, "Stream active");
                        Ok(session.info.clone())
                    }
                    None => {
                        // Session vanished mid-start; nothing left to own the
                        // resources, undo them.
                        drop(sessions);
                        warn!(camera = %short(camera_id), "Session disappeared during start");
                        pump.stop().await;
                        self.ms.release_pipeline(&pipeline_id).await;
                        Err(StreamError::NotFound(camera_id.to_string()))
                    }
                }
            }
            Err(e) => {
                error!(camera = %short(camera_id), "Failed to start stream: {e}");
                let mut sessions = self.sessions.write().await;
                if let Some(session) = sessions.get_mut(camera_id) {
                    if session.info.stream_id == stream_id {
                        session.info.state = StreamState::Error;
                        session.info.error_message = Some(e.to_string());
                        session.info.errors += 1;
                    }
                }
                Err(e)
            }
        }
    }

    async fn drive_start(
        &self,
        camera_id: &str,
        stream_id: &str,
        media: &VendorSdpMetadata,
        target_ip: &str,
        max_kbps: u32,
        min_kbps: u32,
    ) -> Result<(String, String), StreamError> {
        let pipeline_id = self.ms.create_media_pipeline().await?;
        match self
            .negotiate(&pipeline_id, camera_id, stream_id, media, target_ip, max_kbps, min_kbps)
            .await
        {
            Ok(receiver_id) => Ok((pipeline_id, receiver_id)),
            Err(e) => {
                self.ms.release_pipeline(&pipeline_id).await;
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        pipeline_id: &str,
        camera_id: &str,
        stream_id: &str,
        media: &VendorSdpMetadata,
        target_ip: &str,
        max_kbps: u32,
        min_kbps: u32,
    ) -> Result<String, StreamError> {
        let receiver_id = self.ms.create_rtp_endpoint(pipeline_id).await?;

        // Placeholder ports; the answer carries the ports the media server
        // actually listens on.
        let offer = sdp::build_offer(media);
        let answer = self.ms.process_offer(&receiver_id, &offer).await?;

        // Receive bounds on the camera-facing endpoint make the media server
        // emit REMB feedback that modulates the camera's send rate.
        self.ms
            .set_max_video_recv_bandwidth(&receiver_id, max_kbps)
            .await?;
        self.ms
            .set_min_video_recv_bandwidth(&receiver_id, min_kbps)
            .await?;

        if !sdp::answer_supports_remb(&answer) {
            warn!(
                camera = %short(camera_id),
                "Answer lacks a=direction:passive; REMB feedback may not be produced"
            );
        }

        let rewritten = sdp::rewrite_answer(&answer, target_ip, media);
        sdp::validate_rewritten(&rewritten)?;

        self.mqtt
            .publish_play(camera_id, stream_id, rewritten)
            .await?;

        Ok(receiver_id)
    }

    fn spawn_keepalive(&self, camera_id: &str, stream_id: &str) -> KeepalivePump {
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let pump = KeepalivePump::spawn(
            CameraKeepalive {
                gateway: Arc::clone(&self.mqtt),
                camera_id: camera_id.to_string(),
                stream_id: stream_id.to_string(),
            },
            Duration::from_secs(self.config.stream.keepalive_interval_secs),
            fatal_tx,
        );

        let weak = self.weak.clone();
        let camera = camera_id.to_string();
        let stream = stream_id.to_string();
        tokio::spawn(async move {
            if let Some(message) = fatal_rx.recv().await
                && let Some(supervisor) = weak.upgrade()
            {
                supervisor.on_keepalive_failure(&camera, &stream, message).await;
            }
        });

        pump
    }

    /// Keepalive exhaustion: Active -> Error, then an autonomous stop.
    async fn on_keepalive_failure(&self, camera_id: &str, stream_id: &str, message: String) {
        error!(camera = %short(camera_id), "Keepalive exhausted: {message}");
        {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(camera_id) {
                Some(session) if session.info.stream_id == stream_id => {
                    session.info.state = StreamState::Error;
                    session.info.error_message = Some(message);
                    session.info.errors += 1;
                }
                // A newer session owns the camera now; nothing to do.
                _ => return,
            }
        }
        if let Err(e) = self.stop(camera_id).await {
            error!(camera = %short(camera_id), "Failed to stop stream after keepalive exhaustion: {e}");
        }
    }

    /// Stop a session: cancel and await the keepalive pump, publish the stop
    /// command (best-effort), release every attached viewer, release the
    /// pipeline (best-effort), and only then mark Stopped and drop the entry.
    pub async fn stop(&self, camera_id: &str) -> Result<StopSummary, StreamError> {
        let (stream_id, pipeline_id, pump) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(camera_id)
                .ok_or_else(|| StreamError::NotFound(camera_id.to_string()))?;
            match session.info.state {
                StreamState::Active | StreamState::Error => {}
                StreamState::Starting => {
                    return Err(StreamError::StillStarting(camera_id.to_string()));
                }
                _ => return Err(StreamError::NotFound(camera_id.to_string())),
            }
            session.info.state = StreamState::Stopping;
            (
                session.info.stream_id.clone(),
                session.info.pipeline_id.clone(),
                session.pump.take(),
            )
        };

        info!(camera = %short(camera_id), "Stopping stream");

        let keepalive = match pump {
            Some(pump) => Some(pump.stop().await),
            None => None,
        };

        if let Err(e) = self.mqtt.publish_stop(camera_id, &stream_id).await {
            warn!(camera = %short(camera_id), "Failed to publish stop command: {e}");
        }

        self.viewers.release_for_camera(camera_id).await;

        if let Some(pipeline_id) = &pipeline_id {
            self.ms.release_pipeline(pipeline_id).await;
        }

        let mut sessions = self.sessions.write().await;
        let mut session = match sessions.remove(camera_id) {
            Some(session) => session,
            None => return Err(StreamError::NotFound(camera_id.to_string())),
        };
        session.info.state = StreamState::Stopped;
        session.info.stopped_at = Some(Utc::now());
        session.info.pipeline_id = None;
        session.info.receiver_id = None;

        let duration_seconds = match (session.info.started_at, session.info.stopped_at) {
            (Some(started), Some(stopped)) => {
                Some((stopped - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };

        info!(camera = %short(camera_id), ?duration_seconds, "Stream stopped");

        Ok(StopSummary {
            info: session.info,
            duration_seconds,
            keepalive,
        })
    }

    /// Stop every session; used on shutdown.
    pub async fn stop_all(&self) {
        let camera_ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };
        for camera_id in camera_ids {
            if let Err(e) = self.stop(&camera_id).await {
                warn!(camera = %short(&camera_id), "Error stopping stream on shutdown: {e}");
            }
        }
    }

    pub async fn get(&self, camera_id: &str) -> Option<StreamDetail> {
        let sessions = self.sessions.read().await;
        sessions.get(camera_id).map(|session| StreamDetail {
            info: session.info.clone(),
            media: session.media.clone(),
            keepalive: session.pump.as_ref().map(|p| p.stats()),
        })
    }

    /// Snapshot of every session; taken under the lock, iterated outside it.
    pub async fn list(&self) -> Vec<StreamInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<StreamInfo> =
            sessions.values().map(|s| s.info.clone()).collect();
        infos.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        infos
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn state_counts(&self) -> Vec<(StreamState, usize)> {
        let sessions = self.sessions.read().await;
        STREAM_STATES
            .iter()
            .map(|state| {
                let count = sessions
                    .values()
                    .filter(|s| s.info.state == *state)
                    .count();
                (*state, count)
            })
            .collect()
    }

    /// Pipeline, shared receiver, and stream id for viewer attachment;
    /// `None` unless the session is Active.
    pub async fn connection_info(&self, camera_id: &str) -> Option<(String, String, String)> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(camera_id)?;
        if session.info.state != StreamState::Active {
            return None;
        }
        Some((
            session.info.pipeline_id.clone()?,
            session.info.receiver_id.clone()?,
            session.info.stream_id.clone(),
        ))
    }
}

/// Abbreviate long camera ids for log lines.
fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
