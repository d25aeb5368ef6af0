use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `sourceType` the camera firmware expects on every MQTT command.
pub const CAMERA_SOURCE_TYPE: &str = "hive-cam";

/// A trickle ICE candidate as exchanged with browsers and the media server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

/// Messages a browser viewer sends on the signaling WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewerMessage {
    /// Request to watch a stream
    #[serde(rename_all = "camelCase")]
    Viewer {
        camera_id: String,
        stream_id: String,
        sdp_offer: String,
    },
    /// ICE candidate gathered by the browser
    OnIceCandidate { candidate: IceCandidate },
    /// Viewer is done
    Stop,
}

/// Messages the hub sends back to a viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HubMessage {
    /// Answer to the viewer's offer
    #[serde(rename_all = "camelCase")]
    ViewerResponse {
        sdp_answer: String,
        viewer_id: String,
    },
    /// ICE candidate gathered by the media server
    IceCandidate { candidate: IceCandidate },
    Error { message: String },
}

/// Command published to a camera's per-purpose MQTT topic.
///
/// Wire shape: the common envelope fields plus the `messageType`-discriminated
/// body flattened alongside them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraCommand {
    pub request_id: Uuid,
    /// ISO-8601 UTC with trailing `Z`
    pub creation_timestamp: String,
    pub source_id: String,
    pub source_type: String,
    pub stream_id: String,
    #[serde(flatten)]
    pub body: CameraCommandBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum CameraCommandBody {
    #[serde(rename_all = "camelCase")]
    Play { sdp_offer: String },
    Stop,
    #[serde(rename_all = "camelCase")]
    Keepalive { keepalive_count: u64 },
}

impl CameraCommand {
    fn envelope(camera_id: &str, stream_id: &str, body: CameraCommandBody) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            creation_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            source_id: camera_id.to_string(),
            source_type: CAMERA_SOURCE_TYPE.to_string(),
            stream_id: stream_id.to_string(),
            body,
        }
    }

    /// Play command carrying the rewritten SDP. The SDP is a plain JSON
    /// string value; serialization escapes the CRLFs, the camera restores
    /// them.
    pub fn play(camera_id: &str, stream_id: &str, sdp_offer: String) -> Self {
        Self::envelope(camera_id, stream_id, CameraCommandBody::Play { sdp_offer })
    }

    pub fn stop(camera_id: &str, stream_id: &str) -> Self {
        Self::envelope(camera_id, stream_id, CameraCommandBody::Stop)
    }

    pub fn keepalive(camera_id: &str, stream_id: &str, keepalive_count: u64) -> Self {
        Self::envelope(
            camera_id,
            stream_id,
            CameraCommandBody::Keepalive { keepalive_count },
        )
    }
}
