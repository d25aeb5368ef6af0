use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::IceCandidate;

/// Outgoing JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
    pub jsonrpc: &'static str,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            id,
            method,
            params,
            jsonrpc: "2.0",
        }
    }
}

/// Error object carried in a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcErrorBody {
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("Unknown error")
    }
}

/// Raw incoming frame before classification.
#[derive(Debug, Deserialize)]
pub struct RpcIncoming {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
    #[serde(default)]
    pub params: Option<Value>,
}

/// A classified incoming frame: responses carry an `id`, notifications a
/// `method` but no `id`.
#[derive(Debug)]
pub enum RpcFrame {
    Response {
        id: u64,
        result: Result<Value, RpcErrorBody>,
    },
    Notification {
        method: String,
        params: Value,
    },
    Malformed,
}

impl RpcIncoming {
    pub fn classify(self) -> RpcFrame {
        match (self.id, self.method) {
            (Some(id), _) => {
                let result = match self.error {
                    Some(err) => Err(err),
                    None => Ok(self.result.unwrap_or(Value::Null)),
                };
                RpcFrame::Response { id, result }
            }
            (None, Some(method)) => RpcFrame::Notification {
                method,
                params: self.params.unwrap_or(Value::Null),
            },
            (None, None) => RpcFrame::Malformed,
        }
    }
}

/// Payload of an `onEvent` notification: `params.value` holds the event.
#[derive(Debug, Clone, Deserialize)]
pub struct EventParams {
    pub value: EventValue,
}

/// The event envelope common to all media-server events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventValue {
    #[serde(rename = "type")]
    pub kind: String,
    /// Id of the object (endpoint) the event refers to
    pub object: String,
    #[serde(default)]
    pub data: Value,
}

/// Typed view over the event envelope. Unknown kinds are preserved so callers
/// can warn and drop them.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// ICE candidate gathered on an endpoint. Arrives as `OnIceCandidate`
    /// from older server lines and `IceCandidateFound` from 6.x onwards.
    IceCandidateFound {
        endpoint: String,
        candidate: IceCandidate,
    },
    Unknown {
        kind: String,
        endpoint: String,
    },
}

impl MediaEvent {
    pub fn from_value(value: EventValue) -> Self {
        match value.kind.as_str() {
            "OnIceCandidate" | "IceCandidateFound" => {
                let candidate = value
                    .data
                    .get("candidate")
                    .cloned()
                    .and_then(|c| serde_json::from_value::<IceCandidate>(c).ok());
                match candidate {
                    Some(candidate) => MediaEvent::IceCandidateFound {
                        endpoint: value.object,
                        candidate,
                    },
                    None => MediaEvent::Unknown {
                        kind: value.kind,
                        endpoint: value.object,
                    },
                }
            }
            _ => MediaEvent::Unknown {
                kind: value.kind,
                endpoint: value.object,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_as_jsonrpc_2() {
        let req = RpcRequest::new(7, "create", serde_json::json!({"type": "MediaPipeline"}));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "create");
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["params"]["type"], "MediaPipeline");
    }

    #[test]
    fn response_frame_with_result() {
        let incoming: RpcIncoming = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"result":{"value":"pipeline-1","sessionId":"s"}}"#,
        )
        .unwrap();
        match incoming.classify() {
            RpcFrame::Response { id, result } => {
                assert_eq!(id, 3);
                assert_eq!(result.unwrap()["value"], "pipeline-1");
            }
            _ => panic!("Expected Response"),
        }
    }

    #[test]
    fn response_frame_with_error() {
        let incoming: RpcIncoming = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":40101,"message":"Object not found"}}"#,
        )
        .unwrap();
        match incoming.classify() {
            RpcFrame::Response { id, result } => {
                assert_eq!(id, 4);
                let err = result.unwrap_err();
                assert_eq!(err.message(), "Object not found");
                assert_eq!(err.code, Some(40101));
            }
            _ => panic!("Expected Response"),
        }
    }

    #[test]
    fn notification_has_method_but_no_id() {
        let incoming: RpcIncoming = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"onEvent","params":{"value":{"type":"OnIceCandidate","object":"ep-1","data":{}}}}"#,
        )
        .unwrap();
        match incoming.classify() {
            RpcFrame::Notification { method, params } => {
                assert_eq!(method, "onEvent");
                assert_eq!(params["value"]["object"], "ep-1");
            }
            _ => panic!("Expected Notification"),
        }
    }

    #[test]
    fn frame_without_id_or_method_is_malformed() {
        let incoming: RpcIncoming = serde_json::from_str(r#"{"jsonrpc":"2.0"}"#).unwrap();
        assert!(matches!(incoming.classify(), RpcFrame::Malformed));
    }

    #[test]
    fn ice_event_decodes_under_legacy_name() {
        let params: EventParams = serde_json::from_str(
            r#"{"value":{"type":"OnIceCandidate","object":"ep-V1","data":{"candidate":{"candidate":"candidate:1 1 UDP 2130706431 10.0.0.1 50000 typ host","sdpMid":"0","sdpMLineIndex":0}}}}"#,
        )
        .unwrap();
        match MediaEvent::from_value(params.value) {
            MediaEvent::IceCandidateFound {
                endpoint,
                candidate,
            } => {
                assert_eq!(endpoint, "ep-V1");
                assert!(candidate.candidate.starts_with("candidate:1"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("Expected IceCandidateFound, got {other:?}"),
        }
    }

    #[test]
    fn ice_event_decodes_under_modern_name() {
        let value = EventValue {
            kind: "IceCandidateFound".to_string(),
            object: "ep-2".to_string(),
            data: serde_json::json!({
                "candidate": {"candidate": "candidate:2 ...", "sdpMid": "0", "sdpMLineIndex": 1}
            }),
        };
        assert!(matches!(
            MediaEvent::from_value(value),
            MediaEvent::IceCandidateFound { .. }
        ));
    }

    #[test]
    fn unknown_event_kind_is_preserved() {
        let value = EventValue {
            kind: "MediaStateChanged".to_string(),
            object: "ep-3".to_string(),
            data: Value::Null,
        };
        match MediaEvent::from_value(value) {
            MediaEvent::Unknown { kind, endpoint } => {
                assert_eq!(kind, "MediaStateChanged");
                assert_eq!(endpoint, "ep-3");
            }
            _ => panic!("Expected Unknown"),
        }
    }

    #[test]
    fn ice_event_with_missing_candidate_degrades_to_unknown() {
        let value = EventValue {
            kind: "OnIceCandidate".to_string(),
            object: "ep-4".to_string(),
            data: serde_json::json!({}),
        };
        assert!(matches!(
            MediaEvent::from_value(value),
            MediaEvent::Unknown { .. }
        ));
    }
}
