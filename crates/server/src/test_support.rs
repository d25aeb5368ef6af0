//! In-process fakes for the media server and the MQTT worker, shared by the
//! component tests.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use hivestream_protocol::config::Config;

use crate::mqtt::{MqttError, PublishCommand};

/// Answer a media-server RtpEndpoint would produce for the vendor offer.
pub const MS_ANSWER: &str = "v=0\r\n\
o=- 3923422 0 IN IP4 192.168.199.173\r\n\
s=Kurento Media Server\r\n\
c=IN IP4 192.168.199.173\r\n\
t=0 0\r\n\
m=audio 32414 RTP/AVPF 96 0\r\n\
a=rtpmap:96 opus/48000/2\r\n\
a=sendrecv\r\n\
a=direction:passive\r\n\
a=rtcp:32415\r\n\
a=ssrc:981263540 cname:user999@host-cafe0123\r\n\
m=video 43210 RTP/AVPF 103\r\n\
a=rtpmap:103 H264/90000\r\n\
a=rtcp-fb:103 nack\r\n\
a=rtcp-fb:103 nack pli\r\n\
a=rtcp-fb:103 goog-remb\r\n\
a=rtcp-fb:103 ccm fir\r\n\
a=recvonly\r\n\
a=direction:passive\r\n\
a=rtcp:43211\r\n\
a=ssrc:112233445 cname:user999@host-cafe0123\r\n";

pub type PublishLog = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

/// Single-connection scripted media server.
///
/// Replies to every request with canned object ids and answers, records the
/// operations it saw, and can push notifications to the connected client.
pub struct FakeMediaServer {
    pub url: String,
    ops: Arc<Mutex<Vec<String>>>,
    notify_tx: mpsc::UnboundedSender<Value>,
}

impl FakeMediaServer {
    pub fn operations(&self) -> Vec<String> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Push a raw JSON-RPC frame (e.g. an `onEvent` notification) to the
    /// connected client.
    pub fn notify(&self, frame: Value) {
        let _ = self.notify_tx.send(frame);
    }
}

pub async fn spawn_fake_media_server() -> FakeMediaServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ops: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Value>();

    let task_ops = Arc::clone(&ops);
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        let mut webrtc_count = 0u32;
        loop {
            tokio::select! {
                frame = ws.next() => {
                    let Some(Ok(Message::Text(text))) = frame else { break };
                    let request: Value = serde_json::from_str(&text).unwrap();
                    let reply = respond(&request, &task_ops, &mut webrtc_count);
                    if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                        break;
                    }
                }
                event = notify_rx.recv() => {
                    let Some(event) = event else { break };
                    if ws.send(Message::Text(event.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    FakeMediaServer {
        url: format!("ws://{addr}"),
        ops,
        notify_tx,
    }
}

fn respond(request: &Value, ops: &Arc<Mutex<Vec<String>>>, webrtc_count: &mut u32) -> Value {
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or("");
    let params = &request["params"];

    let (op, value) = match method {
        "create" => {
            let kind = params["type"].as_str().unwrap_or("?");
            let object = match kind {
                "MediaPipeline" => "pipeline-1".to_string(),
                "RtpEndpoint" => "rtp-1".to_string(),
                "WebRtcEndpoint" => {
                    *webrtc_count += 1;
                    format!("webrtc-{webrtc_count}")
                }
                other => format!("object-{other}"),
            };
            (format!("create:{kind}"), json!(object))
        }
        "invoke" => {
            let operation = params["operation"].as_str().unwrap_or("?");
            match operation {
                "processOffer" => ("invoke:processOffer".to_string(), json!(MS_ANSWER)),
                "generateOffer" => ("invoke:generateOffer".to_string(), json!(MS_ANSWER)),
                set_op if set_op.starts_with("set") => {
                    let kbps = params["operationParams"]
                        .as_object()
                        .and_then(|m| m.values().next())
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    (format!("invoke:{set_op}:{kbps}"), Value::Null)
                }
                other => (format!("invoke:{other}"), Value::Null),
            }
        }
        "subscribe" => (
            format!("subscribe:{}", params["type"].as_str().unwrap_or("?")),
            json!("sub-1"),
        ),
        "release" => (
            format!("release:{}", params["object"].as_str().unwrap_or("?")),
            Value::Null,
        ),
        "ping" => ("ping".to_string(), json!("pong")),
        other => (other.to_string(), Value::Null),
    };

    ops.lock().unwrap_or_else(|e| e.into_inner()).push(op);
    json!({ "jsonrpc": "2.0", "id": id, "result": { "value": value } })
}

/// Config with dummy cert paths; validation is not exercised here.
pub fn stub_config() -> Config {
    Config::from_vars(|key| {
        Some(match key {
            "MQTT_CA_CERT" => "/tmp/ca.pem",
            "MQTT_CLIENT_CERT" => "/tmp/client.pem",
            "MQTT_CLIENT_KEY" => "/tmp/client.key",
            "EXTERNAL_IP" => "203.0.113.5",
            "LOCAL_IP" => "192.168.199.10",
            _ => return None,
        }
        .to_string())
    })
    .unwrap()
}

/// Drive the MQTT stub: record every publish and acknowledge it.
pub fn ack_all_publishes(mut commands: mpsc::Receiver<PublishCommand>) -> PublishLog {
    let log: PublishLog = Arc::new(Mutex::new(Vec::new()));
    let task_log = Arc::clone(&log);
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            task_log
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((command.topic.clone(), command.payload.clone()));
            let _ = command.done.send(Ok(()));
        }
    });
    log
}

/// Drive the MQTT stub: record every publish and refuse it.
pub fn refuse_all_publishes(mut commands: mpsc::Receiver<PublishCommand>) -> PublishLog {
    let log: PublishLog = Arc::new(Mutex::new(Vec::new()));
    let task_log = Arc::clone(&log);
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            task_log
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((command.topic.clone(), command.payload.clone()));
            let _ = command
                .done
                .send(Err(MqttError::Publish("broker refused".to_string())));
        }
    });
    log
}

/// Drive the MQTT stub: acknowledge play/stop, refuse keepalives.
pub fn ack_play_refuse_keepalive(mut commands: mpsc::Receiver<PublishCommand>) -> PublishLog {
    let log: PublishLog = Arc::new(Mutex::new(Vec::new()));
    let task_log = Arc::clone(&log);
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let refused = command.topic.ends_with("/stream/keepalive");
            task_log
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((command.topic.clone(), command.payload.clone()));
            let outcome = if refused {
                Err(MqttError::Publish("broker refused".to_string()))
            } else {
                Ok(())
            };
            let _ = command.done.send(outcome);
        }
    });
    log
}
