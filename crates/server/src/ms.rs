use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use hivestream_protocol::messages::IceCandidate;
use hivestream_protocol::rpc::{EventParams, EventValue, RpcFrame, RpcIncoming, RpcRequest};

#[derive(Debug, Error)]
pub enum MsError {
    #[error("failed to connect to media server: {0}")]
    Connect(String),
    #[error("not connected to media server")]
    NotConnected,
    #[error("media server connection closed")]
    ConnectionClosed,
    #[error("media server request {id} timed out after {seconds}s")]
    Timeout { id: u64, seconds: u64 },
    #[error("media server error: {0}")]
    Rpc(String),
    #[error("malformed media server reply: {0}")]
    Protocol(String),
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, MsError>>>>;

/// Async JSON-RPC client for the media server.
///
/// One background reader task classifies incoming frames: responses complete
/// the pending request with the matching id, `onEvent` notifications fan out
/// on a broadcast channel. Request ids are process-unique and monotonically
/// increasing; connection loss fails every pending request.
pub struct MsClient {
    next_id: AtomicU64,
    pending: PendingMap,
    outbound: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<EventValue>,
    connected: AtomicBool,
    default_timeout: Duration,
}

impl MsClient {
    pub async fn connect(url: &str, default_timeout: Duration) -> Result<Arc<Self>, MsError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| MsError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, _) = broadcast::channel(256);

        let client = Arc::new(MsClient {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            events: events_tx,
            connected: AtomicBool::new(true),
            default_timeout,
        });

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!("Media server send failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = Arc::clone(&client);
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader.handle_frame(&text),
                    Ok(Message::Close(_)) => {
                        info!("Media server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Media server connection error: {e}");
                        break;
                    }
                }
            }
            reader.mark_disconnected();
        });

        info!(%url, "Connected to media server");
        Ok(client)
    }

    fn handle_frame(&self, text: &str) {
        let incoming: RpcIncoming = match serde_json::from_str(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!("Failed to parse media server frame: {e}");
                return;
            }
        };

        match incoming.classify() {
            RpcFrame::Response { id, result } => {
                let sender = self.lock_pending().remove(&id);
                match sender {
                    Some(tx) => {
                        let outcome =
                            result.map_err(|err| MsError::Rpc(err.message().to_string()));
                        let _ = tx.send(outcome);
                    }
                    None => warn!(id, "Late reply for a cleared request id, dropping"),
                }
            }
            RpcFrame::Notification { method, params } => {
                if method == "onEvent" {
                    match serde_json::from_value::<EventParams>(params) {
                        // Delivery is best-effort; a listener that lags or
                        // went away must not block the reader.
                        Ok(event) => {
                            let _ = self.events.send(event.value);
                        }
                        Err(e) => warn!("Malformed onEvent notification: {e}"),
                    }
                } else {
                    debug!(%method, "Ignoring unhandled notification");
                }
            }
            RpcFrame::Malformed => warn!("Frame with neither id nor method, dropping"),
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let pending: Vec<_> = {
            let mut map = self.lock_pending();
            map.drain().collect()
        };
        if !pending.is_empty() {
            warn!(count = pending.len(), "Failing pending media server requests");
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(MsError::ConnectionClosed));
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, MsError>>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send a JSON-RPC request and await its response.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, MsError> {
        if !self.is_connected() {
            return Err(MsError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = RpcRequest::new(id, method, params);
        let payload =
            serde_json::to_string(&request).map_err(|e| MsError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        if self.outbound.send(Message::Text(payload.into())).is_err() {
            self.lock_pending().remove(&id);
            return Err(MsError::ConnectionClosed);
        }
        debug!(id, %method, "Sent media server request");

        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MsError::ConnectionClosed),
            Err(_) => {
                self.lock_pending().remove(&id);
                Err(MsError::Timeout {
                    id,
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    /// Subscribe to media-server event notifications.
    pub fn events(&self) -> broadcast::Receiver<EventValue> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.lock_pending().len()
    }

    /// Close the connection; pending requests fail with `ConnectionClosed`.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
        self.mark_disconnected();
    }

    // ------------------------------------------------------------------
    // Typed helpers over the raw call surface
    // ------------------------------------------------------------------

    pub async fn create_media_pipeline(&self) -> Result<String, MsError> {
        let result = self
            .call("create", json!({ "type": "MediaPipeline" }), None)
            .await?;
        let pipeline_id = string_value(result)?;
        info!(%pipeline_id, "Created MediaPipeline");
        Ok(pipeline_id)
    }

    /// Camera-facing endpoint: accepts the camera's plain RTP.
    pub async fn create_rtp_endpoint(&self, pipeline_id: &str) -> Result<String, MsError> {
        let result = self
            .call(
                "create",
                json!({
                    "type": "RtpEndpoint",
                    "constructorParams": { "mediaPipeline": pipeline_id }
                }),
                None,
            )
            .await?;
        let endpoint_id = string_value(result)?;
        info!(%endpoint_id, "Created RtpEndpoint");
        Ok(endpoint_id)
    }

    /// Viewer-facing endpoint: speaks WebRTC toward a browser.
    pub async fn create_webrtc_endpoint(&self, pipeline_id: &str) -> Result<String, MsError> {
        let result = self
            .call(
                "create",
                json!({
                    "type": "WebRtcEndpoint",
                    "constructorParams": { "mediaPipeline": pipeline_id }
                }),
                None,
            )
            .await?;
        let endpoint_id = string_value(result)?;
        info!(%endpoint_id, "Created WebRtcEndpoint");
        Ok(endpoint_id)
    }

    pub async fn generate_offer(&self, endpoint_id: &str) -> Result<String, MsError> {
        let result = self
            .call(
                "invoke",
                json!({ "object": endpoint_id, "operation": "generateOffer" }),
                None,
            )
            .await?;
        string_value(result)
    }

    /// Submit an offer to an endpoint; the reply is the endpoint's answer.
    pub async fn process_offer(&self, endpoint_id: &str, offer: &str) -> Result<String, MsError> {
        let result = self
            .call(
                "invoke",
                json!({
                    "object": endpoint_id,
                    "operation": "processOffer",
                    "operationParams": { "offer": offer }
                }),
                None,
            )
            .await?;
        string_value(result)
    }

    /// Splice `source` into `sink` inside their shared pipeline.
    pub async fn connect_endpoints(&self, source_id: &str, sink_id: &str) -> Result<(), MsError> {
        self.call(
            "invoke",
            json!({
                "object": source_id,
                "operation": "connect",
                "operationParams": { "sink": sink_id }
            }),
            None,
        )
        .await?;
        info!(source = %source_id, sink = %sink_id, "Connected endpoints");
        Ok(())
    }

    /// Upper receive bound; setting it makes the server emit REMB toward the
    /// sender.
    pub async fn set_max_video_recv_bandwidth(
        &self,
        endpoint_id: &str,
        kbps: u32,
    ) -> Result<(), MsError> {
        self.set_bandwidth(endpoint_id, "setMaxVideoRecvBandwidth", "maxVideoRecvBandwidth", kbps)
            .await
    }

    pub async fn set_min_video_recv_bandwidth(
        &self,
        endpoint_id: &str,
        kbps: u32,
    ) -> Result<(), MsError> {
        self.set_bandwidth(endpoint_id, "setMinVideoRecvBandwidth", "minVideoRecvBandwidth", kbps)
            .await
    }

    pub async fn set_max_video_send_bandwidth(
        &self,
        endpoint_id: &str,
        kbps: u32,
    ) -> Result<(), MsError> {
        self.set_bandwidth(endpoint_id, "setMaxVideoSendBandwidth", "maxVideoSendBandwidth", kbps)
            .await
    }

    pub async fn set_min_video_send_bandwidth(
        &self,
        endpoint_id: &str,
        kbps: u32,
    ) -> Result<(), MsError> {
        self.set_bandwidth(endpoint_id, "setMinVideoSendBandwidth", "minVideoSendBandwidth", kbps)
            .await
    }

    async fn set_bandwidth(
        &self,
        endpoint_id: &str,
        operation: &str,
        param: &str,
        kbps: u32,
    ) -> Result<(), MsError> {
        self.call(
            "invoke",
            json!({
                "object": endpoint_id,
                "operation": operation,
                "operationParams": { param: kbps }
            }),
            None,
        )
        .await?;
        debug!(endpoint = %endpoint_id, %operation, kbps, "Configured bandwidth");
        Ok(())
    }

    /// Subscribe an object to an event type. Must happen before the event can
    /// fire (i.e. before candidate gathering starts).
    pub async fn subscribe(&self, object_id: &str, event_type: &str) -> Result<String, MsError> {
        let result = self
            .call(
                "subscribe",
                json!({ "object": object_id, "type": event_type }),
                None,
            )
            .await?;
        let subscription_id = string_value(result).unwrap_or_default();
        info!(object = %object_id, %event_type, %subscription_id, "Subscribed to event");
        Ok(subscription_id)
    }

    pub async fn gather_candidates(&self, endpoint_id: &str) -> Result<(), MsError> {
        self.call(
            "invoke",
            json!({ "object": endpoint_id, "operation": "gatherCandidates" }),
            None,
        )
        .await?;
        debug!(endpoint = %endpoint_id, "Started ICE candidate gathering");
        Ok(())
    }

    pub async fn add_ice_candidate(
        &self,
        endpoint_id: &str,
        candidate: &IceCandidate,
    ) -> Result<(), MsError> {
        let candidate = serde_json::to_value(candidate)
            .map_err(|e| MsError::Protocol(e.to_string()))?;
        self.call(
            "invoke",
            json!({
                "object": endpoint_id,
                "operation": "addIceCandidate",
                "operationParams": { "candidate": candidate }
            }),
            None,
        )
        .await?;
        debug!(endpoint = %endpoint_id, "Added remote ICE candidate");
        Ok(())
    }

    /// Best-effort: cleanup paths must not abort on a failed release.
    pub async fn release_endpoint(&self, endpoint_id: &str) {
        match self.call("release", json!({ "object": endpoint_id }), None).await {
            Ok(_) => info!(endpoint = %endpoint_id, "Released endpoint"),
            Err(e) => warn!(endpoint = %endpoint_id, "Failed to release endpoint: {e}"),
        }
    }

    /// Best-effort: releasing the pipeline also releases its endpoints.
    pub async fn release_pipeline(&self, pipeline_id: &str) {
        match self.call("release", json!({ "object": pipeline_id }), None).await {
            Ok(_) => info!(pipeline = %pipeline_id, "Released pipeline"),
            Err(e) => warn!(pipeline = %pipeline_id, "Failed to release pipeline: {e}"),
        }
    }

    pub async fn ping(&self) -> bool {
        self.call("ping", json!({}), Some(Duration::from_secs(5)))
            .await
            .is_ok()
    }
}

fn string_value(result: Value) -> Result<String, MsError> {
    result
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MsError::Protocol("reply missing string 'value'".to_string()))
}
