use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, TlsConfiguration, Transport};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use hivestream_protocol::config::MqttConfig;
use hivestream_protocol::messages::CameraCommand;

/// Broker acknowledgement deadline for a QoS 1 publish.
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Backoff after an event-loop error before rumqttc reconnects.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("failed to read MQTT TLS material from {path}: {source}")]
    Tls {
        path: String,
        source: std::io::Error,
    },
    #[error("no usable PEM data in {path}")]
    InvalidPem { path: String },
    #[error("MQTT publish failed: {0}")]
    Publish(String),
    #[error("broker did not acknowledge publish within {0:?}")]
    AckTimeout(Duration),
    #[error("MQTT worker is gone")]
    WorkerGone,
}

pub(crate) struct PublishCommand {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) done: oneshot::Sender<Result<(), MqttError>>,
}

/// Mutually-authenticated MQTT 3.1.1 client for camera control.
///
/// A single worker task owns the connection and serializes publishes through
/// a command queue; each publish reports success only once the broker has
/// acknowledged it (QoS 1 PubAck) within the deadline.
pub struct MqttGateway {
    commands: mpsc::Sender<PublishCommand>,
    topics: MqttConfig,
}

impl MqttGateway {
    pub fn connect(config: &MqttConfig) -> Result<Self, MqttError> {
        let ca = read_pem_certs(&config.ca_cert)?;
        let client_cert = read_pem_certs(&config.client_cert)?;
        let client_key = read_pem_key(&config.client_key)?;

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        // rustls negotiates TLS 1.2+; the broker requires the client chain
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: Some((client_cert, client_key)),
        }));

        let (client, eventloop) = AsyncClient::new(options, 16);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        tokio::spawn(run_worker(client, eventloop, commands_rx));

        info!(host = %config.host, port = config.port, "MQTT gateway started");
        Ok(Self {
            commands: commands_tx,
            topics: config.clone(),
        })
    }

    /// Gateway whose worker is the test: publish commands surface on the
    /// returned receiver instead of a broker connection.
    #[cfg(test)]
    pub(crate) fn test_stub(topics: MqttConfig) -> (Self, mpsc::Receiver<PublishCommand>) {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        (
            Self {
                commands: commands_tx,
                topics,
            },
            commands_rx,
        )
    }

    pub async fn publish_play(
        &self,
        camera_id: &str,
        stream_id: &str,
        sdp_offer: String,
    ) -> Result<(), MqttError> {
        let topic = self.topics.play_topic_for(camera_id);
        let command = CameraCommand::play(camera_id, stream_id, sdp_offer);
        self.publish_command(topic, &command).await
    }

    pub async fn publish_stop(&self, camera_id: &str, stream_id: &str) -> Result<(), MqttError> {
        let topic = self.topics.stop_topic_for(camera_id);
        let command = CameraCommand::stop(camera_id, stream_id);
        self.publish_command(topic, &command).await
    }

    pub async fn publish_keepalive(
        &self,
        camera_id: &str,
        stream_id: &str,
        keepalive_count: u64,
    ) -> Result<(), MqttError> {
        let topic = self.topics.keepalive_topic_for(camera_id);
        let command = CameraCommand::keepalive(camera_id, stream_id, keepalive_count);
        self.publish_command(topic, &command).await
    }

    async fn publish_command(
        &self,
        topic: String,
        command: &CameraCommand,
    ) -> Result<(), MqttError> {
        let payload =
            serde_json::to_vec(command).map_err(|e| MqttError::Publish(e.to_string()))?;
        debug!(%topic, bytes = payload.len(), "Publishing camera command");

        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(PublishCommand {
                topic,
                payload,
                done: done_tx,
            })
            .await
            .map_err(|_| MqttError::WorkerGone)?;
        done_rx.await.map_err(|_| MqttError::WorkerGone)?
    }
}

async fn run_worker(
    client: AsyncClient,
    mut eventloop: EventLoop,
    mut commands: mpsc::Receiver<PublishCommand>,
) {
    loop {
        tokio::select! {
            maybe_command = commands.recv() => {
                let Some(command) = maybe_command else { break };
                let result =
                    publish_and_wait(&client, &mut eventloop, command.topic, command.payload).await;
                let _ = command.done.send(result);
            }
            event = eventloop.poll() => {
                if let Err(e) = event {
                    debug!("MQTT event loop error: {e}");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
    let _ = client.disconnect().await;
    debug!("MQTT worker stopped");
}

async fn publish_and_wait(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    topic: String,
    payload: Vec<u8>,
) -> Result<(), MqttError> {
    client
        .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
        .await
        .map_err(|e| MqttError::Publish(e.to_string()))?;

    // Publishes are serialized through the worker queue, so the next PubAck
    // on the wire belongs to this publish.
    let deadline = tokio::time::Instant::now() + ACK_TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, eventloop.poll())
            .await
            .map_err(|_| MqttError::AckTimeout(ACK_TIMEOUT))?
            .map_err(|e| MqttError::Publish(e.to_string()))?;
        match event {
            Event::Incoming(Incoming::PubAck(_)) => {
                debug!(%topic, "Broker acknowledged publish");
                return Ok(());
            }
            other => {
                debug!(?other, "MQTT event while awaiting ack");
            }
        }
    }
}

fn read_pem_certs(path: &str) -> Result<Vec<u8>, MqttError> {
    let data = std::fs::read(path).map_err(|source| MqttError::Tls {
        path: path.to_string(),
        source,
    })?;
    let parsed = rustls_pemfile::certs(&mut data.as_slice())
        .filter_map(|entry| entry.ok())
        .count();
    if parsed == 0 {
        return Err(MqttError::InvalidPem {
            path: path.to_string(),
        });
    }
    Ok(data)
}

fn read_pem_key(path: &str) -> Result<Vec<u8>, MqttError> {
    let data = std::fs::read(path).map_err(|source| MqttError::Tls {
        path: path.to_string(),
        source,
    })?;
    match rustls_pemfile::private_key(&mut data.as_slice()) {
        Ok(Some(_)) => Ok(data),
        _ => Err(MqttError::InvalidPem {
            path: path.to_string(),
        }),
    }
}
