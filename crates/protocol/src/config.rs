use std::net::Ipv4Addr;
use std::path::Path;

use thiserror::Error;

/// Default value shipped in the install template before the operator fills in
/// a real address. Triggers a startup warning, not an error.
pub const EXTERNAL_IP_PLACEHOLDER: &str = "YOUR_EXTERNAL_IP";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-wide configuration, loaded once from the environment at startup
/// and passed down immutably.
#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub media_server: MediaServerConfig,
    pub network: NetworkConfig,
    pub bandwidth: BandwidthConfig,
    pub mqtt: MqttConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct MediaServerConfig {
    /// JSON-RPC WebSocket endpoint
    pub ws_url: String,
    /// Default per-call timeout, seconds
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub stun_url: String,
    /// SDP address handed to cameras when the start request came from the
    /// local network
    pub local_ip: String,
    /// SDP address for starts from anywhere else
    pub external_ip: String,
    /// Dotted prefix that classifies a peer as local, e.g. "192.168.199"
    pub local_network_prefix: String,
    pub camera_rtp_video_port: u16,
    pub camera_rtp_audio_port: u16,
    pub camera_rtcp_port: u16,
}

#[derive(Debug, Clone)]
pub struct BandwidthConfig {
    /// REMB upper bound, Kbps
    pub max_video_kbps: u32,
    /// REMB lower bound, Kbps
    pub min_video_kbps: u32,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub ca_cert: String,
    pub client_cert: String,
    pub client_key: String,
    pub play_topic: String,
    pub stop_topic: String,
    pub keepalive_topic: String,
}

impl MqttConfig {
    pub fn play_topic_for(&self, camera_id: &str) -> String {
        expand_topic(&self.play_topic, camera_id)
    }

    pub fn stop_topic_for(&self, camera_id: &str) -> String {
        expand_topic(&self.stop_topic, camera_id)
    }

    pub fn keepalive_topic_for(&self, camera_id: &str) -> String {
        expand_topic(&self.keepalive_topic, camera_id)
    }
}

fn expand_topic(template: &str, camera_id: &str) -> String {
    template.replace("{camera_id}", camera_id)
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub keepalive_interval_secs: u64,
    pub max_viewers_per_stream: usize,
}

impl Config {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source (tests inject maps here).
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &'static str, default: &str| -> String {
            get(key).unwrap_or_else(|| default.to_string())
        };
        let required = |key: &'static str| -> Result<String, ConfigError> {
            get(key).ok_or(ConfigError::Missing(key))
        };

        Ok(Config {
            http: HttpConfig {
                bind: var("HTTP_BIND", "0.0.0.0"),
                port: parse(&get, "HTTP_PORT", 8080)?,
            },
            media_server: MediaServerConfig {
                ws_url: var("MS_WS_URL", "ws://127.0.0.1:8888/kurento"),
                request_timeout_secs: parse(&get, "REQUEST_TIMEOUT", 30)?,
            },
            network: NetworkConfig {
                stun_url: var("STUN_URL", "stun:stun.l.google.com:19302"),
                local_ip: var("LOCAL_IP", "192.168.199.1"),
                external_ip: var("EXTERNAL_IP", EXTERNAL_IP_PLACEHOLDER),
                local_network_prefix: var("LOCAL_NETWORK_PREFIX", "192.168.199"),
                camera_rtp_video_port: parse(&get, "CAMERA_RTP_VIDEO_PORT", 55000)?,
                camera_rtp_audio_port: parse(&get, "CAMERA_RTP_AUDIO_PORT", 55002)?,
                camera_rtcp_port: parse(&get, "CAMERA_RTCP_PORT", 55001)?,
            },
            bandwidth: BandwidthConfig {
                max_video_kbps: parse(&get, "MAX_VIDEO_RECV_BANDWIDTH", 5000)?,
                min_video_kbps: parse(&get, "MIN_VIDEO_RECV_BANDWIDTH", 500)?,
            },
            mqtt: MqttConfig {
                host: var("MQTT_HOST", "127.0.0.1"),
                port: parse(&get, "MQTT_PORT", 8883)?,
                client_id: var("MQTT_CLIENT_ID", "hivestream"),
                ca_cert: required("MQTT_CA_CERT")?,
                client_cert: required("MQTT_CLIENT_CERT")?,
                client_key: required("MQTT_CLIENT_KEY")?,
                play_topic: var("MQTT_PLAY_TOPIC", "prod/honeycomb/{camera_id}/stream/play"),
                stop_topic: var("MQTT_STOP_TOPIC", "prod/honeycomb/{camera_id}/stream/stop"),
                keepalive_topic: var(
                    "MQTT_KEEPALIVE_TOPIC",
                    "prod/honeycomb/{camera_id}/stream/keepalive",
                ),
            },
            stream: StreamConfig {
                keepalive_interval_secs: parse(&get, "KEEPALIVE_INTERVAL", 4)?,
                max_viewers_per_stream: parse(&get, "MAX_VIEWERS_PER_STREAM", 10)?,
            },
        })
    }

    /// Validate configuration semantics, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        let url = &self.media_server.ws_url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            issues.push(format!(
                "ERROR: MS_WS_URL '{url}' is not a ws:// or wss:// URL"
            ));
        }
        if self.media_server.request_timeout_secs == 0 {
            issues.push("ERROR: REQUEST_TIMEOUT must be at least 1 second".to_string());
        }

        for (key, path) in [
            ("MQTT_CA_CERT", &self.mqtt.ca_cert),
            ("MQTT_CLIENT_CERT", &self.mqtt.client_cert),
            ("MQTT_CLIENT_KEY", &self.mqtt.client_key),
        ] {
            if !Path::new(path).exists() {
                issues.push(format!("ERROR: {key} '{path}' does not exist"));
            }
        }

        if self.network.local_ip.parse::<Ipv4Addr>().is_err() {
            issues.push(format!(
                "ERROR: LOCAL_IP '{}' is not a valid IPv4 address",
                self.network.local_ip
            ));
        }
        if self.network.external_ip == EXTERNAL_IP_PLACEHOLDER {
            issues.push(
                "WARNING: EXTERNAL_IP is still the install placeholder; \
                 remote starts will hand cameras an unroutable address"
                    .to_string(),
            );
        } else if self.network.external_ip.parse::<Ipv4Addr>().is_err() {
            issues.push(format!(
                "ERROR: EXTERNAL_IP '{}' is not a valid IPv4 address",
                self.network.external_ip
            ));
        }
        if self.network.local_network_prefix.is_empty() {
            issues.push(
                "WARNING: LOCAL_NETWORK_PREFIX is empty; every viewer will classify as local"
                    .to_string(),
            );
        }

        if self.bandwidth.min_video_kbps > self.bandwidth.max_video_kbps {
            issues.push(format!(
                "ERROR: MIN_VIDEO_RECV_BANDWIDTH ({}) exceeds MAX_VIDEO_RECV_BANDWIDTH ({})",
                self.bandwidth.min_video_kbps, self.bandwidth.max_video_kbps
            ));
        }

        for (key, template) in [
            ("MQTT_PLAY_TOPIC", &self.mqtt.play_topic),
            ("MQTT_STOP_TOPIC", &self.mqtt.stop_topic),
            ("MQTT_KEEPALIVE_TOPIC", &self.mqtt.keepalive_topic),
        ] {
            if !template.contains("{camera_id}") {
                issues.push(format!(
                    "WARNING: {key} '{template}' has no {{camera_id}} placeholder; \
                     all cameras will share one topic"
                ));
            }
        }

        if self.stream.keepalive_interval_secs == 0 {
            issues.push("ERROR: KEEPALIVE_INTERVAL must be at least 1 second".to_string());
        }
        if self.stream.max_viewers_per_stream == 0 {
            issues.push("ERROR: MAX_VIEWERS_PER_STREAM must be at least 1".to_string());
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
