mod hub;
mod keepalive;
mod mqtt;
mod ms;
mod stream;
#[cfg(test)]
mod test_support;
mod web;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use hivestream_protocol::config::Config;

use crate::hub::ViewerRegistry;
use crate::mqtt::MqttGateway;
use crate::ms::MsClient;
use crate::stream::StreamSupervisor;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration from the environment
    let config = Config::from_env().context("Failed to load configuration")?;
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }
    let config = Arc::new(config);

    // Media server connection; one reader task correlates every reply
    let request_timeout = Duration::from_secs(config.media_server.request_timeout_secs);
    let ms = MsClient::connect(&config.media_server.ws_url, request_timeout)
        .await
        .context("Failed to connect to media server")?;
    if ms.ping().await {
        tracing::info!("Media server ping OK");
    } else {
        tracing::warn!("Media server ping failed; health will report degraded until it recovers");
    }

    // Camera control channel (mutually-authenticated MQTT)
    let mqtt = Arc::new(
        MqttGateway::connect(&config.mqtt).context("Failed to start MQTT gateway")?,
    );

    let viewers = Arc::new(ViewerRegistry::new(
        Arc::clone(&ms),
        config.stream.max_viewers_per_stream,
    ));
    let supervisor = StreamSupervisor::new(
        Arc::clone(&ms),
        mqtt,
        Arc::clone(&viewers),
        Arc::clone(&config),
    );

    // The single process-wide listener relaying ICE events to viewer sockets
    hub::spawn_ice_relay(&ms, Arc::clone(&viewers));

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        ms: Arc::clone(&ms),
        supervisor: Arc::clone(&supervisor),
        viewers,
        started_at: std::time::Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state)).layer(
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "request",
                method = %request.method(),
                path = %request.uri().path(),
            )
        }),
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.http.bind, config.http.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    // Print startup banner
    tracing::info!("===========================================");
    tracing::info!("  Hivestream Control Plane v0.1.0");
    tracing::info!("  Control API:  http://{bind_addr}");
    tracing::info!("  Signaling:    ws://{bind_addr}/ws/viewer");
    tracing::info!("  Media server: {}", config.media_server.ws_url);
    tracing::info!("===========================================");

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    })
    .await
    .context("Server error")?;

    // Stop every session: keepalives cancelled, cameras told to stop,
    // pipelines released, viewers torn down.
    tracing::info!("Stopping active streams...");
    supervisor.stop_all().await;
    ms.close();

    tracing::info!("Hivestream server shut down cleanly");
    Ok(())
}
