use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::mqtt::{MqttError, MqttGateway};

/// Consecutive publish failures that stop the pump and escalate.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Sink for the periodic heartbeat publish. Abstracted so the pump's error
/// budget can be exercised without a broker.
pub trait KeepalivePublisher: Send + Sync + 'static {
    fn publish(&self, count: u64) -> impl Future<Output = Result<(), MqttError>> + Send;
}

/// Production publisher: heartbeats for one camera session over the gateway.
pub struct CameraKeepalive {
    pub gateway: Arc<MqttGateway>,
    pub camera_id: String,
    pub stream_id: String,
}

impl KeepalivePublisher for CameraKeepalive {
    async fn publish(&self, count: u64) -> Result<(), MqttError> {
        self.gateway
            .publish_keepalive(&self.camera_id, &self.stream_id, count)
            .await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeepaliveStats {
    pub running: bool,
    pub sent: u64,
    pub errors: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct PumpShared {
    sent: AtomicU64,
    errors: AtomicU64,
    last_success: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl PumpShared {
    fn snapshot(&self, running: bool) -> KeepaliveStats {
        KeepaliveStats {
            running,
            sent: self.sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_success: *self.last_success.lock().unwrap_or_else(|e| e.into_inner()),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

/// Per-session heartbeat task.
///
/// Wakes every `interval`, publishes a keepalive, and tracks an error budget:
/// any success resets the consecutive-failure streak; the fifth consecutive
/// failure stops the pump and reports the session-fatal error on the channel
/// the stream supervisor consumes.
pub struct KeepalivePump {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    shared: Arc<PumpShared>,
}

impl KeepalivePump {
    pub fn spawn<P: KeepalivePublisher>(
        publisher: P,
        interval: Duration,
        fatal: mpsc::Sender<String>,
    ) -> Self {
        let shared = Arc::new(PumpShared::default());
        let worker = Arc::clone(&shared);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut consecutive = 0u32;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Keepalive pump cancelled");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let count = worker.sent.load(Ordering::Relaxed);
                match publisher.publish(count).await {
                    Ok(()) => {
                        let sent = count + 1;
                        worker.sent.store(sent, Ordering::Relaxed);
                        consecutive = 0;
                        *worker.last_success.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(Utc::now());
                        *worker.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
                        if sent % 4 == 0 {
                            info!(sent, "Keepalive heartbeats delivered");
                        }
                    }
                    Err(e) => {
                        worker.errors.fetch_add(1, Ordering::Relaxed);
                        consecutive += 1;
                        let message = e.to_string();
                        *worker.last_error.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(message.clone());
                        warn!(consecutive, "Keepalive publish failed: {message}");

                        if consecutive >= MAX_CONSECUTIVE_ERRORS {
                            error!("Keepalive error budget exhausted, stopping pump");
                            let _ = fatal.send(message).await;
                            return;
                        }
                    }
                }
            }
        });

        Self {
            shutdown: shutdown_tx,
            handle,
            shared,
        }
    }

    pub fn stats(&self) -> KeepaliveStats {
        self.shared.snapshot(!self.handle.is_finished())
    }

    /// Cancel the pump and wait for the task to finish draining.
    pub async fn stop(self) -> KeepaliveStats {
        let shared = Arc::clone(&self.shared);
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
        shared.snapshot(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Publisher that fails the first `fail_first` calls, then succeeds.
    struct ScriptedPublisher {
        fail_first: u64,
        calls: Arc<AtomicU64>,
    }

    impl KeepalivePublisher for ScriptedPublisher {
        async fn publish(&self, _count: u64) -> Result<(), MqttError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(MqttError::AckTimeout(Duration::from_secs(2)))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fifth_consecutive_failure_stops_pump_and_escalates() {
        let calls = Arc::new(AtomicU64::new(0));
        let publisher = ScriptedPublisher {
            fail_first: u64::MAX,
            calls: Arc::clone(&calls),
        };
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let pump = KeepalivePump::spawn(publisher, Duration::from_secs(4), fatal_tx);

        let message = fatal_rx.recv().await.expect("fatal error should arrive");
        assert!(message.contains("acknowledge"));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let stats = pump.stop().await;
        assert_eq!(stats.errors, 5);
        assert_eq!(stats.sent, 0);
        assert!(!stats.running);
        assert!(stats.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_error_streak() {
        let calls = Arc::new(AtomicU64::new(0));
        // Four failures, one success, then failures until the budget trips:
        // the success must reset the streak so five MORE failures are needed.
        struct ResetPublisher {
            calls: Arc<AtomicU64>,
        }
        impl KeepalivePublisher for ResetPublisher {
            async fn publish(&self, _count: u64) -> Result<(), MqttError> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call == 5 {
                    Ok(())
                } else {
                    Err(MqttError::Publish("broker refused".to_string()))
                }
            }
        }

        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let pump = KeepalivePump::spawn(
            ResetPublisher {
                calls: Arc::clone(&calls),
            },
            Duration::from_secs(4),
            fatal_tx,
        );

        fatal_rx.recv().await.expect("fatal error should arrive");
        // 4 failures + 1 success + 5 failures
        assert_eq!(calls.load(Ordering::SeqCst), 10);

        let stats = pump.stop().await;
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.errors, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_and_drains_the_task() {
        let calls = Arc::new(AtomicU64::new(0));
        let publisher = ScriptedPublisher {
            fail_first: 0,
            calls: Arc::clone(&calls),
        };
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let pump = KeepalivePump::spawn(publisher, Duration::from_secs(4), fatal_tx);

        // Let a few heartbeats go out
        tokio::time::sleep(Duration::from_secs(9)).await;
        let stats = pump.stop().await;
        assert!(stats.sent >= 2, "expected heartbeats, got {}", stats.sent);
        assert!(!stats.running);

        let after_stop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn first_heartbeat_fires_immediately() {
        let calls = Arc::new(AtomicU64::new(0));
        let publisher = ScriptedPublisher {
            fail_first: 0,
            calls: Arc::clone(&calls),
        };
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let pump = KeepalivePump::spawn(publisher, Duration::from_secs(4), fatal_tx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        pump.stop().await;
    }
}
