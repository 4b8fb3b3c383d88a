use crate::cache::CacheManager;
use crate::health::{HealthCheckResult, HealthChecker};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, broadcast, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

/// Single upstream subscription to the cache's events channel, re-broadcast
/// in-process to every gateway connection.
pub struct NotificationRelay {
    sender: broadcast::Sender<String>,
    connected: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max).max(self.initial)
    }
}

impl NotificationRelay {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Receiver for one connection. Lagging receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Spawn the relay loop. It resubscribes with exponential backoff
    /// whenever the upstream subscription fails or ends.
    pub async fn start(
        &self,
        cache: CacheManager,
        backoff: Backoff,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let sender = self.sender.clone();
        let connected = self.connected.clone();
        let channel = cache.events_channel().to_string();

        let handle = tokio::spawn(async move {
            let mut delay = backoff.initial;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                match cache.subscribe(&channel).await {
                    Ok(mut upstream) => {
                        connected.store(true, Ordering::Relaxed);
                        delay = backoff.initial;
                        info!(channel = %channel, "Notification relay subscribed");

                        loop {
                            tokio::select! {
                                message = upstream.next() => match message {
                                    // No live connections is not an error
                                    Some(payload) => { let _ = sender.send(payload); }
                                    None => {
                                        warn!(channel = %channel, "Upstream subscription ended");
                                        break;
                                    }
                                },
                                _ = shutdown_rx.wait_for(|stop| *stop) => {
                                    connected.store(false, Ordering::Relaxed);
                                    info!("Notification relay stopped");
                                    return;
                                }
                            }
                        }
                        connected.store(false, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(
                            channel = %channel,
                            error = %e,
                            "Failed to subscribe, retrying in {:?}",
                            delay
                        );
                    }
                }

                crate::metrics::record_relay_reconnect();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.wait_for(|stop| *stop) => break,
                }
                delay = backoff.next(delay);
            }

            info!("Notification relay stopped");
        });

        if let Some(previous) = self.task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the relay task. Dropping it closes the upstream subscription.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl HealthChecker for NotificationRelay {
    fn name(&self) -> &str {
        "relay"
    }

    async fn check(&self) -> HealthCheckResult {
        let details = serde_json::json!({
            "status": if self.is_connected() { "connected" } else { "reconnecting" },
            "subscribers": self.sender.receiver_count(),
        });
        if self.is_connected() {
            HealthCheckResult::healthy_with_details(details)
        } else {
            HealthCheckResult::degraded_with_details(
                "Notification relay is not subscribed".to_string(),
                details,
            )
        }
    }
}
