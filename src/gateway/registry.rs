use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::{RwLock, oneshot};
use tracing::{error, info, warn};

/// Why the registry asked a connection to close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Evicted,
    Shutdown,
}

struct ConnectionEntry {
    opened_at: Instant,
    last_activity: Arc<AtomicU64>,
    close_tx: Option<oneshot::Sender<CloseReason>>,
}

/// Held by a session for its lifetime
pub struct ConnectionHandle {
    pub id: u64,
    pub close_rx: oneshot::Receiver<CloseReason>,
    last_activity: Arc<AtomicU64>,
    epoch: Instant,
}

impl ConnectionHandle {
    /// Record client activity for idle-based eviction
    pub fn touch(&self) {
        self.last_activity
            .store(millis_since(self.epoch), Ordering::Relaxed);
    }
}

fn millis_since(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

/// Tracks live gateway connections and enforces the connection cap
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<u64, ConnectionEntry>>,
    connection_counter: AtomicU64,
    max_connections: usize,
    epoch: Instant,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_counter: AtomicU64::new(0),
            max_connections: max_connections.max(1),
            epoch: Instant::now(),
        }
    }

    /// Register a new connection. At capacity the longest-idle connection is
    /// evicted first: it is removed immediately and told to close.
    pub async fn register(&self) -> ConnectionHandle {
        let id = self.connection_counter.fetch_add(1, Ordering::SeqCst);
        let (close_tx, close_rx) = oneshot::channel();
        let last_activity = Arc::new(AtomicU64::new(millis_since(self.epoch)));

        let mut connections = self.connections.write().await;
        while connections.len() >= self.max_connections {
            let Some(idle_id) = connections
                .iter()
                .min_by_key(|(id, entry)| (entry.last_activity.load(Ordering::Relaxed), **id))
                .map(|(id, _)| *id)
            else {
                break;
            };

            if let Some(mut evicted) = connections.remove(&idle_id) {
                warn!(
                    connection_id = idle_id,
                    age_ms = evicted.opened_at.elapsed().as_millis() as u64,
                    "Connection limit reached, evicting idle connection"
                );
                if let Some(tx) = evicted.close_tx.take() {
                    let _ = tx.send(CloseReason::Evicted);
                }
                crate::metrics::record_connection_evicted();
            }
        }

        connections.insert(
            id,
            ConnectionEntry {
                opened_at: Instant::now(),
                last_activity: last_activity.clone(),
                close_tx: Some(close_tx),
            },
        );
        crate::metrics::set_active_connections(connections.len());
        info!(connection_id = id, active = connections.len(), "Registered gateway connection");

        ConnectionHandle {
            id,
            close_rx,
            last_activity,
            epoch: self.epoch,
        }
    }

    /// Remove a connection. Returns false if it was already gone (evicted).
    pub async fn unregister(&self, connection_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(&connection_id);
        crate::metrics::set_active_connections(connections.len());

        match removed {
            Some(entry) => {
                info!(
                    connection_id,
                    duration_ms = entry.opened_at.elapsed().as_millis() as u64,
                    "Unregistered gateway connection"
                );
                true
            }
            None => false,
        }
    }

    pub async fn active_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Ask every connection to close. Entries stay until each session unregisters.
    pub async fn signal_all_to_close(&self) {
        let mut connections = self.connections.write().await;
        if connections.is_empty() {
            return;
        }

        info!("Signaling {} gateway connections to close", connections.len());
        for entry in connections.values_mut() {
            if let Some(tx) = entry.close_tx.take() {
                let _ = tx.send(CloseReason::Shutdown);
            }
        }
    }

    /// Wait until every connection has unregistered, up to `timeout_duration`
    pub async fn wait_for_all(&self, timeout_duration: Duration) -> bool {
        let start_time = Instant::now();

        loop {
            let count = self.active_count().await;
            if count == 0 {
                info!("All gateway connections closed");
                return true;
            }

            if start_time.elapsed() > timeout_duration {
                error!("Timeout waiting for {} gateway connections to close", count);
                return false;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_unregister_once() {
        let registry = ConnectionRegistry::new(10);
        let handle = registry.register().await;
        assert_eq!(registry.active_count().await, 1);

        assert!(registry.unregister(handle.id).await);
        assert!(!registry.unregister(handle.id).await);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_longest_idle() {
        let registry = ConnectionRegistry::new(2);
        let mut first = registry.register().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = registry.register().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // The first connection becomes the most recently active one
        first.touch();

        let third = registry.register().await;
        assert_eq!(registry.active_count().await, 2);

        let mut second_rx = second.close_rx;
        assert_eq!(second_rx.try_recv(), Ok(CloseReason::Evicted));
        assert!(first.close_rx.try_recv().is_err());
        assert!(!registry.unregister(second.id).await);
        assert!(registry.unregister(third.id).await);
    }

    #[tokio::test]
    async fn test_signal_all_then_wait() {
        let registry = Arc::new(ConnectionRegistry::new(10));
        let handles = vec![registry.register().await, registry.register().await];

        registry.signal_all_to_close().await;
        assert_eq!(registry.active_count().await, 2);

        for handle in handles {
            let registry = registry.clone();
            tokio::spawn(async move {
                let reason = handle.close_rx.await.unwrap();
                assert_eq!(reason, CloseReason::Shutdown);
                registry.unregister(handle.id).await;
            });
        }

        assert!(registry.wait_for_all(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_wait_for_all_times_out() {
        let registry = ConnectionRegistry::new(10);
        let _handle = registry.register().await;
        assert!(!registry.wait_for_all(Duration::from_millis(100)).await);
    }
}
