use super::{CacheResult, EventStream};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::debug;

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

const CHANNEL_CAPACITY: usize = 1024;

/// Cache entry with expiration
#[derive(Clone, Debug)]
struct CacheEntry {
    data: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn new(data: String, ttl: Option<Duration>) -> Self {
        let expires_at = ttl
            .and_then(|duration| chrono::Duration::from_std(duration).ok())
            .map(|duration| Utc::now() + duration);
        Self { data, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Utc::now() >= exp)
    }
}

/// In-process derived-state cache.
///
/// Values are stored as serialized JSON so both backends share the same
/// encoding; pub/sub channels are tokio broadcast senders created on first use.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    #[cfg(test)]
    reject_writes: Arc<AtomicBool>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.data.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            // Re-check under the write lock so a concurrent fresh write survives
            self.entries.remove_if(key, |_, entry| entry.is_expired());
            debug!("Evicted expired cache key '{}'", key);
        }
        Ok(None)
    }

    pub async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        #[cfg(test)]
        if self.reject_writes.load(Ordering::Relaxed) {
            return Err(super::CacheError::Cache(format!("write to '{}' rejected", key)));
        }
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(())
    }

    /// Make every subsequent `set` fail, for exercising write-failure paths
    #[cfg(test)]
    pub(crate) fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::Relaxed);
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Returns the number of subscribers that received the message
    pub async fn publish(&self, channel: &str, message: String) -> CacheResult<usize> {
        Ok(self.sender(channel).send(message).unwrap_or(0))
    }

    pub async fn subscribe(&self, channel: &str) -> CacheResult<EventStream> {
        let receiver = self.sender(channel).subscribe();

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Memory subscriber lagged, skipped {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
