use super::{CacheError, CacheResult, EventStream};
use futures_util::StreamExt;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::timeout};
use tracing::warn;

/// Redis-backed derived-state cache with a reusable multiplexed connection.
///
/// Every command runs under `command_timeout`; a timeout is reported as
/// `CacheError::Timeout` and the cached connection is dropped.
#[derive(Clone)]
pub struct RedisCache {
    client: Client,
    connection: Arc<Mutex<Option<MultiplexedConnection>>>,
    key_prefix: String,
    command_timeout: Duration,
}

impl RedisCache {
    pub fn new(
        redis_url: &str,
        key_prefix: String,
        command_timeout: Duration,
    ) -> CacheResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| CacheError::Connection(format!("Redis client error: {}", e)))?;

        Ok(Self {
            client,
            connection: Arc::new(Mutex::new(None)),
            key_prefix,
            command_timeout,
        })
    }

    /// Open a connection and ping it so startup fails fast when Redis is down
    pub async fn connect(&self) -> CacheResult<()> {
        let conn = self.get_connection().await?;
        self.return_connection(conn).await;
        self.health_check().await
    }

    async fn get_connection(&self) -> CacheResult<MultiplexedConnection> {
        if let Some(conn) = self.connection.lock().await.take() {
            return Ok(conn);
        }

        self.with_timeout(
            "connect",
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
    }

    async fn return_connection(&self, conn: MultiplexedConnection) {
        *self.connection.lock().await = Some(conn);
    }

    async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.is_connection_refusal() || e.is_io_error() => Err(
                CacheError::Connection(format!("Redis {} failed: {}", operation, e)),
            ),
            Ok(Err(e)) => Err(CacheError::Cache(format!("Redis {} failed: {}", operation, e))),
            Err(_) => Err(CacheError::Timeout(format!(
                "Redis {} exceeded {:?}",
                operation, self.command_timeout
            ))),
        }
    }

    /// Run one command on a pooled connection, returning it only on success
    async fn run<T, F, Fut>(&self, operation: &str, command: F) -> CacheResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<(MultiplexedConnection, T), redis::RedisError>>,
    {
        let conn = self.get_connection().await?;
        let (conn, value) = self.with_timeout(operation, command(conn)).await?;
        self.return_connection(conn).await;
        Ok(value)
    }

    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let key = self.prefixed_key(key);
        self.run("GET", |mut conn| async move {
            let value: Option<String> = conn.get(&key).await?;
            Ok((conn, value))
        })
        .await
    }

    pub async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        let key = self.prefixed_key(key);
        self.run("SET", |mut conn| async move {
            match ttl {
                Some(ttl) => {
                    let millis = (ttl.as_millis() as u64).max(1);
                    let _: () = conn.pset_ex(&key, value, millis).await?;
                }
                None => {
                    let _: () = conn.set(&key, value).await?;
                }
            }
            Ok((conn, ()))
        })
        .await
    }

    pub async fn publish(&self, channel: &str, message: String) -> CacheResult<usize> {
        let channel = channel.to_string();
        self.run("PUBLISH", |mut conn| async move {
            let receivers: usize = conn.publish(&channel, message).await?;
            Ok((conn, receivers))
        })
        .await
    }

    /// Open a dedicated pub/sub connection. The stream ends when the
    /// connection drops; callers resubscribe.
    pub async fn subscribe(&self, channel: &str) -> CacheResult<EventStream> {
        let mut pubsub = self
            .with_timeout("SUBSCRIBE", self.client.get_async_pubsub())
            .await?;
        self.with_timeout("SUBSCRIBE", pubsub.subscribe(channel))
            .await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!("Dropping non-text pub/sub payload: {}", e);
                    None
                }
            }
        });

        Ok(stream.boxed())
    }

    pub async fn health_check(&self) -> CacheResult<()> {
        let _: String = self
            .run("PING", |mut conn| async move {
                let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok((conn, pong))
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_rejected() {
        let result = RedisCache::new("not-a-url", String::new(), Duration::from_secs(1));
        assert!(matches!(result, Err(CacheError::Connection(_))));
    }

    #[test]
    fn test_prefixed_key() {
        let cache = RedisCache::new(
            "redis://localhost:6379",
            "observatory:".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            cache.prefixed_key("analytics:anomalies"),
            "observatory:analytics:anomalies"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_error() {
        let cache = RedisCache::new(
            "redis://127.0.0.1:1",
            String::new(),
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(cache.health_check().await.is_err());
        assert!(cache.get("key").await.is_err());
    }
}
