use api_observatory::{
    Config, Server, cache::CacheManager, storage::MemoryRecordStore,
    test_utils::TestServerBuilder,
};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use serde_json::Value;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Server over in-memory backends, with handles for seeding records and artifacts
pub struct TestHarness {
    pub server: Server,
    pub app: Router,
    pub store: MemoryRecordStore,
    pub cache: CacheManager,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let store = MemoryRecordStore::new();
        let cache = CacheManager::new_memory();
        let server = TestServerBuilder::new()
            .with_config(config)
            .with_store(store.clone())
            .with_cache(cache.clone())
            .build()
            .await;
        let app = server.create_app();

        Self {
            server,
            app,
            store,
            cache,
        }
    }

    pub async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    /// Serve the app on an ephemeral local port
    #[allow(dead_code)]
    pub async fn spawn_listener(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.app.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}
