use crate::{
    cache::CacheManager,
    config::Config,
    server::Server,
    storage::{
        DuplicateRow, EndpointReadStats, HourlyCostRow, MemoryRecordStore, ProviderCostRow,
        RecordStore, StorageError, StorageResult, UsageRecord,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

/// A successful call one minute ago, ready to be tweaked by the caller
pub fn sample_record(organization_id: &str, provider: &str, endpoint: &str) -> UsageRecord {
    UsageRecord {
        time: Utc::now() - chrono::Duration::minutes(1),
        organization_id: organization_id.to_string(),
        provider: provider.to_string(),
        endpoint: endpoint.to_string(),
        method: "POST".to_string(),
        status_code: 200,
        latency_ms: 250,
        request_size_bytes: 512,
        response_size_bytes: 2048,
        cost: 0.002,
        error_message: None,
        metadata: BTreeMap::new(),
    }
}

/// Record store whose every query fails, as an unreachable database would
pub struct UnavailableRecordStore;

impl UnavailableRecordStore {
    fn error() -> StorageError {
        StorageError::Connection("record store unavailable".to_string())
    }
}

#[async_trait]
impl RecordStore for UnavailableRecordStore {
    fn backend_name(&self) -> &'static str {
        "unavailable"
    }

    async fn duplicate_groups(&self, _: Duration, _: usize) -> StorageResult<Vec<DuplicateRow>> {
        Err(Self::error())
    }

    async fn endpoint_read_stats(
        &self,
        _: Duration,
        _: u64,
    ) -> StorageResult<Vec<EndpointReadStats>> {
        Err(Self::error())
    }

    async fn hourly_org_costs(&self, _: Duration) -> StorageResult<Vec<HourlyCostRow>> {
        Err(Self::error())
    }

    async fn provider_costs(&self, _: Duration) -> StorageResult<Vec<ProviderCostRow>> {
        Err(Self::error())
    }

    async fn health_check(&self) -> StorageResult<()> {
        Err(Self::error())
    }
}

/// Test server builder wired to in-memory store and cache backends
pub struct TestServerBuilder {
    config: Config,
    store: MemoryRecordStore,
    cache: CacheManager,
}

impl TestServerBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            store: MemoryRecordStore::new(),
            cache: CacheManager::new_memory(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Share a store the test keeps a handle to for seeding records
    pub fn with_store(mut self, store: MemoryRecordStore) -> Self {
        self.store = store;
        self
    }

    /// Share a cache the test keeps a handle to for writing artifacts
    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = cache;
        self
    }

    pub async fn build(self) -> Server {
        let mut config = self.config;
        config.metrics.enabled = false;
        config.store.backend = "memory".to_string();
        config.cache.backend = "memory".to_string();

        Server::with_components(config, Arc::new(self.store), self.cache).await
    }
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
