use super::{
    DuplicateRow, EndpointReadStats, HourlyCostRow, ProviderCostRow, RecordStore, StorageError,
    StorageResult,
};
use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row, postgres::PgPoolOptions, postgres::PgRow};
use std::{future::Future, time::Duration};
use tokio::time::timeout;
use tracing::{debug, warn};

const DUPLICATES_SQL: &str = r#"
SELECT
    organization_id,
    endpoint,
    md5(endpoint || method || COALESCE(metadata::text, '')) AS fingerprint,
    COUNT(*)::int8 AS count,
    COALESCE(SUM(cost), 0)::float8 AS total_cost,
    MIN(time) AS first_seen,
    MAX(time) AS last_seen
FROM api_requests
WHERE time > NOW() - make_interval(secs => $1)
GROUP BY organization_id, endpoint, fingerprint
HAVING COUNT(*) > 1
ORDER BY total_cost DESC, organization_id, endpoint, fingerprint
LIMIT $2
"#;

const ENDPOINT_READ_STATS_SQL: &str = r#"
SELECT
    endpoint,
    COUNT(*)::int8 AS total_requests,
    COUNT(DISTINCT md5(endpoint || method || COALESCE(metadata::text, '')))::int8 AS unique_requests,
    COALESCE(SUM(cost), 0)::float8 AS total_cost,
    COALESCE(AVG(latency_ms), 0)::float8 AS avg_latency_ms
FROM api_requests
WHERE time > NOW() - make_interval(secs => $1)
  AND method = 'GET'
  AND status_code < 400
GROUP BY endpoint
HAVING COUNT(*) > $2
"#;

const HOURLY_ORG_COSTS_SQL: &str = r#"
SELECT
    organization_id,
    date_trunc('hour', time) AS hour,
    COALESCE(SUM(cost), 0)::float8 AS hourly_cost,
    COUNT(*)::int8 AS request_count
FROM api_requests
WHERE time > NOW() - make_interval(secs => $1)
GROUP BY organization_id, hour
"#;

const PROVIDER_COSTS_SQL: &str = r#"
SELECT
    provider,
    COUNT(*)::int8 AS request_count,
    COALESCE(SUM(cost), 0)::float8 AS total_cost,
    COALESCE(AVG(latency_ms), 0)::float8 AS avg_latency_ms,
    COUNT(*) FILTER (WHERE status_code >= 400)::int8 AS error_count
FROM api_requests
WHERE time > NOW() - make_interval(secs => $1)
GROUP BY provider
"#;

/// PostgreSQL (or TimescaleDB) backed record store over the `api_requests` table
pub struct PostgresRecordStore {
    pool: Pool<Postgres>,
    query_timeout: Duration,
}

impl PostgresRecordStore {
    /// Build a lazily connecting pool. The first query establishes the
    /// connection, so an unreachable database surfaces as a query error
    /// rather than a startup failure.
    pub fn new(
        database_url: &str,
        max_connections: u32,
        query_timeout: Duration,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(query_timeout)
            .connect_lazy(database_url)
            .map_err(|e| StorageError::Connection(format!("Invalid database URL: {}", e)))?;

        Ok(Self {
            pool,
            query_timeout,
        })
    }

    async fn run_query<F>(&self, query_name: &str, fut: F) -> StorageResult<Vec<PgRow>>
    where
        F: Future<Output = Result<Vec<PgRow>, sqlx::Error>>,
    {
        match timeout(self.query_timeout, fut).await {
            Ok(Ok(rows)) => {
                debug!("Query '{}' returned {} rows", query_name, rows.len());
                Ok(rows)
            }
            Ok(Err(e)) => Err(StorageError::Database(format!(
                "Query '{}' failed: {}",
                query_name, e
            ))),
            Err(_) => Err(StorageError::Timeout(format!(
                "Query '{}' exceeded {:?}",
                query_name, self.query_timeout
            ))),
        }
    }

    fn window_secs(window: Duration) -> f64 {
        window.as_secs_f64()
    }

    /// Decode every row, skipping (and logging) the ones that fail
    fn decode_rows<T>(
        query_name: &str,
        rows: Vec<PgRow>,
        decode: impl Fn(&PgRow) -> Result<T, sqlx::Error>,
    ) -> Vec<T> {
        rows.iter()
            .filter_map(|row| match decode(row) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Skipping malformed row from '{}': {}", query_name, e);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn duplicate_groups(
        &self,
        window: Duration,
        limit: usize,
    ) -> StorageResult<Vec<DuplicateRow>> {
        let rows = self
            .run_query(
                "duplicate_groups",
                sqlx::query(DUPLICATES_SQL)
                    .bind(Self::window_secs(window))
                    .bind(limit as i64)
                    .fetch_all(&self.pool),
            )
            .await?;

        Ok(Self::decode_rows("duplicate_groups", rows, |row| {
            Ok(DuplicateRow {
                organization_id: row.try_get("organization_id")?,
                endpoint: row.try_get("endpoint")?,
                fingerprint: row.try_get("fingerprint")?,
                count: row.try_get("count")?,
                total_cost: row.try_get("total_cost")?,
                first_seen: row.try_get("first_seen")?,
                last_seen: row.try_get("last_seen")?,
            })
        }))
    }

    async fn endpoint_read_stats(
        &self,
        window: Duration,
        min_requests: u64,
    ) -> StorageResult<Vec<EndpointReadStats>> {
        let rows = self
            .run_query(
                "endpoint_read_stats",
                sqlx::query(ENDPOINT_READ_STATS_SQL)
                    .bind(Self::window_secs(window))
                    .bind(min_requests as i64)
                    .fetch_all(&self.pool),
            )
            .await?;

        Ok(Self::decode_rows("endpoint_read_stats", rows, |row| {
            Ok(EndpointReadStats {
                endpoint: row.try_get("endpoint")?,
                total_requests: row.try_get("total_requests")?,
                unique_requests: row.try_get("unique_requests")?,
                total_cost: row.try_get("total_cost")?,
                avg_latency_ms: row.try_get("avg_latency_ms")?,
            })
        }))
    }

    async fn hourly_org_costs(&self, window: Duration) -> StorageResult<Vec<HourlyCostRow>> {
        let rows = self
            .run_query(
                "hourly_org_costs",
                sqlx::query(HOURLY_ORG_COSTS_SQL)
                    .bind(Self::window_secs(window))
                    .fetch_all(&self.pool),
            )
            .await?;

        Ok(Self::decode_rows("hourly_org_costs", rows, |row| {
            Ok(HourlyCostRow {
                organization_id: row.try_get("organization_id")?,
                hour: row.try_get("hour")?,
                hourly_cost: row.try_get("hourly_cost")?,
                request_count: row.try_get("request_count")?,
            })
        }))
    }

    async fn provider_costs(&self, window: Duration) -> StorageResult<Vec<ProviderCostRow>> {
        let rows = self
            .run_query(
                "provider_costs",
                sqlx::query(PROVIDER_COSTS_SQL)
                    .bind(Self::window_secs(window))
                    .fetch_all(&self.pool),
            )
            .await?;

        Ok(Self::decode_rows("provider_costs", rows, |row| {
            Ok(ProviderCostRow {
                provider: row.try_get("provider")?,
                request_count: row.try_get("request_count")?,
                total_cost: row.try_get("total_cost")?,
                avg_latency_ms: row.try_get("avg_latency_ms")?,
                error_count: row.try_get("error_count")?,
            })
        }))
    }

    async fn health_check(&self) -> StorageResult<()> {
        match timeout(
            self.query_timeout,
            sqlx::query("SELECT 1").fetch_one(&self.pool),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(StorageError::Connection(format!(
                "Database health check failed: {}",
                e
            ))),
            Err(_) => Err(StorageError::Timeout("Database health check".to_string())),
        }
    }
}
