use crate::{
    artifacts::{
        AnomaliesArtifact, CacheRecommendationsArtifact, CostSnapshot, DuplicatesArtifact,
    },
    server::Server,
};
use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

/// Read-only dashboard API over the cached artifacts.
///
/// Every endpoint answers 200 with the artifact's empty default when the
/// analysis engine has not produced it yet or the cache is unreachable.
pub fn create_analytics_routes() -> Router<Server> {
    Router::new()
        .route("/costs", get(get_costs))
        .route("/analytics/duplicates", get(get_duplicates))
        .route(
            "/analytics/cache-recommendations",
            get(get_cache_recommendations),
        )
        .route("/analytics/anomalies", get(get_anomalies))
        .route("/dashboard/summary", get(get_dashboard_summary))
}

#[derive(Debug, Serialize)]
pub struct DashboardSummary {
    pub costs: CostSnapshot,
    pub duplicates: DuplicatesArtifact,
    pub cache_recommendations: CacheRecommendationsArtifact,
    pub anomalies: AnomaliesArtifact,
    pub updated_at: DateTime<Utc>,
}

async fn get_costs(State(server): State<Server>) -> Json<CostSnapshot> {
    Json(server.cache.read_artifact_or_default().await)
}

async fn get_duplicates(State(server): State<Server>) -> Json<DuplicatesArtifact> {
    Json(server.cache.read_artifact_or_default().await)
}

async fn get_cache_recommendations(
    State(server): State<Server>,
) -> Json<CacheRecommendationsArtifact> {
    Json(server.cache.read_artifact_or_default().await)
}

async fn get_anomalies(State(server): State<Server>) -> Json<AnomaliesArtifact> {
    Json(server.cache.read_artifact_or_default().await)
}

async fn get_dashboard_summary(State(server): State<Server>) -> Json<DashboardSummary> {
    let cache = &server.cache;
    let (costs, duplicates, cache_recommendations, anomalies) = tokio::join!(
        cache.read_artifact_or_default::<CostSnapshot>(),
        cache.read_artifact_or_default::<DuplicatesArtifact>(),
        cache.read_artifact_or_default::<CacheRecommendationsArtifact>(),
        cache.read_artifact_or_default::<AnomaliesArtifact>(),
    );

    Json(DashboardSummary {
        costs,
        duplicates,
        cache_recommendations,
        anomalies,
        updated_at: Utc::now(),
    })
}

/// Service banner served at `/`
pub async fn service_banner() -> Json<Value> {
    Json(json!({
        "service": "API Observatory Gateway",
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
