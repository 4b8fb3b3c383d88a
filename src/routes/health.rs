use crate::{error::AppError, health::HealthService};
use axum::{
    Router,
    extract::{Query, State},
    response::Json,
    routing::get,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct HealthCheckQuery {
    #[serde(default)]
    check: Option<String>,
}

/// Aggregated health of every registered component (store, cache, relay)
pub fn create_health_routes() -> Router<Arc<HealthService>> {
    Router::new().route("/", get(health_check))
}

async fn health_check(
    State(health_service): State<Arc<HealthService>>,
    Query(params): Query<HealthCheckQuery>,
) -> Result<Json<Value>, AppError> {
    let health_response = health_service.check_health(params.check.as_deref()).await;

    let response_json = serde_json::to_value(&health_response)
        .map_err(|e| AppError::Internal(format!("Failed to serialize health response: {}", e)))?;

    Ok(Json(response_json))
}
