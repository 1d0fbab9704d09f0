//! Health and probe endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// Full health report, including database connectivity.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database = if database_ok(&state).await {
        "healthy"
    } else {
        "unhealthy"
    };
    let status = if database == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "healthy" } else { "unhealthy" },
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
        })),
    )
}

/// Liveness probe, answers 200 whenever the process is up.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe, answers 200 once the database is reachable.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if database_ok(&state).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn database_ok(state: &AppState) -> bool {
    sqlx::query("SELECT 1").execute(&state.pool).await.is_ok()
}
