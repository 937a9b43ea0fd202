//! Health check endpoints

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub database: bool,
    pub redis_main: bool,
    pub redis_rate_limit: bool,
    pub fallback_mode: bool,
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check endpoint
///
/// Fallback mode still reports ready (the service deliberately runs degraded
/// there); anything else requires both Redis handles and the database.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query("SELECT 1")
        .execute(&state.db_pool)
        .await
        .is_ok();

    let redis = state.connections.status();
    let redis_ok = state.connections.is_connected() || redis.fallback_mode;

    let status = if db_ok && redis_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if status == StatusCode::OK {
                "ready".to_string()
            } else {
                "not_ready".to_string()
            },
            database: db_ok,
            redis_main: redis.main_connected,
            redis_rate_limit: redis.rate_limit_connected,
            fallback_mode: redis.fallback_mode,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_structure() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            version: "0.3.0".to_string(),
        };

        assert_eq!(response.status, "healthy");
        assert_eq!(response.version, "0.3.0");
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_ready_response_serialization() {
        let response = ReadyResponse {
            status: "ready".to_string(),
            database: true,
            redis_main: true,
            redis_rate_limit: false,
            fallback_mode: true,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"fallback_mode\":true"));
        assert!(json.contains("\"redis_rate_limit\":false"));
    }
}
