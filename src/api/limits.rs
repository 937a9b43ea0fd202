//! Admin endpoints for tenant rate-limit policies
//!
//! The mutation surface consumed by the admin dashboard: policy upsert,
//! emergency bypass arm/disarm, and read access to violations and rollups.
//! Every mutation invalidates the policy cache so enforcement picks up the
//! change immediately instead of waiting out the TTL.

use crate::domain::{
    AggregationPeriod, BypassInput, RateLimitMetric, RateLimitViolation, TenantRateLimit,
    UpsertRateLimitInput,
};
use crate::error::{AppError, Result};
use crate::repository::{MetricRepository, TenantRateLimitRepository, ViolationRepository};
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

const DEFAULT_VIOLATION_LIMIT: i64 = 100;
const DEFAULT_ROLLUP_LIMIT: i64 = 24;
const MAX_LIST_LIMIT: i64 = 1000;

/// GET /api/v1/tenants/{id}/rate-limit
pub async fn get_policy(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<TenantRateLimit>> {
    let row = state
        .limits_repo
        .find_by_tenant(tenant_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("No rate limit policy for tenant {}", tenant_id))
        })?;
    Ok(Json(row))
}

/// PUT /api/v1/tenants/{id}/rate-limit
pub async fn upsert_policy(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<UpsertRateLimitInput>,
) -> Result<Json<TenantRateLimit>> {
    input.validate()?;
    if let (Some(from), Some(until)) = (input.valid_from, input.valid_until) {
        if from >= until {
            return Err(AppError::BadRequest(
                "valid_from must precede valid_until".to_string(),
            ));
        }
    }

    let row = state.limits_repo.upsert(tenant_id, &input).await?;
    state.policy_store.invalidate(tenant_id);
    Ok(Json(row))
}

/// POST /api/v1/tenants/{id}/rate-limit/bypass
pub async fn arm_bypass(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<BypassInput>,
) -> Result<Json<TenantRateLimit>> {
    input.validate()?;
    // Invariant: an armed bypass always carries a future deadline
    if input.until <= Utc::now() {
        return Err(AppError::BadRequest(
            "bypass deadline must be in the future".to_string(),
        ));
    }

    state
        .limits_repo
        .ensure_default(tenant_id, &state.config.rate_limit.defaults())
        .await?;
    let row = state
        .limits_repo
        .set_bypass(tenant_id, &input.reason, input.until)
        .await?;
    state.policy_store.invalidate(tenant_id);

    tracing::info!(
        tenant_id = %tenant_id,
        until = %input.until,
        reason = %input.reason,
        "emergency bypass armed"
    );
    Ok(Json(row))
}

/// DELETE /api/v1/tenants/{id}/rate-limit/bypass
pub async fn disarm_bypass(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<TenantRateLimit>> {
    let row = state.limits_repo.clear_bypass(tenant_id).await?;
    state.policy_store.invalidate(tenant_id);
    tracing::info!(tenant_id = %tenant_id, "emergency bypass disarmed");
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct ViolationQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// GET /api/v1/tenants/{id}/violations
pub async fn list_violations(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ViolationQuery>,
) -> Result<Json<Vec<RateLimitViolation>>> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or_else(|| to - Duration::hours(24));
    let limit = query
        .limit
        .unwrap_or(DEFAULT_VIOLATION_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let violations = state
        .violation_repo
        .list_for_tenant(tenant_id, from, to, limit)
        .await?;
    Ok(Json(violations))
}

#[derive(Debug, Deserialize)]
pub struct RollupQuery {
    /// Omit for the global (all-tenant) series
    pub tenant_id: Option<Uuid>,
    pub period: Option<AggregationPeriod>,
    pub limit: Option<i64>,
}

/// GET /api/v1/rollups
pub async fn list_rollups(
    State(state): State<AppState>,
    Query(query): Query<RollupQuery>,
) -> Result<Json<Vec<RateLimitMetric>>> {
    let period = query.period.unwrap_or(AggregationPeriod::Hour);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ROLLUP_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let rollups = state
        .metric_repo
        .list_recent(query.tenant_id, period, limit)
        .await?;
    Ok(Json(rollups))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_query_defaults() {
        let query: ViolationQuery = serde_json::from_str("{}").unwrap();
        assert!(query.from.is_none());
        assert!(query.limit.is_none());
    }

    #[test]
    fn test_rollup_query_parsing() {
        let query: RollupQuery =
            serde_json::from_str(r#"{"period": "day", "limit": 7}"#).unwrap();
        assert_eq!(query.period, Some(AggregationPeriod::Day));
        assert_eq!(query.limit, Some(7));
        assert!(query.tenant_id.is_none());
    }
}
