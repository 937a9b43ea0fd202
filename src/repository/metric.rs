//! Aggregated metric repository
//!
//! Rollup rows are written exclusively by the aggregator. The global rollup
//! is stored under the nil-UUID sentinel so the `(tenant_id, period,
//! period_start)` unique index covers it (MySQL unique indexes do not
//! constrain NULLs).

use crate::domain::{AggregationPeriod, NewMetricRollup, RateLimitMetric};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::MySqlPool;
use uuid::Uuid;

fn tenant_key(tenant_id: Option<Uuid>) -> String {
    tenant_id.unwrap_or_else(Uuid::nil).to_string()
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricRepository: Send + Sync {
    /// Idempotent recompute: inserting the same `(tenant, period, start)`
    /// twice replaces the stored values instead of accumulating.
    async fn upsert(&self, rollup: &NewMetricRollup) -> Result<()>;
    async fn find(
        &self,
        tenant_id: Option<Uuid>,
        period: AggregationPeriod,
        period_start: DateTime<Utc>,
    ) -> Result<Option<RateLimitMetric>>;
    async fn list_recent(
        &self,
        tenant_id: Option<Uuid>,
        period: AggregationPeriod,
        limit: i64,
    ) -> Result<Vec<RateLimitMetric>>;
}

pub struct MetricRepositoryImpl {
    pool: MySqlPool,
}

impl MetricRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, tenant_id, aggregation_period, period_start, period_end,
           total_requests, blocked_requests, unique_users, unique_ips,
           avg_processing_time_ms, max_processing_time_ms, rate_limit_overhead_ms,
           top_endpoints, top_violating_ips, redis_errors, bypass_events,
           created_at, updated_at
    FROM rate_limit_metrics
"#;

#[async_trait]
impl MetricRepository for MetricRepositoryImpl {
    async fn upsert(&self, rollup: &NewMetricRollup) -> Result<()> {
        let top_endpoints = serde_json::to_string(&rollup.top_endpoints)
            .map_err(|e| AppError::Internal(e.into()))?;
        let top_ips = serde_json::to_string(&rollup.top_violating_ips)
            .map_err(|e| AppError::Internal(e.into()))?;

        sqlx::query(
            r#"
            INSERT INTO rate_limit_metrics
                (id, tenant_id, aggregation_period, period_start, period_end,
                 total_requests, blocked_requests, unique_users, unique_ips,
                 avg_processing_time_ms, max_processing_time_ms, rate_limit_overhead_ms,
                 top_endpoints, top_violating_ips, redis_errors, bypass_events,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NOW(), NOW())
            ON DUPLICATE KEY UPDATE
                period_end = VALUES(period_end),
                total_requests = VALUES(total_requests),
                blocked_requests = VALUES(blocked_requests),
                unique_users = VALUES(unique_users),
                unique_ips = VALUES(unique_ips),
                avg_processing_time_ms = VALUES(avg_processing_time_ms),
                max_processing_time_ms = VALUES(max_processing_time_ms),
                rate_limit_overhead_ms = VALUES(rate_limit_overhead_ms),
                top_endpoints = VALUES(top_endpoints),
                top_violating_ips = VALUES(top_violating_ips),
                redis_errors = VALUES(redis_errors),
                bypass_events = VALUES(bypass_events),
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_key(rollup.tenant_id))
        .bind(rollup.aggregation_period.to_string())
        .bind(rollup.period_start)
        .bind(rollup.period_end)
        .bind(rollup.total_requests)
        .bind(rollup.blocked_requests)
        .bind(rollup.unique_users)
        .bind(rollup.unique_ips)
        .bind(rollup.avg_processing_time_ms)
        .bind(rollup.max_processing_time_ms)
        .bind(rollup.rate_limit_overhead_ms)
        .bind(&top_endpoints)
        .bind(&top_ips)
        .bind(rollup.redis_errors)
        .bind(rollup.bypass_events)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(
        &self,
        tenant_id: Option<Uuid>,
        period: AggregationPeriod,
        period_start: DateTime<Utc>,
    ) -> Result<Option<RateLimitMetric>> {
        let row = sqlx::query_as::<_, RateLimitMetric>(&format!(
            "{} WHERE tenant_id = ? AND aggregation_period = ? AND period_start = ?",
            SELECT_COLUMNS
        ))
        .bind(tenant_key(tenant_id))
        .bind(period.to_string())
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_recent(
        &self,
        tenant_id: Option<Uuid>,
        period: AggregationPeriod,
        limit: i64,
    ) -> Result<Vec<RateLimitMetric>> {
        let rows = sqlx::query_as::<_, RateLimitMetric>(&format!(
            "{} WHERE tenant_id = ? AND aggregation_period = ? ORDER BY period_start DESC LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(tenant_key(tenant_id))
        .bind(period.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_key_sentinel() {
        assert_eq!(tenant_key(None), Uuid::nil().to_string());
        let id = Uuid::new_v4();
        assert_eq!(tenant_key(Some(id)), id.to_string());
    }

    #[tokio::test]
    async fn test_mock_metric_repository_upsert() {
        let mut mock = MockMetricRepository::new();
        mock.expect_upsert().times(2).returning(|_| Ok(()));

        let rollup = NewMetricRollup {
            tenant_id: None,
            aggregation_period: AggregationPeriod::Hour,
            period_start: Utc::now(),
            period_end: Utc::now(),
            total_requests: 10,
            blocked_requests: 1,
            unique_users: 2,
            unique_ips: 2,
            avg_processing_time_ms: 0.4,
            max_processing_time_ms: 1.2,
            rate_limit_overhead_ms: 0.4,
            top_endpoints: vec![],
            top_violating_ips: vec![],
            redis_errors: 0,
            bypass_events: 0,
        };

        // Re-running the same rollup is a recompute, not an accumulation
        mock.upsert(&rollup).await.unwrap();
        mock.upsert(&rollup).await.unwrap();
    }
}
