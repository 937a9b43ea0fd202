//! Rate-limit violation repository
//!
//! Violations are append-only: the recorder worker inserts, everything else
//! reads. No update or delete paths exist here by design of the audit trail
//! (retention pruning is an operational concern outside this service).

use crate::domain::{EndpointCount, IpCount, NewViolation, RateLimitViolation};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::MySqlPool;
use uuid::Uuid;

/// Cap on distinct user/IP samples pulled per rollup query
const DISTINCT_SAMPLE_LIMIT: i64 = 10_000;
/// Number of entries kept in top-endpoint / top-IP lists
const TOP_LIMIT: i64 = 5;

/// Violation facts for one tenant (or all tenants) over a rollup period
#[derive(Debug, Clone, Default)]
pub struct ViolationStats {
    pub blocked: u64,
    pub user_ids: Vec<String>,
    pub client_ips: Vec<String>,
    pub top_endpoints: Vec<EndpointCount>,
    pub top_ips: Vec<IpCount>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ViolationRepository: Send + Sync {
    async fn insert(&self, violation: &NewViolation) -> Result<()>;
    async fn insert_batch(&self, violations: &[NewViolation]) -> Result<()>;
    async fn list_for_tenant(
        &self,
        tenant_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RateLimitViolation>>;
    /// Tenants that produced at least one violation in the period
    async fn tenants_with_violations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Uuid>>;
    /// Aggregated facts for the rollup; `tenant_id = None` spans all tenants
    async fn stats_for_period(
        &self,
        tenant_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ViolationStats>;
}

pub struct ViolationRepositoryImpl {
    pool: MySqlPool,
}

impl ViolationRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn bind_insert<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    id: String,
    v: &'q NewViolation,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    query
        .bind(id)
        .bind(v.tenant_id.to_string())
        .bind(v.user_id.map(|u| u.to_string()))
        .bind(&v.endpoint)
        .bind(&v.method)
        .bind(v.rate_limit)
        .bind(v.request_count)
        .bind(&v.client_ip)
        .bind(&v.user_agent)
        .bind(v.violation_time)
        .bind(v.window_start)
        .bind(v.window_end)
        .bind(v.retry_after_seconds)
        .bind(v.severity.to_string())
        .bind(&v.automated_response)
}

const INSERT_SQL: &str = r#"
    INSERT INTO rate_limit_violations
        (id, tenant_id, user_id, endpoint, method, rate_limit, request_count,
         client_ip, user_agent, violation_time, window_start, window_end,
         retry_after_seconds, severity, automated_response)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

#[async_trait]
impl ViolationRepository for ViolationRepositoryImpl {
    async fn insert(&self, violation: &NewViolation) -> Result<()> {
        bind_insert(sqlx::query(INSERT_SQL), Uuid::new_v4().to_string(), violation)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_batch(&self, violations: &[NewViolation]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for violation in violations {
            bind_insert(sqlx::query(INSERT_SQL), Uuid::new_v4().to_string(), violation)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_for_tenant(
        &self,
        tenant_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RateLimitViolation>> {
        let violations = sqlx::query_as::<_, RateLimitViolation>(
            r#"
            SELECT id, tenant_id, user_id, endpoint, method, rate_limit, request_count,
                   client_ip, user_agent, violation_time, window_start, window_end,
                   retry_after_seconds, severity, automated_response
            FROM rate_limit_violations
            WHERE tenant_id = ? AND violation_time >= ? AND violation_time < ?
            ORDER BY violation_time DESC
            LIMIT ?
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(violations)
    }

    async fn tenants_with_violations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT tenant_id FROM rate_limit_violations
            WHERE violation_time >= ? AND violation_time < ?
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.iter().filter_map(|s| Uuid::parse_str(s).ok()).collect())
    }

    async fn stats_for_period(
        &self,
        tenant_id: Option<Uuid>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ViolationStats> {
        let tenant = tenant_id.map(|u| u.to_string());

        let blocked: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM rate_limit_violations
            WHERE violation_time >= ? AND violation_time < ?
              AND (? IS NULL OR tenant_id = ?)
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(&tenant)
        .bind(&tenant)
        .fetch_one(&self.pool)
        .await?;

        let user_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT user_id FROM rate_limit_violations
            WHERE violation_time >= ? AND violation_time < ?
              AND (? IS NULL OR tenant_id = ?)
              AND user_id IS NOT NULL
            LIMIT ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(&tenant)
        .bind(&tenant)
        .bind(DISTINCT_SAMPLE_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        let client_ips: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT client_ip FROM rate_limit_violations
            WHERE violation_time >= ? AND violation_time < ?
              AND (? IS NULL OR tenant_id = ?)
            LIMIT ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(&tenant)
        .bind(&tenant)
        .bind(DISTINCT_SAMPLE_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        let endpoint_rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT endpoint, COUNT(*) AS hits FROM rate_limit_violations
            WHERE violation_time >= ? AND violation_time < ?
              AND (? IS NULL OR tenant_id = ?)
            GROUP BY endpoint ORDER BY hits DESC LIMIT ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(&tenant)
        .bind(&tenant)
        .bind(TOP_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        let ip_rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT client_ip, COUNT(*) AS hits FROM rate_limit_violations
            WHERE violation_time >= ? AND violation_time < ?
              AND (? IS NULL OR tenant_id = ?)
            GROUP BY client_ip ORDER BY hits DESC LIMIT ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(&tenant)
        .bind(&tenant)
        .bind(TOP_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        Ok(ViolationStats {
            blocked: blocked as u64,
            user_ids,
            client_ips,
            top_endpoints: endpoint_rows
                .into_iter()
                .map(|(endpoint, count)| EndpointCount {
                    endpoint,
                    count: count as u64,
                })
                .collect(),
            top_ips: ip_rows
                .into_iter()
                .map(|(ip, count)| IpCount {
                    ip,
                    count: count as u64,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_violation_repository() {
        let mut mock = MockViolationRepository::new();

        mock.expect_stats_for_period().returning(|_, _, _| {
            Ok(ViolationStats {
                blocked: 3,
                user_ids: vec!["u1".to_string()],
                client_ips: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                top_endpoints: vec![],
                top_ips: vec![],
            })
        });

        let stats = mock
            .stats_for_period(None, Utc::now(), Utc::now())
            .await
            .unwrap();
        assert_eq!(stats.blocked, 3);
        assert_eq!(stats.client_ips.len(), 2);
    }
}
