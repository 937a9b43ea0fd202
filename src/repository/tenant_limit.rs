//! Tenant rate-limit policy repository

use crate::domain::limits::PolicyDefaults;
use crate::domain::{TenantRateLimit, UpsertRateLimitInput};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::MySqlPool;
use uuid::Uuid;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TenantRateLimitRepository: Send + Sync {
    async fn find_by_tenant(&self, tenant_id: Uuid) -> Result<Option<TenantRateLimit>>;
    async fn upsert(&self, tenant_id: Uuid, input: &UpsertRateLimitInput)
        -> Result<TenantRateLimit>;
    /// Insert the default policy row if the tenant has none yet.
    async fn ensure_default(
        &self,
        tenant_id: Uuid,
        defaults: &PolicyDefaults,
    ) -> Result<TenantRateLimit>;
    async fn set_bypass(
        &self,
        tenant_id: Uuid,
        reason: &str,
        until: DateTime<Utc>,
    ) -> Result<TenantRateLimit>;
    async fn clear_bypass(&self, tenant_id: Uuid) -> Result<TenantRateLimit>;
    async fn list_tenant_ids(&self) -> Result<Vec<Uuid>>;
}

pub struct TenantRateLimitRepositoryImpl {
    pool: MySqlPool,
}

impl TenantRateLimitRepositoryImpl {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, tenant_id, tier, requests_per_hour, burst_size, endpoint_overrides,
           enabled, valid_from, valid_until, emergency_bypass, bypass_reason,
           bypass_until, created_at, updated_at
    FROM tenant_rate_limits
"#;

#[async_trait]
impl TenantRateLimitRepository for TenantRateLimitRepositoryImpl {
    async fn find_by_tenant(&self, tenant_id: Uuid) -> Result<Option<TenantRateLimit>> {
        let row = sqlx::query_as::<_, TenantRateLimit>(&format!(
            "{} WHERE tenant_id = ?",
            SELECT_COLUMNS
        ))
        .bind(tenant_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn upsert(
        &self,
        tenant_id: Uuid,
        input: &UpsertRateLimitInput,
    ) -> Result<TenantRateLimit> {
        let id = Uuid::new_v4();
        let overrides_json = serde_json::to_string(&input.endpoint_overrides)
            .map_err(|e| AppError::Internal(e.into()))?;

        sqlx::query(
            r#"
            INSERT INTO tenant_rate_limits
                (id, tenant_id, tier, requests_per_hour, burst_size, endpoint_overrides,
                 enabled, valid_from, valid_until, emergency_bypass, bypass_reason,
                 bypass_until, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, false, NULL, NULL, NOW(), NOW())
            ON DUPLICATE KEY UPDATE
                tier = VALUES(tier),
                requests_per_hour = VALUES(requests_per_hour),
                burst_size = VALUES(burst_size),
                endpoint_overrides = VALUES(endpoint_overrides),
                enabled = VALUES(enabled),
                valid_from = VALUES(valid_from),
                valid_until = VALUES(valid_until),
                updated_at = NOW()
            "#,
        )
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .bind(input.tier.to_string())
        .bind(input.requests_per_hour)
        .bind(input.burst_size)
        .bind(&overrides_json)
        .bind(input.enabled)
        .bind(input.valid_from)
        .bind(input.valid_until)
        .execute(&self.pool)
        .await?;

        self.find_by_tenant(tenant_id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to upsert tenant policy")))
    }

    async fn ensure_default(
        &self,
        tenant_id: Uuid,
        defaults: &PolicyDefaults,
    ) -> Result<TenantRateLimit> {
        sqlx::query(
            r#"
            INSERT IGNORE INTO tenant_rate_limits
                (id, tenant_id, tier, requests_per_hour, burst_size, endpoint_overrides,
                 enabled, emergency_bypass, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, '{}', true, false, NOW(), NOW())
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id.to_string())
        .bind(defaults.tier.to_string())
        .bind(defaults.requests_per_hour)
        .bind(defaults.burst_size)
        .execute(&self.pool)
        .await?;

        self.find_by_tenant(tenant_id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to create default policy")))
    }

    async fn set_bypass(
        &self,
        tenant_id: Uuid,
        reason: &str,
        until: DateTime<Utc>,
    ) -> Result<TenantRateLimit> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_rate_limits
            SET emergency_bypass = true, bypass_reason = ?, bypass_until = ?, updated_at = NOW()
            WHERE tenant_id = ?
            "#,
        )
        .bind(reason)
        .bind(until)
        .bind(tenant_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "No rate limit policy for tenant {}",
                tenant_id
            )));
        }

        self.find_by_tenant(tenant_id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to set bypass")))
    }

    async fn clear_bypass(&self, tenant_id: Uuid) -> Result<TenantRateLimit> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_rate_limits
            SET emergency_bypass = false, bypass_reason = NULL, bypass_until = NULL,
                updated_at = NOW()
            WHERE tenant_id = ?
            "#,
        )
        .bind(tenant_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "No rate limit policy for tenant {}",
                tenant_id
            )));
        }

        self.find_by_tenant(tenant_id)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to clear bypass")))
    }

    async fn list_tenant_ids(&self) -> Result<Vec<Uuid>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT tenant_id FROM tenant_rate_limits ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;

        ids.iter()
            .map(|s| {
                Uuid::parse_str(s)
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("Bad tenant id {}: {}", s, e)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tier;
    use mockall::predicate::*;

    #[tokio::test]
    async fn test_mock_repository_find() {
        let mut mock = MockTenantRateLimitRepository::new();
        let tenant_id = Uuid::new_v4();

        mock.expect_find_by_tenant()
            .with(eq(tenant_id))
            .returning(|_| Ok(None));

        let result = mock.find_by_tenant(tenant_id).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_mock_repository_ensure_default() {
        let mut mock = MockTenantRateLimitRepository::new();
        let tenant_id = Uuid::new_v4();

        mock.expect_ensure_default().returning(move |tid, defaults| {
            let mut row = crate::domain::limits::tests::test_limit_row();
            row.tenant_id = tid.into();
            row.tier = defaults.tier;
            row.requests_per_hour = defaults.requests_per_hour;
            row.burst_size = defaults.burst_size;
            Ok(row)
        });

        let defaults = PolicyDefaults {
            tier: Tier::Standard,
            requests_per_hour: 1000,
            burst_size: 100,
        };
        let row = mock.ensure_default(tenant_id, &defaults).await.unwrap();
        assert_eq!(Uuid::from(row.tenant_id), tenant_id);
        assert_eq!(row.requests_per_hour, 1000);
    }
}
