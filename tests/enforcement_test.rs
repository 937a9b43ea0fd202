//! End-to-end enforcement tests against a live Redis
//!
//! Set TEST_REDIS_URL to run; without it each test logs a skip notice and
//! returns. Tenants are freshly generated UUIDs, so runs never collide on
//! window counters.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ratekeeper::aggregator::stats::HotPathStats;
use ratekeeper::config::{EnforcementFallback, ExecutionMode, RedisSettings};
use ratekeeper::connection::RedisConnections;
use ratekeeper::domain::limits::PolicyDefaults;
use ratekeeper::domain::{TenantRateLimit, Tier, UpsertRateLimitInput};
use ratekeeper::enforcer::{ClientIdentity, RateLimitEnforcer, WINDOW_SECS};
use ratekeeper::error::Result;
use ratekeeper::policy::TenantPolicyStore;
use ratekeeper::recorder::{RecorderHandle, ViolationRecorder};
use ratekeeper::repository::{TenantRateLimitRepository, ViolationRepository};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Serves one fixed policy row for every tenant; no database involved.
struct StaticPolicyRepo {
    row: TenantRateLimit,
}

impl StaticPolicyRepo {
    fn with_limits(requests_per_hour: u32, burst_size: u32) -> Self {
        let now = Utc::now();
        Self {
            row: TenantRateLimit {
                id: Uuid::new_v4().into(),
                tenant_id: Uuid::new_v4().into(),
                tier: Tier::Standard,
                requests_per_hour,
                burst_size,
                endpoint_overrides: HashMap::new(),
                enabled: true,
                valid_from: None,
                valid_until: None,
                emergency_bypass: false,
                bypass_reason: None,
                bypass_until: None,
                created_at: now,
                updated_at: now,
            },
        }
    }

    fn with_row(row: TenantRateLimit) -> Self {
        Self { row }
    }
}

#[async_trait]
impl TenantRateLimitRepository for StaticPolicyRepo {
    async fn find_by_tenant(&self, tenant_id: Uuid) -> Result<Option<TenantRateLimit>> {
        let mut row = self.row.clone();
        row.tenant_id = tenant_id.into();
        Ok(Some(row))
    }

    async fn upsert(&self, _: Uuid, _: &UpsertRateLimitInput) -> Result<TenantRateLimit> {
        unimplemented!("read-only test repository")
    }

    async fn ensure_default(&self, _: Uuid, _: &PolicyDefaults) -> Result<TenantRateLimit> {
        unimplemented!("read-only test repository")
    }

    async fn set_bypass(
        &self,
        _: Uuid,
        _: &str,
        _: DateTime<Utc>,
    ) -> Result<TenantRateLimit> {
        unimplemented!("read-only test repository")
    }

    async fn clear_bypass(&self, _: Uuid) -> Result<TenantRateLimit> {
        unimplemented!("read-only test repository")
    }

    async fn list_tenant_ids(&self) -> Result<Vec<Uuid>> {
        Ok(vec![])
    }
}

/// Discards every violation; enforcement tests only care about decisions.
struct NullViolationRepo;

#[async_trait]
impl ViolationRepository for NullViolationRepo {
    async fn insert(&self, _: &ratekeeper::domain::NewViolation) -> Result<()> {
        Ok(())
    }

    async fn insert_batch(&self, _: &[ratekeeper::domain::NewViolation]) -> Result<()> {
        Ok(())
    }

    async fn list_for_tenant(
        &self,
        _: Uuid,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
        _: i64,
    ) -> Result<Vec<ratekeeper::domain::RateLimitViolation>> {
        Ok(vec![])
    }

    async fn tenants_with_violations(
        &self,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        Ok(vec![])
    }

    async fn stats_for_period(
        &self,
        _: Option<Uuid>,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
    ) -> Result<ratekeeper::repository::ViolationStats> {
        Ok(ratekeeper::repository::ViolationStats::default())
    }
}

async fn live_connections() -> Option<Arc<RedisConnections>> {
    let url = match std::env::var("TEST_REDIS_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!("Skipping test: TEST_REDIS_URL not set");
            return None;
        }
    };
    let settings = RedisSettings {
        main_url: url.clone(),
        rate_limit_url: url,
    };
    match RedisConnections::initialize(&settings, ExecutionMode::Production).await {
        Ok(connections) => Some(Arc::new(connections)),
        Err(e) => {
            eprintln!("Skipping test: could not connect to Redis: {}", e);
            None
        }
    }
}

async fn build_enforcer(
    repo: StaticPolicyRepo,
    connections: Arc<RedisConnections>,
) -> (Arc<RateLimitEnforcer<StaticPolicyRepo>>, RecorderHandle) {
    let policies = Arc::new(TenantPolicyStore::new(
        Arc::new(repo),
        PolicyDefaults {
            tier: Tier::Standard,
            requests_per_hour: 1000,
            burst_size: 100,
        },
        Duration::from_secs(45),
    ));
    let (handle, _worker) = ViolationRecorder::new(Arc::new(NullViolationRepo), 256);
    let stats = Arc::new(HotPathStats::new());
    let enforcer = Arc::new(RateLimitEnforcer::new(
        policies,
        connections,
        handle.clone(),
        stats,
        EnforcementFallback::FailOpen,
        Duration::from_millis(250),
    ));
    (enforcer, handle)
}

fn identity(client: &str) -> ClientIdentity {
    ClientIdentity {
        client_id: client.to_string(),
        user_id: Some(Uuid::new_v4()),
        ip: "203.0.113.50".to_string(),
        user_agent: Some("enforcement-test".to_string()),
    }
}

#[tokio::test]
async fn test_exactly_limit_plus_burst_allowed_in_window() {
    let Some(connections) = live_connections().await else { return };
    let (enforcer, handle) =
        build_enforcer(StaticPolicyRepo::with_limits(5, 2), connections).await;
    let tenant = Uuid::new_v4();
    let client = identity("client-window");

    // limit + burst = 7 requests pass
    for i in 1..=7u64 {
        let decision = enforcer
            .check(tenant, "GET", "/api/v1/widgets", &client)
            .await;
        assert!(decision.allowed, "request {} should be allowed", i);
        assert_eq!(decision.observed_count, i);
        assert_eq!(decision.remaining, 7 - i);
    }

    // The 8th is denied with a retry-after within the window length
    let denied = enforcer
        .check(tenant, "GET", "/api/v1/widgets", &client)
        .await;
    assert!(!denied.allowed);
    assert_eq!(denied.observed_count, 8);
    assert!(denied.retry_after_secs > 0);
    assert!(denied.retry_after_secs <= WINDOW_SECS as u64);
    assert_eq!(denied.limit, 5);

    // The denial was queued for recording
    assert_eq!(handle.queue_len(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_never_exceed_allowance() {
    let Some(connections) = live_connections().await else { return };
    let (enforcer, _handle) =
        build_enforcer(StaticPolicyRepo::with_limits(10, 5), connections).await;
    let tenant = Uuid::new_v4();

    // 2 * (limit + burst) concurrent attempts for one key
    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..30 {
        let enforcer = enforcer.clone();
        tasks.spawn(async move {
            enforcer
                .check(tenant, "GET", "/api/v1/widgets", &identity("client-conc"))
                .await
                .allowed
        });
    }

    let mut allowed = 0u32;
    while let Some(result) = tasks.join_next().await {
        if result.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 15, "exactly limit+burst requests may pass");
}

#[tokio::test]
async fn test_separate_clients_get_separate_windows() {
    let Some(connections) = live_connections().await else { return };
    let (enforcer, _handle) =
        build_enforcer(StaticPolicyRepo::with_limits(2, 0), connections).await;
    let tenant = Uuid::new_v4();

    for _ in 0..2 {
        assert!(
            enforcer
                .check(tenant, "GET", "/api/v1/widgets", &identity("client-a"))
                .await
                .allowed
        );
    }
    assert!(
        !enforcer
            .check(tenant, "GET", "/api/v1/widgets", &identity("client-a"))
            .await
            .allowed
    );

    // client-b has its own counter
    assert!(
        enforcer
            .check(tenant, "GET", "/api/v1/widgets", &identity("client-b"))
            .await
            .allowed
    );
}

#[tokio::test]
async fn test_emergency_bypass_admits_unlimited_volume() {
    let Some(connections) = live_connections().await else { return };

    let mut row = StaticPolicyRepo::with_limits(1, 0).row;
    row.emergency_bypass = true;
    row.bypass_until = Some(Utc::now() + ChronoDuration::minutes(10));
    let (enforcer, handle) =
        build_enforcer(StaticPolicyRepo::with_row(row), connections).await;
    let tenant = Uuid::new_v4();

    for _ in 0..20 {
        let decision = enforcer
            .check(tenant, "GET", "/api/v1/widgets", &identity("client-bypass"))
            .await;
        assert!(decision.allowed);
    }
    assert_eq!(handle.queue_len(), 0);
}

#[tokio::test]
async fn test_expired_bypass_reapplies_limits() {
    let Some(connections) = live_connections().await else { return };

    let mut row = StaticPolicyRepo::with_limits(1, 0).row;
    row.emergency_bypass = true;
    row.bypass_until = Some(Utc::now() - ChronoDuration::seconds(5));
    let (enforcer, _handle) =
        build_enforcer(StaticPolicyRepo::with_row(row), connections).await;
    let tenant = Uuid::new_v4();

    assert!(
        enforcer
            .check(tenant, "GET", "/api/v1/widgets", &identity("client-exp"))
            .await
            .allowed
    );
    // Second request exceeds the limit of 1: the stale bypass must not save it
    assert!(
        !enforcer
            .check(tenant, "GET", "/api/v1/widgets", &identity("client-exp"))
            .await
            .allowed
    );
}
