//! Periodic metric rollups
//!
//! A background task that folds three sources into one `RateLimitMetric` row
//! per tenant per period (plus a global row): the per-tenant Redis counters
//! maintained by the enforcement script, the violations table, and the
//! in-process hot-path accumulator. Runs entirely off the request path and
//! recomputes idempotently, so re-aggregating a period never double-counts.

pub mod stats;

use crate::connection::RedisConnections;
use crate::domain::{AggregationPeriod, NewMetricRollup};
use crate::enforcer::{stats_key, WINDOW_SECS};
use crate::error::Result;
use crate::repository::{
    MetricRepository, TenantRateLimitRepository, ViolationRepository, ViolationStats,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use redis::{aio::ConnectionManager, AsyncCommands};
use stats::{HotPathStats, WindowStats};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Start of the aggregation period containing `now`
pub fn period_start_containing(now: DateTime<Utc>, period: AggregationPeriod) -> DateTime<Utc> {
    let secs = period.as_secs();
    let ts = now.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(secs), 0).unwrap_or(now)
}

/// Start of the most recently completed period
pub fn previous_period_start(now: DateTime<Utc>, period: AggregationPeriod) -> DateTime<Utc> {
    period_start_containing(now, period) - period.duration()
}

pub struct MetricsAggregator<T, V, M>
where
    T: TenantRateLimitRepository,
    V: ViolationRepository,
    M: MetricRepository,
{
    connections: Arc<RedisConnections>,
    limits: Arc<T>,
    violations: Arc<V>,
    metrics_repo: Arc<M>,
    stats: Arc<HotPathStats>,
    period: AggregationPeriod,
    interval: Duration,
}

impl<T, V, M> MetricsAggregator<T, V, M>
where
    T: TenantRateLimitRepository,
    V: ViolationRepository,
    M: MetricRepository,
{
    pub fn new(
        connections: Arc<RedisConnections>,
        limits: Arc<T>,
        violations: Arc<V>,
        metrics_repo: Arc<M>,
        stats: Arc<HotPathStats>,
        period: AggregationPeriod,
        interval: Duration,
    ) -> Self {
        Self {
            connections,
            limits,
            violations,
            metrics_repo,
            stats,
            period,
            interval,
        }
    }

    /// Scheduler loop: each tick rolls up the most recently completed period.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let period_start = previous_period_start(Utc::now(), self.period);
                    match self.aggregate(period_start).await {
                        Ok(rows) => {
                            debug!(rows, period_start = %period_start, "metric rollup complete");
                            counter!("ratekeeper_aggregator_runs_total", "result" => "ok")
                                .increment(1);
                        }
                        Err(e) => {
                            warn!(error = %e, "metric rollup failed");
                            counter!("ratekeeper_aggregator_runs_total", "result" => "error")
                                .increment(1);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("metrics aggregator stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Roll up one period for every known tenant plus the global row.
    /// Returns the number of rows upserted.
    pub async fn aggregate(&self, period_start: DateTime<Utc>) -> Result<usize> {
        let period_end = period_start + self.period.duration();
        let start_secs = period_start.timestamp();
        let end_secs = period_end.timestamp();

        let mut tenants: BTreeSet<Uuid> = self.limits.list_tenant_ids().await?.into_iter().collect();
        tenants.extend(
            self.violations
                .tenants_with_violations(period_start, period_end)
                .await?,
        );

        // One probed handle for the whole pass; counters are skipped (not
        // failed) when the store is unavailable.
        let mut conn = match self.connections.rate_limit().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "rate-limit store unavailable for rollup, using DB sources only");
                None
            }
        };

        let hot = self.stats.snapshot_range(start_secs, end_secs);

        let mut rows = 0usize;
        let mut global_allowed = 0u64;
        let mut global_redis_blocked = 0u64;
        let mut global_read_errors = 0u64;
        let mut global_hot = WindowStats::default();

        for tenant in tenants {
            let mut read_errors = 0u64;
            let (allowed, redis_blocked) = match conn.as_mut() {
                Some(conn) => {
                    match read_window_counters(conn, tenant, start_secs, end_secs).await {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(tenant_id = %tenant, error = %e, "failed to read rollup counters");
                            counter!("ratekeeper_redis_errors_total", "stage" => "rollup", "error_type" => "command")
                                .increment(1);
                            read_errors += 1;
                            (0, 0)
                        }
                    }
                }
                None => (0, 0),
            };

            let vstats = self
                .violations
                .stats_for_period(Some(tenant), period_start, period_end)
                .await?;
            let tenant_hot = hot.get(&tenant).cloned().unwrap_or_default();

            let rollup = build_rollup(
                Some(tenant),
                self.period,
                period_start,
                period_end,
                allowed,
                redis_blocked,
                &vstats,
                &tenant_hot,
                read_errors,
            );

            global_allowed += allowed;
            global_redis_blocked += redis_blocked;
            global_read_errors += read_errors;
            global_hot.merge(&tenant_hot);

            self.metrics_repo.upsert(&rollup).await?;
            rows += 1;
        }

        let global_vstats = self
            .violations
            .stats_for_period(None, period_start, period_end)
            .await?;
        let global = build_rollup(
            None,
            self.period,
            period_start,
            period_end,
            global_allowed,
            global_redis_blocked,
            &global_vstats,
            &global_hot,
            global_read_errors,
        );
        self.metrics_repo.upsert(&global).await?;
        rows += 1;

        // Windows older than the previous period can no longer be re-rolled
        self.stats.prune_before(start_secs - self.period.as_secs());

        Ok(rows)
    }
}

/// Sum the enforcement script's per-window allowed/blocked counters for one
/// tenant across every hour window of the period.
async fn read_window_counters(
    conn: &mut ConnectionManager,
    tenant: Uuid,
    start_secs: i64,
    end_secs: i64,
) -> std::result::Result<(u64, u64), redis::RedisError> {
    let mut allowed = 0u64;
    let mut blocked = 0u64;
    let mut window = start_secs;
    while window < end_secs {
        let counters: HashMap<String, u64> = conn.hgetall(stats_key(tenant, window)).await?;
        allowed += counters.get("allowed").copied().unwrap_or(0);
        blocked += counters.get("blocked").copied().unwrap_or(0);
        window += WINDOW_SECS;
    }
    Ok((allowed, blocked))
}

/// Fold the three sources into one rollup row. Pure, deterministic.
#[allow(clippy::too_many_arguments)]
fn build_rollup(
    tenant_id: Option<Uuid>,
    period: AggregationPeriod,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    allowed: u64,
    redis_blocked: u64,
    vstats: &ViolationStats,
    hot: &WindowStats,
    extra_redis_errors: u64,
) -> NewMetricRollup {
    // The violations table survives Redis counter expiry; whichever source
    // saw more denials is closer to the truth.
    let blocked = redis_blocked.max(vstats.blocked);

    let mut users: HashSet<Uuid> = vstats
        .user_ids
        .iter()
        .filter_map(|s| Uuid::parse_str(s).ok())
        .collect();
    users.extend(hot.sampled_users.iter().copied());

    let mut ips: HashSet<&str> = vstats.client_ips.iter().map(String::as_str).collect();
    ips.extend(hot.sampled_ips.iter().map(String::as_str));

    NewMetricRollup {
        tenant_id,
        aggregation_period: period,
        period_start,
        period_end,
        total_requests: allowed + blocked,
        blocked_requests: blocked,
        unique_users: users.len() as u64,
        unique_ips: ips.len() as u64,
        avg_processing_time_ms: hot.avg_ms(),
        max_processing_time_ms: hot.max_ms(),
        rate_limit_overhead_ms: hot.avg_ms(),
        top_endpoints: vstats.top_endpoints.clone(),
        top_violating_ips: vstats.top_ips.clone(),
        redis_errors: hot.redis_errors + extra_redis_errors,
        bypass_events: hot.bypass_events,
    }
}
