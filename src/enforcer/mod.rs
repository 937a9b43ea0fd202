//! Rate limit enforcement
//!
//! Decides allow/deny for a single request attempt with one atomic Redis
//! round trip. The counter lives in a fixed, epoch-aligned one-hour window
//! with a burst allowance on top of the hourly rate; the Lua script makes the
//! check-and-increment race-free, so two concurrent requests can never both
//! take the last slot.
//!
//! `check` never returns an error: policy trouble degrades inside the policy
//! store, and an unreachable rate-limit store resolves to the configured
//! fail-open/fail-closed decision.

use crate::aggregator::stats::HotPathStats;
use crate::config::EnforcementFallback;
use crate::connection::RedisConnections;
use crate::domain::{
    NewViolation, PolicyBypass, ResolvedPolicy, Severity, RESPONSE_BLOCKED, RESPONSE_THROTTLED,
};
use crate::policy::TenantPolicyStore;
use crate::recorder::RecorderHandle;
use crate::repository::TenantRateLimitRepository;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use redis::Script;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

/// Fixed enforcement window length
pub const WINDOW_SECS: i64 = 3600;
/// Grace added to counter-key expiry beyond the window boundary
const KEY_TTL_GRACE_SECS: i64 = 60;
/// Stats hashes must outlive the aggregation of their window
const STATS_TTL_SECS: i64 = 2 * WINDOW_SECS + 600;

/// Atomically: bump the window counter (arming its expiry on first hit),
/// compare against the allowance, and record the outcome in the per-tenant
/// stats hash. Returns `[allowed, count]`.
const CHECK_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
if count <= tonumber(ARGV[2]) then
    redis.call('HINCRBY', KEYS[2], 'allowed', 1)
    redis.call('EXPIRE', KEYS[2], ARGV[3])
    return {1, count}
end
redis.call('HINCRBY', KEYS[2], 'blocked', 1)
redis.call('EXPIRE', KEYS[2], ARGV[3])
return {0, count}
"#;

/// Start of the fixed window containing `now_secs` (epoch-aligned)
pub fn window_start_secs(now_secs: i64) -> i64 {
    now_secs - now_secs.rem_euclid(WINDOW_SECS)
}

/// Counter key: stable across restarts so limits survive redeploys.
pub fn counter_key(tenant_id: Uuid, endpoint_class: &str, client_id: &str, window_start: i64) -> String {
    format!(
        "ratekeeper:rl:{}:{}:{}:{}",
        tenant_id, endpoint_class, client_id, window_start
    )
}

/// Per-tenant per-window stats hash consumed by the aggregator
pub fn stats_key(tenant_id: Uuid, window_start: i64) -> String {
    format!("ratekeeper:stats:{}:{}", tenant_id, window_start)
}

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Who is making the request, as far as rate limiting cares
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub client_id: String,
    pub user_id: Option<Uuid>,
    pub ip: String,
    pub user_agent: Option<String>,
}

/// Outcome of a single rate-limit check
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Hourly limit in effect (without burst)
    pub limit: u32,
    pub burst: u32,
    pub remaining: u64,
    /// Seconds until the window boundary; zero when allowed
    pub retry_after_secs: u64,
    /// Counter value observed by this check; zero when the check was skipped
    pub observed_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub bypass: PolicyBypass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckFailure {
    Unavailable,
    Timeout,
    Command,
    Malformed,
}

impl CheckFailure {
    fn label(&self) -> &'static str {
        match self {
            CheckFailure::Unavailable => "unavailable",
            CheckFailure::Timeout => "timeout",
            CheckFailure::Command => "command",
            CheckFailure::Malformed => "malformed_reply",
        }
    }
}

pub struct RateLimitEnforcer<R: TenantRateLimitRepository> {
    policies: Arc<TenantPolicyStore<R>>,
    connections: Arc<RedisConnections>,
    recorder: RecorderHandle,
    stats: Arc<HotPathStats>,
    fail_mode: EnforcementFallback,
    check_timeout: Duration,
}

impl<R: TenantRateLimitRepository> RateLimitEnforcer<R> {
    pub fn new(
        policies: Arc<TenantPolicyStore<R>>,
        connections: Arc<RedisConnections>,
        recorder: RecorderHandle,
        stats: Arc<HotPathStats>,
        fail_mode: EnforcementFallback,
        check_timeout: Duration,
    ) -> Self {
        Self {
            policies,
            connections,
            recorder,
            stats,
            fail_mode,
            check_timeout,
        }
    }

    /// Decide allow/deny for one request attempt.
    pub async fn check(
        &self,
        tenant_id: Uuid,
        method: &str,
        path: &str,
        identity: &ClientIdentity,
    ) -> RateLimitDecision {
        let started = Instant::now();
        let now = Utc::now();
        let now_secs = now.timestamp();
        let window_start = window_start_secs(now_secs);
        let window_end = window_start + WINDOW_SECS;
        let endpoint_class = format!("{}:{}", method, path);

        let policy = self.policies.resolve(tenant_id, &endpoint_class).await;
        let allowance = policy.limit as u64 + policy.burst as u64;

        if policy.is_bypassed() {
            if policy.bypass == PolicyBypass::Emergency {
                counter!("ratekeeper_bypass_events_total").increment(1);
                self.stats.record_bypass(tenant_id, window_start);
            }
            counter!("ratekeeper_checks_total", "result" => "bypass").increment(1);
            return RateLimitDecision {
                allowed: true,
                limit: policy.limit,
                burst: policy.burst,
                remaining: allowance,
                retry_after_secs: 0,
                observed_count: 0,
                window_start: ts(window_start),
                window_end: ts(window_end),
                bypass: policy.bypass,
            };
        }

        let key = counter_key(tenant_id, &endpoint_class, &identity.client_id, window_start);
        let stats_hash = stats_key(tenant_id, window_start);
        let key_ttl = (window_end - now_secs) + KEY_TTL_GRACE_SECS;

        let outcome = self.try_consume(&key, &stats_hash, allowance, key_ttl).await;

        let elapsed = started.elapsed();
        self.stats.record_check(
            tenant_id,
            window_start,
            elapsed,
            identity.user_id,
            &identity.ip,
        );
        histogram!("ratekeeper_check_duration_seconds").record(elapsed.as_secs_f64());

        match outcome {
            Ok((true, count)) => {
                counter!("ratekeeper_checks_total", "result" => "allowed").increment(1);
                RateLimitDecision {
                    allowed: true,
                    limit: policy.limit,
                    burst: policy.burst,
                    remaining: allowance.saturating_sub(count),
                    retry_after_secs: 0,
                    observed_count: count,
                    window_start: ts(window_start),
                    window_end: ts(window_end),
                    bypass: PolicyBypass::None,
                }
            }
            Ok((false, count)) => {
                let retry_after = (window_end - now_secs).max(1) as u64;
                counter!("ratekeeper_checks_total", "result" => "blocked").increment(1);
                counter!("ratekeeper_throttled_total", "endpoint" => endpoint_class.clone())
                    .increment(1);

                self.recorder.record(NewViolation {
                    tenant_id,
                    user_id: identity.user_id,
                    endpoint: endpoint_class,
                    method: method.to_string(),
                    rate_limit: policy.limit,
                    request_count: count,
                    client_ip: identity.ip.clone(),
                    user_agent: identity.user_agent.clone(),
                    violation_time: now,
                    window_start: ts(window_start),
                    window_end: ts(window_end),
                    retry_after_seconds: retry_after as u32,
                    severity: Severity::from_ratio(count, policy.limit),
                    automated_response: RESPONSE_BLOCKED.to_string(),
                });

                RateLimitDecision {
                    allowed: false,
                    limit: policy.limit,
                    burst: policy.burst,
                    remaining: 0,
                    retry_after_secs: retry_after,
                    observed_count: count,
                    window_start: ts(window_start),
                    window_end: ts(window_end),
                    bypass: PolicyBypass::None,
                }
            }
            Err(failure) => {
                counter!("ratekeeper_redis_errors_total", "stage" => "check", "error_type" => failure.label())
                    .increment(1);
                self.stats.record_redis_error(tenant_id, window_start);
                self.store_unavailable_decision(
                    failure,
                    &policy,
                    tenant_id,
                    method,
                    &endpoint_class,
                    identity,
                    now,
                    window_start,
                    window_end,
                )
            }
        }
    }

    /// Resolve an unavailable rate-limit store into the configured decision.
    #[allow(clippy::too_many_arguments)]
    fn store_unavailable_decision(
        &self,
        failure: CheckFailure,
        policy: &ResolvedPolicy,
        tenant_id: Uuid,
        method: &str,
        endpoint_class: &str,
        identity: &ClientIdentity,
        now: DateTime<Utc>,
        window_start: i64,
        window_end: i64,
    ) -> RateLimitDecision {
        let allowance = policy.limit as u64 + policy.burst as u64;
        match self.fail_mode {
            EnforcementFallback::FailOpen => {
                warn!(
                    tenant_id = %tenant_id,
                    endpoint = endpoint_class,
                    reason = failure.label(),
                    "rate-limit store unavailable, failing open"
                );
                counter!("ratekeeper_checks_total", "result" => "fail_open").increment(1);
                RateLimitDecision {
                    allowed: true,
                    limit: policy.limit,
                    burst: policy.burst,
                    remaining: allowance,
                    retry_after_secs: 0,
                    observed_count: 0,
                    window_start: ts(window_start),
                    window_end: ts(window_end),
                    bypass: PolicyBypass::None,
                }
            }
            EnforcementFallback::FailClosed => {
                warn!(
                    tenant_id = %tenant_id,
                    endpoint = endpoint_class,
                    reason = failure.label(),
                    "rate-limit store unavailable, failing closed"
                );
                counter!("ratekeeper_checks_total", "result" => "fail_closed").increment(1);
                let retry_after = (window_end - now.timestamp()).max(1) as u64;

                self.recorder.record(NewViolation {
                    tenant_id,
                    user_id: identity.user_id,
                    endpoint: endpoint_class.to_string(),
                    method: method.to_string(),
                    rate_limit: policy.limit,
                    request_count: 0,
                    client_ip: identity.ip.clone(),
                    user_agent: identity.user_agent.clone(),
                    violation_time: now,
                    window_start: ts(window_start),
                    window_end: ts(window_end),
                    retry_after_seconds: retry_after as u32,
                    severity: Severity::Low,
                    automated_response: RESPONSE_THROTTLED.to_string(),
                });

                RateLimitDecision {
                    allowed: false,
                    limit: policy.limit,
                    burst: policy.burst,
                    remaining: 0,
                    retry_after_secs: retry_after,
                    observed_count: 0,
                    window_start: ts(window_start),
                    window_end: ts(window_end),
                    bypass: PolicyBypass::None,
                }
            }
        }
    }

    /// The whole suspension (handle acquisition, probe, script) is bounded by
    /// `check_timeout`; a request whose check exceeds it is treated as a
    /// Redis-unavailable case, not an indefinite hang.
    async fn try_consume(
        &self,
        key: &str,
        stats_hash: &str,
        allowance: u64,
        key_ttl: i64,
    ) -> Result<(bool, u64), CheckFailure> {
        let attempt = async {
            let mut conn = match self.connections.rate_limit().await {
                Ok(Some(conn)) => conn,
                Ok(None) | Err(_) => return Err(CheckFailure::Unavailable),
            };

            let script = Script::new(CHECK_SCRIPT);
            let reply: Vec<i64> = script
                .key(key)
                .key(stats_hash)
                .arg(key_ttl)
                .arg(allowance as i64)
                .arg(STATS_TTL_SECS)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| {
                    warn!(error = %e, "rate-limit script execution failed");
                    CheckFailure::Command
                })?;

            if reply.len() == 2 {
                Ok((reply[0] == 1, reply[1] as u64))
            } else {
                Err(CheckFailure::Malformed)
            }
        };

        match tokio::time::timeout(self.check_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(CheckFailure::Timeout),
        }
    }
}
