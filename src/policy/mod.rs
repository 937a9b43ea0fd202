//! Tenant policy resolution with in-memory caching
//!
//! Resolves the effective rate-limit policy for a (tenant, endpoint) pair.
//! Policies are cached per tenant behind `Arc` snapshots, so concurrent
//! readers never observe a partially updated policy; refreshes swap the whole
//! entry. A policy-store read failure never blocks the request path: the last
//! cached value (even expired) is served, else the configured default policy.

use crate::domain::limits::PolicyDefaults;
use crate::domain::{PolicyBypass, ResolvedPolicy, TenantRateLimit};
use crate::repository::TenantRateLimitRepository;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
struct CacheEntry {
    /// `None` caches the absence of a row (default policy applies)
    row: Option<Arc<TenantRateLimit>>,
    fetched_at: Instant,
}

/// Read-side owner of `TenantRateLimit` at request time.
pub struct TenantPolicyStore<R: TenantRateLimitRepository> {
    repo: Arc<R>,
    defaults: PolicyDefaults,
    ttl: Duration,
    cache: RwLock<HashMap<Uuid, CacheEntry>>,
    degraded: AtomicU64,
}

impl<R: TenantRateLimitRepository> TenantPolicyStore<R> {
    pub fn new(repo: Arc<R>, defaults: PolicyDefaults, ttl: Duration) -> Self {
        Self {
            repo,
            defaults,
            ttl,
            cache: RwLock::new(HashMap::new()),
            degraded: AtomicU64::new(0),
        }
    }

    /// Resolve the effective policy for a tenant and endpoint.
    ///
    /// Infallible by design: database trouble degrades to cached or default
    /// values and is only visible through the degraded counter.
    pub async fn resolve(&self, tenant_id: Uuid, endpoint: &str) -> ResolvedPolicy {
        let now = Utc::now();

        let cached = {
            let cache = self.cache.read().expect("policy cache poisoned");
            cache.get(&tenant_id).cloned()
        };

        if let Some(entry) = &cached {
            if entry.fetched_at.elapsed() < self.ttl {
                return self.build(entry.row.as_deref(), endpoint, now);
            }
        }

        match self.repo.find_by_tenant(tenant_id).await {
            Ok(row) => {
                let entry = CacheEntry {
                    row: row.map(Arc::new),
                    fetched_at: Instant::now(),
                };
                let policy = self.build(entry.row.as_deref(), endpoint, now);
                self.cache
                    .write()
                    .expect("policy cache poisoned")
                    .insert(tenant_id, entry);
                policy
            }
            Err(e) => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
                counter!("ratekeeper_policy_store_degraded_total").increment(1);
                warn!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "policy lookup failed, serving cached or default policy"
                );
                // Stale beats default: the last known configuration is more
                // accurate than the global fallback.
                match cached {
                    Some(entry) => self.build(entry.row.as_deref(), endpoint, now),
                    None => self.build(None, endpoint, now),
                }
            }
        }
    }

    /// Drop the cached entry after an admin mutation.
    pub fn invalidate(&self, tenant_id: Uuid) {
        self.cache
            .write()
            .expect("policy cache poisoned")
            .remove(&tenant_id);
    }

    /// Number of degraded (cache/default-served) resolutions so far
    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    fn build(
        &self,
        row: Option<&TenantRateLimit>,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> ResolvedPolicy {
        let Some(row) = row else {
            // Deterministic synthesized policy for unconfigured tenants
            return ResolvedPolicy {
                limit: self.defaults.requests_per_hour,
                burst: self.defaults.burst_size,
                tier: self.defaults.tier,
                bypass: PolicyBypass::None,
            };
        };

        let limit = row.override_for(endpoint).unwrap_or(row.requests_per_hour);
        let bypass = if !row.enabled {
            PolicyBypass::Disabled
        } else if !row.within_validity(now) {
            PolicyBypass::OutsideValidity
        } else if row.bypass_active(now) {
            PolicyBypass::Emergency
        } else {
            PolicyBypass::None
        };

        ResolvedPolicy {
            limit,
            burst: row.burst_size,
            tier: row.tier,
            bypass,
        }
    }
}
