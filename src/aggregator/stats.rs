//! In-process hot-path accumulator
//!
//! The enforcer records per-check timings, Redis failures, bypass events, and
//! a bounded sample of users/IPs here; the aggregator folds the accumulator
//! into rollup rows. Entries are keyed by (tenant, hour window) and read
//! non-destructively so re-aggregating a period is idempotent; `prune_before`
//! bounds memory once a period can no longer be re-aggregated.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Cap on sampled distinct users/IPs per (tenant, window)
pub const SAMPLE_CAP: usize = 1024;

/// Accumulated hot-path facts for one tenant and one hour window
#[derive(Debug, Clone, Default)]
pub struct WindowStats {
    pub checks: u64,
    pub total_micros: u64,
    pub max_micros: u64,
    pub redis_errors: u64,
    pub bypass_events: u64,
    pub sampled_users: HashSet<Uuid>,
    pub sampled_ips: HashSet<String>,
}

impl WindowStats {
    pub fn merge(&mut self, other: &WindowStats) {
        self.checks += other.checks;
        self.total_micros += other.total_micros;
        self.max_micros = self.max_micros.max(other.max_micros);
        self.redis_errors += other.redis_errors;
        self.bypass_events += other.bypass_events;
        for user in &other.sampled_users {
            if self.sampled_users.len() >= SAMPLE_CAP {
                break;
            }
            self.sampled_users.insert(*user);
        }
        for ip in &other.sampled_ips {
            if self.sampled_ips.len() >= SAMPLE_CAP {
                break;
            }
            self.sampled_ips.insert(ip.clone());
        }
    }

    /// Mean check latency in milliseconds
    pub fn avg_ms(&self) -> f64 {
        if self.checks == 0 {
            0.0
        } else {
            self.total_micros as f64 / self.checks as f64 / 1000.0
        }
    }

    /// Worst check latency in milliseconds
    pub fn max_ms(&self) -> f64 {
        self.max_micros as f64 / 1000.0
    }
}

/// Shared accumulator, written by the enforcer and read by the aggregator.
#[derive(Default)]
pub struct HotPathStats {
    windows: Mutex<HashMap<(Uuid, i64), WindowStats>>,
}

impl HotPathStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(
        &self,
        tenant_id: Uuid,
        window_start: i64,
        elapsed: Duration,
        user_id: Option<Uuid>,
        ip: &str,
    ) {
        let micros = elapsed.as_micros() as u64;
        let mut windows = self.windows.lock().expect("hot-path stats poisoned");
        let entry = windows.entry((tenant_id, window_start)).or_default();
        entry.checks += 1;
        entry.total_micros += micros;
        entry.max_micros = entry.max_micros.max(micros);
        if let Some(user) = user_id {
            if entry.sampled_users.len() < SAMPLE_CAP {
                entry.sampled_users.insert(user);
            }
        }
        if entry.sampled_ips.len() < SAMPLE_CAP {
            entry.sampled_ips.insert(ip.to_string());
        }
    }

    pub fn record_redis_error(&self, tenant_id: Uuid, window_start: i64) {
        let mut windows = self.windows.lock().expect("hot-path stats poisoned");
        windows
            .entry((tenant_id, window_start))
            .or_default()
            .redis_errors += 1;
    }

    pub fn record_bypass(&self, tenant_id: Uuid, window_start: i64) {
        let mut windows = self.windows.lock().expect("hot-path stats poisoned");
        windows
            .entry((tenant_id, window_start))
            .or_default()
            .bypass_events += 1;
    }

    /// Per-tenant stats merged over all hour windows in `[start_secs, end_secs)`.
    /// Non-destructive, so the same period can be aggregated repeatedly.
    pub fn snapshot_range(&self, start_secs: i64, end_secs: i64) -> HashMap<Uuid, WindowStats> {
        let windows = self.windows.lock().expect("hot-path stats poisoned");
        let mut merged: HashMap<Uuid, WindowStats> = HashMap::new();
        for ((tenant, window_start), stats) in windows.iter() {
            if *window_start >= start_secs && *window_start < end_secs {
                merged.entry(*tenant).or_default().merge(stats);
            }
        }
        merged
    }

    /// Drop windows that started before `cutoff_secs`.
    pub fn prune_before(&self, cutoff_secs: i64) {
        let mut windows = self.windows.lock().expect("hot-path stats poisoned");
        windows.retain(|(_, window_start), _| *window_start >= cutoff_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = HotPathStats::new();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();

        stats.record_check(tenant, 3600, Duration::from_micros(500), Some(user), "10.0.0.1");
        stats.record_check(tenant, 3600, Duration::from_micros(1500), None, "10.0.0.2");
        stats.record_redis_error(tenant, 3600);
        stats.record_bypass(tenant, 3600);

        let merged = stats.snapshot_range(0, 7200);
        let entry = &merged[&tenant];
        assert_eq!(entry.checks, 2);
        assert_eq!(entry.redis_errors, 1);
        assert_eq!(entry.bypass_events, 1);
        assert_eq!(entry.sampled_users.len(), 1);
        assert_eq!(entry.sampled_ips.len(), 2);
        assert!((entry.avg_ms() - 1.0).abs() < f64::EPSILON);
        assert!((entry.max_ms() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_is_non_destructive() {
        let stats = HotPathStats::new();
        let tenant = Uuid::new_v4();
        stats.record_check(tenant, 0, Duration::from_micros(100), None, "1.1.1.1");

        let first = stats.snapshot_range(0, 3600);
        let second = stats.snapshot_range(0, 3600);
        assert_eq!(first[&tenant].checks, second[&tenant].checks);
    }

    #[test]
    fn test_snapshot_merges_hour_windows() {
        let stats = HotPathStats::new();
        let tenant = Uuid::new_v4();
        stats.record_check(tenant, 0, Duration::from_micros(100), None, "1.1.1.1");
        stats.record_check(tenant, 3600, Duration::from_micros(300), None, "1.1.1.2");

        // A day-wide range folds both hour windows together
        let merged = stats.snapshot_range(0, 86400);
        assert_eq!(merged[&tenant].checks, 2);
        assert_eq!(merged[&tenant].sampled_ips.len(), 2);

        // A single-hour range sees only its own window
        let single = stats.snapshot_range(3600, 7200);
        assert_eq!(single[&tenant].checks, 1);
    }

    #[test]
    fn test_prune_drops_old_windows() {
        let stats = HotPathStats::new();
        let tenant = Uuid::new_v4();
        stats.record_check(tenant, 0, Duration::from_micros(100), None, "1.1.1.1");
        stats.record_check(tenant, 7200, Duration::from_micros(100), None, "1.1.1.1");

        stats.prune_before(3600);
        assert!(stats.snapshot_range(0, 3600).is_empty());
        assert_eq!(stats.snapshot_range(7200, 10800)[&tenant].checks, 1);
    }

    #[test]
    fn test_sample_cap_bounds_memory() {
        let stats = HotPathStats::new();
        let tenant = Uuid::new_v4();
        for i in 0..(SAMPLE_CAP + 100) {
            stats.record_check(
                tenant,
                0,
                Duration::from_micros(10),
                Some(Uuid::new_v4()),
                &format!("10.0.{}.{}", i / 256, i % 256),
            );
        }
        let merged = stats.snapshot_range(0, 3600);
        assert_eq!(merged[&tenant].sampled_users.len(), SAMPLE_CAP);
        assert_eq!(merged[&tenant].sampled_ips.len(), SAMPLE_CAP);
        assert_eq!(merged[&tenant].checks, (SAMPLE_CAP + 100) as u64);
    }
}
