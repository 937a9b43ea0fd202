//! Configuration management for Ratekeeper

use crate::domain::{AggregationPeriod, Tier};
use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server host
    pub http_host: String,
    /// HTTP server port
    pub http_port: u16,
    /// Execution mode (gates Redis fallback eligibility, nothing else)
    pub mode: ExecutionMode,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Redis configuration
    pub redis: RedisSettings,
    /// Rate limiting configuration
    pub rate_limit: RateLimitSettings,
    /// Metric rollup configuration
    pub aggregation: AggregationSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// URLs for the two logical Redis stores.
///
/// The rate-limit store is dedicated so enforcement stays responsive even when
/// the general cache is under load. When `RATE_LIMIT_REDIS_URL` is unset both
/// handles point at the same instance but remain independent connections.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub main_url: String,
    pub rate_limit_url: String,
}

/// Execution mode controlling whether the Redis layer may degrade to
/// fallback mode instead of failing startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Development,
    Production,
}

impl ExecutionMode {
    /// Only development deployments may run without Redis.
    pub fn allows_fallback(&self) -> bool {
        matches!(self, ExecutionMode::Development)
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(ExecutionMode::Development),
            "production" | "prod" => Ok(ExecutionMode::Production),
            _ => Err(format!("Unknown execution mode: {}", s)),
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Development => write!(f, "development"),
            ExecutionMode::Production => write!(f, "production"),
        }
    }
}

/// What the enforcer does when the rate-limit store is unavailable.
///
/// This is an explicit configuration decision, never inferred from error
/// handling: fail-open admits traffic unmetered, fail-closed throttles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementFallback {
    FailOpen,
    FailClosed,
}

impl std::str::FromStr for EnforcementFallback {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" | "fail_open" => Ok(EnforcementFallback::FailOpen),
            "closed" | "fail_closed" => Ok(EnforcementFallback::FailClosed),
            _ => Err(format!("Unknown fail mode: {}", s)),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Behaviour when the rate-limit store is unreachable
    pub fail_mode: EnforcementFallback,
    /// Default tier for tenants without a configured policy row
    pub default_tier: Tier,
    /// Default hourly request allowance
    pub default_requests_per_hour: u32,
    /// Default burst allowance on top of the hourly rate
    pub default_burst_size: u32,
    /// Upper bound on the single Redis round trip per check
    pub check_timeout: Duration,
    /// How long resolved tenant policies may be served from memory
    pub policy_cache_ttl: Duration,
    /// Bounded capacity of the violation queue
    pub violation_queue_capacity: usize,
}

impl RateLimitSettings {
    /// Defaults used when a tenant has no configured policy row
    pub fn defaults(&self) -> crate::domain::PolicyDefaults {
        crate::domain::PolicyDefaults {
            tier: self.default_tier,
            requests_per_hour: self.default_requests_per_hour,
            burst_size: self.default_burst_size,
        }
    }
}

/// Metric rollup configuration
#[derive(Debug, Clone)]
pub struct AggregationSettings {
    /// Rollup granularity ("hour" or "day")
    pub period: AggregationPeriod,
    /// How often the aggregator wakes up
    pub interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            http_host: env::var("HTTP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            http_port: env::var("HTTP_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid HTTP_PORT")?,
            mode: env::var("RATEKEEPER_MODE")
                .unwrap_or_else(|_| "production".to_string())
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid RATEKEEPER_MODE")?,
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
            },
            redis: {
                let main_url =
                    env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
                let rate_limit_url =
                    env::var("RATE_LIMIT_REDIS_URL").unwrap_or_else(|_| main_url.clone());
                RedisSettings {
                    main_url,
                    rate_limit_url,
                }
            },
            rate_limit: RateLimitSettings {
                fail_mode: env::var("RATE_LIMIT_FAIL_MODE")
                    .unwrap_or_else(|_| "open".to_string())
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))
                    .context("Invalid RATE_LIMIT_FAIL_MODE")?,
                default_tier: env::var("RATE_LIMIT_DEFAULT_TIER")
                    .unwrap_or_else(|_| "standard".to_string())
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))
                    .context("Invalid RATE_LIMIT_DEFAULT_TIER")?,
                default_requests_per_hour: env::var("RATE_LIMIT_DEFAULT_REQUESTS_PER_HOUR")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .unwrap_or(1000),
                default_burst_size: env::var("RATE_LIMIT_DEFAULT_BURST")
                    .unwrap_or_else(|_| "100".to_string())
                    .parse()
                    .unwrap_or(100),
                check_timeout: Duration::from_millis(
                    env::var("RATE_LIMIT_CHECK_TIMEOUT_MS")
                        .unwrap_or_else(|_| "100".to_string())
                        .parse()
                        .unwrap_or(100),
                ),
                policy_cache_ttl: Duration::from_secs(
                    env::var("POLICY_CACHE_TTL_SECS")
                        .unwrap_or_else(|_| "45".to_string())
                        .parse()
                        .unwrap_or(45),
                ),
                violation_queue_capacity: env::var("VIOLATION_QUEUE_CAPACITY")
                    .unwrap_or_else(|_| "1024".to_string())
                    .parse()
                    .unwrap_or(1024),
            },
            aggregation: AggregationSettings {
                period: env::var("AGGREGATION_PERIOD")
                    .unwrap_or_else(|_| "hour".to_string())
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))
                    .context("Invalid AGGREGATION_PERIOD")?,
                interval: Duration::from_secs(
                    env::var("AGGREGATOR_INTERVAL_SECS")
                        .unwrap_or_else(|_| "300".to_string())
                        .parse()
                        .unwrap_or(300),
                ),
            },
        })
    }

    /// Get HTTP server address
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}
