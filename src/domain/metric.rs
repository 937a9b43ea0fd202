//! Aggregated rate-limit metric domain model

use super::common::StringUuid;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Rollup granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPeriod {
    #[default]
    Hour,
    Day,
}

impl AggregationPeriod {
    pub fn duration(&self) -> Duration {
        match self {
            AggregationPeriod::Hour => Duration::hours(1),
            AggregationPeriod::Day => Duration::days(1),
        }
    }

    pub fn as_secs(&self) -> i64 {
        self.duration().num_seconds()
    }
}

impl std::str::FromStr for AggregationPeriod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hour" | "hourly" => Ok(AggregationPeriod::Hour),
            "day" | "daily" => Ok(AggregationPeriod::Day),
            _ => Err(format!("Unknown aggregation period: {}", s)),
        }
    }
}

impl std::fmt::Display for AggregationPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationPeriod::Hour => write!(f, "hour"),
            AggregationPeriod::Day => write!(f, "day"),
        }
    }
}

impl sqlx::Type<sqlx::MySql> for AggregationPeriod {
    fn type_info() -> sqlx::mysql::MySqlTypeInfo {
        <String as sqlx::Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &sqlx::mysql::MySqlTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::MySql>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::MySql> for AggregationPeriod {
    fn decode(
        value: sqlx::mysql::MySqlValueRef<'r>,
    ) -> std::result::Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<'r, sqlx::MySql>>::decode(value)?;
        s.parse().map_err(|e: String| e.into())
    }
}

/// Request count per endpoint, stored in `top_endpoints`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCount {
    pub endpoint: String,
    pub count: u64,
}

/// Violation count per client IP, stored in `top_violating_ips`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpCount {
    pub ip: String,
    pub count: u64,
}

/// One rollup row per `(tenant, period, period_start)`.
///
/// The global rollup (all tenants) is stored under the nil UUID sentinel so
/// the unique index applies to it as well; `is_global()` exposes the
/// distinction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RateLimitMetric {
    pub id: StringUuid,
    pub tenant_id: StringUuid,
    pub aggregation_period: AggregationPeriod,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub unique_users: u64,
    pub unique_ips: u64,
    pub avg_processing_time_ms: f64,
    pub max_processing_time_ms: f64,
    pub rate_limit_overhead_ms: f64,
    #[sqlx(json)]
    pub top_endpoints: Vec<EndpointCount>,
    #[sqlx(json)]
    pub top_violating_ips: Vec<IpCount>,
    pub redis_errors: u64,
    pub bypass_events: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RateLimitMetric {
    pub fn is_global(&self) -> bool {
        self.tenant_id.is_nil()
    }
}

/// Recomputed rollup values, upserted by the aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct NewMetricRollup {
    /// `None` = global rollup across all tenants
    pub tenant_id: Option<Uuid>,
    pub aggregation_period: AggregationPeriod,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub unique_users: u64,
    pub unique_ips: u64,
    pub avg_processing_time_ms: f64,
    pub max_processing_time_ms: f64,
    pub rate_limit_overhead_ms: f64,
    pub top_endpoints: Vec<EndpointCount>,
    pub top_violating_ips: Vec<IpCount>,
    pub redis_errors: u64,
    pub bypass_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_durations() {
        assert_eq!(AggregationPeriod::Hour.as_secs(), 3600);
        assert_eq!(AggregationPeriod::Day.as_secs(), 86400);
    }

    #[test]
    fn test_period_parse_roundtrip() {
        assert_eq!(
            "hour".parse::<AggregationPeriod>().unwrap(),
            AggregationPeriod::Hour
        );
        assert_eq!(
            "daily".parse::<AggregationPeriod>().unwrap(),
            AggregationPeriod::Day
        );
        assert!("week".parse::<AggregationPeriod>().is_err());
    }

    #[test]
    fn test_endpoint_count_serde() {
        let counts = vec![
            EndpointCount {
                endpoint: "GET:/api/v1/widgets".to_string(),
                count: 42,
            },
            EndpointCount {
                endpoint: "POST:/api/v1/widgets".to_string(),
                count: 7,
            },
        ];
        let json = serde_json::to_string(&counts).unwrap();
        let parsed: Vec<EndpointCount> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, counts);
    }
}
