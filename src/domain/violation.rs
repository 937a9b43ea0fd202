//! Rate-limit violation domain model

use super::common::StringUuid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Severity of a violation, classified from how far past the limit the
/// client ran. Thresholds are policy constants, not hidden logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// `observed/limit` at or below this ratio is a low-severity violation
pub const SEVERITY_LOW_MAX_RATIO: f64 = 1.5;
/// `observed/limit` at or below this ratio is medium severity; above is high
pub const SEVERITY_MEDIUM_MAX_RATIO: f64 = 3.0;

impl Severity {
    /// Classify a violation from the observed count and the limit in effect.
    pub fn from_ratio(observed: u64, limit: u32) -> Self {
        if limit == 0 {
            return Severity::High;
        }
        let ratio = observed as f64 / limit as f64;
        if ratio <= SEVERITY_LOW_MAX_RATIO {
            Severity::Low
        } else if ratio <= SEVERITY_MEDIUM_MAX_RATIO {
            Severity::Medium
        } else {
            Severity::High
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

impl sqlx::Type<sqlx::MySql> for Severity {
    fn type_info() -> sqlx::mysql::MySqlTypeInfo {
        <String as sqlx::Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &sqlx::mysql::MySqlTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::MySql>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::MySql> for Severity {
    fn decode(
        value: sqlx::mysql::MySqlValueRef<'r>,
    ) -> std::result::Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<'r, sqlx::MySql>>::decode(value)?;
        s.parse().map_err(|e: String| e.into())
    }
}

/// Append-only audit row for a denied request
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RateLimitViolation {
    pub id: StringUuid,
    pub tenant_id: StringUuid,
    pub user_id: Option<StringUuid>,
    pub endpoint: String,
    pub method: String,
    pub rate_limit: u32,
    pub request_count: u64,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub violation_time: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub retry_after_seconds: u32,
    pub severity: Severity,
    pub automated_response: String,
}

/// A violation captured on the hot path, queued for asynchronous persistence
#[derive(Debug, Clone)]
pub struct NewViolation {
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub endpoint: String,
    pub method: String,
    pub rate_limit: u32,
    pub request_count: u64,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub violation_time: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub retry_after_seconds: u32,
    pub severity: Severity,
    pub automated_response: String,
}

/// Denials where the limit was actually exceeded
pub const RESPONSE_BLOCKED: &str = "blocked";
/// Denials produced by the fail-closed policy while Redis was unavailable
pub const RESPONSE_THROTTLED: &str = "throttled";
