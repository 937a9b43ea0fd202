//! Tenant rate-limit policy domain model

use super::common::StringUuid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use validator::Validate;

/// Named policy bundle determining default limits for a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Standard,
    Premium,
    Enterprise,
    Unlimited,
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(Tier::Standard),
            "premium" => Ok(Tier::Premium),
            "enterprise" => Ok(Tier::Enterprise),
            "unlimited" => Ok(Tier::Unlimited),
            _ => Err(format!("Unknown tier: {}", s)),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Standard => write!(f, "standard"),
            Tier::Premium => write!(f, "premium"),
            Tier::Enterprise => write!(f, "enterprise"),
            Tier::Unlimited => write!(f, "unlimited"),
        }
    }
}

impl sqlx::Type<sqlx::MySql> for Tier {
    fn type_info() -> sqlx::mysql::MySqlTypeInfo {
        <String as sqlx::Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &sqlx::mysql::MySqlTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::MySql>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::MySql> for Tier {
    fn decode(
        value: sqlx::mysql::MySqlValueRef<'r>,
    ) -> std::result::Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<'r, sqlx::MySql>>::decode(value)?;
        s.parse().map_err(|e: String| e.into())
    }
}

/// Per-tenant rate-limit policy row, unique per tenant.
///
/// `endpoint_overrides` maps an endpoint pattern (exact `"METHOD:path"` or a
/// `prefix*` glob) to an hourly limit that replaces `requests_per_hour` for
/// matching endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TenantRateLimit {
    pub id: StringUuid,
    pub tenant_id: StringUuid,
    pub tier: Tier,
    pub requests_per_hour: u32,
    pub burst_size: u32,
    #[sqlx(json)]
    pub endpoint_overrides: HashMap<String, u32>,
    pub enabled: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub emergency_bypass: bool,
    pub bypass_reason: Option<String>,
    pub bypass_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantRateLimit {
    /// Whether the emergency bypass is currently in effect.
    ///
    /// A bypass flag without `bypass_until`, or with one in the past, is
    /// treated as inactive.
    pub fn bypass_active(&self, now: DateTime<Utc>) -> bool {
        self.emergency_bypass && self.bypass_until.map(|until| until > now).unwrap_or(false)
    }

    /// Whether `now` falls inside the policy's validity window.
    pub fn within_validity(&self, now: DateTime<Utc>) -> bool {
        if let Some(from) = self.valid_from {
            if now < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if now >= until {
                return false;
            }
        }
        true
    }

    /// Look up an endpoint override: exact pattern first, then the longest
    /// matching `prefix*` glob. Deterministic regardless of map order.
    pub fn override_for(&self, endpoint: &str) -> Option<u32> {
        if let Some(limit) = self.endpoint_overrides.get(endpoint) {
            return Some(*limit);
        }
        self.endpoint_overrides
            .iter()
            .filter_map(|(pattern, limit)| {
                let prefix = pattern.strip_suffix('*')?;
                endpoint.starts_with(prefix).then_some((prefix.len(), *limit))
            })
            .max_by_key(|(prefix_len, _)| *prefix_len)
            .map(|(_, limit)| limit)
    }
}

/// Defaults used to synthesize a policy for tenants without a configured row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDefaults {
    pub tier: Tier,
    pub requests_per_hour: u32,
    pub burst_size: u32,
}

/// Why a resolved policy skips enforcement, if it does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyBypass {
    /// Normal enforcement
    None,
    /// Rate limiting disabled for the tenant (`enabled = false`)
    Disabled,
    /// The policy's validity window excludes the current time
    OutsideValidity,
    /// Time-boxed administrative emergency bypass
    Emergency,
}

/// Effective policy for one (tenant, endpoint) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub limit: u32,
    pub burst: u32,
    pub tier: Tier,
    pub bypass: PolicyBypass,
}

impl ResolvedPolicy {
    pub fn is_bypassed(&self) -> bool {
        self.bypass != PolicyBypass::None
    }
}

/// Admin input for creating or replacing a tenant policy
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpsertRateLimitInput {
    pub tier: Tier,
    #[validate(range(max = 10_000_000))]
    pub requests_per_hour: u32,
    #[validate(range(max = 1_000_000))]
    pub burst_size: u32,
    #[serde(default)]
    pub endpoint_overrides: HashMap<String, u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

/// Admin input for arming the emergency bypass
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BypassInput {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
    pub until: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn test_limit_row() -> TenantRateLimit {
        TenantRateLimit {
            id: StringUuid::new_v4(),
            tenant_id: StringUuid::new_v4(),
            tier: Tier::Standard,
            requests_per_hour: 1000,
            burst_size: 100,
            endpoint_overrides: HashMap::new(),
            enabled: true,
            valid_from: None,
            valid_until: None,
            emergency_bypass: false,
            bypass_reason: None,
            bypass_until: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_tier_parse_roundtrip() {
        for tier in [Tier::Standard, Tier::Premium, Tier::Enterprise, Tier::Unlimited] {
            assert_eq!(tier.to_string().parse::<Tier>().unwrap(), tier);
        }
        assert!("gold".parse::<Tier>().is_err());
    }

    #[test]
    fn test_bypass_requires_future_deadline() {
        let now = Utc::now();
        let mut row = test_limit_row();

        row.emergency_bypass = true;
        // No deadline set: inactive
        assert!(!row.bypass_active(now));

        row.bypass_until = Some(now + Duration::minutes(10));
        assert!(row.bypass_active(now));

        // Expired deadline: inactive again
        row.bypass_until = Some(now - Duration::seconds(1));
        assert!(!row.bypass_active(now));
    }

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        let mut row = test_limit_row();
        assert!(row.within_validity(now));

        row.valid_from = Some(now + Duration::hours(1));
        assert!(!row.within_validity(now));

        row.valid_from = Some(now - Duration::hours(1));
        row.valid_until = Some(now + Duration::hours(1));
        assert!(row.within_validity(now));

        row.valid_until = Some(now - Duration::minutes(1));
        assert!(!row.within_validity(now));
    }

    #[test]
    fn test_override_exact_match_wins() {
        let mut row = test_limit_row();
        row.endpoint_overrides
            .insert("POST:/api/v1/export".to_string(), 10);
        row.endpoint_overrides.insert("POST:/api/v1/*".to_string(), 50);

        assert_eq!(row.override_for("POST:/api/v1/export"), Some(10));
        assert_eq!(row.override_for("POST:/api/v1/import"), Some(50));
        assert_eq!(row.override_for("GET:/health"), None);
    }

    #[test]
    fn test_override_longest_prefix_wins() {
        let mut row = test_limit_row();
        row.endpoint_overrides.insert("GET:/api/*".to_string(), 500);
        row.endpoint_overrides
            .insert("GET:/api/v1/reports/*".to_string(), 20);

        assert_eq!(row.override_for("GET:/api/v1/reports/daily"), Some(20));
        assert_eq!(row.override_for("GET:/api/v2/users"), Some(500));
    }

    #[test]
    fn test_resolved_policy_bypass() {
        let policy = ResolvedPolicy {
            limit: 1000,
            burst: 100,
            tier: Tier::Standard,
            bypass: PolicyBypass::None,
        };
        assert!(!policy.is_bypassed());

        let bypassed = ResolvedPolicy {
            bypass: PolicyBypass::Emergency,
            ..policy
        };
        assert!(bypassed.is_bypassed());
    }

    #[test]
    fn test_upsert_input_validation() {
        let input = UpsertRateLimitInput {
            tier: Tier::Standard,
            requests_per_hour: 1000,
            burst_size: 100,
            endpoint_overrides: HashMap::new(),
            enabled: true,
            valid_from: None,
            valid_until: None,
        };
        assert!(input.validate().is_ok());

        let too_big = UpsertRateLimitInput {
            requests_per_hour: 20_000_000,
            ..input
        };
        assert!(too_big.validate().is_err());
    }

    #[test]
    fn test_bypass_input_validation() {
        let input = BypassInput {
            reason: "incident 4711, support escalation".to_string(),
            until: Utc::now() + Duration::hours(2),
        };
        assert!(input.validate().is_ok());

        let empty_reason = BypassInput {
            reason: String::new(),
            until: Utc::now(),
        };
        assert!(empty_reason.validate().is_err());
    }
}
