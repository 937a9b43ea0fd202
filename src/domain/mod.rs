//! Domain models for the rate limiting subsystem

pub mod common;
pub mod limits;
pub mod metric;
pub mod violation;

pub use common::StringUuid;
pub use limits::{
    BypassInput, PolicyBypass, PolicyDefaults, ResolvedPolicy, TenantRateLimit, Tier,
    UpsertRateLimitInput,
};
pub use metric::{
    AggregationPeriod, EndpointCount, IpCount, NewMetricRollup, RateLimitMetric,
};
pub use violation::{
    NewViolation, RateLimitViolation, Severity, RESPONSE_BLOCKED, RESPONSE_THROTTLED,
};
