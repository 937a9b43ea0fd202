//! Data access layer
//!
//! Each repository pairs a mockable trait with a `MySqlPool`-backed
//! implementation. Write ownership is strict: the recorder worker writes
//! violations, the aggregator writes metrics, the admin API writes tenant
//! policies.

pub mod metric;
pub mod tenant_limit;
pub mod violation;

pub use metric::{MetricRepository, MetricRepositoryImpl};
pub use tenant_limit::{TenantRateLimitRepository, TenantRateLimitRepositoryImpl};
pub use violation::{ViolationRepository, ViolationRepositoryImpl, ViolationStats};
