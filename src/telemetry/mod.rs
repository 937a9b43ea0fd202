//! Observability setup

pub mod metrics;

pub use metrics::{describe_metrics, install_prometheus_recorder};
