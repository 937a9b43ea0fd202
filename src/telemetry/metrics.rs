//! Prometheus metrics setup and metric definitions

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_prometheus_recorder() -> PrometheusHandle {
    // Histogram buckets (seconds) skewed toward the sub-millisecond range:
    // the enforcement round trip is bounded at 100ms.
    let buckets = vec![
        0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(&buckets)
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Register metric descriptions and emit initial zero values so Prometheus
/// output includes HELP/TYPE lines for all metrics from startup (not just
/// after first use).
pub fn describe_metrics() {
    // HTTP metrics
    describe_counter!(
        "ratekeeper_http_requests_total",
        "Total number of HTTP requests"
    );
    describe_histogram!(
        "ratekeeper_http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
    describe_gauge!(
        "ratekeeper_http_requests_in_flight",
        "Number of HTTP requests currently being processed"
    );

    // Enforcement metrics
    describe_counter!(
        "ratekeeper_checks_total",
        "Rate limit decisions by result (allowed/blocked/bypass/fail_open/fail_closed)"
    );
    describe_histogram!(
        "ratekeeper_check_duration_seconds",
        "Rate limit check duration in seconds"
    );
    describe_counter!(
        "ratekeeper_throttled_total",
        "Total number of rate-limited requests"
    );
    describe_counter!(
        "ratekeeper_bypass_events_total",
        "Requests admitted under an active emergency bypass"
    );

    // Redis metrics
    describe_counter!(
        "ratekeeper_redis_errors_total",
        "Redis failures by stage (check/rollup) and error type"
    );
    describe_counter!(
        "ratekeeper_redis_unavailable_total",
        "Handle requests answered with 'unavailable' by the connection layer"
    );

    // Policy store metrics
    describe_counter!(
        "ratekeeper_policy_store_degraded_total",
        "Policy resolutions served from stale cache or defaults after a read failure"
    );

    // Violation recorder metrics
    describe_counter!(
        "ratekeeper_violations_recorded_total",
        "Violations persisted to storage"
    );
    describe_counter!(
        "ratekeeper_violations_dropped_total",
        "Violations dropped (queue overflow, persistence failure, shutdown)"
    );

    // Aggregator metrics
    describe_counter!(
        "ratekeeper_aggregator_runs_total",
        "Metric rollup passes by result"
    );

    // Emit initial zero values for lazily-registered counters so that
    // HELP/TYPE lines appear in Prometheus output from startup.
    counter!("ratekeeper_checks_total", "result" => "allowed").absolute(0);
    counter!("ratekeeper_checks_total", "result" => "blocked").absolute(0);
    counter!("ratekeeper_throttled_total", "endpoint" => "").absolute(0);
    counter!("ratekeeper_bypass_events_total").absolute(0);
    counter!("ratekeeper_redis_errors_total", "stage" => "check", "error_type" => "unavailable")
        .absolute(0);
    counter!("ratekeeper_redis_unavailable_total", "role" => "rate_limit").absolute(0);
    counter!("ratekeeper_policy_store_degraded_total").absolute(0);
    counter!("ratekeeper_violations_recorded_total").absolute(0);
    counter!("ratekeeper_violations_dropped_total", "reason" => "queue_full").absolute(0);
    counter!("ratekeeper_aggregator_runs_total", "result" => "ok").absolute(0);
    gauge!("ratekeeper_http_requests_in_flight").set(0.0);
}
