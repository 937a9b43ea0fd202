//! Server initialization and routing

use crate::aggregator::{stats::HotPathStats, MetricsAggregator};
use crate::api;
use crate::config::Config;
use crate::connection::RedisConnections;
use crate::enforcer::RateLimitEnforcer;
use crate::middleware::{rate_limit::rate_limit_middleware, EnforcementState, ObservabilityLayer};
use crate::policy::TenantPolicyStore;
use crate::recorder::{RecorderHandle, ViolationRecorder};
use crate::repository::{
    MetricRepositoryImpl, TenantRateLimitRepositoryImpl, ViolationRepositoryImpl,
};
use crate::telemetry;
use anyhow::Result;
use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::{mysql::MySqlPoolOptions, MySqlPool};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db_pool: MySqlPool,
    pub connections: Arc<RedisConnections>,
    pub limits_repo: Arc<TenantRateLimitRepositoryImpl>,
    pub violation_repo: Arc<ViolationRepositoryImpl>,
    pub metric_repo: Arc<MetricRepositoryImpl>,
    pub policy_store: Arc<TenantPolicyStore<TenantRateLimitRepositoryImpl>>,
    pub recorder: RecorderHandle,
    pub prometheus: Arc<Option<PrometheusHandle>>,
}

/// Run the server
pub async fn run(config: Config) -> Result<()> {
    // Install the metrics recorder before anything records
    let prometheus = telemetry::install_prometheus_recorder();
    telemetry::describe_metrics();

    // Create database connection pool
    let db_pool = MySqlPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .connect(&config.database.url)
        .await?;
    info!("Connected to database");

    sqlx::migrate!("./migrations").run(&db_pool).await?;
    info!("Database migrations applied");

    // Establish the two Redis handles. In production a failure here is fatal;
    // in development the layer degrades to fallback mode.
    let connections = Arc::new(RedisConnections::initialize(&config.redis, config.mode).await?);
    if connections.is_fallback_mode() {
        info!("Redis unavailable, continuing in fallback mode");
    } else {
        info!("Connected to Redis (main + rate-limit)");
    }

    // Repositories
    let limits_repo = Arc::new(TenantRateLimitRepositoryImpl::new(db_pool.clone()));
    let violation_repo = Arc::new(ViolationRepositoryImpl::new(db_pool.clone()));
    let metric_repo = Arc::new(MetricRepositoryImpl::new(db_pool.clone()));

    // Policy store and enforcement
    let policy_store = Arc::new(TenantPolicyStore::new(
        limits_repo.clone(),
        config.rate_limit.defaults(),
        config.rate_limit.policy_cache_ttl,
    ));
    let (recorder, recorder_worker) = ViolationRecorder::new(
        violation_repo.clone(),
        config.rate_limit.violation_queue_capacity,
    );
    let stats = Arc::new(HotPathStats::new());
    let enforcer = Arc::new(RateLimitEnforcer::new(
        policy_store.clone(),
        connections.clone(),
        recorder.clone(),
        stats.clone(),
        config.rate_limit.fail_mode,
        config.rate_limit.check_timeout,
    ));

    // Background workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let recorder_task = tokio::spawn(recorder_worker.run());
    let aggregator = MetricsAggregator::new(
        connections.clone(),
        limits_repo.clone(),
        violation_repo.clone(),
        metric_repo.clone(),
        stats,
        config.aggregation.period,
        config.aggregation.interval,
    );
    let aggregator_task = tokio::spawn(aggregator.run(shutdown_rx));

    let state = AppState {
        config: Arc::new(config.clone()),
        db_pool,
        connections: connections.clone(),
        limits_repo,
        violation_repo,
        metric_repo,
        policy_store,
        recorder: recorder.clone(),
        prometheus: Arc::new(Some(prometheus)),
    };

    let app = build_router(state, enforcer);

    let http_addr = config.http_addr();
    let listener = TcpListener::bind(&http_addr).await?;
    info!("HTTP server started on {}", http_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background workers, draining the violation queue first
    let _ = shutdown_tx.send(true);
    recorder.shutdown();
    let _ = recorder_task.await;
    let _ = aggregator_task.await;
    connections.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// Build the HTTP router.
///
/// The admin API runs behind the enforcement middleware; health and metrics
/// endpoints stay outside so probes are never throttled.
pub fn build_router(
    state: AppState,
    enforcer: Arc<RateLimitEnforcer<TenantRateLimitRepositoryImpl>>,
) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let enforcement = EnforcementState::new(enforcer);

    let admin = Router::new()
        .route(
            "/api/v1/tenants/{id}/rate-limit",
            get(api::limits::get_policy).put(api::limits::upsert_policy),
        )
        .route(
            "/api/v1/tenants/{id}/rate-limit/bypass",
            post(api::limits::arm_bypass).delete(api::limits::disarm_bypass),
        )
        .route(
            "/api/v1/tenants/{id}/violations",
            get(api::limits::list_violations),
        )
        .route("/api/v1/rollups", get(api::limits::list_rollups))
        .layer(axum_middleware::from_fn_with_state(
            enforcement,
            rate_limit_middleware::<TenantRateLimitRepositoryImpl>,
        ))
        .with_state(state.clone());

    Router::new()
        // Health endpoints
        .route("/health", get(api::health::health))
        .route("/ready", get(api::health::ready))
        // Prometheus endpoint
        .route("/metrics", get(api::metrics::metrics_handler))
        .with_state(state)
        .merge(admin)
        // Add middleware
        .layer(ObservabilityLayer)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
