//! Redis connection lifecycle management
//!
//! Owns two logical Redis handles: "main" for general caching and a dedicated
//! "rate-limit" handle, so enforcement stays responsive when the main cache is
//! under load. Connections are established with bounded linear-backoff retry;
//! when Redis is unreachable, development deployments degrade into fallback
//! mode (handles report "unavailable") while any other mode fails startup.
//!
//! No other component may open Redis connections.

use crate::config::{ExecutionMode, RedisSettings};
use crate::error::{AppError, Result};
use metrics::counter;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Upper bound on a single liveness probe
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Named retry strategy for establishing Redis connections.
///
/// Delay grows linearly: `base_delay * attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Which of the two logical connections is being addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Main,
    RateLimit,
}

impl Role {
    fn label(&self) -> &'static str {
        match self {
            Role::Main => "main",
            Role::RateLimit => "rate_limit",
        }
    }
}

#[derive(Default)]
struct Handles {
    main: Option<ConnectionManager>,
    rate_limit: Option<ConnectionManager>,
}

/// Point-in-time connection state for health reporting
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ConnectionStatus {
    pub main_connected: bool,
    pub rate_limit_connected: bool,
    pub fallback_mode: bool,
}

/// Manager for the two Redis handles with retry, probing, and fallback.
pub struct RedisConnections {
    settings: RedisSettings,
    mode: ExecutionMode,
    retry: RetryPolicy,
    handles: RwLock<Handles>,
    main_connected: AtomicBool,
    rate_limit_connected: AtomicBool,
    fallback: AtomicBool,
    closed: AtomicBool,
}

impl RedisConnections {
    /// Establish both connections with the default retry policy.
    pub async fn initialize(settings: &RedisSettings, mode: ExecutionMode) -> Result<Self> {
        Self::initialize_with_retry(settings, mode, RetryPolicy::default()).await
    }

    /// Establish both connections, retrying per `retry`.
    ///
    /// On exhausted retries: development mode logs a warning and enters
    /// fallback mode; any other mode propagates the failure so the service
    /// never reports itself healthy without Redis.
    pub async fn initialize_with_retry(
        settings: &RedisSettings,
        mode: ExecutionMode,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let main = connect_with_retry(&settings.main_url, Role::Main, &retry, mode).await?;
        let rate_limit =
            connect_with_retry(&settings.rate_limit_url, Role::RateLimit, &retry, mode).await?;

        let fallback = main.is_none() || rate_limit.is_none();
        if fallback {
            warn!("Redis layer running in fallback mode; rate limiting is degraded");
        }

        Ok(Self {
            settings: settings.clone(),
            mode,
            retry,
            main_connected: AtomicBool::new(main.is_some()),
            rate_limit_connected: AtomicBool::new(rate_limit.is_some()),
            handles: RwLock::new(Handles { main, rate_limit }),
            fallback: AtomicBool::new(fallback),
            closed: AtomicBool::new(false),
        })
    }

    /// Live handle to the general-purpose cache store, or `None` when
    /// unavailable in fallback-eligible mode.
    pub async fn main(&self) -> Result<Option<ConnectionManager>> {
        self.checked_handle(Role::Main).await
    }

    /// Live handle to the dedicated rate-limit store, or `None` when
    /// unavailable in fallback-eligible mode.
    pub async fn rate_limit(&self) -> Result<Option<ConnectionManager>> {
        self.checked_handle(Role::RateLimit).await
    }

    /// Whether both handles passed their last probe
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
            && self.main_connected.load(Ordering::Relaxed)
            && self.rate_limit_connected.load(Ordering::Relaxed)
    }

    /// Whether the layer has degraded to fallback mode
    pub fn is_fallback_mode(&self) -> bool {
        self.fallback.load(Ordering::Relaxed)
    }

    /// Per-handle state for health endpoints
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            main_connected: self.main_connected.load(Ordering::Relaxed),
            rate_limit_connected: self.rate_limit_connected.load(Ordering::Relaxed),
            fallback_mode: self.fallback.load(Ordering::Relaxed),
        }
    }

    /// Release both handles. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut handles = self.handles.write().await;
        handles.main = None;
        handles.rate_limit = None;
        self.main_connected.store(false, Ordering::Relaxed);
        self.rate_limit_connected.store(false, Ordering::Relaxed);
        info!("Redis connections closed");
    }

    fn connected_flag(&self, role: Role) -> &AtomicBool {
        match role {
            Role::Main => &self.main_connected,
            Role::RateLimit => &self.rate_limit_connected,
        }
    }

    fn url_for(&self, role: Role) -> &str {
        match role {
            Role::Main => &self.settings.main_url,
            Role::RateLimit => &self.settings.rate_limit_url,
        }
    }

    async fn checked_handle(&self, role: Role) -> Result<Option<ConnectionManager>> {
        if self.closed.load(Ordering::Relaxed) {
            return self.unavailable(role, None);
        }

        let current = {
            let handles = self.handles.read().await;
            match role {
                Role::Main => handles.main.clone(),
                Role::RateLimit => handles.rate_limit.clone(),
            }
        };

        let Some(mut conn) = current else {
            return self.unavailable(role, None);
        };

        match ping(&mut conn).await {
            Ok(()) => Ok(Some(conn)),
            Err(e) => {
                warn!(
                    role = role.label(),
                    error = %e,
                    "Redis liveness probe failed, attempting one reconnect"
                );
                self.reconnect(role).await
            }
        }
    }

    async fn reconnect(&self, role: Role) -> Result<Option<ConnectionManager>> {
        match connect(self.url_for(role)).await {
            Ok(conn) => {
                let mut handles = self.handles.write().await;
                match role {
                    Role::Main => handles.main = Some(conn.clone()),
                    Role::RateLimit => handles.rate_limit = Some(conn.clone()),
                }
                self.connected_flag(role).store(true, Ordering::Relaxed);
                info!(role = role.label(), "Redis reconnected");
                Ok(Some(conn))
            }
            Err(e) => {
                self.connected_flag(role).store(false, Ordering::Relaxed);
                warn!(role = role.label(), error = %e, "Redis reconnect failed");
                self.unavailable(role, Some(e))
            }
        }
    }

    fn unavailable(
        &self,
        role: Role,
        error: Option<redis::RedisError>,
    ) -> Result<Option<ConnectionManager>> {
        counter!("ratekeeper_redis_unavailable_total", "role" => role.label()).increment(1);
        if self.mode.allows_fallback() {
            self.fallback.store(true, Ordering::Relaxed);
            Ok(None)
        } else {
            match error {
                Some(e) => Err(AppError::Redis(e)),
                None => Err(AppError::RedisUnavailable {
                    attempts: self.retry.max_attempts,
                }),
            }
        }
    }
}

async fn connect(url: &str) -> std::result::Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url)?;
    ConnectionManager::new(client).await
}

async fn connect_with_retry(
    url: &str,
    role: Role,
    retry: &RetryPolicy,
    mode: ExecutionMode,
) -> Result<Option<ConnectionManager>> {
    for attempt in 1..=retry.max_attempts {
        match connect(url).await {
            Ok(conn) => {
                info!(role = role.label(), attempt, "Redis connected");
                return Ok(Some(conn));
            }
            Err(e) => {
                let delay = retry.delay_for(attempt);
                warn!(
                    role = role.label(),
                    attempt,
                    max_attempts = retry.max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Redis connection attempt failed"
                );
                if attempt < retry.max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    if mode.allows_fallback() {
        warn!(
            role = role.label(),
            "all Redis connection attempts failed; entering fallback mode"
        );
        Ok(None)
    } else {
        Err(AppError::RedisUnavailable {
            attempts: retry.max_attempts,
        })
    }
}

async fn ping(conn: &mut ConnectionManager) -> std::result::Result<(), redis::RedisError> {
    let probe = async {
        let pong: String = redis::cmd("PING").query_async(conn).await?;
        Ok::<_, redis::RedisError>(pong)
    };
    match tokio::time::timeout(PING_TIMEOUT, probe).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(redis::RedisError::from((
            redis::ErrorKind::Io,
            "liveness probe timed out",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Nothing listens on this port, so connection attempts fail fast.
    const UNREACHABLE_URL: &str = "redis://127.0.0.1:1/";

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(10),
        }
    }

    fn unreachable_settings() -> RedisSettings {
        RedisSettings {
            main_url: UNREACHABLE_URL.to_string(),
            rate_limit_url: UNREACHABLE_URL.to_string(),
        }
    }

    #[test]
    fn test_retry_policy_linear_backoff() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.delay_for(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for(2), Duration::from_millis(1000));
        assert_eq!(retry.delay_for(3), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_development_mode_enters_fallback() {
        let connections = RedisConnections::initialize_with_retry(
            &unreachable_settings(),
            ExecutionMode::Development,
            fast_retry(),
        )
        .await
        .unwrap();

        assert!(connections.is_fallback_mode());
        assert!(!connections.is_connected());

        // Handles report unavailable instead of raising
        let handle = connections.rate_limit().await.unwrap();
        assert!(handle.is_none());
        let handle = connections.main().await.unwrap();
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn test_production_mode_init_failure_is_fatal() {
        let result = RedisConnections::initialize_with_retry(
            &unreachable_settings(),
            ExecutionMode::Production,
            fast_retry(),
        )
        .await;

        assert!(matches!(
            result,
            Err(AppError::RedisUnavailable { attempts: 1 })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connections = RedisConnections::initialize_with_retry(
            &unreachable_settings(),
            ExecutionMode::Development,
            fast_retry(),
        )
        .await
        .unwrap();

        connections.close().await;
        connections.close().await;
        assert!(!connections.is_connected());
    }

    #[tokio::test]
    async fn test_status_reflects_fallback() {
        let connections = RedisConnections::initialize_with_retry(
            &unreachable_settings(),
            ExecutionMode::Development,
            fast_retry(),
        )
        .await
        .unwrap();

        let status = connections.status();
        assert!(!status.main_connected);
        assert!(!status.rate_limit_connected);
        assert!(status.fallback_mode);
    }
}
