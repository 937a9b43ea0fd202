//! Rate limiting middleware
//!
//! Translates the enforcer's decision into the HTTP contract: a deny becomes
//! a 429 with `Retry-After`, an allow passes through with `X-RateLimit-*`
//! headers. Tenant and client identity come from headers the upstream API
//! gateway is responsible for setting; requests without a tenant are passed
//! through untouched.

use crate::enforcer::{ClientIdentity, RateLimitDecision, RateLimitEnforcer};
use crate::repository::TenantRateLimitRepository;
use axum::{
    body::Body,
    extract::MatchedPath,
    extract::State,
    http::{header::USER_AGENT, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Shared enforcement state for the middleware
pub struct EnforcementState<R: TenantRateLimitRepository> {
    enforcer: Arc<RateLimitEnforcer<R>>,
}

impl<R: TenantRateLimitRepository> EnforcementState<R> {
    pub fn new(enforcer: Arc<RateLimitEnforcer<R>>) -> Self {
        Self { enforcer }
    }
}

impl<R: TenantRateLimitRepository> Clone for EnforcementState<R> {
    fn clone(&self) -> Self {
        Self {
            enforcer: self.enforcer.clone(),
        }
    }
}

fn extract_client_ip(request: &Request<Body>) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn normalize_path(path: &str) -> String {
    if path.contains('{') {
        return path.to_string();
    }
    let normalized: Vec<String> = path
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                String::new()
            } else if segment.parse::<u64>().is_ok() || Uuid::parse_str(segment).is_ok() {
                ":id".to_string()
            } else {
                segment.to_string()
            }
        })
        .collect();
    normalized.join("/")
}

fn endpoint_path(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| normalize_path(request.uri().path()))
}

fn extract_tenant(request: &Request<Body>) -> Option<Uuid> {
    request
        .headers()
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
}

fn extract_identity(request: &Request<Body>) -> ClientIdentity {
    let ip = extract_client_ip(request);
    let client_id = request
        .headers()
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| ip.clone());
    let user_id = request
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s.trim()).ok());
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    ClientIdentity {
        client_id,
        user_id,
        ip,
        user_agent,
    }
}

/// Rate limit exceeded response
#[derive(Debug, Serialize)]
struct RateLimitExceededResponse {
    error: String,
    code: String,
    retry_after: u64,
    limit: u32,
}

impl RateLimitExceededResponse {
    fn from_decision(decision: &RateLimitDecision) -> Self {
        Self {
            error: "Rate limit exceeded".to_string(),
            code: "RATE_LIMITED".to_string(),
            retry_after: decision.retry_after_secs,
            limit: decision.limit,
        }
    }
}

impl IntoResponse for RateLimitExceededResponse {
    fn into_response(self) -> Response {
        let body = serde_json::to_string(&self).unwrap();
        let mut response = Response::new(body.into());
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        response
            .headers_mut()
            .insert("Retry-After", self.retry_after.to_string().parse().unwrap());
        response
            .headers_mut()
            .insert("Content-Type", "application/json".parse().unwrap());
        response
    }
}

fn apply_rate_limit_headers(response: &mut Response, decision: &RateLimitDecision) {
    response.headers_mut().insert(
        "X-RateLimit-Limit",
        decision.limit.to_string().parse().unwrap(),
    );
    response.headers_mut().insert(
        "X-RateLimit-Remaining",
        decision.remaining.to_string().parse().unwrap(),
    );
    response.headers_mut().insert(
        "X-RateLimit-Reset",
        decision
            .window_end
            .timestamp()
            .to_string()
            .parse()
            .unwrap(),
    );
}

/// Rate limiting middleware function
///
/// Only a deliberate deny produces a 429; every internal failure already
/// degraded to an allow/deny decision inside the enforcer.
pub async fn rate_limit_middleware<R: TenantRateLimitRepository + 'static>(
    State(state): State<EnforcementState<R>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(tenant_id) = extract_tenant(&request) else {
        return next.run(request).await;
    };

    let method = request.method().as_str().to_string();
    let path = endpoint_path(&request);
    let identity = extract_identity(&request);

    let decision = state
        .enforcer
        .check(tenant_id, &method, &path, &identity)
        .await;

    if decision.allowed {
        let mut response = next.run(request).await;
        apply_rate_limit_headers(&mut response, &decision);
        response
    } else {
        let mut response = RateLimitExceededResponse::from_decision(&decision).into_response();
        apply_rate_limit_headers(&mut response, &decision);
        response
    }
}
