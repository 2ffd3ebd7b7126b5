//! Rate limiting middleware for the gateway API.
//!
//! Fixed-window limiting with per-caller buckets:
//! - Identified callers (actor id resolved by the upstream router) get the
//!   authenticated limit
//! - Everyone else is keyed by peer IP with the anonymous limit
//! - 429 responses flow through the error boundary and advertise
//!   `Retry-After` (RFC 6585)
//!
//! ## Configuration
//!
//! - `PROCGATE_RATE_LIMIT_ANONYMOUS`: requests per window for anonymous
//!   callers (default: 100)
//! - `PROCGATE_RATE_LIMIT_AUTHENTICATED`: requests per window for
//!   identified callers (default: 1000)
//! - `PROCGATE_RATE_LIMIT_WINDOW_SECS`: window length (default: 60)
//! - `PROCGATE_RATE_LIMIT_MAX_BUCKETS`: bucket storage cap (default: 10000)
//! - `PROCGATE_RATE_LIMIT_BUCKET_TTL_SECS`: idle bucket TTL (default: 600)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request};
use axum::http::header::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use procgate_core::{CorrelationId, GateError};
use tracing::{debug, warn};

use crate::app::RequestContext;
use crate::error_boundary::ApiError;

const DEFAULT_ANONYMOUS_LIMIT: u32 = 100;
const DEFAULT_AUTHENTICATED_LIMIT: u32 = 1000;
const DEFAULT_WINDOW_SECS: u64 = 60;
const DEFAULT_MAX_BUCKETS: usize = 10_000;
const DEFAULT_BUCKET_TTL_SECS: u64 = 600;

/// Configuration for rate limiting.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub anonymous_limit: u32,
    pub authenticated_limit: u32,
    pub window_secs: u64,
    pub max_buckets: usize,
    pub bucket_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            anonymous_limit: env_parse("PROCGATE_RATE_LIMIT_ANONYMOUS", DEFAULT_ANONYMOUS_LIMIT),
            authenticated_limit: env_parse(
                "PROCGATE_RATE_LIMIT_AUTHENTICATED",
                DEFAULT_AUTHENTICATED_LIMIT,
            ),
            window_secs: env_parse("PROCGATE_RATE_LIMIT_WINDOW_SECS", DEFAULT_WINDOW_SECS),
            max_buckets: env_parse("PROCGATE_RATE_LIMIT_MAX_BUCKETS", DEFAULT_MAX_BUCKETS),
            bucket_ttl_secs: env_parse(
                "PROCGATE_RATE_LIMIT_BUCKET_TTL_SECS",
                DEFAULT_BUCKET_TTL_SECS,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
struct RateLimitBucket {
    count: u32,
    window_start: Instant,
    last_accessed: Instant,
}

/// Shared limiter state.
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    buckets: Arc<DashMap<String, RateLimitBucket>>,
}

/// Rate limit metadata for response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitMetadata {
    pub limit: u32,
    pub remaining: u32,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Arc::new(config),
            buckets: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn rate_limit_key<B>(&self, req: &Request<B>) -> (String, u32) {
        if let Some(context) = req.extensions().get::<RequestContext>() {
            if let Some(actor) = &context.actor {
                let key = format!("auth:{}", actor.id);
                debug!(rate_limit_key = %key, "Using caller id for rate limiting");
                return (key, self.config.authenticated_limit);
            }
            if let Some(peer_ip) = &context.peer_ip {
                let key = format!("anon:{peer_ip}");
                debug!(rate_limit_key = %key, "Using peer address for rate limiting");
                return (key, self.config.anonymous_limit);
            }
        }

        if let Some(peer) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
            let key = format!("anon:{}", peer.0.ip());
            debug!(rate_limit_key = %key, "Using peer address for rate limiting");
            return (key, self.config.anonymous_limit);
        }

        warn!("Could not derive a rate limit key, using 'unknown'");
        ("anon:unknown".to_string(), self.config.anonymous_limit)
    }

    /// Check the limit for this request. `Err(retry_after_secs)` when the
    /// window is exhausted.
    pub fn check<B>(&self, req: &Request<B>) -> (Result<(), u64>, RateLimitMetadata) {
        let (key, limit) = self.rate_limit_key(req);
        let now = Instant::now();
        let window = Duration::from_secs(self.config.window_secs);

        // Evict idle buckets once storage crosses half the cap
        if self.buckets.len() > self.config.max_buckets / 2 {
            let ttl = Duration::from_secs(self.config.bucket_ttl_secs);
            self.buckets
                .retain(|_, bucket| now.duration_since(bucket.last_accessed) < ttl);
        }

        let mut bucket = self.buckets.entry(key).or_insert_with(|| RateLimitBucket {
            count: 0,
            window_start: now,
            last_accessed: now,
        });
        bucket.last_accessed = now;

        if now.duration_since(bucket.window_start) >= window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count >= limit {
            let retry_after = self
                .config
                .window_secs
                .saturating_sub(now.duration_since(bucket.window_start).as_secs())
                .max(1);
            return (
                Err(retry_after),
                RateLimitMetadata {
                    limit,
                    remaining: 0,
                },
            );
        }

        bucket.count += 1;
        let remaining = limit.saturating_sub(bucket.count);
        (Ok(()), RateLimitMetadata { limit, remaining })
    }
}

/// Rate limiting middleware. Expects a [`RateLimiter`] in request
/// extensions; requests without one pass through unlimited.
pub async fn rate_limit_middleware(req: Request, next: Next) -> Response {
    let Some(limiter) = req.extensions().get::<RateLimiter>().cloned() else {
        return next.run(req).await;
    };

    let correlation_id = req
        .extensions()
        .get::<CorrelationId>()
        .copied()
        .unwrap_or_default();

    let (verdict, metadata) = limiter.check(&req);

    match verdict {
        Ok(()) => {
            let mut response = next.run(req).await;
            apply_headers(&mut response, metadata);
            response
        }
        Err(retry_after) => {
            let mut response = ApiError(
                GateError::rate_limited(retry_after).with_correlation_id(correlation_id),
            )
            .into_response();
            apply_headers(&mut response, metadata);
            response
        }
    }
}

fn apply_headers(response: &mut Response, metadata: RateLimitMetadata) {
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-ratelimit-limit"),
        HeaderValue::from(metadata.limit),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(metadata.remaining),
    );
}
