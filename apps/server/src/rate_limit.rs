use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::ApiResponse;

// ── Configuration ──

/// Configuration for a single rate limit tier.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests allowed within the sliding window.
    pub max_requests: u32,
    /// Duration of the sliding window.
    pub window: Duration,
}

// ── Throttle store capability ──

/// Keyed sliding-window hit store. The limiter only needs get/record/expire
/// semantics, so a deployment with more than one process can swap the
/// process-local map for a shared keyed store with TTL.
pub trait ThrottleStore: Send + Sync {
    /// Record a hit under `key` unless the window is already full.
    /// Returns `Err(oldest_hit)` when over the limit.
    fn try_hit(
        &self,
        key: &str,
        now: Instant,
        window: Duration,
        max_requests: u32,
    ) -> Result<(), Instant>;

    /// Drop keys whose newest hit is older than `max_idle`.
    fn cleanup(&self, now: Instant, max_idle: Duration);
}

/// Process-local store: request timestamps per key in a DashMap.
#[derive(Debug, Default)]
pub struct InMemoryThrottleStore {
    hits: DashMap<String, Vec<Instant>>,
}

impl ThrottleStore for InMemoryThrottleStore {
    fn try_hit(
        &self,
        key: &str,
        now: Instant,
        window: Duration,
        max_requests: u32,
    ) -> Result<(), Instant> {
        let mut entry = self.hits.entry(key.to_string()).or_default();
        let window_start = now - window;

        // Evict expired timestamps
        entry.retain(|t| *t > window_start);

        if entry.len() >= max_requests as usize {
            return Err(entry[0]);
        }
        entry.push(now);
        Ok(())
    }

    fn cleanup(&self, now: Instant, max_idle: Duration) {
        self.hits.retain(|_key, timestamps| {
            timestamps.retain(|t| now.duration_since(*t) < max_idle);
            !timestamps.is_empty()
        });
    }
}

// ── Core rate limiter ──

/// Per-IP sliding-window limiter. Each tier (e.g. "public", "booking") has
/// its own config; hits land in the pluggable [`ThrottleStore`].
#[derive(Clone)]
pub struct RateLimiter {
    tiers: Arc<DashMap<&'static str, RateLimitConfig>>,
    store: Arc<dyn ThrottleStore>,
}

impl RateLimiter {
    /// Create a limiter over the process-local store. Call `add_tier()` to
    /// configure.
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryThrottleStore::default()))
    }

    pub fn with_store(store: Arc<dyn ThrottleStore>) -> Self {
        Self {
            tiers: Arc::new(DashMap::new()),
            store,
        }
    }

    /// Register a named tier with its configuration.
    pub fn add_tier(&self, name: &'static str, config: RateLimitConfig) {
        self.tiers.insert(name, config);
    }

    /// Check if a request from `ip` is allowed under the given tier.
    ///
    /// Returns `Ok(())` if allowed, `Err(retry_after_secs)` if rate limited.
    pub fn check(&self, tier: &'static str, ip: IpAddr) -> Result<(), u64> {
        let config = self
            .tiers
            .get(tier)
            .expect("unknown rate limit tier")
            .value()
            .clone();
        let now = Instant::now();
        let key = format!("{tier}:{ip}");

        self.store
            .try_hit(&key, now, config.window, config.max_requests)
            .map_err(|oldest| {
                // Time until the oldest request expires from the window
                (oldest + config.window)
                    .saturating_duration_since(now)
                    .as_secs()
                    .max(1)
            })
    }

    /// Remove stale entries (older than 2× the largest window) from the
    /// store. Call periodically from a background task.
    pub fn cleanup(&self) {
        let max_window = self
            .tiers
            .iter()
            .map(|entry| entry.value().window)
            .max()
            .unwrap_or(Duration::from_secs(60));
        self.store.cleanup(Instant::now(), max_window * 2);
    }
}

// ── IP extraction ──

/// Extract client IP from X-Forwarded-For header (reverse proxy) or
/// ConnectInfo.
pub fn extract_client_ip(req: &Request) -> IpAddr {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first_ip) = forwarded.split(',').next() {
            if let Ok(ip) = first_ip.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or_else(|| "127.0.0.1".parse().unwrap())
}

// ── 429 response builder ──

fn too_many_requests(retry_after: u64) -> Response {
    let body = ApiResponse::<()>::error(format!(
        "Too many requests. Try again in {} seconds",
        retry_after
    ));
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", retry_after.to_string())],
        Json(body),
    )
        .into_response()
}

// ── Middleware functions (one per tier) ──

/// Rate limiter for public read-only endpoints (60 req/min).
pub async fn rate_limit_public(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check("public", ip).map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

/// Rate limiter for code-authenticated client endpoints (30 req/min).
pub async fn rate_limit_client(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check("client", ip).map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

/// Rate limiter for reservation creation (5 req/5min — strictest).
pub async fn rate_limit_booking(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check("booking", ip).map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

/// Rate limiter for admin endpoints (120 req/min).
pub async fn rate_limit_admin(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check("admin", ip).map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread::sleep;

    fn test_ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn limiter_with(max_requests: u32, window: Duration) -> RateLimiter {
        let limiter = RateLimiter::new();
        limiter.add_tier(
            "test",
            RateLimitConfig {
                max_requests,
                window,
            },
        );
        limiter
    }

    #[test]
    fn test_allows_requests_under_limit() {
        let limiter = limiter_with(3, Duration::from_secs(60));
        let ip = test_ip(1);
        assert!(limiter.check("test", ip).is_ok());
        assert!(limiter.check("test", ip).is_ok());
        assert!(limiter.check("test", ip).is_ok());
    }

    #[test]
    fn test_rejects_over_limit() {
        let limiter = limiter_with(2, Duration::from_secs(60));
        let ip = test_ip(1);
        assert!(limiter.check("test", ip).is_ok());
        assert!(limiter.check("test", ip).is_ok());
        assert!(limiter.check("test", ip).is_err());
    }

    #[test]
    fn test_returns_retry_after() {
        let limiter = limiter_with(1, Duration::from_secs(60));
        let ip = test_ip(1);
        limiter.check("test", ip).unwrap();
        let retry_after = limiter.check("test", ip).unwrap_err();
        assert!((1..=60).contains(&retry_after));
    }

    #[test]
    fn test_different_ips_independent() {
        let limiter = limiter_with(1, Duration::from_secs(60));
        assert!(limiter.check("test", test_ip(1)).is_ok());
        assert!(limiter.check("test", test_ip(1)).is_err()); // exhausted
        assert!(limiter.check("test", test_ip(2)).is_ok()); // different IP — ok
    }

    #[test]
    fn test_different_tiers_independent() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
        };
        limiter.add_tier("tier_a", config.clone());
        limiter.add_tier("tier_b", config);
        let ip = test_ip(1);
        assert!(limiter.check("tier_a", ip).is_ok());
        assert!(limiter.check("tier_a", ip).is_err());
        assert!(limiter.check("tier_b", ip).is_ok()); // different tier — ok
    }

    #[test]
    fn test_window_expiry_allows_again() {
        let limiter = limiter_with(1, Duration::from_millis(100));
        let ip = test_ip(1);
        assert!(limiter.check("test", ip).is_ok());
        assert!(limiter.check("test", ip).is_err());

        sleep(Duration::from_millis(150));

        assert!(limiter.check("test", ip).is_ok()); // window expired
    }

    #[test]
    fn test_cleanup_removes_stale_entries() {
        let limiter = limiter_with(10, Duration::from_millis(50));
        let ip = test_ip(1);
        limiter.check("test", ip).unwrap();

        sleep(Duration::from_millis(120)); // > 2× window

        limiter.cleanup();

        assert!(limiter.check("test", ip).is_ok());
    }

    #[test]
    fn test_cleanup_preserves_active_entries() {
        let limiter = limiter_with(2, Duration::from_secs(60));
        let ip = test_ip(1);
        limiter.check("test", ip).unwrap();

        limiter.cleanup(); // should NOT remove active entries

        limiter.check("test", ip).unwrap();
        assert!(limiter.check("test", ip).is_err()); // limit is 2, both still count
    }

    #[test]
    fn test_store_keys_namespace_by_tier() {
        let store = InMemoryThrottleStore::default();
        let now = Instant::now();
        let window = Duration::from_secs(60);
        assert!(store.try_hit("a:10.0.0.1", now, window, 1).is_ok());
        assert!(store.try_hit("a:10.0.0.1", now, window, 1).is_err());
        assert!(store.try_hit("b:10.0.0.1", now, window, 1).is_ok());
    }
}
