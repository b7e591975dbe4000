mod auth;
mod availability;
mod db;
mod error;
mod handlers;
mod models;
mod payments;
mod rate_limit;
mod reservation;
mod sweeper;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, patch, post, put},
    Router,
};
use chrono::FixedOffset;
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use url::Url;

use payments::GatewayConfig;
use rate_limit::{
    rate_limit_admin, rate_limit_booking, rate_limit_client, rate_limit_public, RateLimitConfig,
    RateLimiter,
};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub http: reqwest::Client,
    pub gateway: GatewayConfig,
    pub admin_token: String,
    pub sweep_secret: String,
    pub webapp_url: String,
    /// Business timezone for working-hours resolution.
    pub tz: FixedOffset,
    /// Lifetime of an unpaid hold (minutes).
    pub hold_ttl_min: i64,
    pub started_at: Instant,
}

/// Rate limit cleanup interval (seconds).
const RATE_LIMIT_CLEANUP_SECS: u64 = 300;
/// Timeout for calls to the payment gateway (seconds).
const GATEWAY_TIMEOUT_SECS: u64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // ── Required env vars ──
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:bookline.db?mode=rwc".into());
    let admin_token = std::env::var("ADMIN_API_TOKEN").expect("ADMIN_API_TOKEN must be set");
    let sweep_secret = std::env::var("SWEEP_SECRET").expect("SWEEP_SECRET must be set");

    // ── Tracing ──
    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".into());

    // ── Optional env vars ──
    let webapp_url =
        std::env::var("WEBAPP_URL").unwrap_or_else(|_| "https://example.com".into());
    let gateway = GatewayConfig {
        api_url: std::env::var("GATEWAY_API_URL")
            .unwrap_or_else(|_| "https://api.gateway.example".into()),
        api_key: std::env::var("GATEWAY_API_KEY").unwrap_or_default(),
        webhook_secret: std::env::var("GATEWAY_WEBHOOK_SECRET").unwrap_or_default(),
        return_url: std::env::var("GATEWAY_RETURN_URL")
            .unwrap_or_else(|_| format!("{webapp_url}/payment/return")),
    };
    let hold_ttl_min: i64 = std::env::var("HOLD_TTL_MIN")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(reservation::DEFAULT_HOLD_TTL_MIN);
    let tz_offset_min: i32 = std::env::var("BUSINESS_UTC_OFFSET_MIN")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let tz = FixedOffset::east_opt(tz_offset_min * 60)
        .expect("BUSINESS_UTC_OFFSET_MIN out of range");

    if gateway.api_key.is_empty() {
        tracing::warn!("GATEWAY_API_KEY not set — prepayments will fail");
    }
    if gateway.webhook_secret.is_empty() {
        tracing::warn!("GATEWAY_WEBHOOK_SECRET not set — webhooks will be rejected");
    }
    // Fail fast on malformed URLs instead of at the first checkout.
    Url::parse(&gateway.api_url)?;
    Url::parse(&gateway.return_url)?;

    // ── Database ──
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    db::run_migrations(&pool).await?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(GATEWAY_TIMEOUT_SECS))
        .build()?;

    let state = Arc::new(AppState {
        db: pool,
        http,
        gateway,
        admin_token,
        sweep_secret,
        webapp_url: webapp_url.clone(),
        tz,
        hold_ttl_min,
        started_at: Instant::now(),
    });

    // ── Rate limiter ──
    let rate_limiter = RateLimiter::new();
    rate_limiter.add_tier(
        "public",
        RateLimitConfig {
            max_requests: 60,
            window: Duration::from_secs(60),
        },
    );
    rate_limiter.add_tier(
        "client",
        RateLimitConfig {
            max_requests: 30,
            window: Duration::from_secs(60),
        },
    );
    rate_limiter.add_tier(
        "booking",
        RateLimitConfig {
            max_requests: 5,
            window: Duration::from_secs(300),
        },
    );
    rate_limiter.add_tier(
        "admin",
        RateLimitConfig {
            max_requests: 120,
            window: Duration::from_secs(60),
        },
    );

    // ── Background task: cleanup stale rate limit entries ──
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(RATE_LIMIT_CLEANUP_SECS));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    // ── CORS: whitelist WEBAPP_URL when configured, otherwise allow any ──
    let cors = if webapp_url != "https://example.com" {
        let origins: Vec<axum::http::HeaderValue> = vec![
            webapp_url.parse().expect("WEBAPP_URL must be a valid URL"),
            "http://localhost:5173".parse().unwrap(), // Vite dev server
        ];
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // ── Router (5 groups with per-group rate limits) ──

    // 1. No-limit: health check, signed webhook, secret-gated sweep trigger
    let no_limit_routes = Router::new()
        .route("/api/health", get(handlers::health::health))
        .route(
            "/api/payments/webhook",
            post(handlers::payment::payment_webhook),
        )
        .route("/api/internal/sweep", post(handlers::admin::trigger_sweep));

    // 2. Public: read-only endpoints (no auth, 60 req/min)
    let public_routes = Router::new()
        .route("/api/services", get(handlers::client::list_services))
        .route("/api/staff", get(handlers::client::list_staff))
        .route("/api/slots", get(handlers::client::list_slots))
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_public));

    // 3. Reservation creation: strictest limit (5 req/5min)
    let booking_routes = Router::new()
        .route(
            "/api/reservations",
            post(handlers::client::create_reservation),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_booking));

    // 4. Client: code-authenticated reservation endpoints (30 req/min)
    let client_routes = Router::new()
        .route(
            "/api/reservations/{id}",
            get(handlers::client::reservation_status),
        )
        .route(
            "/api/reservations/{id}",
            delete(handlers::client::cancel_reservation),
        )
        .route(
            "/api/reservations/{id}/contact",
            patch(handlers::client::update_contact),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_client));

    // 5. Admin: bearer-token endpoints (120 req/min)
    let admin_routes = Router::new()
        .route(
            "/api/admin/reservations",
            get(handlers::admin::list_reservations),
        )
        .route(
            "/api/admin/reservations/{id}/cancel",
            post(handlers::admin::cancel_reservation),
        )
        .route(
            "/api/admin/reservations/{id}/no-show",
            post(handlers::admin::mark_no_show),
        )
        .route(
            "/api/admin/reservations/{id}/settle",
            post(handlers::admin::settle_reservation),
        )
        .route(
            "/api/admin/reservations/{id}/payments",
            get(handlers::admin::list_payment_events),
        )
        .route(
            "/api/admin/reservations/{id}/refund",
            post(handlers::admin::refund_reservation),
        )
        .route(
            "/api/admin/services",
            get(handlers::admin::list_all_services),
        )
        .route("/api/admin/services", post(handlers::admin::create_service))
        .route(
            "/api/admin/services/{id}",
            put(handlers::admin::update_service),
        )
        .route(
            "/api/admin/overrides",
            post(handlers::admin::upsert_override),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_admin));

    let app = Router::new()
        .merge(no_limit_routes)
        .merge(public_routes)
        .merge(booking_routes)
        .merge(client_routes)
        .merge(admin_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    tracing::info!("Bookline server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
