pub mod audit;
pub mod auth;
pub mod call_token;
pub mod config;
pub mod db;
pub mod security;
pub mod video_calls;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, FromRef, State},
    http::{header, HeaderName, Method, Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use auth::{AuthUser, LogoutResponse, RegisterRequest};
pub use config::GatewayConfig;
pub use db::{Session, User};
pub use security::hash_token;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: GatewayConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }
}

impl FromRef<AppState> for SqlitePool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Arc<GatewayConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

#[derive(Serialize)]
pub struct RuntimeMetrics {
    pub active_video_calls: i64,
    pub active_sessions: i64,
}

async fn health(State(pool): State<SqlitePool>) -> Response {
    let active_video_calls = db::count_active_calls(&pool).await;
    let active_sessions = db::count_active_sessions(&pool).await;
    match (active_video_calls, active_sessions) {
        (Ok(active_video_calls), Ok(active_sessions)) => (
            StatusCode::OK,
            Json(RuntimeMetrics {
                active_video_calls,
                active_sessions,
            }),
        )
            .into_response(),
        (Err(err), _) | (_, Err(err)) => {
            tracing::error!("health check failed: {}", err);
            auth::error_response(StatusCode::SERVICE_UNAVAILABLE, "Database unavailable")
        }
    }
}

async fn global_api_rate_limit(req: Request<axum::body::Body>, next: middleware::Next) -> Response {
    let path = req.uri().path();
    if path == "/" || path == "/health" || path.starts_with("/metrics/") {
        return next.run(req).await;
    }

    let direct_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let client_ip = security::effective_client_ip(req.headers(), direct_addr);
    let key = format!("{}:{}:{}", req.method(), path, client_ip);
    if !security::allow_api_request(&key) {
        audit::log_security_event(
            audit::SecurityEventType::RateLimitExceeded,
            Some(client_ip),
            None,
            None,
            Some(audit::FailureReason::RateLimited),
            Some(path),
        );
        return auth::error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }

    next.run(req).await
}

fn build_cors_layer() -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::PUT, Method::OPTIONS];
    let headers = [
        header::CONTENT_TYPE,
        header::AUTHORIZATION,
        HeaderName::from_static("x-session-token"),
    ];

    let allow_origin = if security::cors_allow_any() {
        AllowOrigin::any()
    } else {
        let origins = security::cors_origin_values();
        if origins.is_empty() {
            tracing::warn!(
                "no valid CORS origins configured; cross-origin browser access will be blocked"
            );
            return CorsLayer::new().allow_methods(methods).allow_headers(headers);
        }
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(methods)
        .allow_headers(headers)
}

/// Full HTTP surface of the gateway. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Campus Gateway Online" }))
        .route("/health", get(health))
        .route("/metrics/auth", get(auth::metrics))
        .route("/metrics/video-calls", get(video_calls::metrics))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route(
            "/video-calls",
            get(video_calls::list_video_calls).post(video_calls::create_video_call),
        )
        .route("/video-calls/:id", get(video_calls::get_video_call))
        .route("/video-calls/:id/token", post(video_calls::issue_token))
        .route("/video-calls/:id/end", post(video_calls::end_video_call))
        .route("/video-calls/:id/cancel", post(video_calls::cancel_video_call))
        .route(
            "/video-calls/:id/participants",
            put(video_calls::update_participants),
        )
        .layer(middleware::from_fn(global_api_rate_limit))
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
