use crate::audit::{log_security_event, FailureReason, SecurityEventType};
use crate::config::GatewayConfig;
use crate::db::{self, NewUser, Session, User};
use crate::security;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{ConnectInfo, Json, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use campus_common::{AccountInfo, AuthResponse, ErrorResponse, LoginRequest, UserRole};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
    pub username: String,
    pub tenant: String,
    pub role: UserRole,
}

#[derive(Serialize)]
pub struct LogoutResponse {
    pub revoked: bool,
}

/// Identity resolved from a bearer session token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub tenant: String,
    pub role: UserRole,
}

#[derive(Default)]
struct AuthMetrics {
    register_attempts: AtomicU64,
    register_success: AtomicU64,
    login_attempts: AtomicU64,
    login_success: AtomicU64,
    logout_attempts: AtomicU64,
    logout_success: AtomicU64,
    rate_limited: AtomicU64,
    validation_errors: AtomicU64,
    auth_failures: AtomicU64,
    db_errors: AtomicU64,
}

#[derive(Serialize)]
pub struct AuthMetricsSnapshot {
    pub register_attempts: u64,
    pub register_success: u64,
    pub login_attempts: u64,
    pub login_success: u64,
    pub logout_attempts: u64,
    pub logout_success: u64,
    pub rate_limited: u64,
    pub validation_errors: u64,
    pub auth_failures: u64,
    pub db_errors: u64,
}

static AUTH_METRICS: Lazy<AuthMetrics> = Lazy::new(AuthMetrics::default);

fn metrics_snapshot() -> AuthMetricsSnapshot {
    AuthMetricsSnapshot {
        register_attempts: AUTH_METRICS.register_attempts.load(Ordering::Relaxed),
        register_success: AUTH_METRICS.register_success.load(Ordering::Relaxed),
        login_attempts: AUTH_METRICS.login_attempts.load(Ordering::Relaxed),
        login_success: AUTH_METRICS.login_success.load(Ordering::Relaxed),
        logout_attempts: AUTH_METRICS.logout_attempts.load(Ordering::Relaxed),
        logout_success: AUTH_METRICS.logout_success.load(Ordering::Relaxed),
        rate_limited: AUTH_METRICS.rate_limited.load(Ordering::Relaxed),
        validation_errors: AUTH_METRICS.validation_errors.load(Ordering::Relaxed),
        auth_failures: AUTH_METRICS.auth_failures.load(Ordering::Relaxed),
        db_errors: AUTH_METRICS.db_errors.load(Ordering::Relaxed),
    }
}

pub async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, Json(metrics_snapshot())).into_response()
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            video_call_id: None,
        }),
    )
        .into_response()
}

fn account_info(user: &User, role: UserRole) -> AccountInfo {
    AccountInfo {
        id: user.id.clone(),
        tenant: user.tenant.clone(),
        email: user.email.clone(),
        username: user.username.clone(),
        display_name: user.display_name.clone(),
        role,
    }
}

fn auth_response(user: &User, role: UserRole, session: Session) -> AuthResponse {
    AuthResponse {
        user: account_info(user, role),
        token: session.token,
        expires_at: session.expires_at,
    }
}

fn rate_limit_key(scope: &str, ip: IpAddr) -> String {
    format!("{scope}:{}", ip)
}

fn ensure_auth_rate_limit(scope: &str, ip: IpAddr) -> bool {
    security::allow_auth_request(&rate_limit_key(scope, ip))
}

fn is_reasonable_password_input(password: &str) -> bool {
    !password.is_empty() && password.len() <= 128
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn normalize_username(username: &str) -> String {
    username.trim().to_ascii_lowercase()
}

pub(crate) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-session-token") {
        if let Ok(token) = value.to_str() {
            let trimmed = token.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToOwned::to_owned)
}

/// Resolves the caller from the session token, or produces the 401/500 response
/// the handler should return as-is.
pub async fn authenticate(pool: &SqlitePool, headers: &HeaderMap) -> Result<AuthUser, Response> {
    let (user, role) = resolve_session(pool, headers).await?;
    Ok(AuthUser {
        id: user.id,
        tenant: user.tenant,
        role,
    })
}

async fn resolve_session(
    pool: &SqlitePool,
    headers: &HeaderMap,
) -> Result<(User, UserRole), Response> {
    let Some(token) = extract_session_token(headers) else {
        return Err(error_response(StatusCode::UNAUTHORIZED, "Missing session token"));
    };
    if !security::is_valid_session_token(&token) {
        return Err(error_response(StatusCode::UNAUTHORIZED, "Invalid session token"));
    }

    let user = match db::get_user_by_session_token(pool, &token).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            AUTH_METRICS.auth_failures.fetch_add(1, Ordering::Relaxed);
            return Err(error_response(
                StatusCode::UNAUTHORIZED,
                "Session expired or revoked",
            ));
        }
        Err(err) => {
            AUTH_METRICS.db_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!("failed to resolve session: {}", err);
            return Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error"));
        }
    };

    let role = match user.role() {
        Ok(role) => role,
        Err(err) => {
            tracing::error!("{}", err);
            return Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Corrupt account"));
        }
    };

    Ok((user, role))
}

/// Account behind the presented session token.
pub async fn me(State(pool): State<SqlitePool>, headers: HeaderMap) -> Response {
    match resolve_session(&pool, &headers).await {
        Ok((user, role)) => (StatusCode::OK, Json(account_info(&user, role))).into_response(),
        Err(response) => response,
    }
}

pub async fn register(
    State(pool): State<SqlitePool>,
    State(config): State<Arc<GatewayConfig>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<RegisterRequest>,
) -> impl IntoResponse {
    AUTH_METRICS
        .register_attempts
        .fetch_add(1, Ordering::Relaxed);
    let client_ip = security::effective_client_ip(&headers, addr);
    if !ensure_auth_rate_limit("register", client_ip) {
        AUTH_METRICS.rate_limited.fetch_add(1, Ordering::Relaxed);
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }

    let email = normalize_email(&payload.email);
    let username = normalize_username(&payload.username);
    let display_name = payload.display_name.trim().to_string();
    let tenant = payload.tenant.trim().to_string();

    if !security::is_valid_email(&email)
        || !security::is_valid_password(&payload.password)
        || !security::is_valid_display_name(&display_name)
        || !security::is_valid_username(&username)
        || !security::is_valid_tenant(&tenant)
    {
        AUTH_METRICS
            .validation_errors
            .fetch_add(1, Ordering::Relaxed);
        return error_response(StatusCode::BAD_REQUEST, "Invalid registration payload");
    }

    // Admin accounts are provisioned out of band.
    if payload.role == UserRole::Admin {
        AUTH_METRICS
            .validation_errors
            .fetch_add(1, Ordering::Relaxed);
        log_security_event(
            SecurityEventType::ValidationError,
            Some(client_ip),
            None,
            Some(&email),
            Some(FailureReason::InsufficientRole),
            Some("admin self-registration"),
        );
        return error_response(StatusCode::FORBIDDEN, "Admin accounts cannot self-register");
    }

    if let Ok(Some(_)) = db::get_user_by_email(&pool, &email).await {
        AUTH_METRICS.auth_failures.fetch_add(1, Ordering::Relaxed);
        return error_response(StatusCode::CONFLICT, "Email already exists");
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = match Argon2::default().hash_password(payload.password.as_bytes(), &salt) {
        Ok(hash) => hash.to_string(),
        Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Hashing failed"),
    };

    let user = match db::create_user(
        &pool,
        NewUser {
            tenant: &tenant,
            email: &email,
            password_hash: &password_hash,
            display_name: &display_name,
            username: &username,
            role: payload.role,
        },
    )
    .await
    {
        Ok(user) => user,
        Err(err) => {
            let lower = err.to_string().to_ascii_lowercase();
            if lower.contains("unique")
                && (lower.contains("users.email") || lower.contains("users.username"))
            {
                AUTH_METRICS.auth_failures.fetch_add(1, Ordering::Relaxed);
                return error_response(StatusCode::CONFLICT, "Account already exists");
            }
            AUTH_METRICS.db_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!("failed to create user: {}", err);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    };

    let session = match db::create_session(
        &pool,
        &user.id,
        Some(client_ip.to_string()),
        config.session_ttl_hours,
    )
    .await
    {
        Ok(session) => session,
        Err(err) => {
            AUTH_METRICS.db_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!("failed to create session: {}", err);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Session creation failed");
        }
    };

    AUTH_METRICS
        .register_success
        .fetch_add(1, Ordering::Relaxed);
    log_security_event(
        SecurityEventType::Registration,
        Some(client_ip),
        Some(&user.id),
        Some(&email),
        None,
        None,
    );
    (
        StatusCode::CREATED,
        Json(auth_response(&user, payload.role, session)),
    )
        .into_response()
}

const MAX_LOGIN_ATTEMPTS: i64 = 5;
const LOCKOUT_DURATION_MINUTES: i64 = 15;

async fn is_locked_out(pool: &SqlitePool, identifier: &str) -> bool {
    if let Ok(Some((count, last_failure))) = db::get_login_failures(pool, identifier).await {
        if count >= MAX_LOGIN_ATTEMPTS {
            let lockout_until = last_failure + chrono::Duration::minutes(LOCKOUT_DURATION_MINUTES);
            return Utc::now() < lockout_until;
        }
    }
    false
}

pub async fn login(
    State(pool): State<SqlitePool>,
    State(config): State<Arc<GatewayConfig>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<LoginRequest>,
) -> impl IntoResponse {
    AUTH_METRICS.login_attempts.fetch_add(1, Ordering::Relaxed);
    let client_ip = security::effective_client_ip(&headers, addr);
    if !ensure_auth_rate_limit("login", client_ip) {
        AUTH_METRICS.rate_limited.fetch_add(1, Ordering::Relaxed);
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }

    let email = normalize_email(&payload.email);
    let failure_key = format!("email:{}", email);
    let ip_failure_key = format!("ip:{}", client_ip);

    if is_locked_out(&pool, &failure_key).await {
        AUTH_METRICS.rate_limited.fetch_add(1, Ordering::Relaxed);
        log_security_event(
            SecurityEventType::LoginFailure,
            Some(client_ip),
            None,
            Some(&email),
            Some(FailureReason::AccountLocked),
            None,
        );
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "Account locked due to too many failed attempts. Try again later.",
        );
    }

    if is_locked_out(&pool, &ip_failure_key).await {
        AUTH_METRICS.rate_limited.fetch_add(1, Ordering::Relaxed);
        log_security_event(
            SecurityEventType::RateLimitExceeded,
            Some(client_ip),
            None,
            Some(&email),
            Some(FailureReason::RateLimited),
            None,
        );
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many failed attempts from this IP. Try again later.",
        );
    }

    if !security::is_valid_email(&email) || !is_reasonable_password_input(&payload.password) {
        AUTH_METRICS
            .validation_errors
            .fetch_add(1, Ordering::Relaxed);
        return error_response(StatusCode::BAD_REQUEST, "Invalid login payload");
    }

    let user = match db::get_user_by_email(&pool, &email).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            AUTH_METRICS.auth_failures.fetch_add(1, Ordering::Relaxed);
            db::record_login_failure(&pool, &ip_failure_key).await.ok();
            log_security_event(
                SecurityEventType::LoginFailure,
                Some(client_ip),
                None,
                Some(&email),
                Some(FailureReason::UserNotFound),
                None,
            );
            return error_response(StatusCode::UNAUTHORIZED, "Invalid credentials");
        }
        Err(err) => {
            AUTH_METRICS.db_errors.fetch_add(1, Ordering::Relaxed);
            log_security_event(
                SecurityEventType::DatabaseError,
                Some(client_ip),
                None,
                None,
                Some(FailureReason::InternalError),
                Some(&err.to_string()),
            );
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    };

    let password_ok = PasswordHash::new(&user.password_hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(payload.password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false);

    if !password_ok {
        AUTH_METRICS.auth_failures.fetch_add(1, Ordering::Relaxed);
        db::record_login_failure(&pool, &failure_key).await.ok();
        db::record_login_failure(&pool, &ip_failure_key).await.ok();
        log_security_event(
            SecurityEventType::LoginFailure,
            Some(client_ip),
            Some(&user.id),
            Some(&email),
            Some(FailureReason::InvalidPassword),
            None,
        );
        return error_response(StatusCode::UNAUTHORIZED, "Invalid credentials");
    }

    let role = match user.role() {
        Ok(role) => role,
        Err(err) => {
            tracing::error!("{}", err);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Corrupt account");
        }
    };

    db::reset_login_failure(&pool, &failure_key).await.ok();
    db::reset_login_failure(&pool, &ip_failure_key).await.ok();

    let session = match db::create_session(
        &pool,
        &user.id,
        Some(client_ip.to_string()),
        config.session_ttl_hours,
    )
    .await
    {
        Ok(session) => session,
        Err(err) => {
            AUTH_METRICS.db_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!("failed to create session: {}", err);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Session creation failed");
        }
    };

    AUTH_METRICS.login_success.fetch_add(1, Ordering::Relaxed);
    log_security_event(
        SecurityEventType::LoginSuccess,
        Some(client_ip),
        Some(&user.id),
        Some(&email),
        None,
        None,
    );
    (StatusCode::OK, Json(auth_response(&user, role, session))).into_response()
}

pub async fn logout(
    State(pool): State<SqlitePool>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    AUTH_METRICS.logout_attempts.fetch_add(1, Ordering::Relaxed);
    let client_ip = security::effective_client_ip(&headers, addr);

    let Some(token) = extract_session_token(&headers) else {
        AUTH_METRICS
            .validation_errors
            .fetch_add(1, Ordering::Relaxed);
        return error_response(StatusCode::UNAUTHORIZED, "Missing session token");
    };

    match db::revoke_session(&pool, &token).await {
        Ok(revoked) => {
            if revoked {
                AUTH_METRICS.logout_success.fetch_add(1, Ordering::Relaxed);
                log_security_event(
                    SecurityEventType::Logout,
                    Some(client_ip),
                    None,
                    None,
                    None,
                    None,
                );
            }
            (StatusCode::OK, Json(LogoutResponse { revoked })).into_response()
        }
        Err(err) => {
            AUTH_METRICS.db_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!("failed to revoke session: {}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}
