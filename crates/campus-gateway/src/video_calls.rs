//! `/video-calls` endpoints: call records, join tokens and participant presence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use campus_common::{
    helpers::{is_valid_call_segment, DEFAULT_CALL_TYPE},
    CreateVideoCallRequest, ErrorResponse, ParticipantAction, ParticipantRole,
    ParticipantUpdateRequest, VideoCall, VideoCallQuery, VideoCallStatus, INACTIVE_CALL_ERROR,
};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::audit::{log_security_event, FailureReason, SecurityEventType};
use crate::auth::{authenticate, error_response, AuthUser};
use crate::call_token::{issue_join_token, participant_role_for};
use crate::config::GatewayConfig;
use crate::db::{self, CallFilter, NewVideoCall};
use crate::security;

const ALREADY_RUNNING_ERROR: &str = "A video call is already running for this lesson";

#[derive(Default)]
struct VideoCallMetrics {
    created: AtomicU64,
    ended: AtomicU64,
    cancelled: AtomicU64,
    tokens_issued: AtomicU64,
    conflicts: AtomicU64,
    forbidden: AtomicU64,
    participant_updates: AtomicU64,
    db_errors: AtomicU64,
}

#[derive(Serialize)]
pub struct VideoCallMetricsSnapshot {
    pub created: u64,
    pub ended: u64,
    pub cancelled: u64,
    pub tokens_issued: u64,
    pub conflicts: u64,
    pub forbidden: u64,
    pub participant_updates: u64,
    pub db_errors: u64,
}

static CALL_METRICS: Lazy<VideoCallMetrics> = Lazy::new(VideoCallMetrics::default);

pub async fn metrics() -> impl IntoResponse {
    let m = &*CALL_METRICS;
    let snapshot = VideoCallMetricsSnapshot {
        created: m.created.load(Ordering::Relaxed),
        ended: m.ended.load(Ordering::Relaxed),
        cancelled: m.cancelled.load(Ordering::Relaxed),
        tokens_issued: m.tokens_issued.load(Ordering::Relaxed),
        conflicts: m.conflicts.load(Ordering::Relaxed),
        forbidden: m.forbidden.load(Ordering::Relaxed),
        participant_updates: m.participant_updates.load(Ordering::Relaxed),
        db_errors: m.db_errors.load(Ordering::Relaxed),
    };
    (StatusCode::OK, Json(snapshot)).into_response()
}

fn db_error(context: &str, err: anyhow::Error) -> Response {
    CALL_METRICS.db_errors.fetch_add(1, Ordering::Relaxed);
    error!("{}: {}", context, err);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
}

fn forbidden(user: &AuthUser, action: &str) -> Response {
    CALL_METRICS.forbidden.fetch_add(1, Ordering::Relaxed);
    log_security_event(
        SecurityEventType::AccessDenied,
        None,
        Some(&user.id),
        None,
        Some(FailureReason::InsufficientRole),
        Some(action),
    );
    error_response(StatusCode::FORBIDDEN, "Not allowed")
}

fn inactive_call() -> Response {
    CALL_METRICS.conflicts.fetch_add(1, Ordering::Relaxed);
    error_response(StatusCode::CONFLICT, INACTIVE_CALL_ERROR)
}

fn already_running(existing_id: String) -> Response {
    CALL_METRICS.conflicts.fetch_add(1, Ordering::Relaxed);
    (
        StatusCode::CONFLICT,
        Json(ErrorResponse {
            error: ALREADY_RUNNING_ERROR.to_string(),
            video_call_id: Some(existing_id),
        }),
    )
        .into_response()
}

/// Loads a call in the caller's tenant; other tenants' calls read as missing.
async fn load_call(pool: &SqlitePool, user: &AuthUser, id: &str) -> Result<VideoCall, Response> {
    if !security::is_valid_reference_id(id) {
        return Err(error_response(StatusCode::NOT_FOUND, "Video call not found"));
    }
    match db::get_video_call(pool, &user.tenant, id).await {
        Ok(Some(call)) => Ok(call),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "Video call not found")),
        Err(err) => Err(db_error("failed to load video call", err)),
    }
}

async fn reload_call(pool: &SqlitePool, user: &AuthUser, id: &str) -> Response {
    match load_call(pool, user, id).await {
        Ok(call) => (StatusCode::OK, Json(call)).into_response(),
        Err(resp) => resp,
    }
}

fn is_call_host(call: &VideoCall, user: &AuthUser) -> bool {
    participant_role_for(call, &user.id, user.role) == ParticipantRole::Host
}

fn validate_create(payload: &CreateVideoCallRequest) -> Result<String, &'static str> {
    if !security::is_valid_reference_id(payload.lesson_id.trim())
        || !security::is_valid_reference_id(payload.course_id.trim())
    {
        return Err("lessonId and courseId are required");
    }
    if !security::is_valid_call_title(&payload.title) {
        return Err("title must be 1-200 characters");
    }
    if let (Some(start), Some(end)) = (payload.lesson_start_at, payload.lesson_end_at) {
        if end <= start {
            return Err("lessonEndAt must be after lessonStartAt");
        }
    }
    let call_type = payload
        .call_type
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CALL_TYPE)
        .to_string();
    if !is_valid_call_segment(&call_type) {
        return Err("callType must be 1-64 characters of [A-Za-z0-9_-]");
    }
    Ok(call_type)
}

pub async fn list_video_calls(
    State(pool): State<SqlitePool>,
    headers: HeaderMap,
    Query(query): Query<VideoCallQuery>,
) -> Response {
    let user = match authenticate(&pool, &headers).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let filter = match CallFilter::try_from(query) {
        Ok(filter) => filter,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };

    match db::list_video_calls(&pool, &user.tenant, &filter).await {
        Ok(calls) => (StatusCode::OK, Json(calls)).into_response(),
        Err(err) => db_error("failed to list video calls", err),
    }
}

pub async fn get_video_call(
    State(pool): State<SqlitePool>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = match authenticate(&pool, &headers).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    reload_call(&pool, &user, &id).await
}

pub async fn create_video_call(
    State(pool): State<SqlitePool>,
    headers: HeaderMap,
    Json(payload): Json<CreateVideoCallRequest>,
) -> Response {
    let user = match authenticate(&pool, &headers).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if !user.role.can_start_calls() {
        return forbidden(&user, "start video call");
    }

    let call_type = match validate_create(&payload) {
        Ok(call_type) => call_type,
        Err(message) => {
            log_security_event(
                SecurityEventType::ValidationError,
                None,
                Some(&user.id),
                None,
                Some(FailureReason::InvalidInput),
                Some(message),
            );
            return error_response(StatusCode::BAD_REQUEST, message);
        }
    };
    let lesson_id = payload.lesson_id.trim();
    let course_id = payload.course_id.trim();

    match db::find_active_call_for_lesson(&pool, &user.tenant, lesson_id).await {
        Ok(Some(existing)) => return already_running(existing),
        Ok(None) => {}
        Err(err) => return db_error("failed to check running calls", err),
    }

    let created = db::create_video_call(
        &pool,
        NewVideoCall {
            tenant: &user.tenant,
            lesson_id,
            course_id,
            call_type: &call_type,
            title: payload.title.trim(),
            lesson_start_at: payload.lesson_start_at,
            lesson_end_at: payload.lesson_end_at,
            created_by: &user.id,
        },
    )
    .await;

    match created {
        Ok(call) => {
            CALL_METRICS.created.fetch_add(1, Ordering::Relaxed);
            info!(call_cid = %call.call_cid, lesson = %call.lesson, "video call started");
            log_security_event(
                SecurityEventType::CallStarted,
                None,
                Some(&user.id),
                None,
                None,
                Some(&call.id),
            );
            (StatusCode::CREATED, Json(call)).into_response()
        }
        // Lost a race with a concurrent start for the same lesson.
        Err(err) if db::is_active_lesson_conflict(&err) => {
            match db::find_active_call_for_lesson(&pool, &user.tenant, lesson_id).await {
                Ok(Some(existing)) => already_running(existing),
                Ok(None) => db_error("active call vanished after conflict", err),
                Err(lookup_err) => db_error("failed to check running calls", lookup_err),
            }
        }
        Err(err) => db_error("failed to create video call", err),
    }
}

pub async fn issue_token(
    State(pool): State<SqlitePool>,
    State(config): State<Arc<GatewayConfig>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = match authenticate(&pool, &headers).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let call = match load_call(&pool, &user, &id).await {
        Ok(call) => call,
        Err(resp) => return resp,
    };
    if !call.is_active() {
        return inactive_call();
    }

    let role = participant_role_for(&call, &user.id, user.role);
    match issue_join_token(&config, &call, &user.id, role, Utc::now()) {
        Ok(token) => {
            CALL_METRICS.tokens_issued.fetch_add(1, Ordering::Relaxed);
            log_security_event(
                SecurityEventType::JoinTokenIssued,
                None,
                Some(&user.id),
                None,
                None,
                Some(&call.call_cid),
            );
            (StatusCode::OK, Json(token)).into_response()
        }
        Err(err) => {
            error!("failed to sign join token: {}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Token signing failed")
        }
    }
}

async fn finish_call(
    pool: &SqlitePool,
    headers: &HeaderMap,
    id: &str,
    next: VideoCallStatus,
) -> Response {
    let user = match authenticate(pool, headers).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let call = match load_call(pool, &user, id).await {
        Ok(call) => call,
        Err(resp) => return resp,
    };
    if !is_call_host(&call, &user) {
        return forbidden(&user, "finish video call");
    }
    if !call.status.can_transition_to(next) {
        return inactive_call();
    }

    match db::finish_video_call(pool, &user.tenant, id, next).await {
        Ok(true) => {}
        // Someone else finished it between the load and the update.
        Ok(false) => return inactive_call(),
        Err(err) => return db_error("failed to finish video call", err),
    }

    let event = match next {
        VideoCallStatus::Cancelled => {
            CALL_METRICS.cancelled.fetch_add(1, Ordering::Relaxed);
            SecurityEventType::CallCancelled
        }
        _ => {
            CALL_METRICS.ended.fetch_add(1, Ordering::Relaxed);
            SecurityEventType::CallEnded
        }
    };
    info!(call_cid = %call.call_cid, status = %next, "video call finished");
    log_security_event(event, None, Some(&user.id), None, None, Some(&call.id));

    reload_call(pool, &user, id).await
}

pub async fn end_video_call(
    State(pool): State<SqlitePool>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    finish_call(&pool, &headers, &id, VideoCallStatus::Ended).await
}

pub async fn cancel_video_call(
    State(pool): State<SqlitePool>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    finish_call(&pool, &headers, &id, VideoCallStatus::Cancelled).await
}

pub async fn update_participants(
    State(pool): State<SqlitePool>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<ParticipantUpdateRequest>,
) -> Response {
    let user = match authenticate(&pool, &headers).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let call = match load_call(&pool, &user, &id).await {
        Ok(call) => call,
        Err(resp) => return resp,
    };

    match payload.action {
        ParticipantAction::Join => {
            if !call.is_active() {
                return inactive_call();
            }
            let role = participant_role_for(&call, &user.id, user.role);
            if let Err(err) = db::record_participant_join(&pool, &call.id, &user.id, role).await {
                return db_error("failed to record participant join", err);
            }
        }
        ParticipantAction::Leave => {
            match db::record_participant_leave(&pool, &call.id, &user.id).await {
                Ok(true) => {}
                Ok(false) => {
                    return error_response(StatusCode::NOT_FOUND, "Not a participant of this call")
                }
                Err(err) => return db_error("failed to record participant leave", err),
            }
        }
    }

    CALL_METRICS
        .participant_updates
        .fetch_add(1, Ordering::Relaxed);
    reload_call(&pool, &user, &id).await
}
