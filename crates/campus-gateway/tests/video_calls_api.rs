//! End-to-end tests for the `/video-calls` API.
//!
//! Each test builds the real router over an in-memory database and drives it
//! with `oneshot`, so the auth, validation and persistence layers are all
//! exercised together.

use std::net::SocketAddr;

use axum::{
    body::{to_bytes, Body},
    extract::connect_info::MockConnectInfo,
    http::{Method, Request, StatusCode},
    Router,
};
use campus_common::{
    AccountInfo, AuthResponse, ParticipantRole, VideoCall, VideoCallStatus, VideoCallTokenResponse,
};
use campus_gateway::{build_router, call_token::JoinClaims, db, AppState, GatewayConfig};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde_json::{json, Value};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tower::ServiceExt;

const VIDEO_SECRET: &str = "test-video-secret-0123456789abcdef";
const PASSWORD: &str = "correct horse battery staple";

async fn setup_test_db() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");
    db::migrate(&pool).await.expect("Failed to run migrations");
    pool
}

struct TestApp {
    router: Router,
    pool: SqlitePool,
}

impl TestApp {
    /// `octet` keeps each test on its own rate-limit keys.
    async fn new(octet: u8) -> Self {
        let pool = setup_test_db().await;
        let config = GatewayConfig::with_video_credentials("test-api-key", VIDEO_SECRET);
        let router = build_router(AppState::new(pool.clone(), config))
            .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, octet], 40000))));
        Self { router, pool }
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn register(&self, username: &str, tenant: &str, role: &str) -> AuthResponse {
        let (status, body) = self
            .request(
                Method::POST,
                "/auth/register",
                None,
                Some(json!({
                    "email": format!("{username}@{tenant}.edu"),
                    "password": PASSWORD,
                    "display_name": username,
                    "username": username,
                    "tenant": tenant,
                    "role": role,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "register failed: {body}");
        serde_json::from_value(body).unwrap()
    }

    async fn start_call(&self, token: &str, lesson: &str) -> (StatusCode, Value) {
        self.request(
            Method::POST,
            "/video-calls",
            Some(token),
            Some(json!({
                "lessonId": lesson,
                "courseId": "course-1",
                "title": format!("Lesson {lesson}"),
            })),
        )
        .await
    }

    async fn started_call(&self, token: &str, lesson: &str) -> VideoCall {
        let (status, body) = self.start_call(token, lesson).await;
        assert_eq!(status, StatusCode::CREATED, "start failed: {body}");
        serde_json::from_value(body).unwrap()
    }
}

#[tokio::test]
async fn test_requests_without_session_are_rejected() {
    let app = TestApp::new(1).await;
    let (status, body) = app.request(Method::GET, "/video-calls", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _) = app
        .request(Method::GET, "/video-calls", Some(&"x".repeat(64)), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_professor_starts_call_and_students_see_it() {
    let app = TestApp::new(2).await;
    let prof = app.register("prof_a", "uni", "professor").await;
    let student = app.register("student_a", "uni", "student").await;

    let call = app.started_call(&prof.token, "lesson-1").await;
    assert_eq!(call.status, VideoCallStatus::Active);
    assert_eq!(call.lesson, "lesson-1");
    assert_eq!(call.call_cid, format!("{}:{}", call.call_type, call.call_id));
    assert_eq!(call.created_by, prof.user.id);
    assert!(call.participants.is_empty());

    let (status, body) = app
        .request(Method::GET, "/video-calls?status=active", Some(&student.token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let calls: Vec<VideoCall> = serde_json::from_value(body).unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, call.id);

    let (status, body) = app
        .request(
            Method::GET,
            &format!("/video-calls/{}", call.id),
            Some(&student.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], call.id);
    assert_eq!(body["status"], "active");
}

#[tokio::test]
async fn test_students_cannot_start_calls() {
    let app = TestApp::new(3).await;
    let student = app.register("student_b", "uni", "student").await;

    let (status, _) = app.start_call(&student.token, "lesson-1").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_second_call_for_same_lesson_conflicts() {
    let app = TestApp::new(4).await;
    let prof = app.register("prof_c", "uni", "professor").await;
    let other = app.register("prof_d", "uni", "professor").await;

    let first = app.started_call(&prof.token, "lesson-9").await;
    let (status, body) = app.start_call(&other.token, "lesson-9").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "A video call is already running for this lesson");
    assert_eq!(body["videoCallId"], first.id);

    // A different lesson is unaffected.
    app.started_call(&other.token, "lesson-10").await;

    // Once the first call ends, the lesson can host a new one.
    let (status, _) = app
        .request(
            Method::POST,
            &format!("/video-calls/{}/end", first.id),
            Some(&prof.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    app.started_call(&other.token, "lesson-9").await;
}

#[tokio::test]
async fn test_calls_are_tenant_scoped() {
    let app = TestApp::new(5).await;
    let prof = app.register("prof_e", "north", "professor").await;
    let outsider = app.register("student_e", "south", "student").await;

    let call = app.started_call(&prof.token, "lesson-1").await;

    let (status, _) = app
        .request(
            Method::GET,
            &format!("/video-calls/{}", call.id),
            Some(&outsider.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .request(Method::GET, "/video-calls", Some(&outsider.token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = app
        .request(
            Method::POST,
            &format!("/video-calls/{}/token", call.id),
            Some(&outsider.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_filters_and_rejects_unknown_status() {
    let app = TestApp::new(6).await;
    let prof = app.register("prof_f", "uni", "professor").await;

    let first = app.started_call(&prof.token, "lesson-1").await;
    let second = app.started_call(&prof.token, "lesson-2").await;
    app.request(
        Method::POST,
        &format!("/video-calls/{}/cancel", first.id),
        Some(&prof.token),
        None,
    )
    .await;

    let (status, body) = app
        .request(Method::GET, "/video-calls", Some(&prof.token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let all: Vec<VideoCall> = serde_json::from_value(body).unwrap();
    let ids: Vec<&str> = all.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);

    let (_, body) = app
        .request(
            Method::GET,
            "/video-calls?status=cancelled",
            Some(&prof.token),
            None,
        )
        .await;
    let cancelled: Vec<VideoCall> = serde_json::from_value(body).unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, first.id);

    let (_, body) = app
        .request(
            Method::GET,
            "/video-calls?lessonId=lesson-2",
            Some(&prof.token),
            None,
        )
        .await;
    let by_lesson: Vec<VideoCall> = serde_json::from_value(body).unwrap();
    assert_eq!(by_lesson.len(), 1);
    assert_eq!(by_lesson[0].id, second.id);

    let (status, _) = app
        .request(Method::GET, "/video-calls?status=paused", Some(&prof.token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_join_token_roles_and_claims() {
    let app = TestApp::new(7).await;
    let host = app.register("prof_g", "uni", "professor").await;
    let cohost = app.register("prof_h", "uni", "professor").await;
    let student = app.register("student_g", "uni", "student").await;
    let call = app.started_call(&host.token, "lesson-1").await;

    let uri = format!("/video-calls/{}/token", call.id);
    for (session, expected) in [
        (&host, ParticipantRole::Host),
        (&cohost, ParticipantRole::Cohost),
        (&student, ParticipantRole::Participant),
    ] {
        let (status, body) = app
            .request(Method::POST, &uri, Some(&session.token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let issued: VideoCallTokenResponse = serde_json::from_value(body).unwrap();
        assert_eq!(issued.role, expected);
        assert_eq!(issued.user_id, session.user.id);
        assert_eq!(issued.call_cid, call.call_cid);
        assert_eq!(issued.api_key, "test-api-key");

        let claims = decode::<JoinClaims>(
            &issued.token,
            &DecodingKey::from_secret(VIDEO_SECRET.as_bytes()),
            &Validation::default(),
        )
        .unwrap()
        .claims;
        assert_eq!(claims.call_cids, vec![call.call_cid.clone()]);
        assert_eq!(claims.exp, issued.expires_at.timestamp());
    }
}

#[tokio::test]
async fn test_token_for_finished_call_is_refused() {
    let app = TestApp::new(8).await;
    let prof = app.register("prof_i", "uni", "professor").await;
    let student = app.register("student_i", "uni", "student").await;
    let call = app.started_call(&prof.token, "lesson-1").await;

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/video-calls/{}/end", call.id),
            Some(&prof.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ended");
    assert!(body["endedAt"].is_string());

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/video-calls/{}/token", call.id),
            Some(&student.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Video call is not active");
}

#[tokio::test]
async fn test_only_host_can_end_and_ending_twice_conflicts() {
    let app = TestApp::new(9).await;
    let host = app.register("prof_j", "uni", "professor").await;
    let cohost = app.register("prof_k", "uni", "professor").await;
    let student = app.register("student_j", "uni", "student").await;
    let call = app.started_call(&host.token, "lesson-1").await;
    let end_uri = format!("/video-calls/{}/end", call.id);

    let (status, _) = app
        .request(Method::POST, &end_uri, Some(&student.token), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app
        .request(Method::POST, &end_uri, Some(&cohost.token), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .request(Method::POST, &end_uri, Some(&host.token), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .request(Method::POST, &end_uri, Some(&host.token), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = app
        .request(
            Method::POST,
            &format!("/video-calls/{}/cancel", call.id),
            Some(&host.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_participant_presence_lifecycle() {
    let app = TestApp::new(10).await;
    let prof = app.register("prof_l", "uni", "professor").await;
    let student = app.register("student_l", "uni", "student").await;
    let call = app.started_call(&prof.token, "lesson-1").await;
    let uri = format!("/video-calls/{}/participants", call.id);

    // Leaving before ever joining is a 404.
    let (status, _) = app
        .request(
            Method::PUT,
            &uri,
            Some(&student.token),
            Some(json!({"action": "leave"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .request(
            Method::PUT,
            &uri,
            Some(&student.token),
            Some(json!({"action": "join"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let updated: VideoCall = serde_json::from_value(body).unwrap();
    assert_eq!(updated.present_participants(), 1);
    assert_eq!(updated.participants[0].user, student.user.id);
    assert_eq!(updated.participants[0].role, ParticipantRole::Participant);

    // Ending the call closes every open entry.
    let (status, body) = app
        .request(
            Method::POST,
            &format!("/video-calls/{}/end", call.id),
            Some(&prof.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let ended: VideoCall = serde_json::from_value(body).unwrap();
    assert_eq!(ended.present_participants(), 0);
    assert!(ended.participants[0].left_at.is_some());

    // Leave stays valid after the call ended; join does not.
    let (status, _) = app
        .request(
            Method::PUT,
            &uri,
            Some(&student.token),
            Some(json!({"action": "leave"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app
        .request(
            Method::PUT,
            &uri,
            Some(&student.token),
            Some(json!({"action": "join"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Video call is not active");
}

#[tokio::test]
async fn test_admin_accounts_cannot_self_register() {
    let app = TestApp::new(11).await;
    let (status, _) = app
        .request(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({
                "email": "root@uni.edu",
                "password": PASSWORD,
                "display_name": "Root",
                "username": "root",
                "tenant": "uni",
                "role": "admin",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health_reports_active_calls() {
    let app = TestApp::new(12).await;
    let prof = app.register("prof_m", "uni", "professor").await;
    app.started_call(&prof.token, "lesson-1").await;

    let (status, body) = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_video_calls"], 1);
    assert_eq!(body["active_sessions"], 1);

    assert_eq!(db::count_active_calls(&app.pool).await.unwrap(), 1);
}

#[tokio::test]
async fn test_login_and_logout_round_trip() {
    let app = TestApp::new(13).await;
    let registered = app.register("prof_n", "uni", "professor").await;

    let (status, body) = app
        .request(
            Method::POST,
            "/auth/login",
            None,
            Some(json!({"email": "prof_n@uni.edu", "password": PASSWORD})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let login: AuthResponse = serde_json::from_value(body).unwrap();
    assert_eq!(login.user.id, registered.user.id);

    let (status, body) = app
        .request(Method::GET, "/auth/me", Some(&login.token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let account: AccountInfo = serde_json::from_value(body).unwrap();
    assert_eq!(account, login.user);

    let (status, body) = app
        .request(Method::POST, "/auth/logout", Some(&login.token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], true);

    let (status, _) = app
        .request(Method::GET, "/video-calls", Some(&login.token), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = app
        .request(Method::GET, "/auth/me", Some(&login.token), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
