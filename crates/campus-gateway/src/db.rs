use anyhow::{anyhow, Context};
use campus_common::helpers::call_cid;
use campus_common::{
    Participant, ParticipantRole, UserRole, VideoCall, VideoCallQuery, VideoCallStatus,
};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::security;

const SESSION_HASH_PREFIX: &str = "h1:";

fn storage_token_for_bearer(token: &str) -> String {
    format!("{}{}", SESSION_HASH_PREFIX, security::hash_token(token))
}

/// Applies the embedded schema migrations.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to run migrations")?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub tenant: String,
    pub email: String,
    pub username: String,
    #[serde(skip)]
    pub password_hash: String,
    pub display_name: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn role(&self) -> anyhow::Result<UserRole> {
        self.role
            .parse()
            .map_err(|e| anyhow!("user {} has invalid role: {}", self.id, e))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct NewUser<'a> {
    pub tenant: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub display_name: &'a str,
    pub username: &'a str,
    pub role: UserRole,
}

#[derive(Debug, sqlx::FromRow)]
struct VideoCallRow {
    id: String,
    tenant: String,
    lesson_id: String,
    course_id: String,
    call_type: String,
    call_id: String,
    call_cid: String,
    title: String,
    status: String,
    lesson_start_at: Option<DateTime<Utc>>,
    lesson_end_at: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    created_by: String,
}

impl VideoCallRow {
    fn into_call(self, participants: Vec<Participant>) -> anyhow::Result<VideoCall> {
        let status: VideoCallStatus = self
            .status
            .parse()
            .map_err(|e| anyhow!("video call {} has invalid status: {}", self.id, e))?;
        Ok(VideoCall {
            id: self.id,
            tenant: self.tenant,
            lesson: self.lesson_id,
            course: self.course_id,
            call_type: self.call_type,
            call_id: self.call_id,
            call_cid: self.call_cid,
            title: self.title,
            status,
            lesson_start_at: self.lesson_start_at,
            lesson_end_at: self.lesson_end_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            participants,
            created_by: self.created_by,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ParticipantRow {
    user_id: String,
    role: String,
    joined_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = anyhow::Error;

    fn try_from(row: ParticipantRow) -> Result<Self, Self::Error> {
        let role: ParticipantRole = row
            .role
            .parse()
            .map_err(|e| anyhow!("participant {} has invalid role: {}", row.user_id, e))?;
        Ok(Participant {
            user: row.user_id,
            role,
            joined_at: row.joined_at,
            left_at: row.left_at,
        })
    }
}

pub struct NewVideoCall<'a> {
    pub tenant: &'a str,
    pub lesson_id: &'a str,
    pub course_id: &'a str,
    pub call_type: &'a str,
    pub title: &'a str,
    pub lesson_start_at: Option<DateTime<Utc>>,
    pub lesson_end_at: Option<DateTime<Utc>>,
    pub created_by: &'a str,
}

/// Validated filter for listing calls.
#[derive(Debug, Default)]
pub struct CallFilter {
    pub status: Option<VideoCallStatus>,
    pub course_id: Option<String>,
    pub lesson_id: Option<String>,
}

impl TryFrom<VideoCallQuery> for CallFilter {
    type Error = campus_common::Error;

    fn try_from(query: VideoCallQuery) -> Result<Self, Self::Error> {
        let status = match query.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse()?),
        };
        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Ok(Self {
            status,
            course_id: non_empty(query.course_id),
            lesson_id: non_empty(query.lesson_id),
        })
    }
}

// Users and sessions

pub async fn create_user(pool: &SqlitePool, new_user: NewUser<'_>) -> anyhow::Result<User> {
    let id = Uuid::new_v4().to_string();
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, tenant, email, password_hash, display_name, username, role, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id, tenant, email, username, password_hash, display_name, role, created_at
        "#,
    )
    .bind(&id)
    .bind(new_user.tenant)
    .bind(new_user.email)
    .bind(new_user.password_hash)
    .bind(new_user.display_name)
    .bind(new_user.username)
    .bind(new_user.role.as_str())
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(user)
}

pub async fn get_user_by_email(pool: &SqlitePool, email: &str) -> anyhow::Result<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

pub async fn create_session(
    pool: &SqlitePool,
    user_id: &str,
    ip_address: Option<String>,
    ttl_hours: i64,
) -> anyhow::Result<Session> {
    // Only a hash of the bearer token is stored.
    let mut token_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut token_bytes);
    let token = hex::encode(token_bytes);
    let stored_token = storage_token_for_bearer(&token);

    let created_at = Utc::now();
    let expires_at = created_at + chrono::Duration::hours(ttl_hours);

    sqlx::query(
        r#"
        INSERT INTO sessions (token, user_id, expires_at, ip_address, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&stored_token)
    .bind(user_id)
    .bind(expires_at)
    .bind(ip_address.clone())
    .bind(created_at)
    .execute(pool)
    .await?;

    Ok(Session {
        token,
        user_id: user_id.to_string(),
        expires_at,
        ip_address,
        created_at,
    })
}

pub async fn get_user_by_session_token(
    pool: &SqlitePool,
    token: &str,
) -> anyhow::Result<Option<User>> {
    let stored_token = storage_token_for_bearer(token);
    let user = sqlx::query_as::<_, User>(
        r#"
        SELECT u.*
        FROM sessions s
        JOIN users u ON s.user_id = u.id
        WHERE s.token = ? AND s.expires_at > ?
        "#,
    )
    .bind(stored_token)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn revoke_session(pool: &SqlitePool, token: &str) -> anyhow::Result<bool> {
    let stored_token = storage_token_for_bearer(token);
    let result = sqlx::query("DELETE FROM sessions WHERE token = ?")
        .bind(stored_token)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_expired_sessions(pool: &SqlitePool) -> anyhow::Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn count_active_sessions(pool: &SqlitePool) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE expires_at > ?")
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// Login hardening

pub async fn record_login_failure(pool: &SqlitePool, identifier: &str) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO login_failures (identifier, count, last_failure)
        VALUES (?, 1, ?)
        ON CONFLICT(identifier) DO UPDATE SET
            count = count + 1,
            last_failure = excluded.last_failure
        RETURNING count
        "#,
    )
    .bind(identifier)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn reset_login_failure(pool: &SqlitePool, identifier: &str) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM login_failures WHERE identifier = ?")
        .bind(identifier)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_login_failures(
    pool: &SqlitePool,
    identifier: &str,
) -> anyhow::Result<Option<(i64, DateTime<Utc>)>> {
    let row: Option<(i64, DateTime<Utc>)> =
        sqlx::query_as("SELECT count, last_failure FROM login_failures WHERE identifier = ?")
            .bind(identifier)
            .fetch_optional(pool)
            .await?;
    Ok(row)
}

// Video calls

/// Whether an error came from the one-active-call-per-lesson index.
pub fn is_active_lesson_conflict(err: &anyhow::Error) -> bool {
    let lower = err.to_string().to_ascii_lowercase();
    lower.contains("unique") && lower.contains("video_calls.")
}

pub async fn create_video_call(
    pool: &SqlitePool,
    new_call: NewVideoCall<'_>,
) -> anyhow::Result<VideoCall> {
    let id = Uuid::new_v4().to_string();
    let sdk_call_id = Uuid::new_v4().simple().to_string();
    let cid = call_cid(new_call.call_type, &sdk_call_id);
    let now = Utc::now();

    let row = sqlx::query_as::<_, VideoCallRow>(
        r#"
        INSERT INTO video_calls (
            id, tenant, lesson_id, course_id, call_type, call_id, call_cid, title, status,
            lesson_start_at, lesson_end_at, started_at, ended_at, created_by, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?, NULL, ?, ?)
        RETURNING id, tenant, lesson_id, course_id, call_type, call_id, call_cid, title, status,
            lesson_start_at, lesson_end_at, started_at, ended_at, created_by
        "#,
    )
    .bind(&id)
    .bind(new_call.tenant)
    .bind(new_call.lesson_id)
    .bind(new_call.course_id)
    .bind(new_call.call_type)
    .bind(&sdk_call_id)
    .bind(&cid)
    .bind(new_call.title)
    .bind(new_call.lesson_start_at)
    .bind(new_call.lesson_end_at)
    .bind(now)
    .bind(new_call.created_by)
    .bind(now)
    .fetch_one(pool)
    .await?;

    row.into_call(Vec::new())
}

pub async fn find_active_call_for_lesson(
    pool: &SqlitePool,
    tenant: &str,
    lesson_id: &str,
) -> anyhow::Result<Option<String>> {
    let id: Option<String> = sqlx::query_scalar(
        "SELECT id FROM video_calls WHERE tenant = ? AND lesson_id = ? AND status = 'active'",
    )
    .bind(tenant)
    .bind(lesson_id)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

async fn list_participants(pool: &SqlitePool, video_call_id: &str) -> anyhow::Result<Vec<Participant>> {
    let rows = sqlx::query_as::<_, ParticipantRow>(
        r#"
        SELECT user_id, role, joined_at, left_at
        FROM video_call_participants
        WHERE video_call_id = ?
        ORDER BY joined_at ASC, user_id ASC
        "#,
    )
    .bind(video_call_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Participant::try_from).collect()
}

pub async fn get_video_call(
    pool: &SqlitePool,
    tenant: &str,
    id: &str,
) -> anyhow::Result<Option<VideoCall>> {
    let row = sqlx::query_as::<_, VideoCallRow>(
        r#"
        SELECT id, tenant, lesson_id, course_id, call_type, call_id, call_cid, title, status,
            lesson_start_at, lesson_end_at, started_at, ended_at, created_by
        FROM video_calls
        WHERE tenant = ? AND id = ?
        "#,
    )
    .bind(tenant)
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let participants = list_participants(pool, &row.id).await?;
            Ok(Some(row.into_call(participants)?))
        }
        None => Ok(None),
    }
}

pub async fn list_video_calls(
    pool: &SqlitePool,
    tenant: &str,
    filter: &CallFilter,
) -> anyhow::Result<Vec<VideoCall>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        r#"
        SELECT id, tenant, lesson_id, course_id, call_type, call_id, call_cid, title, status,
            lesson_start_at, lesson_end_at, started_at, ended_at, created_by
        FROM video_calls
        WHERE tenant = "#,
    );
    builder.push_bind(tenant);
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(course_id) = &filter.course_id {
        builder.push(" AND course_id = ").push_bind(course_id.as_str());
    }
    if let Some(lesson_id) = &filter.lesson_id {
        builder.push(" AND lesson_id = ").push_bind(lesson_id.as_str());
    }
    builder.push(" ORDER BY created_at DESC, id DESC");

    let rows = builder
        .build_query_as::<VideoCallRow>()
        .fetch_all(pool)
        .await?;

    let mut calls = Vec::with_capacity(rows.len());
    for row in rows {
        let participants = list_participants(pool, &row.id).await?;
        calls.push(row.into_call(participants)?);
    }
    Ok(calls)
}

/// Moves an `active` call to `next` and closes every open participant entry.
///
/// Returns `false` when the call was not `active` (nothing is written).
pub async fn finish_video_call(
    pool: &SqlitePool,
    tenant: &str,
    id: &str,
    next: VideoCallStatus,
) -> anyhow::Result<bool> {
    if !VideoCallStatus::Active.can_transition_to(next) {
        return Err(anyhow!("illegal call status transition to {}", next));
    }

    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let result = sqlx::query(
        "UPDATE video_calls SET status = ?, ended_at = ? WHERE tenant = ? AND id = ? AND status = 'active'",
    )
    .bind(next.as_str())
    .bind(now)
    .bind(tenant)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        "UPDATE video_call_participants SET left_at = ? WHERE video_call_id = ? AND left_at IS NULL",
    )
    .bind(now)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Records `user_id` as present in the call, re-opening an earlier entry.
pub async fn record_participant_join(
    pool: &SqlitePool,
    video_call_id: &str,
    user_id: &str,
    role: ParticipantRole,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO video_call_participants (video_call_id, user_id, role, joined_at, left_at)
        VALUES (?, ?, ?, ?, NULL)
        ON CONFLICT(video_call_id, user_id) DO UPDATE SET
            role = excluded.role,
            joined_at = excluded.joined_at,
            left_at = NULL
        "#,
    )
    .bind(video_call_id)
    .bind(user_id)
    .bind(role.as_str())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Marks the caller's entry as left. Returns `false` if they never joined.
pub async fn record_participant_leave(
    pool: &SqlitePool,
    video_call_id: &str,
    user_id: &str,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE video_call_participants
        SET left_at = COALESCE(left_at, ?)
        WHERE video_call_id = ? AND user_id = ?
        "#,
    )
    .bind(Utc::now())
    .bind(video_call_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_active_calls(pool: &SqlitePool) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM video_calls WHERE status = 'active'")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
