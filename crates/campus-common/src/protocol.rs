use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Error text returned by the gateway when a call is no longer `active`.
///
/// The client matches on [`INACTIVE_CALL_MARKER`] to tell this benign race apart
/// from a genuine failure.
pub const INACTIVE_CALL_ERROR: &str = "Video call is not active";

/// Substring identifying an inactive-call error in any message.
pub const INACTIVE_CALL_MARKER: &str = "is not active";

/// Lifecycle status of a persisted video call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCallStatus {
    Active,
    Ended,
    Cancelled,
}

impl VideoCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Cancelled => "cancelled",
        }
    }

    /// Only `active -> ended` and `active -> cancelled` are legal.
    pub fn can_transition_to(&self, next: VideoCallStatus) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Ended) | (Self::Active, Self::Cancelled)
        )
    }
}

impl fmt::Display for VideoCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoCallStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::validation(format!("unknown call status: {other}"))),
        }
    }
}

/// Role of a participant inside one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    Cohost,
    Participant,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Cohost => "cohost",
            Self::Participant => "participant",
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParticipantRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "cohost" => Ok(Self::Cohost),
            "participant" => Ok(Self::Participant),
            other => Err(Error::validation(format!("unknown participant role: {other}"))),
        }
    }
}

/// Account-level role inside a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Professor,
    Student,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Professor => "professor",
            Self::Student => "student",
        }
    }

    /// Professors and admins may start calls for a lesson.
    pub fn can_start_calls(&self) -> bool {
        matches!(self, Self::Admin | Self::Professor)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "professor" => Ok(Self::Professor),
            "student" => Ok(Self::Student),
            other => Err(Error::validation(format!("unknown user role: {other}"))),
        }
    }
}

/// One user's presence record inside a call. Entries are appended or updated,
/// never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn is_present(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Server-persisted video call record tied to a lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCall {
    pub id: String,
    pub tenant: String,
    pub lesson: String,
    pub course: String,
    pub call_type: String,
    pub call_id: String,
    pub call_cid: String,
    pub title: String,
    pub status: VideoCallStatus,
    #[serde(default)]
    pub lesson_start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lesson_end_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    pub created_by: String,
}

impl VideoCall {
    pub fn is_active(&self) -> bool {
        self.status == VideoCallStatus::Active
    }

    pub fn present_participants(&self) -> usize {
        self.participants.iter().filter(|p| p.is_present()).count()
    }
}

/// Credential issued by `POST /video-calls/:id/token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCallTokenResponse {
    pub token: String,
    pub api_key: String,
    pub user_id: String,
    pub call_type: String,
    pub call_id: String,
    pub call_cid: String,
    pub role: ParticipantRole,
    pub expires_at: DateTime<Utc>,
}

/// Body of `POST /video-calls`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVideoCallRequest {
    pub lesson_id: String,
    pub course_id: String,
    pub title: String,
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub lesson_start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lesson_end_at: Option<DateTime<Utc>>,
}

/// Query string of `GET /video-calls`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCallQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<String>,
}

/// What a participant update records for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    Join,
    Leave,
}

/// Body of `PUT /video-calls/:id/participants`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantUpdateRequest {
    pub action: ParticipantAction,
}

/// Body of `POST /auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Public view of an authenticated account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: String,
    pub tenant: String,
    pub email: String,
    pub username: String,
    pub display_name: String,
    pub role: UserRole,
}

/// Payload returned by register and login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: AccountInfo,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Error body used by every gateway endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_call_id: Option<String>,
}

/// Whether an error message describes a call that became inactive mid-request.
pub fn is_inactive_call_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains(INACTIVE_CALL_MARKER)
}
