//! Boundary to the third-party video SDK.
//!
//! The SDK is opaque: signalling and media transport live behind these traits.
//! The call core only needs to connect a client, address a call by type and id,
//! join or leave it and drive the local media toggles. [`loopback`] provides an
//! in-process implementation for the CLI and for tests.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use campus_common::ParticipantRole;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod loopback;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdkError {
    #[error("participant is already joined to call {0}")]
    AlreadyJoined(String),
    #[error("call {0} is not joined")]
    NotJoined(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("{0}")]
    Rejected(String),
}

impl SdkError {
    /// The SDK already counts this participant as in the call.
    pub fn is_already_joined(&self) -> bool {
        match self {
            Self::AlreadyJoined(_) => true,
            other => other.to_string().to_ascii_lowercase().contains("already"),
        }
    }
}

/// Identity the SDK client is connected as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkUser {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMember {
    pub user_id: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOptions {
    /// Create the call on the SDK side if it does not exist yet.
    pub create: bool,
    pub members: Vec<CallMember>,
}

impl JoinOptions {
    /// Hosts create the call and register themselves as its admin member.
    pub fn for_role(role: ParticipantRole, user_id: &str) -> Self {
        if role.is_host() {
            Self {
                create: true,
                members: vec![CallMember {
                    user_id: user_id.to_string(),
                    role: "admin".to_string(),
                }],
            }
        } else {
            Self::default()
        }
    }
}

/// A local display-media stream ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayStream {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    Like,
    RaiseHand,
    Applause,
    Laugh,
}

impl Reaction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::RaiseHand => "raise_hand",
            Self::Applause => "applause",
            Self::Laugh => "laugh",
        }
    }
}

impl fmt::Display for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reaction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "like" => Ok(Self::Like),
            "raise_hand" | "hand" => Ok(Self::RaiseHand),
            "applause" | "clap" => Ok(Self::Applause),
            "laugh" => Ok(Self::Laugh),
            other => Err(format!("unknown reaction: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkParticipant {
    pub user_id: String,
    pub session_id: String,
    pub is_local: bool,
}

#[async_trait]
pub trait VideoSdk: Send + Sync {
    /// Connect a client for `user`, authorised by a server-issued join token.
    async fn connect(
        &self,
        api_key: &str,
        user: SdkUser,
        token: &str,
    ) -> Result<Arc<dyn VideoClient>, SdkError>;
}

#[async_trait]
pub trait VideoClient: Send + Sync {
    fn user_id(&self) -> &str;

    /// Handle for a call; repeated lookups of the same call share state.
    fn call(&self, call_type: &str, call_id: &str) -> Arc<dyn CallHandle>;

    async fn disconnect(&self) -> Result<(), SdkError>;
}

#[async_trait]
pub trait CallHandle: Send + Sync {
    fn cid(&self) -> String;

    /// Whether the SDK reports a live session for this call.
    fn is_joined(&self) -> bool;

    async fn join(&self, options: JoinOptions) -> Result<(), SdkError>;
    async fn leave(&self) -> Result<(), SdkError>;

    async fn enable_camera(&self) -> Result<(), SdkError>;
    async fn disable_camera(&self) -> Result<(), SdkError>;
    fn camera_enabled(&self) -> bool;

    async fn enable_microphone(&self) -> Result<(), SdkError>;
    async fn disable_microphone(&self) -> Result<(), SdkError>;
    fn microphone_enabled(&self) -> bool;

    async fn publish_screen_share(&self, stream: DisplayStream) -> Result<(), SdkError>;
    async fn stop_screen_share(&self) -> Result<(), SdkError>;
    fn screen_share_enabled(&self) -> bool;

    async fn send_reaction(&self, reaction: Reaction) -> Result<(), SdkError>;

    fn participants(&self) -> Vec<SdkParticipant>;
}

/// Source of local display-media streams (the browser's screen picker).
#[async_trait]
pub trait DisplayCapture: Send + Sync {
    /// Denial or dismissal of the picker is an error.
    async fn acquire(&self) -> Result<DisplayStream, SdkError>;
}
