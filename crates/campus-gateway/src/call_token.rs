//! Join tokens for the external video SDK.
//!
//! Tokens are HS256 JWTs signed with the deployment's video API secret. They
//! authorise exactly one call cid for one user until `exp`.

use campus_common::{ParticipantRole, UserRole, VideoCall, VideoCallTokenResponse};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::config::GatewayConfig;

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinClaims {
    pub user_id: String,
    pub call_cids: Vec<String>,
    pub role: ParticipantRole,
    pub iat: i64,
    pub exp: i64,
}

/// Role a caller takes inside `call`.
///
/// The creator and tenant admins host; other professors co-host; everyone else
/// participates.
pub fn participant_role_for(call: &VideoCall, user_id: &str, user_role: UserRole) -> ParticipantRole {
    if call.created_by == user_id || user_role == UserRole::Admin {
        ParticipantRole::Host
    } else if user_role == UserRole::Professor {
        ParticipantRole::Cohost
    } else {
        ParticipantRole::Participant
    }
}

pub fn issue_join_token(
    config: &GatewayConfig,
    call: &VideoCall,
    user_id: &str,
    role: ParticipantRole,
    now: DateTime<Utc>,
) -> anyhow::Result<VideoCallTokenResponse> {
    let expires_at = now + Duration::seconds(config.video_token_ttl_secs as i64);
    let claims = JoinClaims {
        user_id: user_id.to_string(),
        call_cids: vec![call.call_cid.clone()],
        role,
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.video_api_secret.as_bytes()),
    )?;

    Ok(VideoCallTokenResponse {
        token,
        api_key: config.video_api_key.clone(),
        user_id: user_id.to_string(),
        call_type: call.call_type.clone(),
        call_id: call.call_id.clone(),
        call_cid: call.call_cid.clone(),
        role,
        expires_at,
    })
}
