use std::net::SocketAddr;

use anyhow::{anyhow, Context};
use tracing::warn;

const MIN_VIDEO_SECRET_BYTES: usize = 32;

pub(crate) fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

pub(crate) fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Runtime settings for the gateway, read once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub allow_public_bind: bool,
    /// Public key identifying this deployment to the video SDK.
    pub video_api_key: String,
    /// Secret used to sign join tokens.
    pub video_api_secret: String,
    pub video_token_ttl_secs: u64,
    pub session_ttl_hours: i64,
}

impl GatewayConfig {
    /// Settings with the given SDK credentials and every other field at its default.
    pub fn with_video_credentials(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            database_url: "sqlite:campus.db".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            allow_public_bind: false,
            video_api_key: api_key.into(),
            video_api_secret: api_secret.into(),
            video_token_ttl_secs: 3600,
            session_ttl_hours: 24,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:campus.db".to_string());

        let bind_addr: SocketAddr = std::env::var("CAMPUS_GATEWAY_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .context("CAMPUS_GATEWAY_BIND_ADDR must be host:port")?;

        let video_api_key = std::env::var("CAMPUS_VIDEO_API_KEY").unwrap_or_default();
        if video_api_key.trim().is_empty() {
            warn!("CAMPUS_VIDEO_API_KEY is empty; clients will not be able to reach the video SDK");
        }

        let video_api_secret = std::env::var("CAMPUS_VIDEO_API_SECRET").unwrap_or_default();
        if video_api_secret.len() < MIN_VIDEO_SECRET_BYTES {
            if !env_bool("CAMPUS_ALLOW_INSECURE_VIDEO_SECRET", false) {
                return Err(anyhow!(
                    "CAMPUS_VIDEO_API_SECRET must be at least {} bytes unless CAMPUS_ALLOW_INSECURE_VIDEO_SECRET=1",
                    MIN_VIDEO_SECRET_BYTES
                ));
            }
            warn!("signing join tokens with a short video secret (NOT FOR PRODUCTION)");
        }

        Ok(Self {
            database_url,
            bind_addr,
            allow_public_bind: env_bool("CAMPUS_ALLOW_PUBLIC_BIND", false),
            video_api_key,
            video_api_secret,
            video_token_ttl_secs: env_u64("CAMPUS_VIDEO_TOKEN_TTL_SECS", 3600).max(60),
            session_ttl_hours: env_u64("CAMPUS_SESSION_TTL_HOURS", 24).clamp(1, 24 * 30) as i64,
        })
    }

    pub fn check_public_bind_allowed(&self) -> anyhow::Result<()> {
        if self.bind_addr.ip().is_loopback() || self.allow_public_bind {
            return Ok(());
        }
        Err(anyhow!(
            "refusing non-loopback bind without CAMPUS_ALLOW_PUBLIC_BIND=1"
        ))
    }
}
