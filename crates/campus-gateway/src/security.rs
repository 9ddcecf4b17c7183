use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

use axum::http::{HeaderMap, HeaderValue};
use sha2::{Digest, Sha256};

use crate::config::{env_bool, env_u32, env_usize};

const DEFAULT_ALLOWED_ORIGINS: [&str; 4] = [
    "http://localhost:5173",
    "http://127.0.0.1:5173",
    "http://localhost:3000",
    "http://127.0.0.1:3000",
];

#[derive(Clone, Copy)]
struct RateEntry {
    count: u32,
    window_start: Instant,
}

pub struct FixedWindowRateLimiter {
    max_requests: u32,
    window: Duration,
    max_keys: usize,
    entries: Mutex<HashMap<String, RateEntry>>,
}

impl FixedWindowRateLimiter {
    pub fn new(max_requests: u32, window: Duration, max_keys: usize) -> Self {
        Self {
            max_requests,
            window,
            max_keys,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut guard = match self.entries.lock() {
            Ok(v) => v,
            Err(_) => return false,
        };

        if guard.len() > self.max_keys {
            guard.retain(|_, entry| now.duration_since(entry.window_start) < self.window);
            if guard.len() > self.max_keys {
                return false;
            }
        }

        let entry = guard.entry(key.to_string()).or_insert(RateEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count = entry.count.saturating_add(1);
        entry.count <= self.max_requests
    }
}

static AUTH_LIMITER: OnceLock<FixedWindowRateLimiter> = OnceLock::new();
static API_LIMITER: OnceLock<FixedWindowRateLimiter> = OnceLock::new();
static ALLOWED_ORIGINS: OnceLock<HashSet<String>> = OnceLock::new();

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn load_allowed_origins() -> HashSet<String> {
    let configured = std::env::var("CAMPUS_ALLOWED_ORIGINS").unwrap_or_default();
    let mut set: HashSet<String> = configured
        .split(',')
        .map(normalize_origin)
        .filter(|v| !v.is_empty())
        .collect();

    if set.is_empty() {
        for value in DEFAULT_ALLOWED_ORIGINS {
            set.insert(normalize_origin(value));
        }
    }

    set
}

pub fn cors_allow_any() -> bool {
    env_bool("CAMPUS_CORS_ALLOW_ANY", false)
}

pub fn cors_origin_values() -> Vec<HeaderValue> {
    let set = ALLOWED_ORIGINS.get_or_init(load_allowed_origins);
    set.iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}

/// Client address used for rate limiting and audit records.
///
/// `X-Forwarded-For` is honoured only when `CAMPUS_TRUST_PROXY_HEADERS=1`, since
/// any client can set it.
pub fn effective_client_ip(headers: &HeaderMap, direct_addr: SocketAddr) -> IpAddr {
    if env_bool("CAMPUS_TRUST_PROXY_HEADERS", false) {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| raw.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    direct_addr.ip()
}

pub fn allow_auth_request(key: &str) -> bool {
    AUTH_LIMITER
        .get_or_init(|| {
            FixedWindowRateLimiter::new(
                env_u32("CAMPUS_AUTH_RATE_LIMIT", 20),
                Duration::from_secs(env_u32("CAMPUS_AUTH_RATE_WINDOW_SECS", 60).max(1) as u64),
                env_usize("CAMPUS_AUTH_RATE_MAX_KEYS", 10_000),
            )
        })
        .allow(key)
}

pub fn allow_api_request(key: &str) -> bool {
    API_LIMITER
        .get_or_init(|| {
            FixedWindowRateLimiter::new(
                env_u32("CAMPUS_API_RATE_LIMIT", 600),
                Duration::from_secs(env_u32("CAMPUS_API_RATE_WINDOW_SECS", 60).max(1) as u64),
                env_usize("CAMPUS_API_RATE_MAX_KEYS", 50_000),
            )
        })
        .allow(key)
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn is_valid_email(email: &str) -> bool {
    if email.len() > 254 || email.contains(char::is_whitespace) {
        return false;
    }
    let mut parts = email.split('@');
    let Some(local) = parts.next() else {
        return false;
    };
    let Some(domain) = parts.next() else {
        return false;
    };
    if parts.next().is_some() {
        return false;
    }
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

pub fn is_valid_username(username: &str) -> bool {
    let len = username.len();
    if !(3..=32).contains(&len) {
        return false;
    }
    username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

pub fn is_valid_display_name(display_name: &str) -> bool {
    let len = display_name.trim().len();
    (1..=64).contains(&len) && display_name.chars().all(|c| !c.is_control())
}

pub fn is_valid_password(password: &str) -> bool {
    let len = password.len();
    (12..=128).contains(&len)
}

pub fn is_valid_tenant(tenant: &str) -> bool {
    let len = tenant.len();
    (1..=64).contains(&len)
        && tenant
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Opaque identifiers supplied by clients (lesson ids, course ids, record ids).
pub fn is_valid_reference_id(id: &str) -> bool {
    let len = id.len();
    (1..=128).contains(&len) && id.chars().all(|c| !c.is_control() && !c.is_whitespace())
}

pub fn is_valid_call_title(title: &str) -> bool {
    let len = title.trim().len();
    (1..=200).contains(&len) && title.chars().all(|c| !c.is_control())
}

pub fn is_valid_session_token(token: &str) -> bool {
    let len = token.len();
    (32..=256).contains(&len)
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_window() {
        let limiter = FixedWindowRateLimiter::new(2, Duration::from_secs(60), 100);
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        assert!(limiter.allow("other"));
    }

    #[test]
    fn test_rate_limiter_rejects_when_key_table_full() {
        let limiter = FixedWindowRateLimiter::new(10, Duration::from_secs(60), 1);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("c"));
    }

    #[test]
    fn test_hash_token_is_sha256_hex() {
        let hash = hash_token("token");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("token"));
        assert_ne!(hash, hash_token("token2"));
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("prof@uni.edu"));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("a@b@c.d"));
        assert!(!is_valid_email("user@.edu"));
        assert!(!is_valid_email("us er@uni.edu"));
    }

    #[test]
    fn test_tenant_validation() {
        assert!(is_valid_tenant("north-campus"));
        assert!(is_valid_tenant("uni2"));
        assert!(!is_valid_tenant("Upper"));
        assert!(!is_valid_tenant(""));
        assert!(!is_valid_tenant("has space"));
    }

    #[test]
    fn test_reference_and_title_validation() {
        assert!(is_valid_reference_id("lesson-42"));
        assert!(!is_valid_reference_id("lesson 42"));
        assert!(!is_valid_reference_id(""));
        assert!(is_valid_call_title("Week 3: Graphs"));
        assert!(!is_valid_call_title("   "));
        assert!(!is_valid_call_title(&"t".repeat(201)));
    }

    #[test]
    fn test_direct_addr_used_without_proxy_trust() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.9"));
        let direct = SocketAddr::from(([192, 168, 1, 5], 5555));
        assert_eq!(effective_client_ip(&headers, direct), direct.ip());
    }
}
