/// Security audit logging for authentication, authorization and call lifecycle events
use std::net::IpAddr;
use tracing::{error, info, warn};

/// Security and operational event types for audit logging
#[derive(Debug, Clone, Copy)]
pub enum SecurityEventType {
    /// Successful login
    LoginSuccess,
    /// Failed login attempt
    LoginFailure,
    /// Account registration
    Registration,
    /// Session logout
    Logout,
    /// Rate limit exceeded
    RateLimitExceeded,
    /// Invalid/malformed request
    ValidationError,
    /// Authenticated caller attempted an operation their role does not allow
    AccessDenied,
    /// Database error during an audited operation
    DatabaseError,
    /// A professor or admin started a call for a lesson
    CallStarted,
    /// A host ended a call for everyone
    CallEnded,
    /// A host cancelled a call
    CallCancelled,
    /// A join token was issued for a call
    JoinTokenIssued,
}

impl SecurityEventType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::LoginSuccess => "LOGIN_SUCCESS",
            Self::LoginFailure => "LOGIN_FAILURE",
            Self::Registration => "REGISTRATION",
            Self::Logout => "LOGOUT",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::CallStarted => "CALL_STARTED",
            Self::CallEnded => "CALL_ENDED",
            Self::CallCancelled => "CALL_CANCELLED",
            Self::JoinTokenIssued => "JOIN_TOKEN_ISSUED",
        }
    }
}

/// Reason codes for failures
#[derive(Debug, Clone, Copy)]
pub enum FailureReason {
    /// User account not found
    UserNotFound,
    /// Invalid password provided
    InvalidPassword,
    /// Account locked after repeated failures
    AccountLocked,
    /// Role does not permit the operation
    InsufficientRole,
    /// Rate limit exceeded for IP or user
    RateLimited,
    /// Invalid input format
    InvalidInput,
    /// Database or internal error
    InternalError,
}

impl FailureReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::InvalidPassword => "INVALID_PASSWORD",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::InsufficientRole => "INSUFFICIENT_ROLE",
            Self::RateLimited => "RATE_LIMITED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Log a security event for audit purposes.
///
/// Entries go to the `security_audit` target so they can be routed separately
/// with `RUST_LOG=security_audit=info`.
pub fn log_security_event(
    event_type: SecurityEventType,
    client_ip: Option<IpAddr>,
    user_id: Option<&str>,
    email: Option<&str>,
    reason: Option<FailureReason>,
    additional_context: Option<&str>,
) {
    let event_str = event_type.as_str();
    let reason_str = reason.map(|r| r.as_str());

    match event_type {
        SecurityEventType::LoginSuccess => {
            info!(
                target: "security_audit",
                event = event_str,
                client_ip = ?client_ip,
                user_id = user_id,
                email = email,
                "Authentication successful"
            );
        }
        SecurityEventType::LoginFailure => {
            warn!(
                target: "security_audit",
                event = event_str,
                client_ip = ?client_ip,
                user_id = user_id,
                email = email,
                reason = reason_str,
                context = additional_context,
                "Authentication failed"
            );
        }
        SecurityEventType::Registration => {
            info!(
                target: "security_audit",
                event = event_str,
                client_ip = ?client_ip,
                user_id = user_id,
                email = email,
                "User registration"
            );
        }
        SecurityEventType::Logout => {
            info!(
                target: "security_audit",
                event = event_str,
                client_ip = ?client_ip,
                user_id = user_id,
                "Session logout"
            );
        }
        SecurityEventType::RateLimitExceeded => {
            warn!(
                target: "security_audit",
                event = event_str,
                client_ip = ?client_ip,
                user_id = user_id,
                email = email,
                "Rate limit exceeded"
            );
        }
        SecurityEventType::ValidationError => {
            warn!(
                target: "security_audit",
                event = event_str,
                client_ip = ?client_ip,
                context = additional_context,
                "Invalid request format"
            );
        }
        SecurityEventType::AccessDenied => {
            warn!(
                target: "security_audit",
                event = event_str,
                user_id = user_id,
                reason = reason_str,
                context = additional_context,
                "Operation not permitted for role"
            );
        }
        SecurityEventType::DatabaseError => {
            error!(
                target: "security_audit",
                event = event_str,
                context = additional_context,
                "Database error during audited operation"
            );
        }
        SecurityEventType::CallStarted
        | SecurityEventType::CallEnded
        | SecurityEventType::CallCancelled
        | SecurityEventType::JoinTokenIssued => {
            info!(
                target: "security_audit",
                event = event_str,
                user_id = user_id,
                context = additional_context,
                "Video call lifecycle"
            );
        }
    }
}
