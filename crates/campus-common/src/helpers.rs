//! Common helper functions for Campus.

use crate::error::{Error, Result};

/// Default SDK call type used when a call is created without one.
pub const DEFAULT_CALL_TYPE: &str = "default";

/// Builds the SDK composite call identifier (`type:id`).
pub fn call_cid(call_type: &str, call_id: &str) -> String {
    format!("{call_type}:{call_id}")
}

/// Splits a composite call identifier back into `(type, id)`.
pub fn parse_call_cid(cid: &str) -> Result<(&str, &str)> {
    match cid.split_once(':') {
        Some((call_type, call_id)) if !call_type.is_empty() && !call_id.is_empty() => {
            Ok((call_type, call_id))
        }
        _ => Err(Error::validation(format!("malformed call cid: {cid:?}"))),
    }
}

/// Whether an identifier is acceptable as an SDK call type or call id segment.
pub fn is_valid_call_segment(value: &str) -> bool {
    let len = value.len();
    (1..=64).contains(&len)
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
