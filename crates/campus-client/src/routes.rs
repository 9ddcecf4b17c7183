//! Client route conventions and navigation.

use std::sync::Mutex;

use campus_common::UserRole;

pub const CALL_ROOM_PREFIX: &str = "/video-calls/";
pub const PROFESSOR_CALLS: &str = "/professor/video-calls";
pub const STUDENT_CALLS: &str = "/student/video-calls";
pub const ADMIN_CALLS: &str = "/admin/video-calls";

pub fn call_room_path(call_id: &str) -> String {
    format!("{CALL_ROOM_PREFIX}{call_id}")
}

/// Call id of a call-room path, ignoring query string and fragment.
pub fn parse_call_room_path(path: &str) -> Option<&str> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let id = path.strip_prefix(CALL_ROOM_PREFIX)?.trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}

/// Whether `path` is the room page for `call_id`.
pub fn is_call_room_for(path: &str, call_id: &str) -> bool {
    parse_call_room_path(path) == Some(call_id)
}

/// Where to land after leaving when there is no page to go back to.
pub fn fallback_path(role: UserRole) -> &'static str {
    match role {
        UserRole::Admin => ADMIN_CALLS,
        UserRole::Professor => PROFESSOR_CALLS,
        UserRole::Student => STUDENT_CALLS,
    }
}

pub trait Navigator: Send + Sync {
    fn current_path(&self) -> String;
    fn navigate(&self, path: &str);
    /// Returns to the referring page, or `fallback` if there is none.
    fn back_or(&self, fallback: &str);
}

/// In-memory history stack.
pub struct History {
    entries: Mutex<Vec<String>>,
}

impl History {
    pub fn new(start: &str) -> Self {
        Self {
            entries: Mutex::new(vec![start.to_string()]),
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Navigator for History {
    fn current_path(&self) -> String {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last()
            .cloned()
            .unwrap_or_else(|| "/".to_string())
    }

    fn navigate(&self, path: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(path.to_string());
    }

    fn back_or(&self, fallback: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() > 1 {
            entries.pop();
        } else {
            entries.clear();
            entries.push(fallback.to_string());
        }
    }
}
