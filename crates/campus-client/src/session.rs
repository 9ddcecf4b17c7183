//! Session Store: the single owner of "which call am I in".
//!
//! One store is created per signed-in client and shared (`Arc<SessionStore>`)
//! between the join coordinator, the call controls, the dock and the call room.
//! Every mutation republishes a [`SessionSnapshot`] on a `watch` channel so views
//! can redraw without polling.

use std::sync::{Arc, Mutex, MutexGuard};

use campus_common::{Participant, ParticipantRole, VideoCall, VideoCallStatus};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::sdk::{CallHandle, VideoClient};

/// A joined call, ready to be installed with [`SessionStore::set_active_call`].
pub struct ActiveCall {
    pub call: Arc<dyn CallHandle>,
    pub call_info: VideoCall,
    pub role: ParticipantRole,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub dock_visible: bool,
}

impl ActiveCall {
    /// Installs with the dock shown; use [`ActiveCall::on_call_page`] when
    /// the full room is on screen.
    pub fn new(
        call: Arc<dyn CallHandle>,
        call_info: VideoCall,
        role: ParticipantRole,
        token: String,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            call,
            call_info,
            role,
            token,
            expires_at,
            dock_visible: true,
        }
    }

    pub fn on_call_page(mut self) -> Self {
        self.dock_visible = false;
        self
    }
}

/// Fields of the installed call record that may change while in the call.
#[derive(Debug, Clone, Default)]
pub struct CallInfoPatch {
    pub title: Option<String>,
    pub status: Option<VideoCallStatus>,
    pub ended_at: Option<DateTime<Utc>>,
    pub participants: Option<Vec<Participant>>,
}

impl From<&VideoCall> for CallInfoPatch {
    fn from(call: &VideoCall) -> Self {
        Self {
            title: Some(call.title.clone()),
            status: Some(call.status),
            ended_at: call.ended_at,
            participants: Some(call.participants.clone()),
        }
    }
}

/// Read-only view of the store, published after every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub has_client: bool,
    pub in_call: bool,
    pub call_info: Option<VideoCall>,
    pub role: Option<ParticipantRole>,
    pub expires_at: Option<DateTime<Utc>>,
    pub dock_visible: bool,
    pub call_page_active: bool,
}

impl SessionSnapshot {
    pub fn call_cid(&self) -> Option<&str> {
        self.call_info.as_ref().map(|c| c.call_cid.as_str())
    }

    /// The snapshot of a store holding nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Default)]
struct SessionState {
    client: Option<Arc<dyn VideoClient>>,
    active_call: Option<Arc<dyn CallHandle>>,
    call_info: Option<VideoCall>,
    role: Option<ParticipantRole>,
    token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    dock_visible: bool,
    call_page_active: bool,
    // Bumped on every install so a slow teardown cannot wipe a newer call.
    generation: u64,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            has_client: self.client.is_some(),
            in_call: self.active_call.is_some(),
            call_info: self.call_info.clone(),
            role: self.role,
            expires_at: self.expires_at,
            dock_visible: self.dock_visible,
            call_page_active: self.call_page_active,
        }
    }

    fn is_empty(&self) -> bool {
        self.client.is_none()
            && self.active_call.is_none()
            && self.call_info.is_none()
            && self.role.is_none()
            && self.token.is_none()
            && self.expires_at.is_none()
            && !self.dock_visible
            && !self.call_page_active
    }

    fn reset(&mut self) {
        let generation = self.generation;
        *self = Self {
            generation,
            ..Self::default()
        };
    }
}

pub struct SessionStore {
    state: Mutex<SessionState>,
    tx: watch::Sender<SessionSnapshot>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot::default());
        Self {
            state: Mutex::new(SessionState::default()),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &SessionState) {
        self.tx.send_replace(state.snapshot());
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.lock();
        let out = f(&mut state);
        self.publish(&state);
        out
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    pub fn set_client_handle(&self, client: Option<Arc<dyn VideoClient>>) {
        self.mutate(|s| s.client = client);
    }

    pub fn client(&self) -> Option<Arc<dyn VideoClient>> {
        self.lock().client.clone()
    }

    pub fn set_active_call(&self, active: ActiveCall) {
        self.mutate(|s| {
            s.generation += 1;
            s.active_call = Some(active.call);
            s.call_info = Some(active.call_info);
            s.role = Some(active.role);
            s.token = Some(active.token);
            s.expires_at = Some(active.expires_at);
            s.dock_visible = active.dock_visible;
        });
    }

    /// Merges `patch` into the installed call record. No-op without one.
    pub fn update_call_info(&self, patch: CallInfoPatch) -> bool {
        let mut state = self.lock();
        let Some(info) = state.call_info.as_mut() else {
            return false;
        };
        if let Some(title) = patch.title {
            info.title = title;
        }
        if let Some(status) = patch.status {
            info.status = status;
        }
        if patch.ended_at.is_some() {
            info.ended_at = patch.ended_at;
        }
        if let Some(participants) = patch.participants {
            info.participants = participants;
        }
        self.publish(&state);
        true
    }

    pub fn set_dock_visible(&self, visible: bool) {
        self.mutate(|s| s.dock_visible = visible);
    }

    pub fn set_call_page_active(&self, active: bool) {
        self.mutate(|s| s.call_page_active = active);
    }

    pub fn active_call(&self) -> Option<Arc<dyn CallHandle>> {
        self.lock().active_call.clone()
    }

    pub fn call_info(&self) -> Option<VideoCall> {
        self.lock().call_info.clone()
    }

    pub fn role(&self) -> Option<ParticipantRole> {
        self.lock().role
    }

    pub fn token(&self) -> Option<String> {
        self.lock().token.clone()
    }

    pub fn current_cid(&self) -> Option<String> {
        self.lock().call_info.as_ref().map(|c| c.call_cid.clone())
    }

    /// The installed call is `cid` and the SDK still reports it live.
    pub fn is_live_in(&self, cid: &str) -> bool {
        let state = self.lock();
        let same_call = state
            .call_info
            .as_ref()
            .is_some_and(|info| info.call_cid == cid);
        same_call
            && state
                .active_call
                .as_ref()
                .is_some_and(|call| call.is_joined())
    }

    /// Whether the stored join token has passed its expiry.
    ///
    /// Purely informational: nothing renews the token or drops the call when
    /// this turns true, the SDK server enforces the token's own `exp`.
    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        self.lock().expires_at.is_some_and(|exp| now >= exp)
    }

    /// Leaves the active call (best effort) and resets every field.
    ///
    /// Returns `false` when the store was already empty, in which case no SDK
    /// operation is performed.
    pub async fn clear_call(&self) -> bool {
        let (call, generation) = {
            let mut state = self.lock();
            if state.is_empty() {
                return false;
            }
            (state.active_call.take(), state.generation)
        };

        if let Some(call) = call {
            let cid = call.cid();
            match call.leave().await {
                Ok(()) => debug!(call_cid = %cid, "left call"),
                Err(err) => warn!(call_cid = %cid, "failed to leave call: {}", err),
            }
        }

        let mut state = self.lock();
        if state.generation == generation {
            state.reset();
        } else {
            debug!("newer call installed during teardown; keeping it");
        }
        self.publish(&state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::loopback::LoopbackSdk;
    use crate::sdk::{JoinOptions, SdkUser, VideoSdk};
    use crate::testing::sample_call;
    use chrono::Duration;

    async fn joined_call(sdk: &LoopbackSdk, call_id: &str) -> Arc<dyn CallHandle> {
        let client = sdk
            .connect(
                "key",
                SdkUser {
                    id: "u1".into(),
                    name: "User".into(),
                },
                "token",
            )
            .await
            .unwrap();
        let call = client.call("default", call_id);
        call.join(JoinOptions::default()).await.unwrap();
        call
    }

    fn install(store: &SessionStore, call: Arc<dyn CallHandle>, call_id: &str) {
        store.set_active_call(ActiveCall::new(
            call,
            sample_call("vc-1", call_id),
            ParticipantRole::Participant,
            "jwt".into(),
            Utc::now() + Duration::hours(1),
        ));
    }

    #[tokio::test]
    async fn test_install_defaults_to_dock_visible() {
        let sdk = LoopbackSdk::new();
        let store = SessionStore::new();
        install(&store, joined_call(&sdk, "c1").await, "c1");

        let snap = store.snapshot();
        assert!(snap.in_call);
        assert!(snap.dock_visible);
        assert_eq!(snap.call_cid(), Some("default:c1"));
        assert!(store.is_live_in("default:c1"));
        assert!(!store.is_live_in("default:c2"));
    }

    #[tokio::test]
    async fn test_clear_call_twice_is_idempotent() {
        let sdk = LoopbackSdk::new();
        let store = SessionStore::new();
        install(&store, joined_call(&sdk, "c1").await, "c1");

        assert!(store.clear_call().await);
        assert_eq!(sdk.leave_count("default:c1"), 1);
        assert!(store.snapshot().is_empty());

        assert!(!store.clear_call().await);
        assert_eq!(sdk.leave_count("default:c1"), 1);
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_clear_call_resets_even_when_leave_fails() {
        let sdk = LoopbackSdk::new();
        let store = SessionStore::new();
        install(&store, joined_call(&sdk, "c1").await, "c1");
        sdk.set_fail_leave(true);

        assert!(store.clear_call().await);
        assert!(store.snapshot().is_empty());
        assert!(store.active_call().is_none());
    }

    #[tokio::test]
    async fn test_update_call_info_needs_installed_call() {
        let sdk = LoopbackSdk::new();
        let store = SessionStore::new();
        let patch = CallInfoPatch {
            title: Some("Renamed".into()),
            ..CallInfoPatch::default()
        };
        assert!(!store.update_call_info(patch.clone()));
        assert!(store.snapshot().call_info.is_none());

        install(&store, joined_call(&sdk, "c1").await, "c1");
        assert!(store.update_call_info(patch));
        let info = store.call_info().unwrap();
        assert_eq!(info.title, "Renamed");
        assert_eq!(info.call_cid, "default:c1");
    }

    #[tokio::test]
    async fn test_snapshots_are_published() {
        let store = SessionStore::new();
        let mut rx = store.subscribe();
        store.set_call_page_active(true);
        rx.changed().await.unwrap();
        assert!(rx.borrow().call_page_active);
    }

    #[tokio::test]
    async fn test_token_expiry_is_only_reported() {
        let sdk = LoopbackSdk::new();
        let store = SessionStore::new();
        assert!(!store.token_expired(Utc::now()));

        install(&store, joined_call(&sdk, "c1").await, "c1");
        assert!(!store.token_expired(Utc::now()));
        assert!(store.token_expired(Utc::now() + Duration::hours(2)));
        // Still in the call.
        assert!(store.is_live_in("default:c1"));
    }
}
