//! In-process video SDK.
//!
//! Calls live in a shared table instead of on a media server, so several
//! clients created from one [`LoopbackSdk`] see each other. Every join and leave
//! is counted per call cid, and failures can be injected for the next join,
//! for leaves, for media toggles and for display capture.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use campus_common::helpers::call_cid;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::{
    CallHandle, DisplayCapture, DisplayStream, JoinOptions, Reaction, SdkError, SdkParticipant,
    SdkUser, VideoClient, VideoSdk,
};

#[derive(Default)]
struct LoopbackState {
    connects: usize,
    joins: HashMap<String, usize>,
    leaves: HashMap<String, usize>,
    rooms: HashMap<String, BTreeSet<String>>,
    reactions: Vec<(String, Reaction)>,
    fail_next_join: Option<SdkError>,
    fail_leave: bool,
    fail_media: bool,
    deny_capture: bool,
}

struct Shared {
    state: Mutex<LoopbackState>,
    // `true` while joins may complete.
    gate_tx: watch::Sender<bool>,
    gate_rx: watch::Receiver<bool>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        // A panic while holding the lock leaves plain counters behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct LoopbackSdk {
    shared: Arc<Shared>,
}

impl Default for LoopbackSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackSdk {
    pub fn new() -> Self {
        let (gate_tx, gate_rx) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LoopbackState::default()),
                gate_tx,
                gate_rx,
            }),
        }
    }

    /// Screen picker backed by the same failure switches.
    pub fn display_capture(&self) -> LoopbackCapture {
        LoopbackCapture {
            shared: self.shared.clone(),
        }
    }

    /// Hold every join at the point after it was counted until [`resume_joins`].
    ///
    /// [`resume_joins`]: LoopbackSdk::resume_joins
    pub fn pause_joins(&self) {
        self.shared.gate_tx.send_replace(false);
    }

    pub fn resume_joins(&self) {
        self.shared.gate_tx.send_replace(true);
    }

    pub fn fail_next_join(&self, err: SdkError) {
        self.shared.state().fail_next_join = Some(err);
    }

    pub fn set_fail_leave(&self, fail: bool) {
        self.shared.state().fail_leave = fail;
    }

    pub fn set_fail_media(&self, fail: bool) {
        self.shared.state().fail_media = fail;
    }

    pub fn set_deny_capture(&self, deny: bool) {
        self.shared.state().deny_capture = deny;
    }

    pub fn connect_count(&self) -> usize {
        self.shared.state().connects
    }

    /// Join invocations for `cid`, including failed ones.
    pub fn join_count(&self, cid: &str) -> usize {
        self.shared.state().joins.get(cid).copied().unwrap_or(0)
    }

    pub fn total_joins(&self) -> usize {
        self.shared.state().joins.values().sum()
    }

    pub fn leave_count(&self, cid: &str) -> usize {
        self.shared.state().leaves.get(cid).copied().unwrap_or(0)
    }

    pub fn present_in(&self, cid: &str) -> Vec<String> {
        self.shared
            .state()
            .rooms
            .get(cid)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reactions(&self) -> Vec<(String, Reaction)> {
        self.shared.state().reactions.clone()
    }
}

#[async_trait]
impl VideoSdk for LoopbackSdk {
    async fn connect(
        &self,
        api_key: &str,
        user: SdkUser,
        token: &str,
    ) -> Result<Arc<dyn VideoClient>, SdkError> {
        if token.trim().is_empty() {
            return Err(SdkError::Connection("missing join token".into()));
        }
        self.shared.state().connects += 1;
        debug!(user = %user.id, api_key, "loopback client connected");
        Ok(Arc::new(LoopbackClient {
            user,
            shared: self.shared.clone(),
            calls: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct LoopbackClient {
    user: SdkUser,
    shared: Arc<Shared>,
    calls: Mutex<HashMap<String, Arc<LoopbackCall>>>,
}

#[async_trait]
impl VideoClient for LoopbackClient {
    fn user_id(&self) -> &str {
        &self.user.id
    }

    fn call(&self, call_type: &str, call_id: &str) -> Arc<dyn CallHandle> {
        let cid = call_cid(call_type, call_id);
        let mut calls = self.calls.lock().unwrap_or_else(|p| p.into_inner());
        let call = calls.entry(cid.clone()).or_insert_with(|| {
            Arc::new(LoopbackCall {
                cid,
                user_id: self.user.id.clone(),
                shared: self.shared.clone(),
                joined: AtomicBool::new(false),
                camera: AtomicBool::new(false),
                microphone: AtomicBool::new(false),
                screen: Mutex::new(None),
            })
        });
        call.clone()
    }

    async fn disconnect(&self) -> Result<(), SdkError> {
        let calls: Vec<_> = self
            .calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .map(|(_, call)| call)
            .collect();
        for call in calls {
            call.drop_presence();
        }
        Ok(())
    }
}

pub struct LoopbackCall {
    cid: String,
    user_id: String,
    shared: Arc<Shared>,
    joined: AtomicBool,
    camera: AtomicBool,
    microphone: AtomicBool,
    screen: Mutex<Option<DisplayStream>>,
}

impl LoopbackCall {
    fn ensure_media_allowed(&self) -> Result<(), SdkError> {
        if !self.joined.load(Ordering::SeqCst) {
            return Err(SdkError::NotJoined(self.cid.clone()));
        }
        if self.shared.state().fail_media {
            return Err(SdkError::Rejected("media device unavailable".into()));
        }
        Ok(())
    }

    fn drop_presence(&self) {
        self.joined.store(false, Ordering::SeqCst);
        self.camera.store(false, Ordering::SeqCst);
        self.microphone.store(false, Ordering::SeqCst);
        *self.screen.lock().unwrap_or_else(|p| p.into_inner()) = None;
        if let Some(members) = self.shared.state().rooms.get_mut(&self.cid) {
            members.remove(&self.user_id);
        }
    }
}

#[async_trait]
impl CallHandle for LoopbackCall {
    fn cid(&self) -> String {
        self.cid.clone()
    }

    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    async fn join(&self, options: JoinOptions) -> Result<(), SdkError> {
        let injected = {
            let mut state = self.shared.state();
            *state.joins.entry(self.cid.clone()).or_default() += 1;
            state.fail_next_join.take()
        };

        let mut gate = self.shared.gate_rx.clone();
        // The sender lives in `shared`, so the channel cannot close under us.
        let _ = gate.wait_for(|open| *open).await;

        if let Some(err) = injected {
            return Err(err);
        }
        if self.joined.swap(true, Ordering::SeqCst) {
            return Err(SdkError::AlreadyJoined(self.cid.clone()));
        }

        let mut state = self.shared.state();
        let exists = state.rooms.contains_key(&self.cid);
        if !exists && !options.create {
            // Plain joins still succeed; the host may simply not have arrived yet.
            debug!(cid = %self.cid, "joining call before its creator");
        }
        state
            .rooms
            .entry(self.cid.clone())
            .or_default()
            .insert(self.user_id.clone());
        Ok(())
    }

    async fn leave(&self) -> Result<(), SdkError> {
        {
            let mut state = self.shared.state();
            *state.leaves.entry(self.cid.clone()).or_default() += 1;
            if state.fail_leave {
                return Err(SdkError::Connection("leave request timed out".into()));
            }
        }
        if !self.is_joined() {
            return Err(SdkError::NotJoined(self.cid.clone()));
        }
        self.drop_presence();
        Ok(())
    }

    async fn enable_camera(&self) -> Result<(), SdkError> {
        self.ensure_media_allowed()?;
        self.camera.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_camera(&self) -> Result<(), SdkError> {
        self.ensure_media_allowed()?;
        self.camera.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn camera_enabled(&self) -> bool {
        self.camera.load(Ordering::SeqCst)
    }

    async fn enable_microphone(&self) -> Result<(), SdkError> {
        self.ensure_media_allowed()?;
        self.microphone.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_microphone(&self) -> Result<(), SdkError> {
        self.ensure_media_allowed()?;
        self.microphone.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn microphone_enabled(&self) -> bool {
        self.microphone.load(Ordering::SeqCst)
    }

    async fn publish_screen_share(&self, stream: DisplayStream) -> Result<(), SdkError> {
        self.ensure_media_allowed()?;
        *self.screen.lock().unwrap_or_else(|p| p.into_inner()) = Some(stream);
        Ok(())
    }

    async fn stop_screen_share(&self) -> Result<(), SdkError> {
        self.ensure_media_allowed()?;
        *self.screen.lock().unwrap_or_else(|p| p.into_inner()) = None;
        Ok(())
    }

    fn screen_share_enabled(&self) -> bool {
        self.screen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    async fn send_reaction(&self, reaction: Reaction) -> Result<(), SdkError> {
        self.ensure_media_allowed()?;
        self.shared
            .state()
            .reactions
            .push((self.cid.clone(), reaction));
        Ok(())
    }

    fn participants(&self) -> Vec<SdkParticipant> {
        let state = self.shared.state();
        state
            .rooms
            .get(&self.cid)
            .map(|members| {
                members
                    .iter()
                    .map(|user| SdkParticipant {
                        user_id: user.clone(),
                        session_id: format!("{}/{}", self.cid, user),
                        is_local: *user == self.user_id,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct LoopbackCapture {
    shared: Arc<Shared>,
}

#[async_trait]
impl DisplayCapture for LoopbackCapture {
    async fn acquire(&self) -> Result<DisplayStream, SdkError> {
        if self.shared.state().deny_capture {
            return Err(SdkError::PermissionDenied(
                "display capture was dismissed".into(),
            ));
        }
        Ok(DisplayStream {
            id: Uuid::new_v4().to_string(),
            label: "loopback screen".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> SdkUser {
        SdkUser {
            id: id.into(),
            name: id.into(),
        }
    }

    #[tokio::test]
    async fn test_clients_share_rooms() {
        let sdk = LoopbackSdk::new();
        let host = sdk.connect("key", user("prof"), "t1").await.unwrap();
        let student = sdk.connect("key", user("stud"), "t2").await.unwrap();

        host.call("default", "c1")
            .join(JoinOptions {
                create: true,
                members: Vec::new(),
            })
            .await
            .unwrap();
        let call = student.call("default", "c1");
        call.join(JoinOptions::default()).await.unwrap();

        assert_eq!(call.participants().len(), 2);
        assert_eq!(sdk.join_count("default:c1"), 2);
        assert_eq!(sdk.present_in("default:c1"), vec!["prof", "stud"]);

        call.leave().await.unwrap();
        assert!(!call.is_joined());
        assert_eq!(sdk.present_in("default:c1"), vec!["prof"]);
    }

    #[tokio::test]
    async fn test_second_join_reports_already_joined() {
        let sdk = LoopbackSdk::new();
        let client = sdk.connect("key", user("u1"), "t").await.unwrap();
        let call = client.call("default", "c1");
        call.join(JoinOptions::default()).await.unwrap();
        let err = call.join(JoinOptions::default()).await.unwrap_err();
        assert!(err.is_already_joined());
        assert!(call.is_joined());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let sdk = LoopbackSdk::new();
        let client = sdk.connect("key", user("u1"), "t").await.unwrap();
        let call = client.call("default", "c1");

        sdk.fail_next_join(SdkError::Rejected("call is full".into()));
        assert!(call.join(JoinOptions::default()).await.is_err());
        assert!(!call.is_joined());
        call.join(JoinOptions::default()).await.unwrap();

        sdk.set_fail_media(true);
        assert!(call.enable_camera().await.is_err());
        assert!(!call.camera_enabled());

        sdk.set_deny_capture(true);
        assert!(matches!(
            sdk.display_capture().acquire().await,
            Err(SdkError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_paused_joins_wait_for_resume() {
        let sdk = LoopbackSdk::new();
        let client = sdk.connect("key", user("u1"), "t").await.unwrap();
        let call = client.call("default", "c1");

        sdk.pause_joins();
        let pending = tokio::spawn({
            let call = call.clone();
            async move { call.join(JoinOptions::default()).await }
        });
        tokio::task::yield_now().await;
        assert!(!call.is_joined());

        sdk.resume_joins();
        pending.await.unwrap().unwrap();
        assert!(call.is_joined());
        assert_eq!(sdk.join_count("default:c1"), 1);
    }
}
