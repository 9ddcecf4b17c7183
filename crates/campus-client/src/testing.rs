//! Test doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use campus_common::helpers::{call_cid, DEFAULT_CALL_TYPE};
use campus_common::{
    CreateVideoCallRequest, ParticipantAction, ParticipantRole, UserRole, VideoCall,
    VideoCallQuery, VideoCallStatus, VideoCallTokenResponse, INACTIVE_CALL_ERROR,
};
use chrono::Utc;
use tokio::sync::watch;

use crate::api::VideoCallApi;
use crate::controls::CallControls;
use crate::coordinator::JoinCoordinator;
use crate::dock::Dock;
use crate::error::{ClientError, Result};
use crate::notify::RecordingNotifier;
use crate::room::CallRoom;
use crate::routes::{call_room_path, History, Navigator};
use crate::sdk::loopback::LoopbackSdk;
use crate::session::SessionStore;
use crate::types::CallUser;

pub fn sample_call(id: &str, call_id: &str) -> VideoCall {
    let now = Utc::now();
    VideoCall {
        id: id.to_string(),
        tenant: "uni".to_string(),
        lesson: format!("lesson-{id}"),
        course: "course-1".to_string(),
        call_type: DEFAULT_CALL_TYPE.to_string(),
        call_id: call_id.to_string(),
        call_cid: call_cid(DEFAULT_CALL_TYPE, call_id),
        title: format!("Lecture {id}"),
        status: VideoCallStatus::Active,
        lesson_start_at: None,
        lesson_end_at: None,
        started_at: now,
        ended_at: None,
        participants: Vec::new(),
        created_by: "prof-1".to_string(),
    }
}

#[derive(Default)]
struct FakeState {
    calls: HashMap<String, VideoCall>,
    fail_token: Option<(u16, String)>,
    fail_end: Option<(u16, String)>,
    token_requests: Vec<String>,
    participant_updates: Vec<(String, ParticipantAction)>,
    ended: Vec<String>,
}

/// Gateway stand-in keyed by video-call id.
pub struct FakeApi {
    state: Mutex<FakeState>,
    role: ParticipantRole,
    token_gate_tx: watch::Sender<bool>,
    token_gate_rx: watch::Receiver<bool>,
}

impl FakeApi {
    pub fn new(role: ParticipantRole) -> Self {
        let (token_gate_tx, token_gate_rx) = watch::channel(true);
        Self {
            state: Mutex::new(FakeState::default()),
            role,
            token_gate_tx,
            token_gate_rx,
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert(&self, call: VideoCall) {
        self.state().calls.insert(call.id.clone(), call);
    }

    /// Token requests block after being recorded until [`FakeApi::resume_tokens`].
    pub fn pause_tokens(&self) {
        self.token_gate_tx.send_replace(false);
    }

    pub fn resume_tokens(&self) {
        self.token_gate_tx.send_replace(true);
    }

    /// The next token request fails with this status and message.
    pub fn fail_next_token(&self, status: u16, message: &str) {
        self.state().fail_token = Some((status, message.to_string()));
    }

    pub fn fail_next_end(&self, status: u16, message: &str) {
        self.state().fail_end = Some((status, message.to_string()));
    }

    pub fn token_requests(&self) -> Vec<String> {
        self.state().token_requests.clone()
    }

    pub fn participant_updates(&self) -> Vec<(String, ParticipantAction)> {
        self.state().participant_updates.clone()
    }

    pub fn ended(&self) -> Vec<String> {
        self.state().ended.clone()
    }

    fn lookup(&self, id: &str) -> Result<VideoCall> {
        self.state()
            .calls
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::api(404, "Video call not found"))
    }

    fn active(&self, id: &str) -> Result<VideoCall> {
        let call = self.lookup(id)?;
        if !call.is_active() {
            return Err(ClientError::api(409, INACTIVE_CALL_ERROR));
        }
        Ok(call)
    }

    fn finish(&self, id: &str, status: VideoCallStatus) -> Result<VideoCall> {
        let mut state = self.state();
        let call = state
            .calls
            .get_mut(id)
            .ok_or_else(|| ClientError::api(404, "Video call not found"))?;
        if !call.is_active() {
            return Err(ClientError::api(409, INACTIVE_CALL_ERROR));
        }
        call.status = status;
        call.ended_at = Some(Utc::now());
        Ok(call.clone())
    }
}

#[async_trait]
impl VideoCallApi for FakeApi {
    async fn list_calls(&self, _query: &VideoCallQuery) -> Result<Vec<VideoCall>> {
        Ok(self.state().calls.values().cloned().collect())
    }

    async fn get_call(&self, id: &str) -> Result<VideoCall> {
        self.lookup(id)
    }

    async fn start_call(&self, request: &CreateVideoCallRequest) -> Result<VideoCall> {
        let mut call = sample_call(&format!("vc-{}", request.lesson_id), &request.lesson_id);
        call.title = request.title.clone();
        self.insert(call.clone());
        Ok(call)
    }

    async fn request_token(&self, id: &str) -> Result<VideoCallTokenResponse> {
        self.state().token_requests.push(id.to_string());
        let mut gate = self.token_gate_rx.clone();
        let _ = gate.wait_for(|open| *open).await;

        if let Some((status, message)) = self.state().fail_token.take() {
            return Err(ClientError::api(status, message));
        }
        let call = self.active(id)?;
        Ok(VideoCallTokenResponse {
            token: format!("jwt-{id}"),
            api_key: "test-key".to_string(),
            user_id: "u1".to_string(),
            call_type: call.call_type,
            call_id: call.call_id,
            call_cid: call.call_cid,
            role: self.role,
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn end_call(&self, id: &str) -> Result<VideoCall> {
        if let Some((status, message)) = self.state().fail_end.take() {
            return Err(ClientError::api(status, message));
        }
        let call = self.finish(id, VideoCallStatus::Ended)?;
        self.state().ended.push(id.to_string());
        Ok(call)
    }

    async fn cancel_call(&self, id: &str) -> Result<VideoCall> {
        self.finish(id, VideoCallStatus::Cancelled)
    }

    async fn update_participants(&self, id: &str, action: ParticipantAction) -> Result<VideoCall> {
        self.state()
            .participant_updates
            .push((id.to_string(), action));
        self.lookup(id)
    }
}

/// One signed-in client wired to fakes.
pub struct Harness {
    pub sdk: LoopbackSdk,
    pub api: Arc<FakeApi>,
    pub store: Arc<SessionStore>,
    pub history: Arc<History>,
    pub notifier: Arc<RecordingNotifier>,
    pub coordinator: JoinCoordinator,
    pub controls: CallControls,
}

impl Harness {
    /// A student in a dashboard, every call with a participant token.
    pub fn student() -> Self {
        Self::build(UserRole::Student, ParticipantRole::Participant)
    }

    /// A professor who hosts every call.
    pub fn professor() -> Self {
        Self::build(UserRole::Professor, ParticipantRole::Host)
    }

    fn build(user_role: UserRole, call_role: ParticipantRole) -> Self {
        let sdk = LoopbackSdk::new();
        let api = Arc::new(FakeApi::new(call_role));
        let store = Arc::new(SessionStore::new());
        let history = Arc::new(History::new("/dashboard"));
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = JoinCoordinator::new(
            api.clone(),
            Arc::new(sdk.clone()),
            store.clone(),
            history.clone(),
            notifier.clone(),
        );
        let controls = CallControls::new(
            store.clone(),
            Arc::new(sdk.display_capture()),
            notifier.clone(),
        );
        coordinator.user_changed(Some(CallUser {
            id: "u1".to_string(),
            name: "Ada".to_string(),
            role: user_role,
        }));
        Self {
            sdk,
            api,
            store,
            history,
            notifier,
            coordinator,
            controls,
        }
    }

    /// Registers active calls `vc-<n>` with call id `c<n>` for each `n`.
    pub fn with_calls(self, ns: &[u32]) -> Self {
        for n in ns {
            self.api
                .insert(sample_call(&format!("vc-{n}"), &format!("c{n}")));
        }
        self
    }

    pub fn goto(&self, path: &str) {
        self.history.navigate(path);
        self.coordinator.route_changed();
    }

    /// Navigates to the room and delivers its record, like the room page does.
    pub async fn open_room(&self, id: &str) {
        self.goto(&call_room_path(id));
        let call = self.api.get_call(id).await;
        if let Ok(call) = call {
            self.coordinator.call_fetched(call);
        }
    }

    pub fn room(&self, id: &str) -> CallRoom {
        CallRoom::new(
            id,
            self.coordinator.clone(),
            self.controls.clone(),
            self.notifier.clone(),
        )
    }

    pub fn dock(&self) -> Dock {
        Dock::new(
            self.coordinator.clone(),
            self.history.clone(),
            self.controls.clone(),
        )
    }

    pub fn path(&self) -> String {
        self.history.current_path()
    }
}

/// Polls `cond` until it holds; panics after a second.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
