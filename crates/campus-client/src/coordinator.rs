//! Join Coordinator.
//!
//! Turns a stream of discrete events (the route changed, the signed-in user
//! changed, the call record was fetched, the user asked to leave) into at most
//! one join per call cid. Each event re-runs [`decide`], a pure function of the
//! current observation; a `Join` decision spawns an attempt that requests a join
//! token, connects the SDK client and joins, re-checking its own validity at
//! every await point through a per-attempt [`CancellationToken`].
//!
//! Cancellation is cooperative. An attempt that is already inside the SDK join
//! when it is cancelled runs to completion and then leaves the call it just
//! joined instead of installing it. Attempts for the same cid are serialized so
//! such a late leave never races a fresh join of the same call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use campus_common::helpers::parse_call_cid;
use campus_common::{ParticipantAction, UserRole, VideoCall, VideoCallTokenResponse};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::VideoCallApi;
use crate::error::{ClientError, Result};
use crate::notify::Notifier;
use crate::routes::{fallback_path, is_call_room_for, parse_call_room_path, Navigator, PROFESSOR_CALLS};
use crate::sdk::{JoinOptions, SdkUser, VideoClient, VideoSdk};
use crate::session::{ActiveCall, SessionStore};
use crate::types::CallUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    Idle,
    TokenRequested,
    Joining,
    Joined,
    Leaving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Leaving,
    /// The current page is not a call room.
    NoRoute,
    NoUser,
    CallNotFetched,
    /// The fetched record belongs to a previous route.
    StaleCall,
    CallInactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Wait {
        reason: WaitReason,
        cancel_in_flight: bool,
    },
    AlreadyJoined,
    AlreadyInFlight,
    Join {
        cid: String,
        supersedes: Option<String>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct InFlight<'a> {
    pub cid: &'a str,
    pub call_id: &'a str,
}

/// Everything [`decide`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub path: &'a str,
    pub user: Option<&'a CallUser>,
    pub call: Option<&'a VideoCall>,
    pub leaving: bool,
    /// Cid of the installed call, if the SDK still reports it live.
    pub live_cid: Option<&'a str>,
    pub in_flight: Option<InFlight<'a>>,
}

pub fn decide(obs: &Observation<'_>) -> Decision {
    let wait = |reason, keep_in_flight: bool| Decision::Wait {
        reason,
        cancel_in_flight: obs.in_flight.is_some() && !keep_in_flight,
    };

    if obs.leaving {
        return wait(WaitReason::Leaving, false);
    }
    let Some(route_id) = parse_call_room_path(obs.path) else {
        return wait(WaitReason::NoRoute, false);
    };
    if obs.user.is_none() {
        return wait(WaitReason::NoUser, false);
    }
    let Some(call) = obs.call else {
        // A refetch on the same route keeps its attempt.
        let same_route = obs.in_flight.is_some_and(|f| f.call_id == route_id);
        return wait(WaitReason::CallNotFetched, same_route);
    };
    if call.id != route_id {
        return wait(WaitReason::StaleCall, false);
    }
    if !call.is_active() {
        return wait(WaitReason::CallInactive, false);
    }
    if obs.live_cid == Some(call.call_cid.as_str()) {
        return Decision::AlreadyJoined;
    }
    match obs.in_flight {
        Some(f) if f.cid == call.call_cid => Decision::AlreadyInFlight,
        other => Decision::Join {
            cid: call.call_cid.clone(),
            supersedes: other.map(|f| f.cid.to_string()),
        },
    }
}

/// Whether a failed join for `call_id` should reach the user.
pub fn should_surface_error(leaving: bool, path: &str, call_id: &str, err: &ClientError) -> bool {
    !leaving && is_call_room_for(path, call_id) && !err.is_benign()
}

struct Attempt {
    id: u64,
    cid: String,
    call_id: String,
    cancel: CancellationToken,
}

struct AttemptCtx {
    id: u64,
    cid: String,
    call: VideoCall,
    user: CallUser,
    cancel: CancellationToken,
}

struct CoordinatorState {
    phase: JoinPhase,
    user: Option<CallUser>,
    call: Option<VideoCall>,
    leaving: bool,
    attempt: Option<Attempt>,
    next_attempt: u64,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    api: Arc<dyn VideoCallApi>,
    sdk: Arc<dyn VideoSdk>,
    store: Arc<SessionStore>,
    navigator: Arc<dyn Navigator>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<CoordinatorState>,
    cid_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    phase_tx: watch::Sender<JoinPhase>,
}

#[derive(Clone)]
pub struct JoinCoordinator {
    inner: Arc<Inner>,
}

impl JoinCoordinator {
    pub fn new(
        api: Arc<dyn VideoCallApi>,
        sdk: Arc<dyn VideoSdk>,
        store: Arc<SessionStore>,
        navigator: Arc<dyn Navigator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(JoinPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                api,
                sdk,
                store,
                navigator,
                notifier,
                state: Mutex::new(CoordinatorState {
                    phase: JoinPhase::Idle,
                    user: None,
                    call: None,
                    leaving: false,
                    attempt: None,
                    next_attempt: 0,
                    tasks: Vec::new(),
                }),
                cid_locks: Mutex::new(HashMap::new()),
                phase_tx,
            }),
        }
    }

    pub fn phase(&self) -> JoinPhase {
        self.inner.lock().phase
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<JoinPhase> {
        self.inner.phase_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    pub fn api(&self) -> &Arc<dyn VideoCallApi> {
        &self.inner.api
    }

    /// The navigator's current path changed.
    pub fn route_changed(&self) {
        let path = self.inner.navigator.current_path();
        {
            let mut state = self.inner.lock();
            let route_id = parse_call_room_path(&path);
            if state.call.as_ref().map(|c| c.id.as_str()) != route_id {
                state.call = None;
            }
        }
        self.inner.reconcile();
    }

    /// Signing out, or in as someone else, also tears down whatever the
    /// store still holds for the previous user.
    pub fn user_changed(&self, user: Option<CallUser>) {
        let switched = {
            let mut state = self.inner.lock();
            let switched = state.user.as_ref().map(|u| u.id.as_str())
                != user.as_ref().map(|u| u.id.as_str());
            state.user = user;
            switched
        };
        self.inner.reconcile();

        if switched && !self.inner.store.snapshot().is_empty() {
            info!("signed-in user changed; leaving current call");
            let this = self.clone();
            let task = tokio::spawn(async move {
                this.hang_up().await;
                this.inner.reconcile();
            });
            self.inner.lock().tasks.push(task);
        }
    }

    /// A call record arrived. Records for any call but the routed one are dropped.
    pub fn call_fetched(&self, call: VideoCall) {
        let path = self.inner.navigator.current_path();
        if !is_call_room_for(&path, &call.id) {
            debug!(call_id = %call.id, %path, "ignoring call record for another route");
            return;
        }
        if self.inner.store.current_cid().as_deref() == Some(call.call_cid.as_str()) {
            self.inner.store.update_call_info((&call).into());
        }
        self.inner.lock().call = Some(call);
        self.inner.reconcile();
    }

    /// Leaves the current call without navigating.
    ///
    /// Sets the leaving flag first so no in-flight attempt can install itself,
    /// cancels that attempt, reports the leave (best effort) and clears the
    /// session store.
    pub async fn hang_up(&self) {
        {
            let mut state = self.inner.lock();
            state.leaving = true;
            self.inner.cancel_attempt(&mut state);
            self.inner.set_phase(&mut state, JoinPhase::Leaving);
        }

        if let Some(info) = self.inner.store.call_info() {
            if let Err(err) = self
                .inner
                .api
                .update_participants(&info.id, ParticipantAction::Leave)
                .await
            {
                warn!(call_id = %info.id, "failed to report leave: {}", err);
            }
        }
        self.inner.store.clear_call().await;

        let mut state = self.inner.lock();
        state.leaving = false;
        self.inner.set_phase(&mut state, JoinPhase::Idle);
    }

    /// Leaves and returns to the referring page, or the role's call list.
    pub async fn leave(&self) {
        self.hang_up().await;
        let role = self
            .inner
            .lock()
            .user
            .as_ref()
            .map(|u| u.role)
            .unwrap_or(UserRole::Student);
        self.inner.navigator.back_or(fallback_path(role));
        self.route_changed();
    }

    /// Ends the call for every participant (host only), then tears down locally
    /// and lands on the professor call list.
    pub async fn end_for_everyone(&self) -> Result<()> {
        let info = self.inner.store.call_info().ok_or(ClientError::NotInCall)?;
        if !self.inner.store.role().is_some_and(|r| r.is_host()) {
            return Err(ClientError::NotAllowed(
                "only the host can end the call for everyone".into(),
            ));
        }

        self.inner.api.end_call(&info.id).await?;
        info!(call_cid = %info.call_cid, "call ended for everyone");

        {
            let mut state = self.inner.lock();
            state.leaving = true;
            self.inner.cancel_attempt(&mut state);
            self.inner.set_phase(&mut state, JoinPhase::Leaving);
        }
        self.inner.store.clear_call().await;
        {
            let mut state = self.inner.lock();
            state.leaving = false;
            self.inner.set_phase(&mut state, JoinPhase::Idle);
        }

        self.inner.navigator.navigate(PROFESSOR_CALLS);
        self.route_changed();
        Ok(())
    }

    /// Waits until every spawned join attempt has finished.
    pub async fn settle(&self) {
        loop {
            let tasks = std::mem::take(&mut self.inner.lock().tasks);
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(err) = task.await {
                    warn!("join attempt task failed: {}", err);
                }
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, state: &mut CoordinatorState, phase: JoinPhase) {
        if state.phase != phase {
            debug!(from = ?state.phase, to = ?phase, "join phase");
        }
        state.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn cancel_attempt(&self, state: &mut CoordinatorState) {
        if let Some(attempt) = state.attempt.take() {
            attempt.cancel.cancel();
            debug!(call_cid = %attempt.cid, attempt = attempt.id, "cancelled in-flight join");
        }
    }

    fn live_cid(&self) -> Option<String> {
        self.store
            .current_cid()
            .filter(|cid| self.store.is_live_in(cid))
    }

    fn settled_phase(&self, state: &CoordinatorState) -> JoinPhase {
        if state.leaving {
            JoinPhase::Leaving
        } else if state.attempt.is_some() {
            state.phase
        } else if self.live_cid().is_some() {
            JoinPhase::Joined
        } else {
            JoinPhase::Idle
        }
    }

    fn reconcile(self: &Arc<Self>) {
        let path = self.navigator.current_path();
        let live_cid = self.live_cid();
        let mut state = self.lock();

        let decision = decide(&Observation {
            path: &path,
            user: state.user.as_ref(),
            call: state.call.as_ref(),
            leaving: state.leaving,
            live_cid: live_cid.as_deref(),
            in_flight: state.attempt.as_ref().map(|a| InFlight {
                cid: &a.cid,
                call_id: &a.call_id,
            }),
        });
        debug!(?decision, %path, "join decision");

        match decision {
            Decision::Wait {
                cancel_in_flight, ..
            } => {
                if cancel_in_flight {
                    self.cancel_attempt(&mut state);
                }
                let phase = self.settled_phase(&state);
                self.set_phase(&mut state, phase);
            }
            Decision::AlreadyJoined => {
                let other_cid = state
                    .attempt
                    .as_ref()
                    .is_some_and(|a| Some(a.cid.as_str()) != live_cid.as_deref());
                if other_cid {
                    self.cancel_attempt(&mut state);
                }
                let phase = self.settled_phase(&state);
                self.set_phase(&mut state, phase);
            }
            Decision::AlreadyInFlight => {
                debug!("join already in flight for this call");
            }
            Decision::Join { cid, supersedes } => {
                if let Some(previous) = supersedes {
                    debug!(from = %previous, to = %cid, "superseding in-flight join");
                    self.cancel_attempt(&mut state);
                }
                self.start_attempt(&mut state, cid);
            }
        }
    }

    fn start_attempt(self: &Arc<Self>, state: &mut CoordinatorState, cid: String) {
        let (Some(call), Some(user)) = (state.call.clone(), state.user.clone()) else {
            return;
        };
        state.next_attempt += 1;
        let id = state.next_attempt;
        let cancel = CancellationToken::new();
        state.attempt = Some(Attempt {
            id,
            cid: cid.clone(),
            call_id: call.id.clone(),
            cancel: cancel.clone(),
        });
        self.set_phase(state, JoinPhase::TokenRequested);
        info!(call_cid = %cid, attempt = id, "joining call");

        let ctx = AttemptCtx {
            id,
            cid,
            call,
            user,
            cancel,
        };
        let inner = self.clone();
        state.tasks.retain(|task| !task.is_finished());
        state
            .tasks
            .push(tokio::spawn(async move { inner.run_attempt(ctx).await }));
    }

    /// The attempt is still the one the coordinator wants.
    fn is_current(&self, state: &CoordinatorState, ctx: &AttemptCtx, path: &str) -> bool {
        state.attempt.as_ref().is_some_and(|a| a.id == ctx.id)
            && !ctx.cancel.is_cancelled()
            && !state.leaving
            && is_call_room_for(path, &ctx.call.id)
            && state
                .call
                .as_ref()
                .is_some_and(|c| c.id == ctx.call.id && c.is_active())
    }

    fn ensure_current(&self, ctx: &AttemptCtx) -> Result<()> {
        let path = self.navigator.current_path();
        let state = self.lock();
        if ctx.cancel.is_cancelled() || state.leaving {
            return Err(ClientError::Cancelled);
        }
        if !self.is_current(&state, ctx, &path) {
            return Err(ClientError::Stale(format!(
                "route or call changed while joining {}",
                ctx.cid
            )));
        }
        Ok(())
    }

    fn cid_lock(&self, cid: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.cid_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(cid.to_string())
            .or_default()
            .clone()
    }

    async fn obtain_client(
        &self,
        user: &CallUser,
        token: &VideoCallTokenResponse,
    ) -> Result<Arc<dyn VideoClient>> {
        if let Some(client) = self.store.client() {
            if client.user_id() == user.id {
                return Ok(client);
            }
            if let Err(err) = client.disconnect().await {
                warn!("failed to disconnect previous video client: {}", err);
            }
        }
        let client = self
            .sdk
            .connect(
                &token.api_key,
                SdkUser {
                    id: user.id.clone(),
                    name: user.name.clone(),
                },
                &token.token,
            )
            .await?;
        self.store.set_client_handle(Some(client.clone()));
        Ok(client)
    }

    /// Tears down an installed call other than `ctx.cid`. The SDK client and
    /// the call page flag outlive the switch.
    async fn leave_previous(&self, ctx: &AttemptCtx) {
        let Some(previous) = self
            .store
            .call_info()
            .filter(|info| info.call_cid != ctx.cid)
        else {
            return;
        };
        info!(from = %previous.call_cid, to = %ctx.cid, "switching calls");

        let client = self.store.client();
        let on_call_page = self.store.snapshot().call_page_active;
        self.store.clear_call().await;
        if self.store.client().is_none() {
            self.store.set_client_handle(client);
        }
        if on_call_page {
            self.store.set_call_page_active(true);
        }

        if let Err(err) = self
            .api
            .update_participants(&previous.id, ParticipantAction::Leave)
            .await
        {
            warn!(call_id = %previous.id, "failed to report leave: {}", err);
        }
    }

    async fn join_flow(&self, ctx: &AttemptCtx) -> Result<()> {
        self.ensure_current(ctx)?;
        let token = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(ClientError::Cancelled),
            token = self.api.request_token(&ctx.call.id) => token?,
        };
        self.ensure_current(ctx)?;
        if token.call_cid != ctx.cid {
            return Err(ClientError::Stale(format!(
                "token issued for {} instead of {}",
                token.call_cid, ctx.cid
            )));
        }

        let lock = self.cid_lock(&ctx.cid);
        let _serial = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(ClientError::Cancelled),
            guard = lock.lock_owned() => guard,
        };
        if self.store.is_live_in(&ctx.cid) {
            debug!(call_cid = %ctx.cid, "already in call");
            return Ok(());
        }
        self.ensure_current(ctx)?;
        self.leave_previous(ctx).await;
        self.ensure_current(ctx)?;
        {
            let mut state = self.lock();
            self.set_phase(&mut state, JoinPhase::Joining);
        }

        let client = self.obtain_client(&ctx.user, &token).await?;
        self.ensure_current(ctx)?;

        let (call_type, call_id) = parse_call_cid(&token.call_cid)?;
        let call = client.call(call_type, call_id);
        match call
            .join(JoinOptions::for_role(token.role, &ctx.user.id))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_already_joined() => {
                debug!(call_cid = %ctx.cid, "sdk reports participant already joined; continuing");
            }
            Err(err) => return Err(err.into()),
        }

        let installed = {
            let path = self.navigator.current_path();
            let mut state = self.lock();
            if self.is_current(&state, ctx, &path) {
                self.store.set_active_call(
                    ActiveCall::new(
                        call.clone(),
                        ctx.call.clone(),
                        token.role,
                        token.token.clone(),
                        token.expires_at,
                    )
                    .on_call_page(),
                );
                self.set_phase(&mut state, JoinPhase::Joined);
                true
            } else {
                false
            }
        };
        if !installed {
            debug!(call_cid = %ctx.cid, "join finished after cancellation; leaving");
            if let Err(err) = call.leave().await {
                warn!(call_cid = %ctx.cid, "failed to leave cancelled join: {}", err);
            }
            return Err(ClientError::Cancelled);
        }

        if let Err(err) = self
            .api
            .update_participants(&ctx.call.id, ParticipantAction::Join)
            .await
        {
            warn!(call_id = %ctx.call.id, "failed to report join: {}", err);
        }
        Ok(())
    }

    async fn run_attempt(self: Arc<Self>, ctx: AttemptCtx) {
        let outcome = self.join_flow(&ctx).await;
        let path = self.navigator.current_path();

        let surface = {
            let mut state = self.lock();
            if state.attempt.as_ref().is_some_and(|a| a.id == ctx.id) {
                state.attempt = None;
            }
            let phase = self.settled_phase(&state);
            self.set_phase(&mut state, phase);

            match &outcome {
                Ok(()) => {
                    info!(call_cid = %ctx.cid, "joined call");
                    None
                }
                Err(err)
                    if !ctx.cancel.is_cancelled()
                        && should_surface_error(state.leaving, &path, &ctx.call.id, err) =>
                {
                    Some(format!("Could not join the call: {err}"))
                }
                Err(err) => {
                    debug!(call_cid = %ctx.cid, "suppressed join error: {}", err);
                    None
                }
            }
        };

        if let Some(message) = surface {
            warn!(call_cid = %ctx.cid, "{}", message);
            self.notifier.error(&message);
        }
    }
}
