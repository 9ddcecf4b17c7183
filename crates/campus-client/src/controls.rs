//! Call Controls shared by the dock and the call room.
//!
//! The SDK is the source of truth: each toggle reads the SDK-reported state,
//! asks the SDK for the opposite and reports what the SDK says afterwards. A
//! failed toggle changes nothing locally and raises exactly one notification.

use std::sync::Arc;

use tracing::warn;

use crate::error::{ClientError, Result};
use crate::notify::Notifier;
use crate::sdk::{CallHandle, DisplayCapture, Reaction};
use crate::session::SessionStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlsState {
    pub camera: bool,
    pub microphone: bool,
    pub screen_share: bool,
}

impl ControlsState {
    pub fn of(call: &dyn CallHandle) -> Self {
        Self {
            camera: call.camera_enabled(),
            microphone: call.microphone_enabled(),
            screen_share: call.screen_share_enabled(),
        }
    }
}

#[derive(Clone)]
pub struct CallControls {
    store: Arc<SessionStore>,
    capture: Arc<dyn DisplayCapture>,
    notifier: Arc<dyn Notifier>,
}

impl CallControls {
    pub fn new(
        store: Arc<SessionStore>,
        capture: Arc<dyn DisplayCapture>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            capture,
            notifier,
        }
    }

    /// SDK-reported state of the active call; all off outside a call.
    pub fn state(&self) -> ControlsState {
        self.store
            .active_call()
            .map(|call| ControlsState::of(call.as_ref()))
            .unwrap_or_default()
    }

    fn active_call(&self, what: &str) -> Result<Arc<dyn CallHandle>> {
        self.store.active_call().ok_or_else(|| {
            self.notifier.error(&format!("Cannot {what}: not in a call"));
            ClientError::NotInCall
        })
    }

    fn report(&self, what: &str, err: ClientError) -> ClientError {
        warn!("failed to {}: {}", what, err);
        self.notifier.error(&format!("Could not {what}: {err}"));
        err
    }

    /// Returns the camera state the SDK reports after the toggle.
    pub async fn toggle_camera(&self) -> Result<bool> {
        let what = "toggle camera";
        let call = self.active_call(what)?;
        let outcome = if call.camera_enabled() {
            call.disable_camera().await
        } else {
            call.enable_camera().await
        };
        match outcome {
            Ok(()) => Ok(call.camera_enabled()),
            Err(err) => Err(self.report(what, err.into())),
        }
    }

    pub async fn toggle_microphone(&self) -> Result<bool> {
        let what = "toggle microphone";
        let call = self.active_call(what)?;
        let outcome = if call.microphone_enabled() {
            call.disable_microphone().await
        } else {
            call.enable_microphone().await
        };
        match outcome {
            Ok(()) => Ok(call.microphone_enabled()),
            Err(err) => Err(self.report(what, err.into())),
        }
    }

    /// Starting a share first acquires a display stream; a denied or dismissed
    /// picker counts as a failed toggle.
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        let what = "toggle screen share";
        let call = self.active_call(what)?;
        if call.screen_share_enabled() {
            return match call.stop_screen_share().await {
                Ok(()) => Ok(call.screen_share_enabled()),
                Err(err) => Err(self.report(what, err.into())),
            };
        }

        let stream = match self.capture.acquire().await {
            Ok(stream) => stream,
            Err(err) => {
                return Err(self.report(what, ClientError::ScreenCapture(err.to_string())));
            }
        };
        match call.publish_screen_share(stream).await {
            Ok(()) => Ok(call.screen_share_enabled()),
            Err(err) => Err(self.report(what, err.into())),
        }
    }

    pub async fn send_reaction(&self, reaction: Reaction) -> Result<()> {
        let what = "send reaction";
        let call = self.active_call(what)?;
        call.send_reaction(reaction)
            .await
            .map_err(|err| self.report(what, err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::sdk::loopback::LoopbackSdk;
    use crate::sdk::{JoinOptions, SdkUser, VideoSdk};
    use crate::session::ActiveCall;
    use crate::testing::sample_call;
    use campus_common::ParticipantRole;
    use chrono::Utc;

    async fn joined(sdk: &LoopbackSdk) -> (CallControls, Arc<RecordingNotifier>) {
        let store = Arc::new(SessionStore::new());
        let client = sdk
            .connect(
                "key",
                SdkUser {
                    id: "u1".into(),
                    name: "User".into(),
                },
                "jwt",
            )
            .await
            .unwrap();
        let call = client.call("default", "c1");
        call.join(JoinOptions::default()).await.unwrap();
        store.set_active_call(ActiveCall::new(
            call,
            sample_call("vc-1", "c1"),
            ParticipantRole::Participant,
            "jwt".into(),
            Utc::now(),
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let controls = CallControls::new(store, Arc::new(sdk.display_capture()), notifier.clone());
        (controls, notifier)
    }

    #[tokio::test]
    async fn test_toggles_follow_sdk_state() {
        let sdk = LoopbackSdk::new();
        let (controls, notifier) = joined(&sdk).await;

        assert!(controls.toggle_camera().await.unwrap());
        assert!(controls.toggle_microphone().await.unwrap());
        assert!(controls.toggle_screen_share().await.unwrap());
        assert_eq!(
            controls.state(),
            ControlsState {
                camera: true,
                microphone: true,
                screen_share: true
            }
        );

        assert!(!controls.toggle_camera().await.unwrap());
        assert!(!controls.toggle_screen_share().await.unwrap());
        controls.send_reaction(Reaction::RaiseHand).await.unwrap();
        assert_eq!(sdk.reactions().len(), 1);
        assert!(notifier.all().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_toggle_keeps_state_and_notifies_once() {
        let sdk = LoopbackSdk::new();
        let (controls, notifier) = joined(&sdk).await;
        controls.toggle_microphone().await.unwrap();
        let before = controls.state();

        sdk.set_fail_media(true);
        assert!(controls.toggle_camera().await.is_err());
        assert_eq!(controls.state(), before);
        assert_eq!(notifier.errors().len(), 1);

        assert!(controls.toggle_microphone().await.is_err());
        assert_eq!(controls.state(), before);
        assert_eq!(notifier.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_screen_share_keeps_state_and_notifies_once() {
        let sdk = LoopbackSdk::new();
        let (controls, notifier) = joined(&sdk).await;

        sdk.set_fail_media(true);
        assert!(controls.toggle_screen_share().await.is_err());
        assert!(!controls.state().screen_share);
        assert_eq!(notifier.errors().len(), 1);

        sdk.set_fail_media(false);
        assert!(controls.toggle_screen_share().await.unwrap());
        let sharing = controls.state();

        sdk.set_fail_media(true);
        assert!(controls.toggle_screen_share().await.is_err());
        assert_eq!(controls.state(), sharing);
        assert!(controls.state().screen_share);
        assert_eq!(notifier.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_reaction_notifies_once() {
        let sdk = LoopbackSdk::new();
        let (controls, notifier) = joined(&sdk).await;
        let before = controls.state();

        sdk.set_fail_media(true);
        assert!(controls.send_reaction(Reaction::RaiseHand).await.is_err());
        assert!(sdk.reactions().is_empty());
        assert_eq!(controls.state(), before);
        assert_eq!(notifier.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_denied_screen_capture_is_a_failed_toggle() {
        let sdk = LoopbackSdk::new();
        let (controls, notifier) = joined(&sdk).await;
        sdk.set_deny_capture(true);

        let err = controls.toggle_screen_share().await.unwrap_err();
        assert!(matches!(err, ClientError::ScreenCapture(_)));
        assert!(!controls.state().screen_share);
        assert_eq!(notifier.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_toggle_outside_a_call() {
        let sdk = LoopbackSdk::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let controls = CallControls::new(
            Arc::new(SessionStore::new()),
            Arc::new(sdk.display_capture()),
            notifier.clone(),
        );
        assert!(matches!(
            controls.toggle_camera().await,
            Err(ClientError::NotInCall)
        ));
        assert_eq!(notifier.errors().len(), 1);
        assert_eq!(controls.state(), ControlsState::default());
    }
}
