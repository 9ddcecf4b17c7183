//! Full-page call room.

use std::sync::Arc;

use tracing::warn;

use crate::controls::CallControls;
use crate::coordinator::JoinCoordinator;
use crate::error::Result;
use crate::notify::Notifier;
use crate::session::SessionStore;

pub struct CallRoom {
    call_id: String,
    store: Arc<SessionStore>,
    coordinator: JoinCoordinator,
    controls: CallControls,
    notifier: Arc<dyn Notifier>,
}

impl CallRoom {
    pub fn new(
        call_id: impl Into<String>,
        coordinator: JoinCoordinator,
        controls: CallControls,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            store: coordinator.store().clone(),
            coordinator,
            controls,
            notifier,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn controls(&self) -> &CallControls {
        &self.controls
    }

    /// The room is on screen; the dock steps aside.
    pub fn enter(&self) {
        self.store.set_call_page_active(true);
        self.store.set_dock_visible(false);
    }

    /// The room left the screen; the dock takes over if still in a call.
    pub fn exit(&self) {
        self.store.set_call_page_active(false);
        if self.store.snapshot().in_call {
            self.store.set_dock_visible(true);
        }
    }

    /// Fetches the call record and hands it to the coordinator.
    pub async fn refresh(&self) -> Result<()> {
        match self.coordinator.api().get_call(&self.call_id).await {
            Ok(call) => {
                self.coordinator.call_fetched(call);
                Ok(())
            }
            Err(err) => {
                warn!(call_id = %self.call_id, "failed to load call: {}", err);
                self.notifier.error(&format!("Could not load the call: {err}"));
                Err(err)
            }
        }
    }

    pub fn is_host(&self) -> bool {
        self.store.role().is_some_and(|r| r.is_host())
    }

    pub async fn leave(&self) {
        self.coordinator.leave().await;
    }

    pub async fn end_for_everyone(&self) -> Result<()> {
        let result = self.coordinator.end_for_everyone().await;
        if let Err(err) = &result {
            self.notifier
                .error(&format!("Could not end the call: {err}"));
        }
        result
    }
}
