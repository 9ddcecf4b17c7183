//! Floating dock: the mini call UI shown while in a call but off the call page.

use std::sync::Arc;

use crate::controls::{CallControls, ControlsState};
use crate::coordinator::JoinCoordinator;
use crate::routes::{call_room_path, Navigator};
use crate::session::SessionStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockView {
    pub call_id: String,
    pub title: String,
    pub call_cid: String,
    pub participant_count: usize,
    pub controls: ControlsState,
}

pub struct Dock {
    store: Arc<SessionStore>,
    coordinator: JoinCoordinator,
    navigator: Arc<dyn Navigator>,
    controls: CallControls,
}

impl Dock {
    pub fn new(
        coordinator: JoinCoordinator,
        navigator: Arc<dyn Navigator>,
        controls: CallControls,
    ) -> Self {
        Self {
            store: coordinator.store().clone(),
            coordinator,
            navigator,
            controls,
        }
    }

    pub fn is_visible(&self) -> bool {
        let snap = self.store.snapshot();
        snap.in_call && snap.dock_visible && !snap.call_page_active
    }

    /// What the dock renders, or `None` while it is hidden.
    pub fn view(&self) -> Option<DockView> {
        if !self.is_visible() {
            return None;
        }
        let call = self.store.active_call()?;
        let info = self.store.call_info()?;
        Some(DockView {
            call_id: info.id,
            title: info.title,
            call_cid: info.call_cid,
            participant_count: call.participants().len(),
            controls: ControlsState::of(call.as_ref()),
        })
    }

    pub fn controls(&self) -> &CallControls {
        &self.controls
    }

    /// Leaves the call from wherever the user currently is.
    pub async fn leave(&self) {
        self.coordinator.hang_up().await;
    }

    /// Navigates back to the full call room.
    pub fn return_to_call(&self) -> bool {
        let Some(info) = self.store.call_info() else {
            return false;
        };
        self.navigator.navigate(&call_room_path(&info.id));
        self.coordinator.route_changed();
        true
    }
}
