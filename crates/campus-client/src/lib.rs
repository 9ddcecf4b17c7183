pub mod api;
pub mod controls;
pub mod coordinator;
pub mod dock;
pub mod error;
pub mod notify;
pub mod room;
pub mod routes;
pub mod sdk;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{GatewayApi, VideoCallApi};
pub use controls::{CallControls, ControlsState};
pub use coordinator::{decide, should_surface_error, Decision, JoinCoordinator, JoinPhase};
pub use dock::{Dock, DockView};
pub use error::{ClientError, Result};
pub use notify::{LogNotifier, Notifier};
pub use room::CallRoom;
pub use routes::{History, Navigator};
pub use session::{SessionSnapshot, SessionStore};
pub use types::{CallUser, ClientConfig};
