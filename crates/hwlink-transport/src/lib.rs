//! hwlink-transport library entry point.
//!
//! Everything async lives here: the channel backends, the session
//! arbitrator and the [`TransportFacade`] that ties them together.  The
//! `hwlink` binary and the integration tests in `tests/` share this module
//! tree.

pub mod application;
pub mod infrastructure;

pub use application::arbitrator::{AcquireOptions, AcquirePolicy, SessionArbitrator};
pub use application::events::Subscription;
pub use application::facade::{FacadeSettings, TransportFacade};
pub use infrastructure::backend::{BackendFactory, ChannelBackend, ChannelHandle};
