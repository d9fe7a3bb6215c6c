//! Page busy-state coordination.
//!
//! [`ResourceLoadCoordinator`] keeps a live count of outstanding page work and
//! toggles a busy indicator. Its [`InstrumentationSession`] hooks the page's
//! resource primitives so work started by unrelated code is counted too.

mod coordinator;
mod session;

pub use coordinator::{INDICATOR_HIDDEN, INDICATOR_SHOWN, ResourceLoadCoordinator};
pub use session::InstrumentationSession;
