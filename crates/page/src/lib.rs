//! In-memory host environment for one page view.
//!
//! Models the resource primitives a busy-state coordinator hooks into: the
//! network fetch slot, image attribute assignment, structural insertion under
//! the head or the whole document, and per-element load/error events.

pub mod dom;
pub mod fetcher;
pub mod page;

pub use dom::{AddedNode, Element, ElementEvent, NodeId, ObserveTarget, ReadyState, Subtree};
pub use fetcher::ReqwestFetcher;
pub use page::{AttributeHook, ListenerId, ObserverCallback, ObserverHandle, Page, PageError};
