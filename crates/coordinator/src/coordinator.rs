use loadwatch_core::{BusyTracker, LoaderConfig, Module, ResourceKind};
use loadwatch_page::{ElementEvent, ListenerId, NodeId, Page, ReadyState};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::session::InstrumentationSession;

/// Display value applied to the indicator while work is outstanding.
pub const INDICATOR_SHOWN: &str = "flex";
pub const INDICATOR_HIDDEN: &str = "none";

#[derive(Default)]
struct BusyState {
    active: usize,
    indicator: Option<NodeId>,
    on: bool,
    tracked: HashSet<String>,
}

struct Inner {
    page: Arc<Page>,
    config: LoaderConfig,
    state: Mutex<BusyState>,
    session: Mutex<Option<InstrumentationSession>>,
}

/// Single source of truth for whether the page is still doing tracked work.
///
/// Cloning yields another handle to the same counter.
#[derive(Clone)]
pub struct ResourceLoadCoordinator {
    inner: Arc<Inner>,
}

impl ResourceLoadCoordinator {
    pub fn new(page: Arc<Page>, config: LoaderConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                page,
                config,
                state: Mutex::new(BusyState::default()),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.inner.page
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Selects the indicator and installs interception.
    ///
    /// Without an indicator element the coordinator stays passive: the counter
    /// still works but nothing is intercepted. Returns whether interception was installed.
    pub fn init(&self) -> bool {
        let selector = &self.inner.config.indicator_selector;
        let indicator = match self.inner.page.query_selector(selector) {
            Ok(Some(node)) => node,
            Ok(None) => {
                warn!(selector = %selector, "Loader element not found");
                return false;
            }
            Err(e) => {
                warn!(selector = %selector, error = %e, "Loader selector rejected");
                return false;
            }
        };

        {
            let mut state = self.inner.state.lock();
            state.indicator = Some(indicator);
            if self.inner.page.ready_state() == ReadyState::Loading {
                self.show(&mut state);
            }
        }

        if self.inner.page.ready_state() == ReadyState::Loading {
            let coordinator = self.clone();
            self.inner.page.on_load(move || coordinator.reset());
        }

        self.install_interception();
        true
    }

    /// Hooks the page's fetch slot, image attribute assignment and structural insertions.
    pub fn install_interception(&self) {
        let mut session = self.inner.session.lock();
        if session.is_some() {
            warn!("Interception already installed");
            return;
        }
        let installed = InstrumentationSession::install(self);
        info!(session = %installed.id(), "Resource interception installed");
        *session = Some(installed);
    }

    pub fn increment(&self) {
        let mut state = self.inner.state.lock();
        state.active += 1;
        self.show(&mut state);
        debug!(active = state.active, "Tracked operation started");
    }

    pub fn decrement(&self) {
        let mut state = self.inner.state.lock();
        if state.active == 0 {
            warn!("Active requests went negative, resetting to 0");
        } else {
            state.active -= 1;
        }
        self.hide(&mut state);
        debug!(active = state.active, "Tracked operation settled");
    }

    /// Zeroes the counter and forgets tracked locators. Interception stays installed.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.active = 0;
        state.tracked.clear();
        self.hide(&mut state);
        debug!("Busy state reset");
    }

    /// Restores every intercepted primitive, zeroes the counter and hides the indicator.
    pub fn teardown(&self) {
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            let id = session.id();
            session.uninstall(&self.inner.page);
            info!(session = %id, "Resource interception removed");
        }

        let mut state = self.inner.state.lock();
        state.tracked.clear();
        state.active = 0;
        if let Some(node) = state.indicator {
            self.set_indicator(node, INDICATOR_HIDDEN);
        }
        state.on = false;
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn is_busy(&self) -> bool {
        self.active_count() > 0
    }

    pub fn indicator(&self) -> Option<NodeId> {
        self.inner.state.lock().indicator
    }

    pub fn indicator_on(&self) -> bool {
        self.inner.state.lock().on
    }

    pub fn is_tracked(&self, locator: &str) -> bool {
        let key = self.inner.page.resolve_url(locator);
        self.inner.state.lock().tracked.contains(&key)
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.state.lock().tracked.len()
    }

    pub fn is_intercepting(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.inner.session.lock().as_ref().map(|s| s.id())
    }

    /// Counts an element's resource until its first load or error event.
    ///
    /// Returns `false` when the locator is already tracked.
    pub(crate) fn track_element(&self, kind: ResourceKind, node: NodeId, locator: &str) -> bool {
        let key = self.inner.page.resolve_url(locator);
        if !self.inner.state.lock().tracked.insert(key.clone()) {
            return false;
        }
        self.increment();
        debug!(kind = %kind, url = %key, "Tracking resource");

        // Load and error share one latch; whichever fires first removes the other.
        let settled = Arc::new(AtomicBool::new(false));
        let pending: Arc<Mutex<Vec<ListenerId>>> = Arc::default();
        for event in [ElementEvent::Load, ElementEvent::Error] {
            let coordinator = self.clone();
            let settled_flag = Arc::clone(&settled);
            let siblings = Arc::clone(&pending);
            let url = key.clone();
            let registered = self.inner.page.add_listener_once(node, event, move |fired| {
                if settled_flag.swap(true, Ordering::SeqCst) {
                    return;
                }
                coordinator.forget_listeners(node, &siblings);
                if fired == ElementEvent::Error {
                    error!(kind = %kind, url = %url, "Resource failed");
                }
                coordinator.decrement();
            });

            match registered {
                Ok(listener) if settled.load(Ordering::SeqCst) => {
                    self.inner.page.remove_listener(node, listener);
                }
                Ok(listener) => pending.lock().push(listener),
                Err(e) => {
                    warn!(kind = %kind, url = %key, error = %e, "Could not observe resource");
                    if !settled.swap(true, Ordering::SeqCst) {
                        self.forget_listeners(node, &pending);
                        self.decrement();
                    }
                    break;
                }
            }
        }
        true
    }

    fn forget_listeners(&self, node: NodeId, listeners: &Mutex<Vec<ListenerId>>) {
        let listeners = std::mem::take(&mut *listeners.lock());
        for listener in listeners {
            self.inner.page.remove_listener(node, listener);
        }
    }

    fn show(&self, state: &mut BusyState) {
        if let Some(node) = state.indicator {
            if !state.on {
                self.set_indicator(node, INDICATOR_SHOWN);
                state.on = true;
            }
        }
    }

    fn hide(&self, state: &mut BusyState) {
        if let Some(node) = state.indicator {
            if state.on && state.active == 0 {
                self.set_indicator(node, INDICATOR_HIDDEN);
                state.on = false;
            }
        }
    }

    fn set_indicator(&self, node: NodeId, display: &str) {
        if let Err(e) = self.inner.page.set_display(node, display) {
            warn!(error = %e, "Failed to toggle loader element");
        }
    }
}

impl BusyTracker for ResourceLoadCoordinator {
    fn increment(&self) {
        ResourceLoadCoordinator::increment(self);
    }

    fn decrement(&self) {
        ResourceLoadCoordinator::decrement(self);
    }
}

impl Module for ResourceLoadCoordinator {
    fn cleanup(&self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTML: &str = r#"<html><head></head><body><div data-app-loader></div></body></html>"#;

    fn coordinator() -> ResourceLoadCoordinator {
        let page = Arc::new(Page::parse("https://site.example.com/", HTML));
        page.finish_loading();
        let coordinator = ResourceLoadCoordinator::new(page, LoaderConfig::default());
        assert!(coordinator.init());
        coordinator
    }

    fn display(c: &ResourceLoadCoordinator) -> Option<String> {
        c.page().display(c.indicator().unwrap())
    }

    #[test]
    fn indicator_follows_the_counter() {
        let c = coordinator();
        assert_eq!(display(&c), None);

        c.increment();
        c.increment();
        assert_eq!(display(&c).as_deref(), Some(INDICATOR_SHOWN));

        c.decrement();
        assert!(c.is_busy());
        assert_eq!(display(&c).as_deref(), Some(INDICATOR_SHOWN));

        c.decrement();
        assert!(!c.is_busy());
        assert!(!c.indicator_on());
        assert_eq!(display(&c).as_deref(), Some(INDICATOR_HIDDEN));
    }

    #[test]
    fn underflow_is_clamped() {
        let c = coordinator();
        c.decrement();
        c.decrement();
        assert_eq!(c.active_count(), 0);
        // Never shown, so never touched.
        assert_eq!(display(&c), None);

        c.increment();
        assert_eq!(c.active_count(), 1);
        assert!(c.indicator_on());
    }

    #[test]
    fn reset_forgets_tracked_locators() {
        let c = coordinator();
        let node = c.indicator().unwrap();
        assert!(c.track_element(ResourceKind::Image, node, "/a.png"));
        assert!(!c.track_element(ResourceKind::Image, node, "https://site.example.com/a.png"));
        assert_eq!(c.active_count(), 1);

        c.reset();
        assert_eq!(c.active_count(), 0);
        assert_eq!(c.tracked_count(), 0);
        assert!(!c.indicator_on());
        assert!(c.is_intercepting());
    }
}
