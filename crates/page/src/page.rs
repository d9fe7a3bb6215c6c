use async_trait::async_trait;
use loadwatch_core::{FetchRequest, FetchResponse, Fetcher, TransportError};
use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::dom::{AddedNode, Element, ElementEvent, NodeId, ObserveTarget, ReadyState, Subtree};
use crate::fetcher::ReqwestFetcher;

pub type ObserverCallback = Arc<dyn Fn(&[AddedNode]) + Send + Sync>;
type Listener = Box<dyn FnOnce(ElementEvent) + Send>;
type LoadListener = Box<dyn FnOnce() + Send>;

/// Runs before an `<img>` attribute assignment is applied.
pub trait AttributeHook: Send + Sync {
    fn on_set_attribute(&self, page: &Page, node: NodeId, name: &str, value: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Error)]
pub enum PageError {
    #[error("Invalid selector {selector}: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("Unknown element {0}")]
    UnknownNode(NodeId),
}

struct Node {
    element: Element,
    display: Option<String>,
}

struct ObserverEntry {
    handle: ObserverHandle,
    target: ObserveTarget,
    callback: ObserverCallback,
}

struct ListenerEntry {
    id: ListenerId,
    event: ElementEvent,
    callback: Listener,
}

struct PageState {
    ready_state: ReadyState,
    nodes: HashMap<NodeId, Node>,
    next_node: u64,
    next_handle: u64,
    observers: Vec<ObserverEntry>,
    listeners: HashMap<NodeId, Vec<ListenerEntry>>,
    load_listeners: Vec<LoadListener>,
}

impl PageState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn insert_node(&mut self, element: Element) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(
            id,
            Node {
                element,
                display: None,
            },
        );
        id
    }

    fn observers_for(&self, subtree: Subtree) -> Vec<ObserverCallback> {
        self.observers
            .iter()
            .filter(|o| o.target.covers(subtree))
            .map(|o| Arc::clone(&o.callback))
            .collect()
    }
}

/// The host environment one page view runs in.
///
/// Holds the parsed document, the swappable network primitive, the image
/// attribute hook, structural observers and per-element one-shot listeners.
/// Callbacks are always invoked after the internal lock is released, so they
/// may call back into the page.
pub struct Page {
    url: String,
    source: String,
    state: Mutex<PageState>,
    fetcher: RwLock<Arc<dyn Fetcher>>,
    image_hook: RwLock<Option<Arc<dyn AttributeHook>>>,
}

impl Page {
    pub fn parse(url: &str, html: &str) -> Self {
        Self::with_fetcher(url, html, Arc::new(ReqwestFetcher::new()))
    }

    pub fn with_fetcher(url: &str, html: &str, fetcher: Arc<dyn Fetcher>) -> Self {
        let document = Html::parse_document(html);
        let mut state = PageState {
            ready_state: ReadyState::Loading,
            nodes: HashMap::new(),
            next_node: 0,
            next_handle: 0,
            observers: Vec::new(),
            listeners: HashMap::new(),
            load_listeners: Vec::new(),
        };

        for el in document_elements(&document) {
            state.insert_node(element_from(&el));
        }
        debug!(url, elements = state.nodes.len(), "Parsed page");

        Self {
            url: url.to_string(),
            source: html.to_string(),
            state: Mutex::new(state),
            fetcher: RwLock::new(fetcher),
            image_hook: RwLock::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Absolute form of `href` against the page URL, as element `href`/`src` properties report it.
    pub fn resolve_url(&self, href: &str) -> String {
        match Url::parse(&self.url).and_then(|base| base.join(href)) {
            Ok(url) => url.to_string(),
            Err(_) => href.to_string(),
        }
    }

    /// First element of the parsed markup matching `selector`.
    pub fn query_selector(&self, selector: &str) -> Result<Option<NodeId>, PageError> {
        let parsed = Selector::parse(selector).map_err(|e| PageError::InvalidSelector {
            selector: selector.to_string(),
            message: e.to_string(),
        })?;
        let document = Html::parse_document(&self.source);
        let Some(found) = document.select(&parsed).next() else {
            return Ok(None);
        };
        let position = document_elements(&document)
            .iter()
            .position(|el| el.id() == found.id());
        Ok(position.map(|i| NodeId(i as u64)))
    }

    pub fn element(&self, id: NodeId) -> Option<Element> {
        self.state.lock().nodes.get(&id).map(|n| n.element.clone())
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state.lock().ready_state
    }

    /// Registers a callback for the window load event. Fires only on the transition to `Complete`.
    pub fn on_load(&self, callback: impl FnOnce() + Send + 'static) {
        self.state.lock().load_listeners.push(Box::new(callback));
    }

    pub fn finish_loading(&self) {
        let listeners = {
            let mut state = self.state.lock();
            if state.ready_state == ReadyState::Complete {
                return;
            }
            state.ready_state = ReadyState::Complete;
            std::mem::take(&mut state.load_listeners)
        };
        debug!(url = %self.url, listeners = listeners.len(), "Page load complete");
        for listener in listeners {
            listener();
        }
    }

    /// Creates a detached element. Initial attributes bypass the image attribute hook.
    pub fn create_element(&self, element: Element) -> NodeId {
        self.state.lock().insert_node(element)
    }

    /// Attaches an element and notifies every observer covering `subtree`.
    pub fn append(&self, id: NodeId, subtree: Subtree) -> Result<(), PageError> {
        let (record, callbacks) = {
            let state = self.state.lock();
            let node = state.nodes.get(&id).ok_or(PageError::UnknownNode(id))?;
            let record = AddedNode {
                id,
                element: node.element.clone(),
                subtree,
            };
            (record, state.observers_for(subtree))
        };
        for callback in callbacks {
            callback(std::slice::from_ref(&record));
        }
        Ok(())
    }

    /// Parses `markup` as a fragment and attaches every element in it as one batch.
    pub fn append_html(&self, subtree: Subtree, markup: &str) -> Vec<NodeId> {
        let elements: Vec<Element> = {
            let fragment = Html::parse_fragment(markup);
            fragment
                .root_element()
                .descendants()
                .filter_map(ElementRef::wrap)
                .filter(|el| el.value().name() != "html")
                .map(|el| element_from(&el))
                .collect()
        };

        let (records, callbacks) = {
            let mut state = self.state.lock();
            let records: Vec<AddedNode> = elements
                .into_iter()
                .map(|element| {
                    let id = state.insert_node(element.clone());
                    AddedNode {
                        id,
                        element,
                        subtree,
                    }
                })
                .collect();
            (records, state.observers_for(subtree))
        };

        if !records.is_empty() {
            for callback in callbacks {
                callback(&records);
            }
        }
        records.into_iter().map(|r| r.id).collect()
    }

    /// Assigns an attribute. Assignments on `<img>` pass through the installed image hook first.
    pub fn set_attribute(&self, id: NodeId, name: &str, value: &str) -> Result<(), PageError> {
        let is_image = {
            let state = self.state.lock();
            let node = state.nodes.get(&id).ok_or(PageError::UnknownNode(id))?;
            node.element.tag == "img"
        };

        if is_image {
            let hook = self.image_hook.read().clone();
            if let Some(hook) = hook {
                hook.on_set_attribute(self, id, name, value);
            }
        }

        let mut state = self.state.lock();
        let node = state.nodes.get_mut(&id).ok_or(PageError::UnknownNode(id))?;
        node.element.set_attr(name, value);
        Ok(())
    }

    pub fn image_hook(&self) -> Option<Arc<dyn AttributeHook>> {
        self.image_hook.read().clone()
    }

    /// Installs `hook` and returns the one it replaced.
    pub fn replace_image_hook(
        &self,
        hook: Option<Arc<dyn AttributeHook>>,
    ) -> Option<Arc<dyn AttributeHook>> {
        std::mem::replace(&mut *self.image_hook.write(), hook)
    }

    pub fn observe(
        &self,
        target: ObserveTarget,
        callback: impl Fn(&[AddedNode]) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let mut state = self.state.lock();
        let handle = ObserverHandle(state.next_handle());
        state.observers.push(ObserverEntry {
            handle,
            target,
            callback: Arc::new(callback),
        });
        handle
    }

    pub fn disconnect(&self, handle: ObserverHandle) -> bool {
        let mut state = self.state.lock();
        let before = state.observers.len();
        state.observers.retain(|o| o.handle != handle);
        state.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Registers a listener removed after its first delivery.
    pub fn add_listener_once(
        &self,
        id: NodeId,
        event: ElementEvent,
        callback: impl FnOnce(ElementEvent) + Send + 'static,
    ) -> Result<ListenerId, PageError> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&id) {
            return Err(PageError::UnknownNode(id));
        }
        let listener = ListenerId(state.next_handle());
        state.listeners.entry(id).or_default().push(ListenerEntry {
            id: listener,
            event,
            callback: Box::new(callback),
        });
        Ok(listener)
    }

    pub fn remove_listener(&self, id: NodeId, listener: ListenerId) -> bool {
        let mut state = self.state.lock();
        let Some(entries) = state.listeners.get_mut(&id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|l| l.id != listener);
        let removed = entries.len() != before;
        if entries.is_empty() {
            state.listeners.remove(&id);
        }
        removed
    }

    pub fn listener_count(&self, id: NodeId) -> usize {
        self.state.lock().listeners.get(&id).map_or(0, |l| l.len())
    }

    /// Fires `event` on an element, consuming its matching listeners. Returns how many ran.
    pub fn dispatch(&self, id: NodeId, event: ElementEvent) -> usize {
        let fired: Vec<Listener> = {
            let mut state = self.state.lock();
            let Some(entries) = state.listeners.get_mut(&id) else {
                return 0;
            };
            let (matching, rest): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|l| l.event == event);
            if rest.is_empty() {
                state.listeners.remove(&id);
            } else {
                *entries = rest;
            }
            matching.into_iter().map(|l| l.callback).collect()
        };
        let count = fired.len();
        for callback in fired {
            callback(event);
        }
        count
    }

    pub fn set_display(&self, id: NodeId, value: &str) -> Result<(), PageError> {
        let mut state = self.state.lock();
        let node = state.nodes.get_mut(&id).ok_or(PageError::UnknownNode(id))?;
        node.display = Some(value.to_string());
        Ok(())
    }

    pub fn display(&self, id: NodeId) -> Option<String> {
        self.state.lock().nodes.get(&id).and_then(|n| n.display.clone())
    }

    /// The network primitive currently installed.
    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::clone(&*self.fetcher.read())
    }

    /// Installs `fetcher` and returns the one it replaced.
    pub fn replace_fetcher(&self, fetcher: Arc<dyn Fetcher>) -> Arc<dyn Fetcher> {
        std::mem::replace(&mut *self.fetcher.write(), fetcher)
    }
}

/// Fetches go through whichever primitive is installed at call time.
#[async_trait]
impl Fetcher for Page {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        let fetcher = self.fetcher();
        fetcher.fetch(request).await
    }
}

fn document_elements(document: &Html) -> Vec<ElementRef<'_>> {
    document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .collect()
}

fn element_from(el: &ElementRef<'_>) -> Element {
    el.value()
        .attrs()
        .fold(Element::new(el.value().name()), |element, (name, value)| {
            element.with_attr(name, value)
        })
}
