use async_trait::async_trait;
use loadwatch_core::{
    BusyGuard, BusyTracker, FetchRequest, FetchResponse, Fetcher, ResourceKind, TransportError,
};
use loadwatch_page::{AttributeHook, Element, NodeId, ObserveTarget, ObserverHandle, Page};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::coordinator::ResourceLoadCoordinator;

/// Everything installed into a page to observe work the coordinator did not start.
///
/// Owns the original fetch primitive, the image hook it displaced and both
/// structural observers, so `uninstall` puts the page back exactly as found.
pub struct InstrumentationSession {
    id: Uuid,
    original_fetch: Arc<dyn Fetcher>,
    previous_image_hook: Option<Arc<dyn AttributeHook>>,
    observers: Vec<ObserverHandle>,
}

impl InstrumentationSession {
    pub(crate) fn install(coordinator: &ResourceLoadCoordinator) -> Self {
        let page = coordinator.page();
        let id = Uuid::new_v4();

        let original_fetch = page.fetcher();
        page.replace_fetcher(Arc::new(InterceptingFetcher {
            original: Arc::clone(&original_fetch),
            tracker: Arc::new(coordinator.clone()),
            api_base: coordinator.config().base_url.clone(),
        }));

        let previous_image_hook = page.image_hook();
        page.replace_image_hook(Some(Arc::new(ImageSrcHook {
            coordinator: coordinator.clone(),
            previous: previous_image_hook.clone(),
        })));

        let styles = coordinator.clone();
        let head = page.observe(ObserveTarget::Head, move |added| {
            for node in added {
                if let Some(href) = stylesheet_href(&node.element) {
                    styles.track_element(ResourceKind::Stylesheet, node.id, href);
                }
            }
        });

        let scripts = coordinator.clone();
        let document = page.observe(ObserveTarget::Document, move |added| {
            for node in added {
                if let Some(src) = script_src(&node.element) {
                    scripts.track_element(ResourceKind::Script, node.id, src);
                }
            }
        });

        debug!(session = %id, "Instrumentation installed");
        Self {
            id,
            original_fetch,
            previous_image_hook,
            observers: vec![head, document],
        }
    }

    pub(crate) fn uninstall(self, page: &Page) {
        page.replace_fetcher(self.original_fetch);
        page.replace_image_hook(self.previous_image_hook);
        for handle in self.observers {
            page.disconnect(handle);
        }
        debug!(session = %self.id, "Instrumentation removed");
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Stands in for the page's fetch primitive, counting every call it forwards.
struct InterceptingFetcher {
    original: Arc<dyn Fetcher>,
    tracker: Arc<dyn BusyTracker>,
    api_base: String,
}

impl InterceptingFetcher {
    /// Calls aimed at the API base are already counted by the request cache.
    fn is_api_call(&self, url: &str) -> bool {
        !self.api_base.is_empty() && url.contains(&self.api_base)
    }
}

#[async_trait]
impl Fetcher for InterceptingFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        if self.is_api_call(&request.url) {
            return self.original.fetch(request).await;
        }

        let url = request.url.clone();
        let _busy = BusyGuard::begin(Some(Arc::clone(&self.tracker)));
        let result = self.original.fetch(request).await;
        if let Err(e) = &result {
            error!(url = %url, error = %e, "External fetch failed");
        }
        result
    }
}

/// Counts every distinct image locator the first time it is assigned.
struct ImageSrcHook {
    coordinator: ResourceLoadCoordinator,
    previous: Option<Arc<dyn AttributeHook>>,
}

impl AttributeHook for ImageSrcHook {
    fn on_set_attribute(&self, page: &Page, node: NodeId, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("src") && !value.is_empty() {
            self.coordinator.track_element(ResourceKind::Image, node, value);
        }
        if let Some(previous) = &self.previous {
            previous.on_set_attribute(page, node, name, value);
        }
    }
}

fn stylesheet_href(element: &Element) -> Option<&str> {
    if element.tag != "link" {
        return None;
    }
    let rel = element.attr("rel").unwrap_or("").to_ascii_lowercase();
    let is_style = rel.split_whitespace().any(|r| r == "stylesheet")
        || (rel.split_whitespace().any(|r| r == "preload")
            && element
                .attr("as")
                .is_some_and(|a| a.eq_ignore_ascii_case("style")));
    if !is_style {
        return None;
    }
    element.attr("href").filter(|h| !h.is_empty())
}

fn script_src(element: &Element) -> Option<&str> {
    if element.tag != "script" {
        return None;
    }
    element.attr("src").filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_stylesheets_and_style_preloads() {
        let sheet = Element::new("link")
            .with_attr("rel", "stylesheet")
            .with_attr("href", "/a.css");
        assert_eq!(stylesheet_href(&sheet), Some("/a.css"));

        let preload = Element::new("link")
            .with_attr("rel", "preload")
            .with_attr("as", "style")
            .with_attr("href", "/b.css");
        assert_eq!(stylesheet_href(&preload), Some("/b.css"));

        let font = Element::new("link")
            .with_attr("rel", "preload")
            .with_attr("as", "font")
            .with_attr("href", "/c.woff2");
        assert_eq!(stylesheet_href(&font), None);

        let icon = Element::new("link")
            .with_attr("rel", "icon")
            .with_attr("href", "/i.png");
        assert_eq!(stylesheet_href(&icon), None);
    }

    #[test]
    fn inline_scripts_are_ignored() {
        assert_eq!(script_src(&Element::new("script")), None);
        let external = Element::new("script").with_attr("src", "/app.js");
        assert_eq!(script_src(&external), Some("/app.js"));
    }
}
