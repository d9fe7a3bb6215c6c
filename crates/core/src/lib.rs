use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

mod config;
mod error;

pub use config::{BASE_URL_ENV, DEFAULT_INDICATOR_SELECTOR, LoaderConfig};
pub use error::{ErrorCategory, LoadError, TransportError};

/// Header overrides supplied by callers, merged over any defaults.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
}

/// A single request handed to the host's network primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            method: Method::Post,
            headers: Headers::new(),
            body: Some(body),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Caller headers win over anything already set on the request.
    pub fn with_headers(mut self, overrides: Option<&Headers>) -> Self {
        if let Some(overrides) = overrides {
            for (name, value) in overrides {
                self.headers.insert(name.clone(), value.clone());
            }
        }
        self
    }
}

/// A settled response. Non-2xx statuses are still responses, not transport errors.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            status,
            status_text: String::new(),
            body: body.into(),
        }
    }

    pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = text.into();
        self
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Kinds of asynchronous page work the coordinator counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Fetch,
    Image,
    Stylesheet,
    Script,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Fetch => "fetch",
            ResourceKind::Image => "image",
            ResourceKind::Stylesheet => "stylesheet",
            ResourceKind::Script => "script",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The host's network primitive.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError>;
}

/// Receives one `increment` when tracked work starts and one `decrement` when it settles.
pub trait BusyTracker: Send + Sync {
    fn increment(&self);
    fn decrement(&self);
}

/// Pairs an `increment` with exactly one `decrement`, issued when the guard drops.
///
/// Holding the guard across a transfer keeps the pairing intact on success,
/// failure, and when the surrounding future is dropped mid-flight.
pub struct BusyGuard {
    tracker: Option<Arc<dyn BusyTracker>>,
}

impl BusyGuard {
    pub fn begin(tracker: Option<Arc<dyn BusyTracker>>) -> Self {
        if let Some(tracker) = &tracker {
            tracker.increment();
        }
        Self { tracker }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.decrement();
        }
    }
}

/// Contract every registered page module honours before it is replaced or discarded.
pub trait Module: Send + Sync {
    fn cleanup(&self);
}

pub fn is_absolute(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

/// Prefix `locator` with `base` unless it is already absolute.
pub fn resolve_locator(base: &str, locator: &str) -> String {
    if is_absolute(locator) {
        locator.to_string()
    } else {
        format!("{}{}", base, locator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Default)]
    struct Counter(AtomicI64);

    impl BusyTracker for Counter {
        fn increment(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn decrement(&self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn resolves_relative_locators_against_base() {
        assert_eq!(
            resolve_locator("https://api.example.com", "/data/a.json"),
            "https://api.example.com/data/a.json"
        );
        assert_eq!(resolve_locator("", "/data/a.json"), "/data/a.json");
        assert_eq!(
            resolve_locator("https://api.example.com", "http://cdn.example.com/x.json"),
            "http://cdn.example.com/x.json"
        );
    }

    #[test]
    fn busy_guard_pairs_increment_with_decrement() {
        let counter = Arc::new(Counter::default());
        let tracker: Arc<dyn BusyTracker> = counter.clone();
        {
            let _guard = BusyGuard::begin(Some(tracker));
            assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        // No tracker configured: nothing to report.
        drop(BusyGuard::begin(None));
    }

    #[test]
    fn caller_headers_override_defaults() {
        let mut overrides = Headers::new();
        overrides.insert("Content-Type".into(), "text/plain".into());
        overrides.insert("X-Token".into(), "abc".into());

        let request = FetchRequest::post("/submit", b"{}".to_vec())
            .with_header("Content-Type", "application/json")
            .with_headers(Some(&overrides));

        assert_eq!(request.headers["Content-Type"], "text/plain");
        assert_eq!(request.headers["X-Token"], "abc");
        assert_eq!(request.method, Method::Post);
    }

    #[test]
    fn response_status_classification() {
        assert!(FetchResponse::new("/a", 204, Vec::new()).is_ok());
        assert!(!FetchResponse::new("/a", 404, Vec::new()).is_ok());
        assert!(!FetchResponse::new("/a", 301, Vec::new()).is_ok());

        let response = FetchResponse::new("/a", 200, br#"{"n": 3}"#.to_vec());
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["n"], 3);
    }
}
