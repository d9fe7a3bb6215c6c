//! Request client with single-flight JSON loading and a result cache.

use loadwatch_core::{
    BusyGuard, BusyTracker, FetchRequest, Fetcher, Headers, LoadError, LoaderConfig, Module,
    resolve_locator,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// A parsed JSON payload, shared between the cache and every caller that asked for it.
pub type Payload = Arc<Value>;

type Outcome = Result<Payload, LoadError>;

/// Callers waiting on one transfer. `generation` tells a settling transfer
/// whether the entry it registered is still the current one.
struct Flight {
    generation: u64,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

#[derive(Default)]
struct CacheState {
    completed: HashMap<String, Payload>,
    in_flight: HashMap<String, Flight>,
    generation: u64,
}

impl CacheState {
    fn owns(&self, key: &str, generation: u64) -> bool {
        self.in_flight
            .get(key)
            .is_some_and(|f| f.generation == generation)
    }
}

/// Settles a flight exactly once. If the transfer task ends without
/// settling (a panic or a dropped runtime), the flight is removed on drop and
/// its waiters see their senders go away.
struct FlightGuard {
    cache: RequestCache,
    key: String,
    generation: u64,
    settled: bool,
}

impl FlightGuard {
    /// Takes the waiters of the current flight, caching `outcome` when it succeeded.
    fn settle(&mut self, outcome: &Outcome) -> Vec<oneshot::Sender<Outcome>> {
        self.settled = true;
        let mut guard = self.cache.inner.state.lock();
        let state = &mut *guard;
        if !state.owns(&self.key, self.generation) {
            return Vec::new();
        }
        if let Ok(payload) = outcome {
            state.completed.insert(self.key.clone(), Arc::clone(payload));
        }
        state
            .in_flight
            .remove(&self.key)
            .map(|f| f.waiters)
            .unwrap_or_default()
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let orphaned = {
            let mut state = self.cache.inner.state.lock();
            if state.owns(&self.key, self.generation) {
                state.in_flight.remove(&self.key)
            } else {
                None
            }
        };
        if let Some(flight) = orphaned {
            warn!(
                url = %self.key,
                waiters = flight.waiters.len(),
                "Transfer ended without settling"
            );
        }
    }
}

enum Join {
    Cached(Payload),
    Waiting(oneshot::Receiver<Outcome>),
    Leading(oneshot::Receiver<Outcome>, u64),
}

struct Inner {
    base_url: String,
    fetcher: Arc<dyn Fetcher>,
    tracker: Option<Arc<dyn BusyTracker>>,
    state: Mutex<CacheState>,
}

/// Issues JSON, text and submit requests, reporting each transfer to an optional busy tracker.
///
/// Only `load_json` deduplicates concurrent requests and caches results;
/// `load_text` and `post` always perform a fresh transfer.
#[derive(Clone)]
pub struct RequestCache {
    inner: Arc<Inner>,
}

impl RequestCache {
    pub fn new(
        base_url: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        tracker: Option<Arc<dyn BusyTracker>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                base_url: base_url.into(),
                fetcher,
                tracker,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    pub fn from_config(
        config: &LoaderConfig,
        fetcher: Arc<dyn Fetcher>,
        tracker: Option<Arc<dyn BusyTracker>>,
    ) -> Self {
        Self::new(config.base_url.clone(), fetcher, tracker)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// The request key for `locator`.
    pub fn resolve(&self, locator: &str) -> String {
        resolve_locator(&self.inner.base_url, locator)
    }

    /// Loads and parses a JSON document.
    ///
    /// Served from the cache when present; joins the pending transfer when one
    /// is already running for the same key. Failures are returned to every
    /// waiting caller and never cached.
    pub async fn load_json(
        &self,
        locator: &str,
        headers: Option<&Headers>,
    ) -> Result<Payload, LoadError> {
        let key = self.resolve(locator);

        let join = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if let Some(payload) = state.completed.get(&key) {
                Join::Cached(Arc::clone(payload))
            } else {
                let (tx, rx) = oneshot::channel();
                if let Some(flight) = state.in_flight.get_mut(&key) {
                    flight.waiters.push(tx);
                    Join::Waiting(rx)
                } else {
                    state.generation += 1;
                    let generation = state.generation;
                    state.in_flight.insert(
                        key.clone(),
                        Flight {
                            generation,
                            waiters: vec![tx],
                        },
                    );
                    Join::Leading(rx, generation)
                }
            }
        };

        let rx = match join {
            Join::Cached(payload) => {
                debug!(url = %key, "Serving cached JSON");
                return Ok(payload);
            }
            Join::Waiting(rx) => {
                debug!(url = %key, "Joining in-flight request");
                rx
            }
            Join::Leading(rx, generation) => {
                let busy = BusyGuard::begin(self.inner.tracker.clone());
                let flight = FlightGuard {
                    cache: self.clone(),
                    key: key.clone(),
                    generation,
                    settled: false,
                };
                let request = FetchRequest::get(&key).with_headers(headers);
                tokio::spawn(Self::settle_json(flight, request, busy));
                rx
            }
        };

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(LoadError::Abandoned { url: key }),
        }
    }

    /// Loads a text body. Never deduplicated or cached; failures are logged and yield `None`.
    pub async fn load_text(&self, locator: &str, headers: Option<&Headers>) -> Option<String> {
        let key = self.resolve(locator);
        let _busy = BusyGuard::begin(self.inner.tracker.clone());

        match self.fetch_text(&key, headers).await {
            Ok(text) => Some(text),
            Err(e) => {
                error!(url = %key, error = %e, "Error loading text");
                None
            }
        }
    }

    /// Submits `body` as JSON and parses the JSON reply. Failures are logged and yield `None`.
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        locator: &str,
        body: &B,
        headers: Option<&Headers>,
    ) -> Option<Value> {
        let key = self.resolve(locator);
        let _busy = BusyGuard::begin(self.inner.tracker.clone());

        match self.submit(&key, body, headers).await {
            Ok(value) => Some(value),
            Err(e) => {
                error!(url = %key, error = %e, "Error posting data");
                None
            }
        }
    }

    /// Drops one cached entry, or all of them when `locator` is `None`.
    pub fn clear_cache(&self, locator: Option<&str>) {
        let mut state = self.inner.state.lock();
        match locator {
            Some(locator) => {
                let key = self.resolve(locator);
                state.completed.remove(&key);
                debug!(url = %key, "Cache entry cleared");
            }
            None => {
                state.completed.clear();
                debug!("Cache cleared");
            }
        }
    }

    pub fn cache_size(&self) -> usize {
        self.inner.state.lock().completed.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    pub fn is_cached(&self, locator: &str) -> bool {
        let key = self.resolve(locator);
        self.inner.state.lock().completed.contains_key(&key)
    }

    /// Empties both maps.
    ///
    /// Callers still waiting on a cleared transfer receive `LoadError::Abandoned`.
    pub fn cleanup(&self) {
        let mut state = self.inner.state.lock();
        state.completed.clear();
        state.in_flight.clear();
        debug!("Request cache cleaned up");
    }

    async fn settle_json(mut flight: FlightGuard, request: FetchRequest, busy: BusyGuard) {
        let outcome = flight.cache.fetch_json(&flight.key, request).await;
        let waiters = flight.settle(&outcome);
        drop(busy);

        match &outcome {
            Ok(_) => debug!(url = %flight.key, waiters = waiters.len(), "JSON loaded"),
            Err(e) => error!(url = %flight.key, error = %e, "Error loading JSON"),
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn fetch_json(&self, key: &str, request: FetchRequest) -> Result<Payload, LoadError> {
        let response = self.inner.fetcher.fetch(request).await?;
        if !response.is_ok() {
            return Err(LoadError::Status {
                url: key.to_string(),
                status: response.status,
                status_text: response.status_text,
            });
        }
        let value: Value = response.json().map_err(|e| LoadError::Parse {
            url: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(Arc::new(value))
    }

    async fn fetch_text(&self, key: &str, headers: Option<&Headers>) -> Result<String, LoadError> {
        let request = FetchRequest::get(key).with_headers(headers);
        let response = self.inner.fetcher.fetch(request).await?;
        if !response.is_ok() {
            return Err(LoadError::Status {
                url: key.to_string(),
                status: response.status,
                status_text: response.status_text,
            });
        }
        Ok(response.text())
    }

    async fn submit<B: Serialize + ?Sized>(
        &self,
        key: &str,
        body: &B,
        headers: Option<&Headers>,
    ) -> Result<Value, LoadError> {
        let payload = serde_json::to_vec(body).map_err(|e| LoadError::Encode {
            url: key.to_string(),
            message: e.to_string(),
        })?;
        let request = FetchRequest::post(key, payload)
            .with_header("Content-Type", "application/json")
            .with_headers(headers);

        let response = self.inner.fetcher.fetch(request).await?;
        if !response.is_ok() {
            return Err(LoadError::Status {
                url: key.to_string(),
                status: response.status,
                status_text: response.status_text,
            });
        }
        response.json().map_err(|e| LoadError::Parse {
            url: key.to_string(),
            message: e.to_string(),
        })
    }
}

impl Module for RequestCache {
    fn cleanup(&self) {
        RequestCache::cleanup(self);
    }
}
