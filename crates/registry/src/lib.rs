//! Named page modules and the wiring that brings the loader up.

use loadwatch_client::RequestCache;
use loadwatch_coordinator::ResourceLoadCoordinator;
use loadwatch_core::{BusyTracker, Fetcher, LoaderConfig, Module};
use loadwatch_page::Page;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const LOADER_MODULE: &str = "loader";
pub const API_CLIENT_MODULE: &str = "apiClient";
pub const LOADER_INITIALIZER: &str = "init_loader";

struct Entry {
    module: Arc<dyn Module>,
    typed: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct Modules {
    entries: HashMap<String, Entry>,
    initialized: HashSet<String>,
}

/// Holds at most one module per name. Replacing a module cleans up the old one first.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Mutex<Modules>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `module` under `name`, recording `initializer` when given.
    ///
    /// A module already registered under `name` is removed and cleaned up
    /// before the new one is stored.
    pub fn register<M>(&self, name: &str, module: M, initializer: Option<&str>)
    where
        M: Module + Any,
    {
        let module = Arc::new(module);
        let entry = Entry {
            module: module.clone(),
            typed: module,
        };

        let previous = self.modules.lock().entries.remove(name);
        if let Some(previous) = previous {
            warn!(module = %name, "Module already exists, replacing");
            previous.module.cleanup();
        }

        let mut modules = self.modules.lock();
        if let Some(initializer) = initializer {
            modules.initialized.insert(initializer.to_string());
        }
        modules.entries.insert(name.to_string(), entry);
        info!(module = %name, "Module registered");
    }

    /// The module registered under `name`, if it has type `T`.
    pub fn get<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let typed = self
            .modules
            .lock()
            .entries
            .get(name)
            .map(|e| Arc::clone(&e.typed));
        match typed {
            Some(typed) => typed.downcast::<T>().ok(),
            None => {
                warn!(module = %name, "Module not found");
                None
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.lock().entries.contains_key(name)
    }

    pub fn is_initialized(&self, initializer: &str) -> bool {
        self.modules.lock().initialized.contains(initializer)
    }

    pub fn len(&self) -> usize {
        self.modules.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cleans up every module and forgets them along with the initializer record.
    pub fn reset(&self) {
        let drained: Vec<(String, Entry)> = {
            let mut modules = self.modules.lock();
            modules.initialized.clear();
            modules.entries.drain().collect()
        };
        for (name, entry) in drained {
            entry.module.cleanup();
            debug!(module = %name, "Module cleaned up");
        }
        info!("All modules reset");
    }
}

/// Brings up the busy-state coordinator and the request client for `page`.
///
/// The client reports to the coordinator and issues transfers through the
/// page's fetch slot, so calls to the configured API base are counted once.
/// Modules already registered under the same names are cleaned up first.
pub fn init_loader(
    registry: &ModuleRegistry,
    page: Arc<Page>,
    config: LoaderConfig,
) -> (ResourceLoadCoordinator, RequestCache) {
    let coordinator = ResourceLoadCoordinator::new(Arc::clone(&page), config.clone());
    let tracker: Arc<dyn BusyTracker> = Arc::new(coordinator.clone());
    let fetcher: Arc<dyn Fetcher> = page;
    let client = RequestCache::from_config(&config, fetcher, Some(tracker));

    registry.register(LOADER_MODULE, coordinator.clone(), None);
    registry.register(API_CLIENT_MODULE, client.clone(), Some(LOADER_INITIALIZER));
    coordinator.init();

    (coordinator, client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingModule {
        cleanups: Arc<AtomicUsize>,
    }

    impl Module for CountingModule {
        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn replacing_a_module_cleans_up_the_old_one() {
        let registry = ModuleRegistry::new();
        let first = CountingModule::default();
        let first_cleanups = Arc::clone(&first.cleanups);

        registry.register("menu", first, None);
        registry.register("menu", CountingModule::default(), Some("init_menu"));

        assert_eq!(first_cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_initialized("init_menu"));
        assert!(registry.get::<CountingModule>("menu").is_some());
    }

    /// Records whether its name was still registered while it cleaned up.
    struct Outgoing {
        registry: Weak<ModuleRegistry>,
        seen_registered: Arc<Mutex<Option<bool>>>,
    }

    impl Module for Outgoing {
        fn cleanup(&self) {
            let registered = self.registry.upgrade().map(|r| r.contains("menu"));
            *self.seen_registered.lock() = registered;
        }
    }

    #[test]
    fn previous_module_is_cleaned_up_before_the_replacement_lands() {
        let registry = Arc::new(ModuleRegistry::new());
        let seen_registered = Arc::new(Mutex::new(None));
        registry.register(
            "menu",
            Outgoing {
                registry: Arc::downgrade(&registry),
                seen_registered: Arc::clone(&seen_registered),
            },
            None,
        );

        registry.register("menu", CountingModule::default(), None);
        assert_eq!(*seen_registered.lock(), Some(false));
        assert!(registry.get::<CountingModule>("menu").is_some());
        assert!(registry.get::<Outgoing>("menu").is_none());
    }

    #[test]
    fn typed_lookup_rejects_other_types() {
        let registry = ModuleRegistry::new();
        registry.register("menu", CountingModule::default(), None);
        assert!(registry.get::<RequestCache>("menu").is_none());
        assert!(registry.get::<CountingModule>("missing").is_none());
    }

    #[test]
    fn reset_cleans_up_everything() {
        let registry = ModuleRegistry::new();
        let a = CountingModule::default();
        let b = CountingModule::default();
        let counts = [Arc::clone(&a.cleanups), Arc::clone(&b.cleanups)];
        registry.register("a", a, Some("init_a"));
        registry.register("b", b, None);

        registry.reset();
        assert!(registry.is_empty());
        assert!(!registry.is_initialized("init_a"));
        for count in counts {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }
}
