//! Named service registry with lazy resolution.
//!
//! Factories are registered by name at startup; `resolve` invokes the
//! factory once and caches the instance. Callers must not create
//! resolution cycles between factories.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type ServiceFactory = Box<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>;

#[derive(Default)]
pub struct ServiceRegistry {
    factories: RwLock<HashMap<String, ServiceFactory>>,
    cache: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a name. A later registration under the
    /// same name replaces the earlier one (and drops its cached instance).
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync + 'static,
    {
        let name = name.into();
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&name);
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, Box::new(factory));
    }

    /// Register an already-built instance.
    pub fn register_instance<T: Send + Sync + 'static>(
        &self,
        name: impl Into<String>,
        instance: Arc<T>,
    ) {
        self.register(name, move || instance.clone() as Arc<dyn Any + Send + Sync>);
    }

    /// Resolve a service by name, invoking its factory on first use and
    /// caching the result. Returns `None` for unknown names or when the
    /// cached instance is not a `T`.
    pub fn resolve<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return cached.clone().downcast::<T>().ok();
        }

        let instance = {
            let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
            factories.get(name)?()
        };
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), instance.clone());
        instance.downcast::<T>().ok()
    }

    /// Whether a factory is registered under `name`.
    pub fn has(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Drop all cached instances. Factories stay registered and will be
    /// re-invoked on the next resolve.
    pub fn clear(&self) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ServiceRegistry")
            .field("service_count", &factories.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Greeter {
        greeting: String,
    }

    #[test]
    fn resolve_invokes_factory_once() {
        let registry = ServiceRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let factory_calls = calls.clone();
        registry.register("greeter", move || {
            factory_calls.fetch_add(1, Ordering::SeqCst);
            Arc::new(Greeter {
                greeting: "hello".to_string(),
            })
        });

        let first = registry.resolve::<Greeter>("greeter").unwrap();
        let second = registry.resolve::<Greeter>("greeter").unwrap();
        assert_eq!(first.greeting, "hello");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.resolve::<Greeter>("missing").is_none());
        assert!(!registry.has("missing"));
    }

    #[test]
    fn clear_drops_cache_but_keeps_factories() {
        let registry = ServiceRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let factory_calls = calls.clone();
        registry.register("greeter", move || {
            factory_calls.fetch_add(1, Ordering::SeqCst);
            Arc::new(Greeter {
                greeting: "hi".to_string(),
            })
        });

        registry.resolve::<Greeter>("greeter").unwrap();
        registry.clear();
        assert!(registry.has("greeter"));
        registry.resolve::<Greeter>("greeter").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn register_instance_resolves_same_arc() {
        let registry = ServiceRegistry::new();
        let greeter = Arc::new(Greeter {
            greeting: "yo".to_string(),
        });
        registry.register_instance("greeter", greeter.clone());

        let resolved = registry.resolve::<Greeter>("greeter").unwrap();
        assert!(Arc::ptr_eq(&greeter, &resolved));
    }

    #[test]
    fn wrong_type_resolves_to_none() {
        let registry = ServiceRegistry::new();
        registry.register_instance("greeter", Arc::new(Greeter { greeting: String::new() }));
        assert!(registry.resolve::<String>("greeter").is_none());
    }

    #[test]
    fn re_registration_replaces() {
        let registry = ServiceRegistry::new();
        registry.register_instance("greeter", Arc::new(Greeter { greeting: "a".into() }));
        registry.resolve::<Greeter>("greeter").unwrap();
        registry.register_instance("greeter", Arc::new(Greeter { greeting: "b".into() }));

        let resolved = registry.resolve::<Greeter>("greeter").unwrap();
        assert_eq!(resolved.greeting, "b");
    }
}
