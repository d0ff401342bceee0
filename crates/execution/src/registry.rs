//! Factory registry and singleton cache for broker backends.
//!
//! Backends register a factory under their [`BrokerId`]; `create` hands out
//! a cached singleton (or a fresh instance on request), and the "active"
//! backend comes from settings with the first-registered backend as the
//! default. Unknown identifiers always signal `UnknownBroker`.

use parking_lot::RwLock;
use signal_trade_core::{AppSettings, Broker, BrokerError, BrokerId, BrokerResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Constructs a backend instance on demand. Construction may fail (e.g.
/// the HTTP client cannot be built), which `create` propagates.
pub type BrokerFactory = Arc<dyn Fn() -> BrokerResult<Arc<dyn Broker>> + Send + Sync>;

/// Registry of broker backends.
pub struct BrokerRegistry {
    factories: RwLock<HashMap<BrokerId, BrokerFactory>>,
    /// Registration order; the first entry is the default backend.
    order: RwLock<Vec<BrokerId>>,
    instances: RwLock<HashMap<BrokerId, Arc<dyn Broker>>>,
}

impl Default for BrokerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a backend factory. The first registered backend becomes
    /// the default. Re-registering replaces the factory and drops any
    /// cached instance.
    pub fn register(&self, id: BrokerId, factory: BrokerFactory) {
        let mut factories = self.factories.write();
        if factories.insert(id, factory).is_some() {
            self.instances.write().remove(&id);
        } else {
            self.order.write().push(id);
        }
        tracing::debug!(broker = %id, "registered broker backend");
    }

    /// Unregisters a backend, dropping its factory and cached instance.
    pub fn unregister(&self, id: BrokerId) {
        self.factories.write().remove(&id);
        self.instances.write().remove(&id);
        self.order.write().retain(|b| *b != id);
        tracing::debug!(broker = %id, "unregistered broker backend");
    }

    /// Whether a backend is registered.
    #[must_use]
    pub fn is_registered(&self, id: BrokerId) -> bool {
        self.factories.read().contains_key(&id)
    }

    /// Registered backend ids in registration order.
    #[must_use]
    pub fn list_available(&self) -> Vec<BrokerId> {
        self.order.read().clone()
    }

    /// The default backend (first registered), if any.
    #[must_use]
    pub fn default_broker(&self) -> Option<BrokerId> {
        self.order.read().first().copied()
    }

    /// Creates or retrieves a backend instance.
    ///
    /// With `cache` the per-process singleton is returned (constructed on
    /// first use); without it a fresh instance is built and not cached.
    ///
    /// # Errors
    /// `UnknownBroker` when no factory is registered for `id`.
    pub fn create(&self, id: BrokerId, cache: bool) -> BrokerResult<Arc<dyn Broker>> {
        if cache {
            if let Some(instance) = self.instances.read().get(&id) {
                return Ok(instance.clone());
            }
        }

        let factory = self
            .factories
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| BrokerError::unknown_broker(id.as_str()))?;
        let instance = factory()?;

        if cache {
            self.instances.write().insert(id, instance.clone());
        }
        Ok(instance)
    }

    /// Resolves the active backend from settings, falling back to the
    /// default backend when no selection is stored.
    ///
    /// # Errors
    /// `UnknownBroker` when the selected backend is not registered, or
    /// when nothing is registered at all.
    pub fn active_broker(&self, settings: &AppSettings) -> BrokerResult<Arc<dyn Broker>> {
        let id = settings
            .active_broker
            .or_else(|| self.default_broker())
            .ok_or_else(|| BrokerError::unknown_broker("none configured"))?;
        self.create(id, true)
    }

    /// Drops every cached instance; factories stay registered.
    pub fn clear_instances(&self) {
        self.instances.write().clear();
    }
}
