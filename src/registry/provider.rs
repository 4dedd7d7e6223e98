//! Process-wide holder of the active registry.
//!
//! Exactly one registry is active at a time. Installing a replacement does
//! not close the previous one; `close_service_registry` is the only place a
//! registry is shut down.

use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::registry::ServiceRegistry;

static PROVIDER: Lazy<RwLock<Option<Arc<dyn ServiceRegistry>>>> = Lazy::new(|| RwLock::new(None));

/// Returns the currently active registry, or `None` before initialization.
/// Never observes a half-constructed registry: installation happens only
/// after the backend probe succeeded.
pub fn get_registry() -> Option<Arc<dyn ServiceRegistry>> {
    let slot = PROVIDER.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.clone()
}

/// Installs a fully constructed registry as the active one.
pub fn set_registry(registry: Arc<dyn ServiceRegistry>) {
    let mut slot = PROVIDER
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(registry);
}
