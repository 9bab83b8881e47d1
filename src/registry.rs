use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use crate::Engine;

/// Handle value never assigned to an engine.
pub const INVALID_HANDLE: u64 = 0;

/// Engines addressed by integer handles, for hosts that cannot hold Rust references.
///
/// Handles are never reused within a registry. Releasing a handle drops the registry's
/// reference; the engine shuts down once the last reference is gone.
#[derive(Debug, Default)]
pub struct EngineRegistry {
    last_handle: AtomicU64,
    engines: RwLock<HashMap<u64, Arc<Engine>>>,
}

impl EngineRegistry {
    pub fn new() -> EngineRegistry {
        EngineRegistry::default()
    }

    /// Register `engine`, returning its handle. Returns [`INVALID_HANDLE`] if the registry lock
    /// is poisoned.
    pub fn insert(&self, engine: Engine) -> u64 {
        let handle = self.last_handle.fetch_add(1, Ordering::Relaxed) + 1;
        match self.engines.write() {
            Ok(mut engines) => {
                engines.insert(handle, Arc::new(engine));
                handle
            }
            Err(_) => {
                log::error!(target: "switchyard", handle; "engine registry is poisoned");
                INVALID_HANDLE
            }
        }
    }

    pub fn get(&self, handle: u64) -> Option<Arc<Engine>> {
        let engine = self.engines.read().ok()?.get(&handle).cloned();
        if engine.is_none() {
            log::debug!(target: "switchyard", handle; "unknown engine handle");
        }
        engine
    }

    /// Remove `handle`, returning the engine if it was registered.
    pub fn release(&self, handle: u64) -> Option<Arc<Engine>> {
        self.engines.write().ok()?.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.engines.read().map_or(0, |engines| engines.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
