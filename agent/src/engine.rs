//! Process-wide redirection state.
//!
//! Everything the fault handler reads lives in one [`Engine`], created when
//! the target library is first seen and never torn down. The handler fetches
//! `&Engine` once per fault and passes it down.

use crate::cache::RedirectionCache;
use crate::config::Config;
use crate::fault::PreviousHandler;
use crate::jni::{self, HandleKind};
use crate::registry::HandleRegistry;
use crate::snapshot::TableSnapshots;
use log::{debug, info, warn};
use std::sync::OnceLock;

static ENGINE: OnceLock<Engine> = OnceLock::new();

pub struct Engine {
    config: Config,
    registry: HandleRegistry,
    snapshots: TableSnapshots,
    cache: RedirectionCache,
    previous: OnceLock<PreviousHandler>,
}

impl Engine {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            registry: HandleRegistry::with_capacity(config.handle_capacity),
            snapshots: TableSnapshots::new(),
            cache: RedirectionCache::with_capacity(config.cache_capacity),
            previous: OnceLock::new(),
        }
    }

    /// Create the process engine, or return the existing one.
    pub fn install(config: Config) -> &'static Engine {
        ENGINE.get_or_init(|| {
            debug!(
                "engine created ({} handles per kind, {} cache entries)",
                config.handle_capacity, config.cache_capacity
            );
            Engine::new(&config)
        })
    }

    pub fn get() -> Option<&'static Engine> {
        ENGINE.get()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn snapshots(&self) -> &TableSnapshots {
        &self.snapshots
    }

    pub fn cache(&self) -> &RedirectionCache {
        &self.cache
    }

    pub fn previous_handler(&self) -> Option<&PreviousHandler> {
        self.previous.get()
    }

    /// Keep the first recorded handler; later installs would otherwise save
    /// our own handler as the one to chain to.
    pub(crate) fn record_previous(&self, previous: PreviousHandler) -> bool {
        self.previous.set(previous).is_ok()
    }

    /// Called with every handle the translation layer returns to the guest.
    ///
    /// The first handle of each kind donates its table to the snapshot store,
    /// before the target library has a chance to rewrite it.
    ///
    /// # Safety
    /// `handle` must be null or point to a live handle of `kind` whose table
    /// is readable for `kind.table_len()` words.
    pub unsafe fn observe_handle(&self, kind: HandleKind, handle: usize) {
        if handle == 0 {
            return;
        }
        if !self.snapshots.is_captured(kind) {
            let table = jni::live_table(handle);
            if !table.is_null() && self.snapshots.capture(kind, table) {
                info!("copied {} functions", kind);
            }
        }
        if self.registry.observe(kind, handle) {
            info!("got {}: {:#x}", kind, handle);
        } else if !self.registry.is_known(kind, handle) {
            warn!(
                "{} registry full ({} handles), not tracking {:#x}",
                kind,
                self.registry.len(kind),
                handle
            );
        }
    }
}
