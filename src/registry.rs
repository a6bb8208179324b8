//! Static backend name to container mapping
//!
//! A [`BackendRegistry`] is an immutable snapshot built from configuration.
//! [`SharedRegistry`] holds the current snapshot and swaps it wholesale on
//! reload, so readers always see either the old or the new mapping.

use crate::config::{BackendConfig, Config, Defaults};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Immutable snapshot of the managed backends and their shared settings
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<BackendConfig>,
    defaults: Defaults,
}

impl BackendRegistry {
    pub fn new(backends: Vec<BackendConfig>, defaults: Defaults) -> Self {
        Self { backends, defaults }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.backends.clone(), config.defaults.clone())
    }

    /// Container reference for a backend name.
    ///
    /// Unknown names resolve to themselves so ad-hoc backends still map to
    /// something; use [`is_managed`](Self::is_managed) to tell them apart.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.get(name)
            .map(|b| b.container.as_str())
            .unwrap_or(name)
    }

    pub fn is_managed(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Backend names in configuration order
    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name.clone()).collect()
    }

    pub fn backends(&self) -> &[BackendConfig] {
        &self.backends
    }

    pub fn idle_timeout(&self) -> Duration {
        self.defaults.inactivity_timeout()
    }

    pub fn startup_timeout(&self) -> Duration {
        self.defaults.startup_timeout()
    }

    pub fn ready_patterns(&self) -> &[String] {
        &self.defaults.ready_patterns
    }

    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }
}

/// Result of swapping in a new registry snapshot
#[derive(Debug, Clone, Default)]
pub struct ReloadResult {
    /// Backends present only in the new snapshot
    pub added: Vec<String>,
    /// Backends no longer managed
    pub removed: Vec<String>,
    /// Backends present in both snapshots
    pub kept: Vec<String>,
    /// The runtime command changed; it only takes effect after a restart
    pub runtime_changed: bool,
}

/// The current registry snapshot, replaceable at runtime.
///
/// Like the other shared components, [`new`](SharedRegistry::new) returns
/// `Arc<Self>` since every task that touches backends needs a handle.
#[derive(Debug)]
pub struct SharedRegistry {
    current: RwLock<Arc<BackendRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: BackendRegistry) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(registry)),
        })
    }

    /// The snapshot in effect right now. Holding it does not block reloads.
    pub fn snapshot(&self) -> Arc<BackendRegistry> {
        Arc::clone(&self.current.read())
    }

    pub fn resolve(&self, name: &str) -> String {
        self.snapshot().resolve(name).to_string()
    }

    pub fn is_managed(&self, name: &str) -> bool {
        self.current.read().is_managed(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.current.read().names()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.current.read().idle_timeout()
    }

    /// Atomically replace the whole snapshot
    pub fn replace(&self, registry: BackendRegistry) -> ReloadResult {
        let incoming = registry.names();
        let new_names: HashSet<String> = incoming.iter().cloned().collect();
        let new_runtime = registry.defaults().runtime.clone();
        let old = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, Arc::new(registry))
        };
        let old_names: HashSet<String> = old.names().into_iter().collect();

        let mut result = ReloadResult::default();
        for name in old.names() {
            if new_names.contains(&name) {
                result.kept.push(name);
            } else {
                result.removed.push(name);
            }
        }
        for name in incoming {
            if !old_names.contains(&name) {
                result.added.push(name);
            }
        }

        if old.defaults().runtime != new_runtime {
            result.runtime_changed = true;
            warn!(
                current = %old.defaults().runtime,
                configured = %new_runtime,
                "Runtime command changed; restart to apply it"
            );
        }

        info!(
            added = result.added.len(),
            removed = result.removed.len(),
            kept = result.kept.len(),
            "Backend registry replaced"
        );

        result
    }
}
