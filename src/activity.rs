//! Last-activity tracking for managed backends

use crate::registry::SharedRegistry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Maps backend name to the last time client activity was observed.
///
/// A record says nothing about whether the container is running; the
/// sweeper reconciles the two on each pass.
pub struct ActivityRegistry {
    registry: Arc<SharedRegistry>,
    last_activity: DashMap<String, Instant>,
}

impl ActivityRegistry {
    /// Create the registry, seeding every configured backend with "now" so a
    /// fresh start does not treat everything as idle.
    pub fn new(registry: Arc<SharedRegistry>) -> Arc<Self> {
        let activity = Self {
            registry,
            last_activity: DashMap::new(),
        };

        let now = Instant::now();
        for name in activity.registry.names() {
            activity.last_activity.insert(name.clone(), now);
            info!(backend = %name, "Initialized activity tracking");
        }

        Arc::new(activity)
    }

    /// Record activity now. Ignored for backends that are not managed.
    pub fn touch(&self, name: &str) {
        if self.registry.is_managed(name) {
            self.last_activity.insert(name.to_string(), Instant::now());
        } else {
            debug!(backend = name, "Ignoring activity for unmanaged backend");
        }
    }

    /// Record activity at a specific instant
    pub fn touch_at(&self, name: &str, at: Instant) {
        if self.registry.is_managed(name) {
            self.last_activity.insert(name.to_string(), at);
        }
    }

    pub fn forget(&self, name: &str) {
        self.last_activity.remove(name);
    }

    pub fn last_active(&self, name: &str) -> Option<Instant> {
        self.last_activity.get(name).map(|entry| *entry.value())
    }

    /// Time since the last recorded activity, or `None` without a record
    pub fn idle_for(&self, name: &str) -> Option<Duration> {
        self.last_active(name).map(|at| at.elapsed())
    }

    /// Whole minutes since the last activity; 0 when there is no record
    pub fn minutes_since_active(&self, name: &str) -> u64 {
        self.idle_for(name)
            .map(|idle| idle.as_secs() / 60)
            .unwrap_or(0)
    }

    /// Owned copy of every record
    pub fn snapshot(&self) -> HashMap<String, Instant> {
        self.last_activity
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
