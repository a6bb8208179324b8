//! Connected-client bookkeeping shared by the front-end proxy and the sweeper

use crate::registry::SharedRegistry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// View of the proxy's routing table used by the inactivity sweeper
pub trait Routing: Send + Sync {
    /// Clients currently connected to `name`, or `None` if the proxy has no
    /// such backend registered
    fn connected_clients(&self, name: &str) -> Option<usize>;
}

/// Per-backend connected-client gauges.
///
/// Every managed backend is registered (zero clients until a connection
/// arrives), so the sweeper evaluates backends that are only ever started
/// through the admin API as well.
pub struct ConnectionTracker {
    registry: Arc<SharedRegistry>,
    counts: DashMap<String, Arc<AtomicUsize>>,
}

impl ConnectionTracker {
    pub fn new(registry: Arc<SharedRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            counts: DashMap::new(),
        })
    }

    /// Count a new client; the count drops again when the guard is dropped
    pub fn connect(&self, name: &str) -> ConnectionGuard {
        let counter = self
            .counts
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard { counter }
    }

    fn count(&self, name: &str) -> usize {
        self.counts
            .get(name)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl Routing for ConnectionTracker {
    fn connected_clients(&self, name: &str) -> Option<usize> {
        if !self.registry.is_managed(name) {
            return None;
        }
        Some(self.count(name))
    }
}

/// Keeps one client counted for as long as it lives
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
