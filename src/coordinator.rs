//! Single-flight start coordination
//!
//! At most one start sequence (start, wait for readiness, notify) runs per
//! backend. Concurrent requests for the same backend are told a start is
//! already underway and nothing else happens for them.

use crate::activity::ActivityRegistry;
use crate::registry::SharedRegistry;
use crate::runtime::SharedRuntime;
use dashmap::DashMap;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Per-backend "a start is in flight" flag
pub type StartGuard = Arc<AtomicBool>;

/// How a start sequence ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Container started and printed a readiness pattern
    Ready,
    /// Container started but no readiness pattern within the timeout
    TimedOut,
    /// The runtime refused to start the container
    Failed,
    /// The sequence itself panicked
    Errored(String),
}

impl StartOutcome {
    pub fn notice(&self, backend: &str) -> Notice {
        match self {
            StartOutcome::Ready => Notice::Ready(backend.to_string()),
            StartOutcome::TimedOut => Notice::TimedOut(backend.to_string()),
            StartOutcome::Failed => Notice::Failed(backend.to_string()),
            StartOutcome::Errored(detail) => Notice::Errored(detail.clone()),
        }
    }
}

/// Messages shown to whoever asked for a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Starting(String),
    AlreadyStarting(String),
    Ready(String),
    TimedOut(String),
    Failed(String),
    Errored(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Starting(name) => {
                write!(f, "Server {} is currently offline. Starting it up for you...", name)
            }
            Notice::AlreadyStarting(name) => {
                write!(f, "Server {} is already being started, please wait...", name)
            }
            Notice::Ready(name) => write!(f, "Server {} is now ready!", name),
            Notice::TimedOut(name) => write!(
                f,
                "Server {} may not be fully ready yet. Try again in a moment.",
                name
            ),
            Notice::Failed(name) => write!(f, "Failed to start server {}", name),
            Notice::Errored(detail) => write!(f, "Error starting server: {}", detail),
        }
    }
}

/// The party waiting on a start sequence
pub trait StartRequester: Send + Sync + 'static {
    /// Called exactly once with the sequence's outcome. Runs on the start
    /// task while the guard is still held, so it must not block.
    fn on_outcome(&self, backend: &str, outcome: StartOutcome);
}

/// Result of asking the coordinator to start a backend
#[derive(Debug)]
pub enum StartRequest {
    /// A new start sequence was launched
    Started(JoinHandle<StartOutcome>),
    /// Another sequence for this backend is still running
    AlreadyStarting,
}

/// Releases a start guard when dropped, including during unwinding
struct GuardRelease(StartGuard);

impl Drop for GuardRelease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct StartCoordinator {
    registry: Arc<SharedRegistry>,
    activity: Arc<ActivityRegistry>,
    runtime: SharedRuntime,
    guards: DashMap<String, StartGuard>,
}

impl StartCoordinator {
    pub fn new(
        registry: Arc<SharedRegistry>,
        activity: Arc<ActivityRegistry>,
        runtime: SharedRuntime,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            activity,
            runtime,
            guards: DashMap::new(),
        })
    }

    /// The shared guard for `name`, created on first use
    pub fn guard(&self, name: &str) -> StartGuard {
        self.guards
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub fn is_starting(&self, name: &str) -> bool {
        self.guards
            .get(name)
            .map(|g| g.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Launch a start sequence for `name` unless one is already running.
    ///
    /// The sequence runs on its own task; `requester` hears the outcome.
    pub fn request_start(
        self: &Arc<Self>,
        name: &str,
        requester: Arc<dyn StartRequester>,
    ) -> StartRequest {
        let guard = self.guard(name);
        if guard
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(backend = name, "Start already in progress");
            return StartRequest::AlreadyStarting;
        }

        let release = GuardRelease(guard);
        let coordinator = Arc::clone(self);
        let name = name.to_string();

        let handle = tokio::spawn(async move {
            let sequence = AssertUnwindSafe(coordinator.run_sequence(&name)).catch_unwind();
            let outcome = match sequence.await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    error!(backend = %name, error = %detail, "Start sequence failed unexpectedly");
                    StartOutcome::Errored(detail)
                }
            };
            requester.on_outcome(&name, outcome.clone());
            drop(release);
            outcome
        });

        StartRequest::Started(handle)
    }

    async fn run_sequence(&self, name: &str) -> StartOutcome {
        let registry = self.registry.snapshot();
        let container = registry.resolve(name);

        if !self.runtime.start(container).await {
            warn!(backend = name, container, "Backend failed to start");
            return StartOutcome::Failed;
        }

        let timeout = registry.startup_timeout();
        if !self
            .runtime
            .wait_ready(container, timeout, registry.ready_patterns())
            .await
        {
            warn!(backend = name, container, timeout_secs = timeout.as_secs(), "Backend not ready in time");
            return StartOutcome::TimedOut;
        }

        self.activity.touch(name);
        info!(backend = name, container, "Backend is ready");
        StartOutcome::Ready
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
