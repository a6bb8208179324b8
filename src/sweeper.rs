//! Periodic inactivity sweep
//!
//! Each pass walks the managed backends in configuration order and stops
//! those that have had no connected clients for longer than the idle timeout.
//!
//! The sweep does not coordinate with in-flight start sequences. If a start
//! completes and touches a backend after the sweep has already decided to
//! stop it, the backend is stopped just as it became ready and the client
//! has to reconnect. That window is accepted rather than locked away.

use crate::activity::ActivityRegistry;
use crate::registry::{BackendRegistry, SharedRegistry};
use crate::routing::Routing;
use crate::runtime::SharedRuntime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What a single sweep pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Backends with connected clients whose activity was refreshed
    pub refreshed: Vec<String>,
    /// Running backends without a record that are now being tracked
    pub tracked: Vec<String>,
    /// Idle backends stopped successfully
    pub stopped: Vec<String>,
    /// Idle backends whose stop command failed (record dropped anyway)
    pub stop_failed: Vec<String>,
    /// Idle backends that were already stopped; their stale record was cleared
    pub cleared: Vec<String>,
}

pub struct InactivitySweeper {
    registry: Arc<SharedRegistry>,
    activity: Arc<ActivityRegistry>,
    runtime: SharedRuntime,
    routing: Arc<dyn Routing>,
}

impl InactivitySweeper {
    pub fn new(
        registry: Arc<SharedRegistry>,
        activity: Arc<ActivityRegistry>,
        runtime: SharedRuntime,
        routing: Arc<dyn Routing>,
    ) -> Self {
        Self {
            registry,
            activity,
            runtime,
            routing,
        }
    }

    /// Run one pass over every managed backend
    pub async fn sweep_once(&self) -> SweepReport {
        debug!("Running inactivity check");
        let registry = self.registry.snapshot();
        let mut report = SweepReport::default();

        for name in registry.names() {
            self.sweep_backend(&registry, &name, &mut report).await;
        }

        report
    }

    async fn sweep_backend(&self, registry: &BackendRegistry, name: &str, report: &mut SweepReport) {
        let Some(clients) = self.routing.connected_clients(name) else {
            return;
        };

        if clients > 0 {
            self.activity.touch(name);
            debug!(backend = name, clients, "Clients active, refreshing timestamp");
            report.refreshed.push(name.to_string());
            return;
        }

        let container = registry.resolve(name);

        let Some(idle) = self.activity.idle_for(name) else {
            // No record counts as zero idle time; start the clock if the
            // backend was brought up outside our control
            if self.runtime.is_running(container).await {
                self.activity.touch(name);
                info!(backend = name, container, "Tracking running backend with no activity record");
                report.tracked.push(name.to_string());
            }
            return;
        };

        let timeout = registry.idle_timeout();
        debug!(backend = name, idle_secs = idle.as_secs(), "Backend has no clients");

        if idle <= timeout {
            return;
        }

        if !self.runtime.is_running(container).await {
            debug!(backend = name, container, "Idle backend already stopped, clearing record");
            self.activity.forget(name);
            report.cleared.push(name.to_string());
            return;
        }

        info!(
            backend = name,
            container,
            idle_minutes = idle.as_secs() / 60,
            timeout_secs = timeout.as_secs(),
            "Backend inactive for too long, shutting down"
        );

        if self.runtime.stop(container).await {
            report.stopped.push(name.to_string());
        } else {
            warn!(backend = name, container, "Idle shutdown failed; the next sweep will re-check it");
            report.stop_failed.push(name.to_string());
        }
        self.activity.forget(name);
    }

    /// Sweep on a fixed period until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval().as_secs(),
            "Inactivity sweeper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval()) => {
                    let report = self.sweep_once().await;
                    if !report.stopped.is_empty() || !report.stop_failed.is_empty() {
                        info!(
                            stopped = ?report.stopped,
                            failed = ?report.stop_failed,
                            "Inactivity sweep finished"
                        );
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Inactivity sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Read on every tick so a reload can change it
    fn interval(&self) -> Duration {
        self.registry.snapshot().defaults().sweep_interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Defaults};
    use crate::routing::ConnectionTracker;
    use crate::runtime::fake::{Call, FakeRuntime};
    use std::time::Instant;

    struct Harness {
        registry: Arc<SharedRegistry>,
        activity: Arc<ActivityRegistry>,
        runtime: Arc<FakeRuntime>,
        tracker: Arc<ConnectionTracker>,
        sweeper: InactivitySweeper,
    }

    fn create_harness() -> Harness {
        let mut defaults = Defaults::default();
        defaults.inactivity_timeout_secs = 60;
        let registry = SharedRegistry::new(BackendRegistry::new(
            vec![
                BackendConfig::new("alpha", "alpha-container"),
                BackendConfig::new("beta", "beta-container"),
            ],
            defaults,
        ));
        let activity = ActivityRegistry::new(Arc::clone(&registry));
        let runtime = FakeRuntime::new();
        let tracker = ConnectionTracker::new(Arc::clone(&registry));
        let sweeper = InactivitySweeper::new(
            Arc::clone(&registry),
            Arc::clone(&activity),
            runtime.clone(),
            tracker.clone(),
        );
        Harness {
            registry,
            activity,
            runtime,
            tracker,
            sweeper,
        }
    }

    fn seconds_ago(secs: u64) -> Instant {
        Instant::now() - Duration::from_secs(secs)
    }

    fn stop(container: &str) -> Call {
        Call::Stop(container.to_string())
    }

    #[tokio::test]
    async fn test_idle_running_backend_is_stopped() {
        let h = create_harness();
        h.runtime.set_running("alpha-container", true);
        h.activity.touch_at("alpha", seconds_ago(70));

        let report = h.sweeper.sweep_once().await;

        assert_eq!(report.stopped, vec!["alpha"]);
        assert_eq!(h.runtime.count(&stop("alpha-container")), 1);
        assert!(h.activity.last_active("alpha").is_none());
        // beta was seeded just now and is within its grace period
        assert_eq!(h.runtime.count(&stop("beta-container")), 0);
    }

    #[tokio::test]
    async fn test_record_dropped_even_when_stop_fails() {
        let h = create_harness();
        h.runtime.set_running("alpha-container", true);
        h.runtime.fail_stop("alpha-container");
        h.activity.touch_at("alpha", seconds_ago(70));

        let report = h.sweeper.sweep_once().await;

        assert_eq!(report.stop_failed, vec!["alpha"]);
        assert_eq!(h.runtime.count(&stop("alpha-container")), 1);
        assert!(h.activity.last_active("alpha").is_none());
    }

    #[tokio::test]
    async fn test_connected_clients_refresh_activity() {
        let h = create_harness();
        h.runtime.set_running("alpha-container", true);
        let before = seconds_ago(70);
        h.activity.touch_at("alpha", before);
        let _client = h.tracker.connect("alpha");

        let report = h.sweeper.sweep_once().await;

        assert_eq!(report.refreshed, vec!["alpha"]);
        assert!(h.activity.last_active("alpha").unwrap() > before);
        assert_eq!(h.runtime.count(&stop("alpha-container")), 0);
    }

    #[tokio::test]
    async fn test_clients_retrack_forgotten_backend() {
        let h = create_harness();
        h.activity.forget("alpha");
        let _client = h.tracker.connect("alpha");

        h.sweeper.sweep_once().await;

        assert!(h.activity.last_active("alpha").is_some());
    }

    #[tokio::test]
    async fn test_within_timeout_is_left_alone() {
        let h = create_harness();
        h.runtime.set_running("alpha-container", true);
        h.activity.touch_at("alpha", seconds_ago(30));

        let report = h.sweeper.sweep_once().await;

        assert_eq!(report, SweepReport::default());
        assert!(h.runtime.calls().is_empty());
        assert!(h.activity.last_active("alpha").is_some());
    }

    #[tokio::test]
    async fn test_already_stopped_backend_is_not_restopped() {
        let h = create_harness();
        h.activity.touch_at("alpha", seconds_ago(70));

        let report = h.sweeper.sweep_once().await;

        assert_eq!(report.cleared, vec!["alpha"]);
        assert_eq!(h.runtime.count(&stop("alpha-container")), 0);
        assert!(h.activity.last_active("alpha").is_none());

        // With no record it is not evaluated for shutdown again
        let report = h.sweeper.sweep_once().await;
        assert!(report.cleared.is_empty());
        assert_eq!(h.runtime.count(&stop("alpha-container")), 0);
    }

    #[tokio::test]
    async fn test_missing_record_is_not_stopped() {
        let h = create_harness();
        h.runtime.set_running("alpha-container", true);
        h.activity.forget("alpha");

        let report = h.sweeper.sweep_once().await;

        // Manually started backend gets a fresh grace period
        assert_eq!(report.tracked, vec!["alpha"]);
        assert_eq!(h.runtime.count(&stop("alpha-container")), 0);
        assert_eq!(h.activity.minutes_since_active("alpha"), 0);
        assert!(h.activity.last_active("alpha").is_some());
    }

    #[tokio::test]
    async fn test_one_stop_per_tick() {
        let h = create_harness();
        h.runtime.set_running("alpha-container", true);
        h.runtime.set_running("beta-container", true);
        h.activity.touch_at("alpha", seconds_ago(120));
        h.activity.touch_at("beta", seconds_ago(90));

        let report = h.sweeper.sweep_once().await;
        assert_eq!(report.stopped, vec!["alpha", "beta"]);

        // Nothing left to stop on the following tick
        h.sweeper.sweep_once().await;
        assert_eq!(h.runtime.count(&stop("alpha-container")), 1);
        assert_eq!(h.runtime.count(&stop("beta-container")), 1);
    }

    #[tokio::test]
    async fn test_removed_backend_is_not_swept() {
        let h = create_harness();
        h.registry.replace(BackendRegistry::new(
            vec![BackendConfig::new("gamma", "gamma-container")],
            Defaults::default(),
        ));
        h.runtime.set_running("alpha-container", true);
        h.activity.touch_at("alpha", seconds_ago(700));

        let report = h.sweeper.sweep_once().await;

        assert_eq!(h.runtime.count(&stop("alpha-container")), 0);
        assert!(report.stopped.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_may_stop_backend_touched_mid_pass() {
        // Activity recorded while the sweep is deciding does not save the
        // backend; the stop goes through and the record is dropped
        let h = create_harness();
        h.runtime.set_running("alpha-container", true);
        h.runtime.set_inspect_delay(Duration::from_millis(200));
        h.activity.touch_at("alpha", seconds_ago(70));

        let activity = Arc::clone(&h.activity);
        let late_touch = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            activity.touch("alpha");
        });

        let report = h.sweeper.sweep_once().await;
        late_touch.await.unwrap();

        assert_eq!(report.stopped, vec!["alpha"]);
        assert!(h.activity.last_active("alpha").is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = create_harness();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(h.sweeper.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper should exit promptly")
            .unwrap();
    }
}
