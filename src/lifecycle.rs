use crate::activity::ActivityRegistry;
use crate::config::Config;
use crate::coordinator::{Notice, StartCoordinator, StartOutcome, StartRequest, StartRequester};
use crate::registry::{BackendRegistry, ReloadResult, SharedRegistry};
use crate::routing::{ConnectionTracker, Routing};
use crate::runtime::SharedRuntime;
use crate::sweeper::InactivitySweeper;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// What to do with a client that wants to reach a backend
#[derive(Debug)]
pub enum ConnectDecision {
    /// Backend is running or not managed by us; connect normally
    Proceed,
    /// Backend was offline and a start sequence is now running
    Deferred(JoinHandle<StartOutcome>),
    /// Backend is offline and another client already triggered its start
    AlreadyStarting,
}

/// Status information for a managed backend
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub container: String,
    pub running: bool,
    pub starting: bool,
    pub connected_clients: usize,
    /// Seconds since last activity, `None` without a record
    pub last_active_secs: Option<u64>,
    pub minutes_since_active: u64,
}

/// Reports start outcomes to the operator log
pub struct LoggedRequester {
    origin: String,
}

impl LoggedRequester {
    pub fn new(origin: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            origin: origin.into(),
        })
    }
}

impl StartRequester for LoggedRequester {
    fn on_outcome(&self, backend: &str, outcome: StartOutcome) {
        let notice = outcome.notice(backend);
        info!(origin = %self.origin, backend, notice = %notice, "Start sequence finished");
    }
}

/// Owns the orchestration components and the wiring between them.
///
/// Returned behind an `Arc`: the front-end proxies, the admin API and the
/// sweeper all share one instance.
pub struct LifecycleManager {
    registry: Arc<SharedRegistry>,
    activity: Arc<ActivityRegistry>,
    runtime: SharedRuntime,
    coordinator: Arc<StartCoordinator>,
    connections: Arc<ConnectionTracker>,
}

impl LifecycleManager {
    pub fn new(config: &Config, runtime: SharedRuntime) -> Arc<Self> {
        let registry = SharedRegistry::new(BackendRegistry::from_config(config));
        let activity = ActivityRegistry::new(Arc::clone(&registry));
        let coordinator = StartCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&activity),
            Arc::clone(&runtime),
        );
        let connections = ConnectionTracker::new(Arc::clone(&registry));

        Arc::new(Self {
            registry,
            activity,
            runtime,
            coordinator,
            connections,
        })
    }

    pub fn registry(&self) -> &Arc<SharedRegistry> {
        &self.registry
    }

    pub fn activity(&self) -> &Arc<ActivityRegistry> {
        &self.activity
    }

    pub fn coordinator(&self) -> &Arc<StartCoordinator> {
        &self.coordinator
    }

    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }

    /// Build the periodic sweeper over this manager's shared state
    pub fn sweeper(&self) -> InactivitySweeper {
        InactivitySweeper::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.activity),
            Arc::clone(&self.runtime),
            Arc::clone(&self.connections) as Arc<dyn Routing>,
        )
    }

    /// A client reached a backend
    pub fn on_connected(&self, name: &str) {
        self.activity.touch(name);
    }

    /// Intercept a connection attempt.
    ///
    /// Managed backends that are not running get a start sequence instead of
    /// the connection; `requester` hears how it ends.
    pub async fn intercept(
        &self,
        name: &str,
        requester: Arc<dyn StartRequester>,
    ) -> ConnectDecision {
        if !self.registry.is_managed(name) {
            return ConnectDecision::Proceed;
        }

        let container = self.registry.resolve(name);
        if self.runtime.is_running(&container).await {
            return ConnectDecision::Proceed;
        }

        info!(backend = name, notice = %Notice::Starting(name.to_string()), "Deferring connection");

        match self.coordinator.request_start(name, requester) {
            StartRequest::Started(handle) => ConnectDecision::Deferred(handle),
            StartRequest::AlreadyStarting => {
                info!(backend = name, notice = %Notice::AlreadyStarting(name.to_string()), "Connection denied");
                ConnectDecision::AlreadyStarting
            }
        }
    }

    pub async fn is_running(&self, name: &str) -> bool {
        let container = self.registry.resolve(name);
        self.runtime.is_running(&container).await
    }

    /// Status of every managed backend, in configuration order
    pub async fn status(&self) -> Vec<BackendStatus> {
        let registry = self.registry.snapshot();
        let mut statuses = Vec::with_capacity(registry.backends().len());

        for backend in registry.backends() {
            let name = backend.name.as_str();
            statuses.push(BackendStatus {
                name: name.to_string(),
                container: backend.container.clone(),
                running: self.runtime.is_running(&backend.container).await,
                starting: self.coordinator.is_starting(name),
                connected_clients: self.connections.connected_clients(name).unwrap_or(0),
                last_active_secs: self.activity.idle_for(name).map(|idle| idle.as_secs()),
                minutes_since_active: self.activity.minutes_since_active(name),
            });
        }

        statuses
    }

    /// Reload configuration from a file
    ///
    /// Swaps the backend registry and timing defaults. Front-end listeners
    /// and the runtime command are set up at startup, so `listen`,
    /// `upstream` and `runtime` changes need a restart; a changed `runtime`
    /// is flagged in the result.
    pub fn reload_config<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<ReloadResult> {
        let config = Config::load(path)?;
        Ok(self.apply_config(&config))
    }

    pub fn apply_config(&self, config: &Config) -> ReloadResult {
        self.registry.replace(BackendRegistry::from_config(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::runtime::fake::{Call, FakeRuntime};

    fn create_test_manager() -> (Arc<LifecycleManager>, Arc<FakeRuntime>) {
        let config = Config {
            backends: vec![
                BackendConfig::new("alpha", "alpha-container"),
                BackendConfig::new("beta", "beta-container"),
            ],
            ..Default::default()
        };
        let runtime = FakeRuntime::new();
        (LifecycleManager::new(&config, runtime.clone()), runtime)
    }

    #[tokio::test]
    async fn test_intercept_unmanaged_proceeds() {
        let (manager, runtime) = create_test_manager();
        let decision = manager.intercept("lobby", LoggedRequester::new("test")).await;
        assert!(matches!(decision, ConnectDecision::Proceed));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_intercept_running_proceeds() {
        let (manager, runtime) = create_test_manager();
        runtime.set_running("alpha-container", true);
        let decision = manager.intercept("alpha", LoggedRequester::new("test")).await;
        assert!(matches!(decision, ConnectDecision::Proceed));
        assert_eq!(runtime.count(&Call::Start("alpha-container".to_string())), 0);
    }

    #[tokio::test]
    async fn test_intercept_offline_defers_then_denies() {
        let (manager, runtime) = create_test_manager();
        runtime.set_start_delay(std::time::Duration::from_millis(100));

        let first = manager.intercept("beta", LoggedRequester::new("first")).await;
        let second = manager.intercept("beta", LoggedRequester::new("second")).await;

        let ConnectDecision::Deferred(handle) = first else {
            panic!("first request should start the backend");
        };
        assert!(matches!(second, ConnectDecision::AlreadyStarting));
        assert_eq!(handle.await.unwrap(), StartOutcome::Ready);
        assert_eq!(runtime.count(&Call::Start("beta-container".to_string())), 1);
        assert!(manager.is_running("beta").await);
    }

    #[tokio::test]
    async fn test_status_reports_each_backend() {
        let (manager, runtime) = create_test_manager();
        runtime.set_running("alpha-container", true);
        manager.activity().forget("beta");
        let _client = manager.connections().connect("alpha");

        let status = manager.status().await;

        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "alpha");
        assert!(status[0].running);
        assert_eq!(status[0].connected_clients, 1);
        assert_eq!(status[0].last_active_secs, Some(0));
        assert_eq!(status[1].name, "beta");
        assert!(!status[1].running);
        assert!(!status[1].starting);
        assert_eq!(status[1].last_active_secs, None);
        assert_eq!(status[1].minutes_since_active, 0);
    }

    #[tokio::test]
    async fn test_apply_config_swaps_registry() {
        let (manager, _runtime) = create_test_manager();
        let config = Config {
            backends: vec![BackendConfig::new("gamma", "gamma-container")],
            ..Default::default()
        };

        let result = manager.apply_config(&config);

        assert_eq!(result.added, vec!["gamma"]);
        assert_eq!(result.removed, vec!["alpha", "beta"]);
        assert!(!result.runtime_changed);
        assert!(manager.registry().is_managed("gamma"));
        assert!(!manager.registry().is_managed("alpha"));

        // Activity for backends that are no longer managed is ignored
        manager.activity().forget("alpha");
        manager.on_connected("alpha");
        assert!(manager.activity().last_active("alpha").is_none());
    }
}
