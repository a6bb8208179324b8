use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Errors produced while loading the configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Global configuration for the service
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Process-level settings (admin API, PID file)
    #[serde(default)]
    pub server: ServerConfig,

    /// Timing and readiness settings shared by all backends
    #[serde(default)]
    pub defaults: Defaults,

    /// Managed backends, in configuration order
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1:9999)
    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_bind: default_admin_bind(),
            admin_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Defaults {
    /// Seconds without activity before a backend is stopped
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Seconds to wait for a readiness pattern after starting a container
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Seconds between inactivity sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Log substrings that mark a backend as ready to accept clients
    #[serde(default = "default_ready_patterns")]
    pub ready_patterns: Vec<String>,

    /// Container runtime CLI binary
    #[serde(default = "default_runtime")]
    pub runtime: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            ready_patterns: default_ready_patterns(),
            runtime: default_runtime(),
        }
    }
}

impl Defaults {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Configuration for a single managed backend
///
/// # Security Warning
///
/// `container` is passed verbatim as an argument to the container runtime CLI.
/// Configuration files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BackendConfig {
    /// Backend name as known to the proxy's routing table
    pub name: String,

    /// Container name or ID understood by the runtime
    pub container: String,

    /// Front-end address clients connect to (optional)
    pub listen: Option<String>,

    /// Address the backend serves on, required when `listen` is set
    pub upstream: Option<String>,
}

impl BackendConfig {
    pub fn new(name: &str, container: &str) -> Self {
        Self {
            name: name.to_string(),
            container: container.to_string(),
            listen: None,
            upstream: None,
        }
    }

    /// Route a front-end address to the backend (builder pattern)
    pub fn with_listener(mut self, listen: &str, upstream: &str) -> Self {
        self.listen = Some(listen.to_string());
        self.upstream = Some(upstream.to_string());
        self
    }

    /// Parsed listen/upstream pair, if this backend has a front-end listener
    pub fn route(&self) -> Option<(SocketAddr, SocketAddr)> {
        let listen = self.listen.as_deref()?.parse().ok()?;
        let upstream = self.upstream.as_deref()?.parse().ok()?;
        Some((listen, upstream))
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Backend name must not be empty".to_string());
        }

        if self.container.trim().is_empty() {
            return Err(format!(
                "Backend '{}': 'container' must not be empty",
                self.name
            ));
        }

        match (&self.listen, &self.upstream) {
            (Some(listen), Some(upstream)) => {
                if listen.parse::<SocketAddr>().is_err() {
                    return Err(format!(
                        "Backend '{}': invalid 'listen' address '{}'",
                        self.name, listen
                    ));
                }
                if upstream.parse::<SocketAddr>().is_err() {
                    return Err(format!(
                        "Backend '{}': invalid 'upstream' address '{}'",
                        self.name, upstream
                    ));
                }
            }
            (Some(_), None) => {
                return Err(format!(
                    "Backend '{}': 'listen' requires 'upstream'",
                    self.name
                ));
            }
            _ => {}
        }

        Ok(())
    }
}

// Default value functions
fn default_admin_bind() -> String {
    "127.0.0.1:9999".to_string()
}

fn default_inactivity_timeout() -> u64 {
    300 // 5 minutes
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_ready_patterns() -> Vec<String> {
    vec![
        "Done (".to_string(),
        "] Done (".to_string(),
        "For help, type \"help\"".to_string(),
    ]
}

fn default_runtime() -> String {
    "docker".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for backend in &self.backends {
            if let Err(e) = backend.validate() {
                errors.push(e);
            }
            if !seen.insert(backend.name.as_str()) {
                errors.push(format!("Backend '{}' is defined more than once", backend.name));
            }
        }

        if self.defaults.inactivity_timeout_secs == 0 {
            errors.push("'inactivity_timeout_secs' must be greater than 0".to_string());
        }
        if self.defaults.startup_timeout_secs == 0 {
            errors.push("'startup_timeout_secs' must be greater than 0".to_string());
        }
        if self.defaults.sweep_interval_secs == 0 {
            errors.push("'sweep_interval_secs' must be greater than 0".to_string());
        }
        if self.defaults.ready_patterns.iter().all(|p| p.is_empty()) {
            errors.push("'ready_patterns' must contain at least one non-empty pattern".to_string());
        }
        if self.defaults.runtime.trim().is_empty() {
            errors.push("'runtime' must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }
}
