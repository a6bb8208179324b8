use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use wakegate::admin::{AdminServer, PKG_NAME, VERSION};
use wakegate::config::Config;
use wakegate::lifecycle::LifecycleManager;
use wakegate::proxy::FrontendProxy;
use wakegate::runtime::CliRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wakegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime = Arc::new(CliRuntime::from_command_line(&config.defaults.runtime)?);
    let manager = LifecycleManager::new(&config, runtime);

    // Front-end listeners, one per routed backend
    let mut proxy_handles = Vec::new();
    for backend in &config.backends {
        let Some((listen, upstream)) = backend.route() else {
            continue;
        };
        let proxy = FrontendProxy::bind(
            &backend.name,
            listen,
            upstream,
            Arc::clone(&manager),
            shutdown_rx.clone(),
        )
        .await
        .map_err(|e| {
            error!(backend = %backend.name, listen = %listen, error = %e, "Failed to bind front-end listener");
            e
        })?;

        let name = backend.name.clone();
        proxy_handles.push(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(backend = %name, error = %e, "Front-end listener error");
            }
        }));
    }

    let admin_addr: SocketAddr = config.server.admin_bind.parse().map_err(|e| {
        error!(admin_bind = %config.server.admin_bind, error = %e, "Invalid admin bind address");
        anyhow::anyhow!("Invalid admin bind address: {}", e)
    })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(
        admin_addr,
        Arc::clone(&manager),
        config_path.clone(),
        shutdown_rx.clone(),
        admin_token,
    );

    let sweeper = manager.sweeper();
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx.clone()));

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    reload(&manager, &config_path);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Containers are left as they are; only our own tasks stop
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in proxy_handles {
            let _ = handle.await;
        }
        let _ = sweeper_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn reload(manager: &LifecycleManager, config_path: &Path) {
    match manager.reload_config(config_path) {
        Ok(result) => {
            info!(
                added = result.added.len(),
                removed = result.removed.len(),
                kept = result.kept.len(),
                "Configuration reloaded successfully"
            );
            if !result.added.is_empty() {
                info!(backends = ?result.added, "New backends managed");
            }
            if !result.removed.is_empty() {
                info!(backends = ?result.removed, "Backends no longer managed");
            }
            if result.runtime_changed {
                warn!("Runtime command change takes effect after a restart");
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
        }
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting container wake gate");
    info!(
        admin_bind = %config.server.admin_bind,
        runtime = %config.defaults.runtime,
        "Server configuration"
    );
    info!(
        inactivity_timeout_secs = config.defaults.inactivity_timeout_secs,
        startup_timeout_secs = config.defaults.startup_timeout_secs,
        sweep_interval_secs = config.defaults.sweep_interval_secs,
        ready_patterns = ?config.defaults.ready_patterns,
        "Lifecycle defaults"
    );
    info!(
        backend_count = config.backends.len(),
        backends = ?config.backends.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(),
        routed = config.backends.iter().filter(|b| b.route().is_some()).count(),
        "Configured backends"
    );
}
