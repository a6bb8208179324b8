use crate::coordinator::StartOutcome;
use crate::lifecycle::{ConnectDecision, LifecycleManager, LoggedRequester};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// TCP front end for one backend.
///
/// Clients connect here instead of to the backend. A client that arrives
/// while the backend is offline is held until the start sequence finishes,
/// then spliced through to the upstream address.
pub struct FrontendProxy {
    backend: String,
    listener: TcpListener,
    upstream: SocketAddr,
    manager: Arc<LifecycleManager>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontendProxy {
    pub async fn bind(
        backend: &str,
        listen: SocketAddr,
        upstream: SocketAddr,
        manager: Arc<LifecycleManager>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        Ok(Self {
            backend: backend.to_string(),
            listener,
            upstream,
            manager,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        info!(
            backend = %self.backend,
            addr = %self.local_addr()?,
            upstream = %self.upstream,
            "Front-end listener ready"
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self.manager);
                            let backend = self.backend.clone();
                            let upstream = self.upstream;
                            tokio::spawn(async move {
                                handle_client(stream, addr, backend, upstream, manager).await;
                            });
                        }
                        Err(e) => {
                            error!(backend = %self.backend, error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(backend = %self.backend, "Front-end listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_client(
    mut client: TcpStream,
    addr: SocketAddr,
    backend: String,
    upstream: SocketAddr,
    manager: Arc<LifecycleManager>,
) {
    // Counted from accept so a client waiting on a start keeps the backend alive
    let _connection = manager.connections().connect(&backend);
    manager.on_connected(&backend);
    let origin = addr.to_string();

    match manager.intercept(&backend, LoggedRequester::new(origin)).await {
        ConnectDecision::Proceed => {}
        ConnectDecision::AlreadyStarting => {
            debug!(backend = %backend, client = %addr, "Closing client, start already in progress");
            return;
        }
        ConnectDecision::Deferred(handle) => match handle.await {
            Ok(StartOutcome::Ready) => {}
            Ok(outcome) => {
                info!(backend = %backend, client = %addr, notice = %outcome.notice(&backend), "Closing deferred client");
                return;
            }
            Err(e) => {
                error!(backend = %backend, client = %addr, error = %e, "Start task did not complete");
                return;
            }
        },
    }

    let mut server = match TcpStream::connect(upstream).await {
        Ok(server) => server,
        Err(e) => {
            warn!(backend = %backend, upstream = %upstream, error = %e, "Failed to connect to backend");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut client, &mut server).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                backend = %backend,
                client = %addr,
                client_to_backend,
                backend_to_client,
                "Connection closed normally"
            );
        }
        Err(e) => {
            debug!(backend = %backend, client = %addr, error = %e, "Connection closed with error");
        }
    }
}
