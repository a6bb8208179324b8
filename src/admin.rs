use crate::coordinator::StartRequest;
use crate::lifecycle::{LifecycleManager, LoggedRequester};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the daemon
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Operator API: status, manual starts and configuration reload
pub struct AdminServer {
    bind_addr: SocketAddr,
    manager: Arc<LifecycleManager>,
    config_path: Arc<PathBuf>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<LifecycleManager>,
        config_path: PathBuf,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            config_path: Arc::new(config_path),
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = AdminContext {
                                manager: Arc::clone(&self.manager),
                                config_path: Arc::clone(&self.config_path),
                                auth_token: Arc::clone(&self.auth_token),
                            };

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, ctx).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone)]
struct AdminContext {
    manager: Arc<LifecycleManager>,
    config_path: Arc<PathBuf>,
    auth_token: Arc<String>,
}

async fn serve_admin_connection<S>(stream: S, ctx: AdminContext) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        async move { handle_admin_request(req, ctx).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    ctx: AdminContext,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let public = matches!((method, path), (&Method::GET, "/health") | (&Method::GET, "/version"));
    if !public && !check_auth(&req, &ctx.auth_token) {
        warn!(path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Per-backend status: GET /status
        (&Method::GET, "/status") => {
            let backends = ctx.manager.status().await;
            let response_body = serde_json::json!({
                "count": backends.len(),
                "backends": backends,
            });
            json_response(StatusCode::OK, response_body.to_string())
        }

        // Manual start: POST /start/{name}
        (&Method::POST, path) if path.starts_with("/start/") => {
            let name = path.strip_prefix("/start/").unwrap_or("");
            start_backend(&ctx.manager, name).await
        }

        // Re-read the configuration file: POST /reload
        (&Method::POST, "/reload") => match ctx.manager.reload_config(ctx.config_path.as_path()) {
            Ok(result) => {
                let response_body = serde_json::json!({
                    "added": result.added,
                    "removed": result.removed,
                    "kept": result.kept,
                    "runtime_changed": result.runtime_changed,
                });
                json_response(StatusCode::OK, response_body.to_string())
            }
            Err(e) => {
                error!(path = %ctx.config_path.display(), error = %e, "Configuration reload failed");
                response(StatusCode::INTERNAL_SERVER_ERROR, format!("reload failed: {}", e))
            }
        },

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn start_backend(manager: &Arc<LifecycleManager>, name: &str) -> Response<Full<Bytes>> {
    if name.is_empty() {
        return response(StatusCode::BAD_REQUEST, "missing backend name");
    }
    if !manager.registry().is_managed(name) {
        return response(StatusCode::NOT_FOUND, "unknown backend");
    }
    if manager.is_running(name).await {
        return response(StatusCode::OK, "already running");
    }

    match manager
        .coordinator()
        .request_start(name, LoggedRequester::new("admin"))
    {
        StartRequest::Started(_) => {
            info!(backend = name, "Start requested via admin API");
            response(StatusCode::ACCEPTED, "starting")
        }
        StartRequest::AlreadyStarting => response(StatusCode::CONFLICT, "already starting"),
    }
}
