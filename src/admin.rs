use crate::pool::PoolStats;
use crate::supervisor::ProcessSupervisor;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the gateway
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

/// Read-only diagnostics listener, bound to loopback only
pub struct AdminServer {
    bind_addr: SocketAddr,
    supervisor: Arc<ProcessSupervisor>,
    pool_stats: Arc<PoolStats>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        port: u16,
        supervisor: Arc<ProcessSupervisor>,
        pool_stats: Arc<PoolStats>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            supervisor,
            pool_stats,
            shutdown_rx,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Diagnostics server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let supervisor = Arc::clone(&self.supervisor);
                            let pool_stats = Arc::clone(&self.pool_stats);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, supervisor, pool_stats).await {
                                    debug!(addr = %addr, error = %e, "Diagnostics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept diagnostics connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Diagnostics server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    supervisor: Arc<ProcessSupervisor>,
    pool_stats: Arc<PoolStats>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let supervisor = Arc::clone(&supervisor);
        let pool_stats = Arc::clone(&pool_stats);
        async move { handle_admin_request(req, supervisor, pool_stats).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Diagnostics connection error: {}", e))?;

    Ok(())
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    supervisor: Arc<ProcessSupervisor>,
    pool_stats: Arc<PoolStats>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route_admin_request(req.method(), req.uri().path(), &supervisor, &pool_stats))
}

fn route_admin_request(
    method: &Method,
    path: &str,
    supervisor: &ProcessSupervisor,
    pool_stats: &PoolStats,
) -> Response<Full<Bytes>> {
    debug!(%method, %path, "Diagnostics request");

    match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/processes") => {
            let processes = supervisor.snapshot();
            let body = serde_json::json!({
                "processes": processes,
                "count": processes.len(),
                "live": supervisor.live_count(),
                "requests": pool_stats.snapshot(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
