use crate::error::{json_error_response, ProxyErrorCode};
use crate::info::info_response;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::routes::{Route, RouteTable};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Largest upgrade response head we are willing to parse
const UPGRADE_RESPONSE_MAX: usize = 16 * 1024;
/// Largest body of a rejected upgrade relayed to the client
const REJECTION_BODY_MAX: usize = 64 * 1024;
/// How long to wait for the rest of a rejected upgrade's body
const REJECTION_BODY_TIMEOUT: Duration = Duration::from_secs(5);

/// The public listener: dispatches every request through the route table
pub struct GatewayServer {
    routes: Arc<RouteTable>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl GatewayServer {
    pub fn new(routes: Arc<RouteTable>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self::with_pool_config(routes, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        routes: Arc<RouteTable>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(pool_config));
        Self {
            routes,
            shutdown_rx,
            pool,
        }
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Serve connections accepted on `listener` until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, routes = self.routes.len(), "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, routes, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    routes: Arc<RouteTable>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, routes, pool, addr).await }
    });

    // HTTP/1.1 connections can still use upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    routes: Arc<RouteTable>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path().to_string();

    let Some(route) = routes.resolve(&path) else {
        if req.method() == Method::GET && path == "/" {
            return Ok(info_response(&routes));
        }
        debug!(method = %req.method(), path = %path, "No route");
        return Ok(json_error_response(
            ProxyErrorCode::RouteNotFound,
            format!("No route for {}", path),
        ));
    };

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite X-Forwarded-* rather than append; we are the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let target = forward_target(route, &req);
    debug!(
        method = %req.method(),
        path = %path,
        target = %target,
        upstream = %route.authority(),
        request_id = %request_id,
        "Routing request"
    );

    if is_upgrade_request(&req) {
        if !route.supports_upgrade {
            warn!(path = %path, prefix = %route.prefix, "Upgrade requested on a route without upgrade support");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeNotSupported,
                format!("{} does not accept protocol upgrades", route.prefix),
            ));
        }
        return handle_upgrade(req, route.clone(), target, request_id).await;
    }

    match pool.send_request(req, &route.authority(), &target).await {
        Ok(response) => Ok(response),
        Err(e) => {
            // Log detailed error internally, return generic message externally
            error!(upstream = %route.authority(), path = %path, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
    }
}

/// Upstream request target: rewritten path plus the original query
fn forward_target(route: &Route, req: &Request<Incoming>) -> String {
    let path = route.rewrite_path(req.uri().path());
    match req.uri().query() {
        Some(query) => format!("{}?{}", path, query),
        None => path,
    }
}

/// Check if a request asks for a protocol upgrade
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    // Check for Connection: Upgrade header (case-insensitive value check)
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

fn get_upgrade_type(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Relay bytes both ways until either side closes
async fn forward_bidirectional(
    mut client_io: TokioIo<Upgraded>,
    mut backend: TcpStream,
    upstream: &str,
    request_id: &str,
) {
    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                upstream,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(upstream, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request(req: &Request<Incoming>, target: &str, authority: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), target);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", authority));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the status line and headers of the backend's upgrade response
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Read from `stream` until the end of the response head. Returns the head
/// and any bytes that arrived after it.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((buf, rest));
        }
        if buf.len() > UPGRADE_RESPONSE_MAX {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding to upgrade",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
}

/// Body of a non-101 upgrade reply: the declared `Content-Length` bytes, or
/// whatever arrived with the head when no length was given. Chunked bodies
/// are not decoded and are dropped.
async fn read_rejection_body(
    stream: &mut TcpStream,
    headers: &[(String, String)],
    mut body: Vec<u8>,
) -> Vec<u8> {
    let header = |wanted: &str| {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value.as_str())
    };

    if header("transfer-encoding").is_some() {
        debug!("Dropping chunked body of rejected upgrade");
        return Vec::new();
    }
    let Some(length) = header("content-length").and_then(|v| v.parse::<usize>().ok()) else {
        return body;
    };

    let length = length.min(REJECTION_BODY_MAX);
    let mut chunk = [0u8; 4096];
    while body.len() < length {
        match tokio::time::timeout(REJECTION_BODY_TIMEOUT, stream.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => body.extend_from_slice(&chunk[..n]),
            _ => break,
        }
    }
    body.truncate(length);
    body
}

/// Relay an upgrade request (websocket or other) to the route's target
async fn handle_upgrade(
    req: Request<Incoming>,
    route: Route,
    target: String,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upstream = route.authority();
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(upstream = %upstream, request_id = %request_id, upgrade_type = %upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &target, &upstream);

    let mut backend_stream = match TcpStream::connect(&upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(upstream = %upstream, error = %e, "Failed to connect to backend for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(upstream = %upstream, error = %e, "Failed to send upgrade request to backend");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Failed to send upgrade request",
        ));
    }

    let (head, early_data) = match read_response_head(&mut backend_stream).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(upstream = %upstream, error = %e, "Failed to read upgrade response from backend");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Invalid upgrade response from backend",
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&head) {
        Some(parsed) => parsed,
        None => {
            error!(upstream = %upstream, "Failed to parse backend upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Invalid upgrade response from backend",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(upstream = %upstream, status = %status, "Backend rejected upgrade request");
        let body = read_rejection_body(&mut backend_stream, &response_headers, early_data).await;
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            // The relayed body is re-framed by hyper
            if is_framing_header(name) {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(upstream = %upstream, request_id = %request_id, upgrade_type = %upgrade_type, "Upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // Skip hop-by-hop headers that hyper handles
        if is_framing_header(name) {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                if !early_data.is_empty() {
                    if let Err(e) = client_io.write_all(&early_data).await {
                        debug!(upstream = %upstream, request_id = %request_id, error = %e, "Failed to relay early upgrade data");
                        return;
                    }
                }
                forward_bidirectional(client_io, backend_stream, &upstream, &request_id).await;
            }
            Err(e) => {
                error!(upstream = %upstream, error = %e, "Failed to upgrade client connection");
            }
        }
        debug!(upstream = %upstream, request_id = %request_id, "Upgraded connection closed");
    });

    Ok(response)
}
