//! The reverse-proxy router
//!
//! Runs two listeners:
//!
//! - the public HTTP listener, which forwards each request to the backend
//!   registered for its Host header, and
//! - the control listener on localhost, where supervisors send
//!   [`ControlMessage`]s that add or remove routes.
//!
//! The router never creates routes on its own. After a restart its table is
//! empty until a supervisor reconnects and replays its routes.

use crate::config::CONTROL_PORT;
use crate::error::{
    negotiated_error_response, unknown_host_response, BodyFormat, ProxyErrorCode,
};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::port;
use crate::protocol::{ControlMessage, Route};
use crate::routes::{RouteTable, SharedRouteTable};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Sent to remaining control clients when one disconnects
pub const ROUTING_PAUSED: &str = "Routing paused: a supervisor disconnected from the router";

/// Longest control message accepted, newline excluded
pub const MAX_CONTROL_LINE: usize = 1024 * 1024;

/// Largest backend response head read before an upgraded tunnel starts
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

pub struct Router {
    http_listener: TcpListener,
    control_listener: TcpListener,
    http_addr: SocketAddr,
    control_addr: SocketAddr,
    routes: SharedRouteTable,
    pool: Arc<ConnectionPool>,
    notices: broadcast::Sender<String>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Router {
    /// Bind both listeners. Nothing is served until [`Router::run`].
    pub async fn bind(
        http_addr: SocketAddr,
        control_addr: SocketAddr,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let http_listener = TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind router HTTP port {}: {}", http_addr, e))?;
        let control_listener = TcpListener::bind(control_addr).await.map_err(|e| {
            anyhow::anyhow!("Failed to bind router control port {}: {}", control_addr, e)
        })?;
        let http_addr = http_listener.local_addr()?;
        let control_addr = control_listener.local_addr()?;
        let (notices, _) = broadcast::channel(16);

        Ok(Self {
            http_listener,
            control_listener,
            http_addr,
            control_addr,
            routes: RouteTable::shared(),
            pool: Arc::new(ConnectionPool::new(PoolConfig::default())),
            notices,
            shutdown_rx,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// The pool used for forwarding, for its traffic counters
    pub fn pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.pool)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let http_addr = self.http_addr();
        let router_port = http_addr.port();
        info!(addr = %http_addr, "Router running on port {}", router_port);
        info!(addr = %self.control_addr(), "Router control channel listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.http_listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            let pool = Arc::clone(&self.pool);
                            tokio::spawn(async move {
                                if let Err(e) = serve_http_connection(stream, routes, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = self.control_listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            info!(addr = %addr, "Supervisor connected to router");
                            let routes = Arc::clone(&self.routes);
                            let notices = self.notices.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_control_connection(stream, &routes, router_port, &notices).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                                let hosts: Vec<String> = routes.snapshot().into_iter().map(|r| r.host_name).collect();
                                warn!(addr = %addr, routes = ?hosts, "Supervisor disconnected, routing paused until it reconnects");
                                let _ = notices.send(ROUTING_PAUSED.to_string());
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Router shutting down");
                        break;
                    }
                }
            }
        }

        let stats = self.pool.stats();
        info!(
            forwarded = stats.forwarded(),
            failed = stats.failed(),
            "Router stopped"
        );

        Ok(())
    }
}

/// Start a router in this process unless one is already listening on
/// `router_port`. Safe to call repeatedly; returns whether a router was started.
pub async fn ensure_running(router_port: u16, shutdown_rx: watch::Receiver<bool>) -> bool {
    match port::is_taken(router_port) {
        Err(e) => {
            error!(port = router_port, error = %e, "Failed to probe router port");
            return false;
        }
        Ok(true) => {
            info!("Router port {} is already in use", router_port);
            return false;
        }
        Ok(false) => {}
    }

    info!("Router starting on port {}...", router_port);

    let http_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, router_port));
    let control_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, CONTROL_PORT));

    match Router::bind(http_addr, control_addr, shutdown_rx).await {
        Ok(router) => {
            tokio::spawn(async move {
                if let Err(e) = router.run().await {
                    error!(error = %e, "Router error");
                }
            });
            true
        }
        Err(e) => {
            error!(error = %e, "Failed to start router");
            false
        }
    }
}

/// Apply one control message to the table, returning the confirmation lines
/// to send back to the client
pub fn apply(routes: &RouteTable, router_port: u16, message: ControlMessage) -> Vec<String> {
    match message {
        ControlMessage::AddRoute(route) => {
            let confirmation = added(&route, router_port);
            routes.add_route(route);
            vec![confirmation]
        }
        ControlMessage::AddRoutes(set) => {
            routes.add_routes(&set);
            set.values().map(|route| added(route, router_port)).collect()
        }
        ControlMessage::RemoveRoutes(set) => routes
            .remove_routes(&set)
            .iter()
            .map(|route| {
                info!(host = %route.host_name, process = %route.process_name, "Route removed");
                route
                    .color
                    .paint(&format!(
                        "Removing route {} http://{}:{} on port {}",
                        route.process_name, route.host_name, router_port, route.port
                    ))
                    .to_string()
            })
            .collect(),
    }
}

fn added(route: &Route, router_port: u16) -> String {
    info!(
        host = %route.host_name,
        process = %route.process_name,
        port = route.port,
        "Route added"
    );
    route
        .color
        .paint(&format!(
            "Routing process {} from http://{}:{} to port {}",
            route.process_name, route.host_name, router_port, route.port
        ))
        .to_string()
}

/// Decode and apply one raw line. Bad messages are logged and dropped.
pub fn handle_control_line(routes: &RouteTable, router_port: u16, line: &str) -> Vec<String> {
    match ControlMessage::decode(line) {
        Ok(message) => apply(routes, router_port, message),
        Err(e) => {
            warn!(error = %e, "Dropping control message");
            Vec::new()
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn serve_control_connection(
    stream: TcpStream,
    routes: &RouteTable,
    router_port: u16,
    notices: &broadcast::Sender<String>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut notice_rx = notices.subscribe();
    let mut buf = Vec::new();
    let mut discarding = false;

    write_line(&mut writer, &format!("Connected to router on port {}", router_port)).await?;

    loop {
        // Room for a full line plus its newline; anything longer stops one byte short
        let room = (MAX_CONTROL_LINE + 1).saturating_sub(buf.len()) as u64;
        let mut limited = (&mut reader).take(room);
        tokio::select! {
            read = limited.read_until(b'\n', &mut buf) => {
                if read? == 0 {
                    break;
                }
                if buf.last() != Some(&b'\n') {
                    if buf.len() > MAX_CONTROL_LINE {
                        if !discarding {
                            warn!(limit = MAX_CONTROL_LINE, "Dropping oversized control message");
                        }
                        discarding = true;
                        buf.clear();
                    }
                    continue;
                }
                if discarding {
                    discarding = false;
                    buf.clear();
                    continue;
                }
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                buf.clear();
                if line.is_empty() {
                    continue;
                }
                for reply in handle_control_line(routes, router_port, &line) {
                    write_line(&mut writer, &reply).await?;
                }
            }
            notice = notice_rx.recv() => {
                match notice {
                    Ok(text) => write_line(&mut writer, &text).await?,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

async fn serve_http_connection(
    stream: TcpStream,
    routes: SharedRouteTable,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, routes, pool).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    routes: SharedRouteTable,
    pool: Arc<ConnectionPool>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let format = BodyFormat::negotiate(req.headers());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(negotiated_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
                format,
            ));
        }
    };

    let Some(route) = routes.lookup(&hostname) else {
        debug!(hostname, "No route for host");
        return Ok(unknown_host_response(&hostname, format));
    };

    debug!(hostname, method = %req.method(), uri = %req.uri(), port = route.port, "Forwarding request");

    if is_upgrade_request(&req) {
        return handle_upgrade(req, route).await;
    }

    match pool.forward(req, route.port).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(hostname, port = route.port, error = %e, "Failed to forward request");
            warn!(process = %route.process_name, "Process may still be starting");
            Ok(negotiated_error_response(
                ProxyErrorCode::ConnectionFailed,
                &format!(
                    "Could not reach process {} on port {}",
                    route.process_name, route.port
                ),
                format,
            ))
        }
    }
}

fn extract_hostname(req: &Request<Incoming>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    host_without_port(raw)
}

/// Lowercased host of a Host header value with any port removed. IPv6
/// literals keep their brackets. `None` only when no host is left.
fn host_without_port(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let host = if raw.starts_with('[') {
        raw.find(']').map_or(raw, |end| &raw[..=end])
    } else {
        raw.split(':').next().unwrap_or(raw)
    };

    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 request line and headers for the backend, Host left as sent
fn build_upgrade_request(req: &Request<Incoming>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let code: u16 = status_line.split(' ').nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

/// Response with no body carrying the backend's status and headers.
/// Headers hyper cannot represent are skipped.
fn empty_response(
    status: StatusCode,
    headers: &[(String, String)],
) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
    let mut response = Response::builder().status(status);
    for (name, value) in headers {
        let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "Skipping invalid backend header");
            continue;
        };
        if header == CONTENT_LENGTH || header == TRANSFER_ENCODING {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(header, hv);
        }
    }
    response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .ok()
}

/// Read the backend's response head through its blank line. Returns the
/// head and whatever the backend sent after it in the same reads.
async fn read_response_head<R: AsyncRead + Unpin>(
    backend: &mut R,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }

        let n = backend.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed connection",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Tunnel a WebSocket (or other upgrade) to the backend
async fn handle_upgrade(
    req: Request<Incoming>,
    route: Route,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let format = BodyFormat::negotiate(req.headers());
    let fail = |message: String| -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        error!(host = %route.host_name, port = route.port, "{}", message);
        Ok(negotiated_error_response(
            ProxyErrorCode::ConnectionFailed,
            &message,
            format,
        ))
    };

    let mut backend = match TcpStream::connect(("127.0.0.1", route.port)).await {
        Ok(stream) => stream,
        Err(e) => return fail(format!("Failed to connect to backend: {}", e)),
    };

    if let Err(e) = backend.write_all(&build_upgrade_request(&req)).await {
        return fail(format!("Failed to send upgrade request: {}", e));
    }

    let (head, early) = match read_response_head(&mut backend).await {
        Ok(parts) => parts,
        Err(e) => return fail(format!("Failed to read backend response: {}", e)),
    };

    let Some((status, headers)) = parse_upgrade_response(&head) else {
        return fail("Invalid upgrade response from backend".to_string());
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(host = %route.host_name, status = %status, "Backend rejected upgrade request");
        return match empty_response(status, &headers) {
            Some(response) => Ok(response),
            None => fail(format!("Unusable response from backend ({})", status)),
        };
    }

    let Some(response) = empty_response(StatusCode::SWITCHING_PROTOCOLS, &headers) else {
        return fail("Unusable upgrade response from backend".to_string());
    };

    let host = route.host_name.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => tunnel(upgraded, backend, early, &host).await,
            Err(e) => error!(host, error = %e, "Failed to upgrade client connection"),
        }
    });

    Ok(response)
}

/// Copy bytes both ways until either side closes. `early` holds backend
/// bytes that arrived with the handshake and go to the client first.
async fn tunnel(client: Upgraded, mut backend: TcpStream, early: Vec<u8>, host: &str) {
    let mut client = TokioIo::new(client);
    if !early.is_empty() {
        if let Err(e) = client.write_all(&early).await {
            debug!(host, error = %e, "Upgraded connection closed with error");
            return;
        }
    }
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((up, down)) => debug!(host, up, down, "Upgraded connection closed"),
        Err(e) => debug!(host, error = %e, "Upgraded connection closed with error"),
    }
}
