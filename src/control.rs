//! Supervisor side of the control channel
//!
//! The supervisor is the source of truth for its routes. It keeps a local
//! copy, replays all of it whenever a connection to the router is
//! established, and reconnects forever with a fixed delay when the router
//! goes away.

use crate::protocol::{ControlMessage, Route, RouteSet};
use crate::router;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Delay between reconnect attempts. Fixed, no backoff.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Starts a router when the control connection is lost
pub trait RouterLauncher: Send + Sync + 'static {
    fn ensure_running(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Restarts the router as a task in this process
pub struct InProcessLauncher {
    router_port: u16,
    shutdown_rx: watch::Receiver<bool>,
}

impl InProcessLauncher {
    pub fn new(router_port: u16, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            router_port,
            shutdown_rx,
        }
    }
}

impl RouterLauncher for InProcessLauncher {
    fn ensure_running(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            router::ensure_running(self.router_port, self.shutdown_rx.clone()).await;
        })
    }
}

struct Inner {
    routes: RouteSet,
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<ControlMessage>>,
}

pub struct RouterClient {
    addr: SocketAddr,
    retry_delay: Duration,
    inner: Mutex<Inner>,
}

impl RouterClient {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Self::with_retry_delay(addr, RECONNECT_DELAY)
    }

    pub fn with_retry_delay(addr: SocketAddr, retry_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            addr,
            retry_delay,
            inner: Mutex::new(Inner {
                routes: RouteSet::new(),
                state: ConnectionState::Disconnected,
                outbound: None,
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// The local route copy that is replayed on every reconnect
    pub fn routes(&self) -> RouteSet {
        self.inner.lock().routes.clone()
    }

    /// Record a route locally and send it if the router is connected.
    /// While disconnected the route goes out with the next replay.
    pub fn add_route(&self, route: Route) {
        let mut inner = self.inner.lock();
        inner.routes.insert(route.host_name.clone(), route.clone());
        inner.send(ControlMessage::AddRoute(route));
    }

    pub fn remove_routes(&self, routes: RouteSet) {
        let mut inner = self.inner.lock();
        for host in routes.keys() {
            inner.routes.remove(host);
        }
        inner.send(ControlMessage::RemoveRoutes(routes));
    }

    /// Connect, serve, and reconnect forever. Never returns.
    pub async fn connect_loop<L: RouterLauncher>(self: Arc<Self>, launcher: Arc<L>) {
        loop {
            self.inner.lock().state = ConnectionState::Connecting;
            debug!(addr = %self.addr, "Connecting to router");

            match TcpStream::connect(self.addr).await {
                Ok(stream) => {
                    if let Err(e) = self.serve(stream).await {
                        debug!(error = %e, "Router connection error");
                    }
                    warn!("Lost connection to router");
                }
                Err(e) => {
                    debug!(addr = %self.addr, error = %e, "Router not reachable");
                }
            }

            {
                let mut inner = self.inner.lock();
                inner.state = ConnectionState::Disconnected;
                inner.outbound = None;
            }

            launcher.ensure_running().await;
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn serve(&self, stream: TcpStream) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let (tx, mut rx) = mpsc::unbounded_channel();

        {
            // Replay is queued before the sender is published, so it goes
            // out ahead of any individual update.
            let mut inner = self.inner.lock();
            let replay = ControlMessage::AddRoutes(inner.routes.clone());
            let _ = tx.send(replay);
            inner.outbound = Some(tx);
            inner.state = ConnectionState::Connected;
        }
        info!(addr = %self.addr, "Connected to router control channel");

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line? {
                        Some(line) => info!(target: "portside::router", "{}", line),
                        None => return Ok(()),
                    }
                }
                message = rx.recv() => {
                    let Some(message) = message else { return Ok(()) };
                    let mut encoded = message.encode();
                    encoded.push('\n');
                    writer.write_all(encoded.as_bytes()).await?;
                    writer.flush().await?;
                }
            }
        }
    }
}

impl Inner {
    fn send(&mut self, message: ControlMessage) {
        if let Some(tx) = &self.outbound {
            if tx.send(message).is_err() {
                self.outbound = None;
            }
        }
    }
}
