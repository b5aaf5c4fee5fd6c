//! Outbound transport: dialing, connection pooling and backoff.
//!
//! The dial and listen seams are traits so tests can run whole clusters
//! over an in-memory network with controllable partitions; production
//! uses plain TCP.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use raftforge_core::NodeId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::membership::ClusterConfig;
use crate::message::{read_response, write_request, Request, Response};

/// A bidirectional byte stream between peers.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Boxed peer connection.
pub type Conn = Box<dyn Stream>;

/// Opens outbound connections to peer addresses.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect to `addr` within `timeout`.
    async fn dial(&self, addr: &str, timeout: Duration) -> io::Result<Conn>;
}

/// Accepts inbound peer connections.
#[async_trait]
pub trait Listener: Send + 'static {
    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> io::Result<Conn>;

    /// Address this listener is bound to.
    fn local_addr(&self) -> String;
}

/// TCP [`Dialer`].
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str, timeout: Duration) -> io::Result<Conn> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial {addr}")))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// TCP [`Listener`].
pub struct TcpServerListener {
    inner: TcpListener,
    addr: String,
}

impl TcpServerListener {
    /// Bind to `addr`.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let addr = inner.local_addr()?.to_string();
        Ok(Self { inner, addr })
    }
}

#[async_trait]
impl Listener for TcpServerListener {
    async fn accept(&mut self) -> io::Result<Conn> {
        let (stream, _) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

/// Maps node ids to their current addresses, tracking the latest
/// configuration.
#[derive(Debug, Default)]
pub(crate) struct Resolver {
    addrs: RwLock<HashMap<NodeId, String>>,
}

impl Resolver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replace the mapping with the nodes of `config`.
    pub(crate) fn update(&self, config: &ClusterConfig) {
        let mut addrs = self.addrs.write().expect("resolver lock");
        addrs.clear();
        for node in config.nodes.values() {
            addrs.insert(node.id, node.addr.clone());
        }
    }

    /// Current address of a node, if known.
    pub(crate) fn lookup(&self, id: NodeId) -> Option<String> {
        self.addrs.read().expect("resolver lock").get(&id).cloned()
    }
}

/// Pool of idle connections to one peer.
///
/// A connection is taken for the duration of one RPC and returned on
/// success; errors close it, so a broken pipe never lingers in the
/// pool.
pub(crate) struct ConnPool {
    peer: NodeId,
    resolver: Arc<Resolver>,
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
    max_idle: usize,
    idle: Mutex<Vec<Conn>>,
}

impl ConnPool {
    pub(crate) fn new(
        peer: NodeId,
        resolver: Arc<Resolver>,
        dialer: Arc<dyn Dialer>,
        dial_timeout: Duration,
        max_idle: usize,
    ) -> Self {
        Self {
            peer,
            resolver,
            dialer,
            dial_timeout,
            max_idle,
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn get(&self) -> io::Result<Conn> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }
        let addr = self.resolver.lookup(self.peer).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for node {}", self.peer))
        })?;
        self.dialer.dial(&addr, self.dial_timeout).await
    }

    async fn put(&self, conn: Conn) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    /// Send one request and wait for its response.
    pub(crate) async fn do_rpc(&self, req: &Request) -> io::Result<Response> {
        let mut conn = self.get().await?;
        write_request(&mut conn, req).await?;
        match read_response(&mut conn, req.rpc_type()).await {
            Ok(resp) => {
                self.put(conn).await;
                Ok(resp)
            }
            Err(e) => Err(e),
        }
    }
}

const BACKOFF_BASE: Duration = Duration::from_millis(10);
const BACKOFF_MAX_SCALE: u64 = 12;

/// Exponential backoff for failed peer RPCs: 10ms base, doubling from
/// the third round, capped at round twelve.
pub(crate) fn backoff(round: u64) -> Duration {
    let mut wait = BACKOFF_BASE;
    let mut power = round.min(BACKOFF_MAX_SCALE);
    while power > 2 {
        wait *= 2;
        power -= 1;
    }
    wait
}
