//! Common test utilities: an in-memory partitionable network and a
//! cluster harness.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use raftforge::{
    ClusterConfig, Conn, Dialer, Fsm, Info, Listener, MemLog, MemStable, Node, NodeId, RaftError,
    RaftNode, Result, Role, SnapshotStore, Storage,
};
use raftforge_config::RaftOptions;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

pub const HEARTBEAT: Duration = Duration::from_millis(50);
pub const SHORT: Duration = Duration::from_secs(5);
pub const LONG: Duration = Duration::from_secs(15);

/// In-memory network with per-host partitions. Cutting a host breaks
/// its live connections and refuses new ones until reconnected.
pub struct Network {
    hosts: Mutex<HashMap<String, Host>>,
}

struct Host {
    cut_tx: watch::Sender<bool>,
    accept_tx: mpsc::UnboundedSender<Conn>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { hosts: Mutex::new(HashMap::new()) })
    }

    /// Register a host, returning its listener and dialer.
    pub fn host(self: &Arc<Self>, addr: &str) -> (MemListener, MemDialer) {
        let (cut_tx, _) = watch::channel(false);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        self.hosts
            .lock()
            .expect("network lock")
            .insert(addr.to_string(), Host { cut_tx, accept_tx });
        (
            MemListener { addr: addr.to_string(), rx: accept_rx },
            MemDialer { net: self.clone(), src: addr.to_string() },
        )
    }

    /// Partition a host away from everyone.
    pub fn isolate(&self, addr: &str) {
        if let Some(host) = self.hosts.lock().expect("network lock").get(addr) {
            host.cut_tx.send_replace(true);
        }
    }

    /// Heal all partitions.
    pub fn reconnect_all(&self) {
        for host in self.hosts.lock().expect("network lock").values() {
            host.cut_tx.send_replace(false);
        }
    }

    fn connect(&self, src: &str, dst: &str) -> io::Result<Conn> {
        let hosts = self.hosts.lock().expect("network lock");
        let src_host = hosts
            .get(src)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no host {src}")))?;
        let dst_host = hosts
            .get(dst)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no host {dst}")))?;
        if *src_host.cut_tx.borrow() || *dst_host.cut_tx.borrow() {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "partitioned"));
        }

        let (client, proxy_near) = tokio::io::duplex(64 * 1024);
        let (proxy_far, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(pipe(
            proxy_near,
            proxy_far,
            src_host.cut_tx.subscribe(),
            dst_host.cut_tx.subscribe(),
        ));
        dst_host
            .accept_tx
            .send(Box::new(server))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"))?;
        Ok(Box::new(client))
    }
}

/// Shovel bytes both ways until either side closes or either host is
/// cut; dropping the halves breaks the connection for both peers.
async fn pipe(
    near: DuplexStream,
    far: DuplexStream,
    cut_near: watch::Receiver<bool>,
    cut_far: watch::Receiver<bool>,
) {
    let (mut near_read, mut near_write) = tokio::io::split(near);
    let (mut far_read, mut far_write) = tokio::io::split(far);
    tokio::select! {
        _ = tokio::io::copy(&mut near_read, &mut far_write) => {}
        _ = tokio::io::copy(&mut far_read, &mut near_write) => {}
        _ = wait_cut(cut_near) => {}
        _ = wait_cut(cut_far) => {}
    }
}

async fn wait_cut(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct MemDialer {
    net: Arc<Network>,
    src: String,
}

#[async_trait]
impl Dialer for MemDialer {
    async fn dial(&self, addr: &str, _timeout: Duration) -> io::Result<Conn> {
        self.net.connect(&self.src, addr)
    }
}

pub struct MemListener {
    addr: String,
    rx: mpsc::UnboundedReceiver<Conn>,
}

#[async_trait]
impl Listener for MemListener {
    async fn accept(&mut self) -> io::Result<Conn> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "network gone"))
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

/// State machine recording every applied command.
#[derive(Clone, Default)]
pub struct TestFsm {
    commands: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestFsm {
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.commands.lock().expect("fsm lock").clone()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().expect("fsm lock").len()
    }
}

impl Fsm for TestFsm {
    fn apply(&mut self, data: &[u8]) -> Vec<u8> {
        self.commands.lock().expect("fsm lock").push(data.to_vec());
        data.to_vec()
    }

    fn read(&self, _data: &[u8]) -> Vec<u8> {
        let commands = self.commands.lock().expect("fsm lock");
        format!("{}", commands.len()).into_bytes()
    }

    fn snapshot(&self, sink: &mut dyn io::Write) -> io::Result<()> {
        let commands = self.commands.lock().expect("fsm lock");
        for command in commands.iter() {
            sink.write_all(&(command.len() as u32).to_be_bytes())?;
            sink.write_all(command)?;
        }
        Ok(())
    }

    fn restore(&mut self, source: &mut dyn io::Read) -> io::Result<()> {
        let mut raw = Vec::new();
        source.read_to_end(&mut raw)?;
        let mut commands = Vec::new();
        let mut at = 0usize;
        while at + 4 <= raw.len() {
            let len = u32::from_be_bytes(raw[at..at + 4].try_into().unwrap()) as usize;
            at += 4;
            commands.push(raw[at..at + len].to_vec());
            at += len;
        }
        *self.commands.lock().expect("fsm lock") = commands;
        Ok(())
    }
}

pub fn addr_of(id: NodeId) -> String {
    format!("node{id}:7000")
}

/// A launched cluster over the in-memory network.
pub struct Cluster {
    pub net: Arc<Network>,
    pub nodes: BTreeMap<NodeId, RaftNode>,
    pub fsms: BTreeMap<NodeId, TestFsm>,
    _dirs: Vec<tempfile::TempDir>,
}

impl Cluster {
    /// Bootstrap and start `n` voters with ids `1..=n`.
    pub async fn launch(n: u64) -> Cluster {
        Self::launch_with((1..=n).map(|id| Node::voter(id, addr_of(id))).collect()).await
    }

    /// Bootstrap and start an arbitrary member set.
    pub async fn launch_with(members: Vec<Node>) -> Cluster {
        let net = Network::new();
        let ids: Vec<NodeId> = members.iter().map(|n| n.id).collect();
        let config = ClusterConfig::new(members);

        let mut nodes = BTreeMap::new();
        let mut fsms = BTreeMap::new();
        let mut dirs = Vec::new();
        for id in ids {
            let dir = tempfile::tempdir().expect("tempdir");
            let snaps = SnapshotStore::open(dir.path()).expect("snapshot store");
            let mut storage =
                Storage::open(Box::new(MemStable::new()), Box::new(MemLog::new()), snaps)
                    .expect("storage");
            storage.set_identity(1, id).expect("identity");
            storage.bootstrap(config.clone()).await.expect("bootstrap");

            let (listener, dialer) = net.host(&addr_of(id));
            let fsm = TestFsm::default();
            let options = RaftOptions {
                heartbeat_timeout_ms: HEARTBEAT.as_millis() as u64,
                lease_timeout_ms: HEARTBEAT.as_millis() as u64,
                dial_timeout_ms: 100,
                idle_timeout_ms: 200,
                ..RaftOptions::default()
            };
            let node = RaftNode::start(
                options,
                storage,
                Box::new(fsm.clone()),
                Box::new(listener),
                Arc::new(dialer),
            )
            .await
            .expect("node start");

            nodes.insert(id, node);
            fsms.insert(id, fsm);
            dirs.push(dir);
        }
        Cluster { net, nodes, fsms, _dirs: dirs }
    }

    pub async fn info(&self, id: NodeId) -> Info {
        self.nodes[&id].info().await.expect("info")
    }

    pub async fn apply(&self, id: NodeId, data: Vec<u8>) -> Result<Vec<u8>> {
        self.nodes[&id].apply(data).await
    }

    pub fn isolate(&self, id: NodeId) {
        self.net.isolate(&addr_of(id));
    }

    pub fn reconnect_all(&self) {
        self.net.reconnect_all();
    }

    /// Wait until one of `ids` leads and the rest of `ids` agree.
    pub async fn wait_for_leader_among(&self, ids: &[NodeId], timeout: Duration) -> NodeId {
        let deadline = Instant::now() + timeout;
        loop {
            let mut infos = Vec::new();
            for &id in ids {
                infos.push(self.info(id).await);
            }
            let leaders: Vec<&Info> =
                infos.iter().filter(|info| info.role == Role::Leader).collect();
            if leaders.len() == 1 {
                let leader = leaders[0].node_id;
                if infos.iter().all(|info| info.leader == leader) {
                    return leader;
                }
            }
            if Instant::now() >= deadline {
                panic!("no stable leader among {ids:?} within {timeout:?}");
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> NodeId {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        self.wait_for_leader_among(&ids, timeout).await
    }

    /// Wait until every state machine holds exactly `want`.
    pub async fn wait_fsm_convergence(&self, want: &[&[u8]], timeout: Duration) {
        let want: Vec<Vec<u8>> = want.iter().map(|w| w.to_vec()).collect();
        let deadline = Instant::now() + timeout;
        loop {
            if self.fsms.values().all(|fsm| fsm.commands() == want) {
                return;
            }
            if Instant::now() >= deadline {
                let got: Vec<usize> = self.fsms.values().map(TestFsm::len).collect();
                panic!("state machines did not converge; lengths {got:?}");
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every state machine applied `len` commands.
    pub async fn wait_fsm_len(&self, len: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.fsms.values().all(|fsm| fsm.len() == len) {
                return;
            }
            if Instant::now() >= deadline {
                let got: Vec<usize> = self.fsms.values().map(TestFsm::len).collect();
                panic!("state machines did not reach {len}; lengths {got:?}");
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        for (_, node) in self.nodes {
            node.shutdown().await;
        }
    }
}

/// Expect a NotLeader error, returning its `lost` flag.
pub fn expect_not_leader(err: RaftError) -> bool {
    match err {
        RaftError::NotLeader { lost, .. } => lost,
        other => panic!("expected NotLeader, got {other}"),
    }
}
