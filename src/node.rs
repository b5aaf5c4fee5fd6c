//! The replica: core state, the single-threaded main loop, and the
//! public node handle.
//!
//! One task drives all role logic. Each loop iteration selects over the
//! shutdown signal, inbound RPCs, user tasks, role events published by
//! replicators / vote fan-outs / the applier, and the role's timer. The
//! main task is the sole mutator of term, vote, role, leader, commit
//! index and configuration; everything else observes them through
//! messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use raftforge_core::{LogIndex, NodeId, RaftError, Result, Role, Term};
use raftforge_config::{validate_options, RaftOptions};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::applier::{run_applier, FsmTask};
use crate::candidate::CandShip;
use crate::entry::EntryType;
use crate::follower::FollowerShip;
use crate::fsm::Fsm;
use crate::leader::LdrShip;
use crate::membership::ClusterConfig;
use crate::message::{
    AppendReq, AppendResp, InstallSnapshotReq, InstallSnapshotResp, Request, Response, RpcResult,
    TimeoutNowReq, TimeoutNowResp, VoteReq, VoteResp,
};
use crate::replicate::rand_jitter;
use crate::server::{serve, InboundRpc};
use crate::snapshot::SnapshotMeta;
use crate::storage::Storage;
use crate::tasks::{Info, Task};
use crate::transport::{ConnPool, Dialer, Listener, Resolver};

/// Events delivered to the main loop by helper tasks. Events carry the
/// term of the role that spawned their producer; stale ones are
/// dropped.
#[derive(Debug)]
pub(crate) enum RoleEvent {
    /// A vote response (or a failed vote RPC) from a peer.
    VoteResult {
        term: Term,
        from: NodeId,
        resp: Option<VoteResp>,
    },
    /// A replicator advanced its peer's match index.
    Match {
        term: Term,
        from: NodeId,
        match_index: LogIndex,
    },
    /// A replicator lost (`Some`) or regained (`None`) contact.
    NoContact {
        term: Term,
        from: NodeId,
        since: Option<std::time::Instant>,
    },
    /// A peer answered with a higher term.
    NewTerm { term: Term, observed: Term },
    /// The applier finished a snapshot; the covered prefix may go.
    SnapshotTaken { index: LogIndex },
}

/// Replica state shared by every role.
pub(crate) struct Core {
    pub(crate) storage: Storage,
    pub(crate) options: RaftOptions,
    /// Known leader of the current term; zero when leaderless.
    pub(crate) leader: NodeId,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) fsm_tx: mpsc::Sender<FsmTask>,
    pub(crate) event_tx: mpsc::UnboundedSender<RoleEvent>,
    pub(crate) resolver: Arc<Resolver>,
    pub(crate) dialer: Arc<dyn Dialer>,
    pools: HashMap<NodeId, Arc<ConnPool>>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    /// Set by role logic to request a transition to follower.
    pub(crate) step_down: bool,
    /// Set when a committed configuration removed this node and
    /// `shutdown_on_remove` is on.
    pub(crate) removed: bool,
}

impl Core {
    /// Randomized election timeout in `[hb, 2*hb)`.
    pub(crate) fn election_timeout(&self) -> Duration {
        rand_jitter(self.options.heartbeat_timeout())
    }

    /// Connection pool for a peer, created lazily.
    pub(crate) fn get_conn_pool(&mut self, peer: NodeId) -> Arc<ConnPool> {
        if let Some(pool) = self.pools.get(&peer) {
            return pool.clone();
        }
        let pool = Arc::new(ConnPool::new(
            peer,
            self.resolver.clone(),
            self.dialer.clone(),
            self.options.dial_timeout(),
            self.options.max_pooled_connections,
        ));
        self.pools.insert(peer, pool.clone());
        pool
    }

    /// Current leader with its address, when known.
    pub(crate) fn leader_hint(&self) -> Option<(NodeId, String)> {
        if self.leader == 0 {
            return None;
        }
        let addr = self.resolver.lookup(self.leader).unwrap_or_default();
        Some((self.leader, addr))
    }

    /// Fire-and-forget a TimeoutNow at the transfer target.
    pub(crate) fn send_timeout_now(&mut self, target: NodeId) {
        let pool = self.get_conn_pool(target);
        let req = Request::TimeoutNow(TimeoutNowReq {
            term: self.storage.term,
            leader: self.storage.node_id,
        });
        debug!(to = target, "sending timeout-now");
        tokio::spawn(async move {
            let _ = pool.do_rpc(&req).await;
        });
    }

    /// A new configuration was appended: the previous latest becomes
    /// committed (a change is only accepted once its predecessor
    /// committed) and the new one becomes latest.
    pub(crate) fn change_config(&mut self, config: ClusterConfig) {
        info!(index = config.index, "config changed");
        self.storage.configs.committed =
            std::mem::replace(&mut self.storage.configs.latest, config);
        self.resolver.update(&self.storage.configs.latest);
    }

    /// The latest configuration committed.
    pub(crate) fn commit_config(&mut self) {
        debug!(index = self.storage.configs.latest.index, "config committed");
        self.storage.configs.committed = self.storage.configs.latest.clone();
    }

    /// Truncation discarded the uncommitted latest configuration.
    pub(crate) fn revert_config(&mut self) {
        warn!(index = self.storage.configs.committed.index, "config reverted");
        self.storage.configs.latest = self.storage.configs.committed.clone();
        self.resolver.update(&self.storage.configs.latest);
    }

    /// Advance the commit index, handling configuration commitment.
    /// Returns true when a pending configuration just committed.
    pub(crate) fn set_commit_index(&mut self, index: LogIndex) -> bool {
        self.commit_index = index;
        trace!(commit_index = index, "commit index advanced");

        let mut config_committed = false;
        if !self.storage.configs.is_committed() && self.storage.configs.latest.index <= index {
            self.commit_config();
            config_committed = true;
            let nid = self.storage.node_id;
            if !self.storage.configs.latest.is_voter(nid) {
                self.step_down = true;
            }
            if self.options.shutdown_on_remove
                && !self.storage.configs.latest.nodes.contains_key(&nid)
            {
                self.removed = true;
            }
        }
        config_committed
    }

    /// Feed committed entries to the applier; used outside leadership,
    /// where no pending queue exists.
    pub(crate) async fn apply_committed_basic(&mut self) {
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let entry = match self.storage.get_entry(next).await {
                Ok(entry) => entry,
                Err(e) => panic!("committed entry {next} unavailable: {e}"),
            };
            if entry.typ == EntryType::User {
                let task = FsmTask::Apply {
                    index: entry.index,
                    term: entry.term,
                    data: entry.data,
                    resp: None,
                };
                if !self.send_fsm(task).await {
                    return;
                }
            }
            self.last_applied = next;
        }
    }

    /// Enqueue into the bounded applier channel, staying responsive to
    /// shutdown. Returns false when the replica is closing.
    pub(crate) async fn send_fsm(&mut self, task: FsmTask) -> bool {
        if *self.shutdown_rx.borrow() {
            return false;
        }
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            _ = shutdown.changed() => false,
            sent = self.fsm_tx.send(task) => sent.is_ok(),
        }
    }
}

/// Role-specific state; the loop pattern-matches and delegates.
pub(crate) enum RoleState {
    Follower(FollowerShip),
    Candidate(CandShip),
    Leader(LdrShip),
}

impl RoleState {
    fn role(&self) -> Role {
        match self {
            RoleState::Follower(_) => Role::Follower,
            RoleState::Candidate(_) => Role::Candidate,
            RoleState::Leader(_) => Role::Leader,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            RoleState::Follower(f) => Some(f.deadline),
            RoleState::Candidate(c) => Some(c.deadline),
            RoleState::Leader(l) => l.deadline(),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The replica driven by the main loop.
pub(crate) struct Replica {
    core: Core,
    role: RoleState,
    rpc_rx: mpsc::Receiver<InboundRpc>,
    task_rx: mpsc::Receiver<Task>,
    event_rx: mpsc::UnboundedReceiver<RoleEvent>,
}

impl Replica {
    pub(crate) async fn run(mut self) {
        info!(
            node = self.core.storage.node_id,
            term = self.core.storage.term,
            "replica started"
        );
        loop {
            let deadline = self.role.deadline();
            tokio::select! {
                _ = self.core.shutdown_rx.changed() => break,
                Some(rpc) = self.rpc_rx.recv() => self.on_rpc(rpc).await,
                Some(task) = self.task_rx.recv() => self.on_task(task).await,
                Some(event) = self.event_rx.recv() => self.on_event(event).await,
                _ = sleep_until_opt(deadline) => self.on_timeout().await,
            }

            if self.core.removed {
                info!(node = self.core.storage.node_id, "removed from cluster, shutting down");
                let _ = self.core.shutdown_tx.send(true);
                break;
            }
            if self.core.step_down {
                self.core.step_down = false;
                if !matches!(self.role, RoleState::Follower(_)) {
                    self.core.leader = 0;
                    self.to_follower(false);
                }
            }
        }
        if let RoleState::Leader(l) = &mut self.role {
            l.release(&mut self.core, true, false);
        }
        info!(node = self.core.storage.node_id, "replica stopped");
    }

    // ---- transitions --------------------------------------------------

    fn to_follower(&mut self, new_term: bool) {
        if let RoleState::Leader(l) = &mut self.role {
            l.release(&mut self.core, false, new_term);
        }
        if !matches!(self.role, RoleState::Follower(_)) {
            debug!(term = self.core.storage.term, "became follower");
        }
        self.role = RoleState::Follower(FollowerShip::new(&self.core));
    }

    /// Term rule: an observed term above ours forces follower state.
    fn step_down(&mut self, term: Term) {
        let new_term = term > self.core.storage.term;
        self.to_follower(new_term);
        if new_term {
            self.core.storage.set_term(term);
        }
        self.core.leader = 0;
    }

    async fn become_candidate(&mut self) {
        if let RoleState::Leader(l) = &mut self.role {
            l.release(&mut self.core, false, false);
        }
        self.core.leader = 0;
        let mut cand = CandShip::new();
        let won = cand.start_election(&mut self.core);
        self.role = RoleState::Candidate(cand);
        if won {
            self.become_leader().await;
        }
    }

    async fn become_leader(&mut self) {
        let ldr = LdrShip::init(&mut self.core).await;
        self.role = RoleState::Leader(ldr);
    }

    fn reset_election_timer(&mut self) {
        if let RoleState::Follower(f) = &mut self.role {
            f.reset_timer(&self.core);
        }
    }

    // ---- timers -------------------------------------------------------

    async fn on_timeout(&mut self) {
        match &mut self.role {
            RoleState::Follower(f) => {
                if !self.core.storage.configs.latest.is_voter(self.core.storage.node_id) {
                    // nonvoters never campaign
                    f.reset_timer(&self.core);
                    return;
                }
            }
            RoleState::Candidate(c) => {
                debug!(term = self.core.storage.term, "election timed out, retrying");
                let won = c.start_election(&mut self.core);
                if won {
                    self.become_leader().await;
                }
                return;
            }
            RoleState::Leader(l) => {
                l.on_timeout(&mut self.core).await;
                return;
            }
        }
        debug!(term = self.core.storage.term, "election timeout");
        self.become_candidate().await;
    }

    // ---- role events --------------------------------------------------

    async fn on_event(&mut self, event: RoleEvent) {
        match event {
            RoleEvent::SnapshotTaken { index } => {
                if let Err(e) = self.core.storage.remove_lte(index).await {
                    error!(error = %e, "log compaction failed");
                }
            }
            RoleEvent::NewTerm { term, observed } => {
                if term != self.core.storage.term {
                    return;
                }
                if matches!(self.role, RoleState::Leader(_)) && observed > term {
                    debug!(observed, "peer has a newer term, stepping down");
                    self.step_down(observed);
                }
            }
            RoleEvent::VoteResult { term, from, resp } => {
                if term != self.core.storage.term
                    || !matches!(self.role, RoleState::Candidate(_))
                {
                    return;
                }
                let Some(resp) = resp else { return };
                trace!(from, granted = (resp.result == RpcResult::Success), "vote response");
                if resp.term > term {
                    self.step_down(resp.term);
                    return;
                }
                if resp.result == RpcResult::Success && resp.term == term {
                    let won = {
                        let RoleState::Candidate(c) = &mut self.role else { return };
                        c.votes_needed = c.votes_needed.saturating_sub(1);
                        c.votes_needed == 0
                    };
                    if won {
                        self.become_leader().await;
                    }
                }
            }
            RoleEvent::Match { term, from, match_index } => {
                if term != self.core.storage.term {
                    return;
                }
                let RoleState::Leader(l) = &mut self.role else { return };
                l.on_match(&mut self.core, from, match_index).await;
            }
            RoleEvent::NoContact { term, from, since } => {
                if term != self.core.storage.term {
                    return;
                }
                let RoleState::Leader(l) = &mut self.role else { return };
                l.on_contact_change(&mut self.core, from, since);
            }
        }
    }

    // ---- user tasks ---------------------------------------------------

    async fn on_task(&mut self, task: Task) {
        match task {
            Task::Info { resp } => {
                let _ = resp.send(self.info());
            }
            Task::TakeSnapshot { threshold, resp } => {
                let config = self.core.storage.configs.committed.clone();
                let task = FsmTask::TakeSnapshot { threshold, config, resp };
                // a dropped task surfaces as ServerClosed at the caller
                let _ = self.core.send_fsm(task).await;
            }
            Task::ChangeConfig { new_config, resp }
                if self.core.storage.configs.is_bootstrap() =>
            {
                self.bootstrap(new_config, resp).await;
            }
            task => {
                if !matches!(self.role, RoleState::Leader(_)) {
                    self.reply_not_leader(task);
                    return;
                }
                let RoleState::Leader(l) = &mut self.role else { return };
                match task {
                    Task::Apply { data, resp } => l.on_apply(&mut self.core, data, resp).await,
                    Task::Read { data, resp } => l.on_read(&mut self.core, data, resp).await,
                    Task::Barrier { resp } => l.on_barrier(&mut self.core, resp).await,
                    Task::ChangeConfig { new_config, resp } => {
                        l.on_change_config(&mut self.core, new_config, resp).await
                    }
                    Task::WaitForStableConfig { resp } => l.on_wait_stable(&self.core, resp),
                    Task::TransferLeadership { target, timeout, resp } => {
                        l.on_transfer_leadership(&mut self.core, target, timeout, resp)
                    }
                    Task::Info { .. } | Task::TakeSnapshot { .. } => unreachable!(),
                }
            }
        }
    }

    fn reply_not_leader(&self, task: Task) {
        let err = RaftError::not_leader(self.core.leader_hint(), false);
        match task {
            Task::Apply { resp, .. } | Task::Read { resp, .. } => {
                let _ = resp.send(Err(err));
            }
            Task::Barrier { resp } | Task::ChangeConfig { resp, .. } => {
                let _ = resp.send(Err(err));
            }
            Task::TransferLeadership { resp, .. } => {
                let _ = resp.send(Err(err));
            }
            Task::WaitForStableConfig { resp } => {
                let _ = resp.send(Err(err));
            }
            Task::Info { .. } | Task::TakeSnapshot { .. } => {}
        }
    }

    fn info(&self) -> Info {
        Info {
            cluster_id: self.core.storage.cluster_id,
            node_id: self.core.storage.node_id,
            term: self.core.storage.term,
            role: self.role.role(),
            leader: self.core.leader,
            last_log_index: self.core.storage.last_log_index,
            last_log_term: self.core.storage.last_log_term,
            commit_index: self.core.commit_index,
            last_applied: self.core.last_applied,
            configs: self.core.storage.configs.clone(),
        }
    }

    async fn bootstrap(&mut self, config: ClusterConfig, resp: oneshot::Sender<Result<()>>) {
        let nid = self.core.storage.node_id;
        if let Err(e) = config.validate() {
            let _ = resp.send(Err(e));
            return;
        }
        match config.nodes.get(&nid) {
            None => {
                let _ = resp.send(Err(RaftError::Bootstrap(format!(
                    "self ({nid}) is not in the config"
                ))));
                return;
            }
            Some(node) if !node.voter => {
                let _ = resp.send(Err(RaftError::Bootstrap(format!(
                    "self ({nid}) must be a voter"
                ))));
                return;
            }
            Some(_) => {}
        }
        if !config.is_stable() {
            let _ = resp.send(Err(RaftError::Bootstrap("config must be stable".into())));
            return;
        }

        if let Err(e) = self.core.storage.bootstrap(config).await {
            let _ = resp.send(Err(e));
            return;
        }
        self.core.resolver.update(&self.core.storage.configs.latest);
        let _ = resp.send(Ok(()));
        self.become_candidate().await;
    }

    // ---- rpc receivers ------------------------------------------------

    async fn on_rpc(&mut self, rpc: InboundRpc) {
        let resp = match rpc.req {
            Request::Vote(req) => Response::Vote(self.on_vote_request(req)),
            Request::Append(req) => Response::Append(self.on_append_entries(req).await),
            Request::InstallSnapshot(req) => {
                Response::InstallSnapshot(self.on_install_snapshot(req).await)
            }
            Request::TimeoutNow(req) => Response::TimeoutNow(self.on_timeout_now(req).await),
        };
        let _ = rpc.resp_tx.send(resp);
    }

    fn on_vote_request(&mut self, req: VoteReq) -> VoteResp {
        if req.term > self.core.storage.term {
            self.step_down(req.term);
        }
        let term = self.core.storage.term;
        if req.term < term {
            debug!(candidate = req.candidate, "vote rejected: stale term");
            return VoteResp { term, result: RpcResult::StaleTerm };
        }

        // with a known leader, only that leader gets our vote
        if self.core.leader != 0 {
            if req.candidate == self.core.leader {
                self.reset_election_timer();
                return VoteResp { term, result: RpcResult::Success };
            }
            debug!(candidate = req.candidate, leader = self.core.leader, "vote rejected: leader known");
            return VoteResp { term, result: RpcResult::LeaderKnown };
        }

        if self.core.storage.voted_for != 0 {
            if self.core.storage.voted_for == req.candidate {
                self.reset_election_timer();
                return VoteResp { term, result: RpcResult::Success };
            }
            debug!(candidate = req.candidate, voted_for = self.core.storage.voted_for, "vote rejected: already voted");
            return VoteResp { term, result: RpcResult::AlreadyVoted };
        }

        let (our_index, our_term) =
            (self.core.storage.last_log_index, self.core.storage.last_log_term);
        if our_term > req.last_log_term
            || (our_term == req.last_log_term && our_index > req.last_log_index)
        {
            debug!(candidate = req.candidate, "vote rejected: log not up to date");
            return VoteResp { term, result: RpcResult::LogNotUpToDate };
        }

        debug!(candidate = req.candidate, term, "vote granted");
        self.core.storage.set_voted_for(term, req.candidate);
        self.reset_election_timer();
        VoteResp { term, result: RpcResult::Success }
    }

    async fn on_append_entries(&mut self, mut req: AppendReq) -> AppendResp {
        let mut resp = AppendResp {
            term: self.core.storage.term,
            result: RpcResult::StaleTerm,
            last_log_index: self.core.storage.last_log_index,
        };
        if req.term < self.core.storage.term {
            return resp;
        }
        if req.term > self.core.storage.term || !matches!(self.role, RoleState::Follower(_)) {
            self.step_down(req.term);
        }
        self.core.leader = req.leader;
        self.reset_election_timer();
        resp.term = self.core.storage.term;

        // consistency check against prev(index, term)
        if req.prev_log_index > 0 {
            let storage = &self.core.storage;
            if req.prev_log_index > storage.last_log_index {
                resp.result = RpcResult::LogMismatch;
                return resp;
            }
            let prev_matches = if req.prev_log_index == storage.last_log_index {
                storage.last_log_term == req.prev_log_term
            } else if req.prev_log_index == storage.snap_index() {
                storage.snap_term() == req.prev_log_term
            } else if req.prev_log_index < storage.snap_index() {
                // compacted away; the leader must send a snapshot
                false
            } else {
                match storage.get_entry(req.prev_log_index).await {
                    Ok(entry) => entry.term == req.prev_log_term,
                    Err(_) => false,
                }
            };
            if !prev_matches {
                resp.result = RpcResult::LogMismatch;
                return resp;
            }
        }

        // last position described by this request, for the commit rule
        let (req_last_index, req_last_term) = req
            .entries
            .last()
            .map(|e| (e.index, e.term))
            .unwrap_or((req.prev_log_index, req.prev_log_term));

        // find the first entry we do not already hold
        let mut accept_from = None;
        for (i, entry) in req.entries.iter().enumerate() {
            if entry.index > self.core.storage.last_log_index {
                accept_from = Some(i);
                break;
            }
            let have = self.core.storage.entry_term(entry.index).await.unwrap_or(0);
            if have != entry.term {
                let prev_term = if i == 0 { req.prev_log_term } else { req.entries[i - 1].term };
                debug!(index = entry.index, "conflicting suffix, truncating");
                self.core.storage.remove_gte(entry.index, prev_term).await;
                if entry.index <= self.core.storage.configs.latest.index {
                    self.core.revert_config();
                }
                accept_from = Some(i);
                break;
            }
        }

        if let Some(start) = accept_from {
            for entry in req.entries.drain(..).skip(start) {
                let config = if entry.typ == EntryType::Config {
                    match ClusterConfig::from_entry(&entry) {
                        Ok(config) => Some(config),
                        Err(e) => panic!("corrupt config entry {}: {e}", entry.index),
                    }
                } else {
                    None
                };
                self.core.storage.append_entry(entry).await;
                if let Some(config) = config {
                    // configs follow log receipt, not commit
                    self.core.change_config(config);
                }
            }
            self.core.storage.sync_log().await;
        }
        resp.last_log_index = self.core.storage.last_log_index;

        // commit only when the request proves the prefix is from this
        // term
        if req_last_term == req.term && req.ldr_commit_index > self.core.commit_index {
            let commit = req.ldr_commit_index.min(req_last_index);
            self.core.set_commit_index(commit);
            self.core.apply_committed_basic().await;
        }

        resp.result = RpcResult::Success;
        resp
    }

    async fn on_install_snapshot(&mut self, req: InstallSnapshotReq) -> InstallSnapshotResp {
        let mut resp = InstallSnapshotResp {
            term: self.core.storage.term,
            result: RpcResult::StaleTerm,
        };
        if req.term < self.core.storage.term {
            return resp;
        }
        if req.term > self.core.storage.term || !matches!(self.role, RoleState::Follower(_)) {
            self.step_down(req.term);
        }
        self.core.leader = req.leader;
        self.reset_election_timer();
        resp.term = self.core.storage.term;

        if req.last_index <= self.core.storage.snap_index() {
            // already covered by a local snapshot
            resp.result = RpcResult::Success;
            return resp;
        }

        // restore the state machine before touching storage
        let (tx, rx) = oneshot::channel();
        let restore = FsmTask::Restore {
            index: req.last_index,
            term: req.last_term,
            payload: req.payload.clone(),
            resp: tx,
        };
        if !self.core.send_fsm(restore).await {
            resp.result = RpcResult::Failed;
            return resp;
        }
        match rx.await {
            Ok(Ok(())) => {}
            _ => {
                resp.result = RpcResult::Failed;
                return resp;
            }
        }

        let meta = SnapshotMeta {
            index: req.last_index,
            term: req.last_term,
            config: req.config.clone(),
            size: req.payload.len() as u64,
        };
        if let Err(e) = self.core.storage.install_snapshot(meta, &req.payload).await {
            error!(error = %e, "snapshot install failed");
            resp.result = RpcResult::Failed;
            return resp;
        }
        self.core.resolver.update(&self.core.storage.configs.latest);
        self.core.last_applied = req.last_index;
        if req.last_index > self.core.commit_index {
            self.core.commit_index = req.last_index;
        }
        info!(index = req.last_index, "snapshot installed");
        resp.result = RpcResult::Success;
        resp
    }

    async fn on_timeout_now(&mut self, req: TimeoutNowReq) -> TimeoutNowResp {
        let mut resp = TimeoutNowResp {
            term: self.core.storage.term,
            result: RpcResult::Failed,
        };
        if req.term < self.core.storage.term {
            resp.result = RpcResult::StaleTerm;
            return resp;
        }
        if req.term > self.core.storage.term {
            self.step_down(req.term);
            resp.term = self.core.storage.term;
        }
        let voter = self.core.storage.configs.latest.is_voter(self.core.storage.node_id);
        if voter && !matches!(self.role, RoleState::Leader(_)) {
            info!("timeout-now received, starting election");
            resp.result = RpcResult::Success;
            self.become_candidate().await;
        }
        resp
    }
}

/// A running replica: the public handle.
///
/// Dropping the handle does not stop the node; call
/// [`RaftNode::shutdown`].
pub struct RaftNode {
    task_tx: mpsc::Sender<Task>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl RaftNode {
    /// Start a replica over opened storage: spawns the applier, the RPC
    /// server on `listener`, and the main loop. The storage must carry
    /// an identity.
    pub async fn start(
        options: RaftOptions,
        storage: Storage,
        fsm: Box<dyn Fsm>,
        listener: Box<dyn Listener>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<RaftNode> {
        validate_options(&options)?;
        let (cluster_id, node_id) = storage.identity();
        if cluster_id == 0 || node_id == 0 {
            return Err(RaftError::IdentityNotSet);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let (rpc_tx, rpc_rx) = mpsc::channel(64);
        let (task_tx, task_rx) = mpsc::channel(options.task_channel_capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (fsm_tx, fsm_rx) = mpsc::channel(options.fsm_channel_capacity);

        let resolver = Arc::new(Resolver::new());
        resolver.update(&storage.configs.latest);

        let snap_index = {
            let snaps = storage.snaps.lock().expect("snapshot store lock");
            snaps.index()
        };
        let snap_term = {
            let snaps = storage.snaps.lock().expect("snapshot store lock");
            snaps.term()
        };

        let applier = tokio::spawn(run_applier(
            fsm,
            fsm_rx,
            storage.snaps.clone(),
            event_tx.clone(),
            snap_index,
            snap_term,
        ));

        // rehydrate the state machine from the latest snapshot
        if snap_index > 0 {
            let payload = {
                let snaps = storage.snaps.lock().expect("snapshot store lock");
                snaps.read_payload()?
            };
            let (tx, rx) = oneshot::channel();
            let restore = FsmTask::Restore {
                index: snap_index,
                term: snap_term,
                payload,
                resp: tx,
            };
            fsm_tx
                .send(restore)
                .await
                .map_err(|_| RaftError::ServerClosed)?;
            rx.await.map_err(|_| RaftError::ServerClosed)??;
        }

        let server = tokio::spawn(serve(
            listener,
            rpc_tx,
            shutdown_rx.clone(),
            options.idle_timeout(),
        ));

        let core = Core {
            storage,
            options,
            leader: 0,
            commit_index: snap_index,
            last_applied: snap_index,
            fsm_tx,
            event_tx,
            resolver,
            dialer,
            pools: HashMap::new(),
            shutdown_rx,
            shutdown_tx: shutdown_tx.clone(),
            step_down: false,
            removed: false,
        };
        let role = RoleState::Follower(FollowerShip::new(&core));
        let replica = Replica { core, role, rpc_rx, task_rx, event_rx };
        let main = tokio::spawn(replica.run());

        Ok(RaftNode {
            task_tx,
            shutdown_tx,
            handles: vec![main, server, applier],
        })
    }

    /// Channel for submitting [`Task`]s directly.
    pub fn tasks(&self) -> mpsc::Sender<Task> {
        self.task_tx.clone()
    }

    async fn run_task<T>(&self, task: Task, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.task_tx.send(task).await.map_err(|_| RaftError::ServerClosed)?;
        rx.await.map_err(|_| RaftError::ServerClosed)?
    }

    /// Replicate a command and return the state machine's reply.
    pub async fn apply(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let (task, rx) = Task::apply(data);
        self.run_task(task, rx).await
    }

    /// Linearizable read through the commit pipeline.
    pub async fn read(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let (task, rx) = Task::read(data);
        self.run_task(task, rx).await
    }

    /// Wait until everything submitted before has applied.
    pub async fn barrier(&self) -> Result<()> {
        let (task, rx) = Task::barrier();
        self.run_task(task, rx).await
    }

    /// Propose a configuration change (or bootstrap a fresh cluster).
    pub async fn change_config(&self, new_config: ClusterConfig) -> Result<()> {
        let (task, rx) = Task::change_config(new_config);
        self.run_task(task, rx).await
    }

    /// Wait until the configuration is committed and stable.
    pub async fn wait_for_stable_config(&self) -> Result<ClusterConfig> {
        let (task, rx) = Task::wait_for_stable_config();
        self.run_task(task, rx).await
    }

    /// Snapshot the state machine.
    pub async fn take_snapshot(&self, threshold: u64) -> Result<LogIndex> {
        let (task, rx) = Task::take_snapshot(threshold);
        self.run_task(task, rx).await
    }

    /// Hand leadership to `target`.
    pub async fn transfer_leadership(&self, target: NodeId, timeout: Duration) -> Result<()> {
        let (task, rx) = Task::transfer_leadership(target, timeout);
        self.run_task(task, rx).await
    }

    /// Inspect the replica.
    pub async fn info(&self) -> Result<Info> {
        let (task, rx) = Task::info();
        self.task_tx.send(task).await.map_err(|_| RaftError::ServerClosed)?;
        rx.await.map_err(|_| RaftError::ServerClosed)
    }

    /// Stop the replica and wait for its tasks to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
