//! Leader role: entry ingestion, commit advancement, the leader lease,
//! configuration changes and leadership transfer.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant as StdInstant};

use raftforge_core::{LogIndex, NodeId, RaftError, Result};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::applier::FsmTask;
use crate::entry::{Entry, EntryType};
use crate::membership::{ClusterConfig, ConfigAction};
use crate::node::Core;
use crate::replicate::{run_flr, FlrConfig, LeaderUpdate};
use crate::tasks::{PendingEntry, PendingResp};

const MIN_LEASE_CHECK: Duration = Duration::from_millis(10);

/// An in-flight leadership transfer.
pub(crate) struct Transfer {
    pub(crate) target: NodeId,
    pub(crate) deadline: Instant,
    pub(crate) resp: oneshot::Sender<Result<()>>,
    pub(crate) timeout_now_sent: bool,
}

/// Leader-side view of one peer's replicator.
pub(crate) struct FlrHandle {
    update_tx: watch::Sender<LeaderUpdate>,
    pub(crate) match_index: LogIndex,
    pub(crate) no_contact: Option<StdInstant>,
}

/// Leader-local state.
pub(crate) struct LdrShip {
    /// First index of this leadership's term; points at the noop entry.
    pub(crate) start_index: LogIndex,
    /// Accepted-but-unresolved entries, in index order. Query and
    /// barrier placeholders sit here without being logged.
    pub(crate) new_entries: VecDeque<PendingEntry>,
    /// Replicators, one per peer in the latest configuration.
    pub(crate) flrs: HashMap<NodeId, FlrHandle>,
    /// Tasks waiting for a stable configuration.
    pub(crate) wait_stable: Vec<oneshot::Sender<Result<ClusterConfig>>>,
    /// Armed while some voter is unreachable.
    pub(crate) lease_deadline: Option<Instant>,
    pub(crate) transfer: Option<Transfer>,
}

impl LdrShip {
    /// Enter leadership: spawn replicators and append the term's noop.
    pub(crate) async fn init(core: &mut Core) -> Self {
        core.leader = core.storage.node_id;
        info!(term = core.storage.term, "leadership acquired");

        let mut ldr = Self {
            start_index: core.storage.last_log_index + 1,
            new_entries: VecDeque::new(),
            flrs: HashMap::new(),
            wait_stable: Vec::new(),
            lease_deadline: None,
            transfer: None,
        };

        let peers: Vec<NodeId> = core
            .storage
            .configs
            .latest
            .nodes
            .keys()
            .copied()
            .filter(|id| *id != core.storage.node_id)
            .collect();
        for peer in peers {
            ldr.add_flr(core, peer);
        }

        ldr.store_entry(core, EntryType::Noop, Vec::new(), PendingResp::None).await;
        ldr
    }

    /// Leave leadership: stop replicators and fail everything pending.
    ///
    /// `new_term` marks a stepdown caused by observing a higher term, in
    /// which case an in-flight transfer is considered successful.
    pub(crate) fn release(&mut self, core: &mut Core, closing: bool, new_term: bool) {
        self.flrs.clear(); // dropping the senders stops the tasks

        let make_err = |core: &Core| -> RaftError {
            if closing {
                RaftError::ServerClosed
            } else {
                RaftError::not_leader(core.leader_hint(), true)
            }
        };
        for pending in self.new_entries.drain(..) {
            pending.resp.reply_err(make_err(core));
        }
        for tx in self.wait_stable.drain(..) {
            let _ = tx.send(Err(make_err(core)));
        }
        if let Some(transfer) = self.transfer.take() {
            let reply = if new_term && !closing {
                Ok(())
            } else {
                Err(make_err(core))
            };
            let _ = transfer.resp.send(reply);
        }
        debug!(term = core.storage.term, "leadership released");
    }

    /// Earliest deadline the main loop must wake for.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match (self.lease_deadline, self.transfer.as_ref().map(|t| t.deadline)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    pub(crate) async fn on_timeout(&mut self, core: &mut Core) {
        let now = Instant::now();
        if self.transfer.as_ref().map(|t| now >= t.deadline).unwrap_or(false) {
            let transfer = self.transfer.take().expect("transfer present");
            warn!(to = transfer.target, "leadership transfer timed out");
            let _ = transfer.resp.send(Err(RaftError::LeadershipTransferTimeout));
        }
        if self.lease_deadline.map(|d| now >= d).unwrap_or(false) {
            self.lease_deadline = None;
            self.check_leader_lease(core);
        }
    }

    fn add_flr(&mut self, core: &mut Core, peer: NodeId) {
        let initial = LeaderUpdate {
            last_index: core.storage.last_log_index,
            commit_index: core.commit_index,
        };
        let (update_tx, update_rx) = watch::channel(initial);
        let flr = FlrConfig {
            peer,
            leader: core.storage.node_id,
            term: core.storage.term,
            pool: core.get_conn_pool(peer),
            log: core.storage.log.clone(),
            snaps: core.storage.snaps.clone(),
            hb_timeout: core.options.heartbeat_timeout(),
            max_batch: core.options.max_append_entries,
            event_tx: core.event_tx.clone(),
            update_rx,
        };
        tokio::spawn(run_flr(flr));
        self.flrs.insert(peer, FlrHandle { update_tx, match_index: 0, no_contact: None });
    }

    /// Ingest one user-facing entry. Query and barrier placeholders are
    /// ordered in the queue without touching the log.
    pub(crate) async fn store_entry(
        &mut self,
        core: &mut Core,
        typ: EntryType,
        data: Vec<u8>,
        resp: PendingResp,
    ) {
        let index = core.storage.last_log_index + 1;
        let term = core.storage.term;

        if !typ.is_persisted() {
            self.new_entries.push_back(PendingEntry { index, typ, data, resp });
            self.apply_committed(core).await;
            return;
        }

        core.storage.append_entry(Entry { index, term, typ, data }).await;
        core.storage.sync_log().await;
        self.new_entries.push_back(PendingEntry { index, typ, data: Vec::new(), resp });
        self.on_local_append(core).await;
    }

    /// Append a configuration entry, making it the latest config at
    /// once (configs advance on append, not on commit).
    async fn append_config(
        &mut self,
        core: &mut Core,
        mut config: ClusterConfig,
        resp: PendingResp,
    ) {
        let index = core.storage.last_log_index + 1;
        config.index = index;
        config.term = core.storage.term;
        core.storage.append_entry(config.to_entry()).await;
        core.storage.sync_log().await;
        core.change_config(config);
        self.on_membership_change(core);
        self.new_entries.push_back(PendingEntry {
            index,
            typ: EntryType::Config,
            data: Vec::new(),
            resp,
        });
        Box::pin(self.on_local_append(core)).await;
    }

    /// Reconcile replicators with the latest configuration.
    fn on_membership_change(&mut self, core: &mut Core) {
        let latest = core.storage.configs.latest.clone();
        self.flrs.retain(|id, _| latest.nodes.contains_key(id));
        for id in latest.nodes.keys().copied().collect::<Vec<_>>() {
            if id != core.storage.node_id && !self.flrs.contains_key(&id) {
                self.add_flr(core, id);
            }
        }
    }

    async fn on_local_append(&mut self, core: &mut Core) {
        self.notify_replicators(core);
        self.on_majority_commit(core).await;
    }

    fn notify_replicators(&self, core: &Core) {
        let update = LeaderUpdate {
            last_index: core.storage.last_log_index,
            commit_index: core.commit_index,
        };
        for flr in self.flrs.values() {
            flr.update_tx.send_replace(update);
        }
    }

    /// A replicator reported progress.
    pub(crate) async fn on_match(&mut self, core: &mut Core, from: NodeId, match_index: LogIndex) {
        if let Some(flr) = self.flrs.get_mut(&from) {
            if match_index > flr.match_index {
                flr.match_index = match_index;
            }
        }

        if let Some(transfer) = self.transfer.as_mut() {
            if !transfer.timeout_now_sent
                && transfer.target == from
                && match_index >= core.storage.last_log_index
            {
                transfer.timeout_now_sent = true;
                let target = transfer.target;
                core.send_timeout_now(target);
            }
        }

        self.on_majority_commit(core).await;
        self.check_actions(core).await;
    }

    /// A replicator reported a reachability change.
    pub(crate) fn on_contact_change(
        &mut self,
        core: &mut Core,
        from: NodeId,
        since: Option<StdInstant>,
    ) {
        if let Some(flr) = self.flrs.get_mut(&from) {
            flr.no_contact = since;
        }
        if since.is_some() {
            debug!(peer = from, "peer unreachable");
            self.check_leader_lease(core);
        }
    }

    /// N such that a quorum of voters matches at least N.
    fn majority_match_index(&self, core: &Core) -> LogIndex {
        let latest = &core.storage.configs.latest;
        let nid = core.storage.node_id;
        let mut matched: Vec<LogIndex> = latest
            .nodes
            .values()
            .filter(|n| n.voter)
            .map(|n| {
                if n.id == nid {
                    core.storage.last_log_index
                } else {
                    self.flrs.get(&n.id).map(|f| f.match_index).unwrap_or(0)
                }
            })
            .collect();
        if matched.is_empty() {
            return 0;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        matched[latest.quorum() - 1]
    }

    /// Advance the commit index when a majority has replicated past it.
    /// `start_index` guards the Raft commit rule: only entries of the
    /// current term are counted directly.
    pub(crate) async fn on_majority_commit(&mut self, core: &mut Core) {
        let majority = self.majority_match_index(core);
        if majority > core.commit_index && majority >= self.start_index {
            let config_committed = core.set_commit_index(majority);
            if config_committed {
                self.on_config_committed(core).await;
            }
            self.apply_committed(core).await;
            self.notify_replicators(core);
        }
    }

    async fn on_config_committed(&mut self, core: &mut Core) {
        self.check_actions(core).await;
        if core.storage.configs.is_stable() {
            for tx in self.wait_stable.drain(..) {
                let _ = tx.send(Ok(core.storage.configs.latest.clone()));
            }
        }
    }

    /// Drive pending promote/demote/remove actions, one derived config
    /// change at a time. Each change requires the previous one to be
    /// committed.
    pub(crate) async fn check_actions(&mut self, core: &mut Core) {
        if !core.storage.configs.is_committed() {
            return;
        }
        let latest = core.storage.configs.latest.clone();
        let mut ids: Vec<NodeId> = latest.nodes.keys().copied().collect();
        ids.sort_unstable();

        let mut next: Option<ClusterConfig> = None;
        for id in ids {
            let node = &latest.nodes[&id];
            if node.wants_demote() {
                let mut config = latest.clone();
                let n = config.nodes.get_mut(&id).expect("node present");
                n.voter = false;
                if n.action == ConfigAction::Demote {
                    n.action = ConfigAction::None;
                }
                info!(node = id, "demoting");
                next = Some(config);
                break;
            }
            if node.wants_remove() {
                let mut config = latest.clone();
                config.nodes.remove(&id);
                info!(node = id, "removing");
                next = Some(config);
                break;
            }
            if node.wants_promote() {
                let caught_up = self
                    .flrs
                    .get(&id)
                    .map(|f| f.match_index >= core.commit_index)
                    .unwrap_or(false);
                if caught_up {
                    let mut config = latest.clone();
                    let n = config.nodes.get_mut(&id).expect("node present");
                    n.voter = true;
                    n.action = ConfigAction::None;
                    info!(node = id, "promoting");
                    next = Some(config);
                    break;
                }
            }
        }

        if let Some(config) = next {
            if let Err(e) = config.validate() {
                warn!(error = %e, "derived config change skipped");
                return;
            }
            self.append_config(core, config, PendingResp::None).await;
        }
    }

    /// Step down when recent contact with a quorum of voters is lost;
    /// otherwise re-arm the lease timer against the earliest failure.
    pub(crate) fn check_leader_lease(&mut self, core: &mut Core) {
        let now = StdInstant::now();
        let lease = core.options.lease_timeout();
        let nid = core.storage.node_id;

        let mut voters = 0usize;
        let mut reachable = 0usize;
        let mut earliest: Option<StdInstant> = None;
        for node in core.storage.configs.latest.nodes.values() {
            if !node.voter {
                continue;
            }
            voters += 1;
            if node.id == nid {
                reachable += 1;
                continue;
            }
            match self.flrs.get(&node.id).and_then(|f| f.no_contact) {
                None => reachable += 1,
                Some(since) => {
                    if now.duration_since(since) <= lease {
                        reachable += 1;
                        earliest = Some(earliest.map_or(since, |e| e.min(since)));
                    }
                }
            }
        }

        if reachable < voters / 2 + 1 {
            warn!(reachable, voters, "quorum unreachable, stepping down");
            core.step_down = true;
            return;
        }

        self.lease_deadline = earliest.map(|since| {
            let remaining = lease
                .checked_sub(now.duration_since(since))
                .unwrap_or_default()
                .max(MIN_LEASE_CHECK);
            Instant::now() + remaining
        });
    }

    /// Hand committed entries to the applier, serving query and barrier
    /// placeholders as soon as everything before them has applied.
    pub(crate) async fn apply_committed(&mut self, core: &mut Core) {
        loop {
            while let Some(front) = self.new_entries.front() {
                if front.typ.is_persisted() || front.index != core.last_applied + 1 {
                    break;
                }
                let pending = self.new_entries.pop_front().expect("front present");
                let task = match (pending.typ, pending.resp) {
                    (EntryType::Query, PendingResp::Bytes(tx)) => {
                        FsmTask::Read { data: pending.data, resp: tx }
                    }
                    (EntryType::Barrier, PendingResp::Unit(tx)) => FsmTask::Barrier { resp: tx },
                    _ => continue,
                };
                if !core.send_fsm(task).await {
                    return;
                }
            }

            if core.last_applied + 1 > core.commit_index {
                return;
            }
            let next = core.last_applied + 1;

            let pending = if self
                .new_entries
                .front()
                .map(|p| p.typ.is_persisted() && p.index == next)
                .unwrap_or(false)
            {
                self.new_entries.pop_front()
            } else {
                None
            };

            let entry = match core.storage.get_entry(next).await {
                Ok(entry) => entry,
                Err(e) => panic!("committed entry {next} unavailable: {e}"),
            };

            match entry.typ {
                EntryType::User => {
                    let resp = match pending.map(|p| p.resp) {
                        Some(PendingResp::Bytes(tx)) => Some(tx),
                        _ => None,
                    };
                    let task = FsmTask::Apply {
                        index: entry.index,
                        term: entry.term,
                        data: entry.data,
                        resp,
                    };
                    if !core.send_fsm(task).await {
                        return;
                    }
                }
                EntryType::Config => {
                    if let Some(PendingResp::Unit(tx)) = pending.map(|p| p.resp) {
                        let _ = tx.send(Ok(()));
                    }
                }
                _ => {
                    if let Some(p) = pending {
                        p.resp.reply_err(RaftError::ServerClosed);
                    }
                }
            }
            core.last_applied = next;
        }
    }

    // ---- task handlers ------------------------------------------------

    pub(crate) async fn on_apply(
        &mut self,
        core: &mut Core,
        data: Vec<u8>,
        resp: oneshot::Sender<Result<Vec<u8>>>,
    ) {
        if self.transfer.is_some() {
            let _ = resp.send(Err(RaftError::LeadershipTransferInProgress));
            return;
        }
        self.store_entry(core, EntryType::User, data, PendingResp::Bytes(resp)).await;
    }

    pub(crate) async fn on_read(
        &mut self,
        core: &mut Core,
        data: Vec<u8>,
        resp: oneshot::Sender<Result<Vec<u8>>>,
    ) {
        self.store_entry(core, EntryType::Query, data, PendingResp::Bytes(resp)).await;
    }

    pub(crate) async fn on_barrier(&mut self, core: &mut Core, resp: oneshot::Sender<Result<()>>) {
        self.store_entry(core, EntryType::Barrier, Vec::new(), PendingResp::Unit(resp)).await;
    }

    pub(crate) async fn on_change_config(
        &mut self,
        core: &mut Core,
        new_config: ClusterConfig,
        resp: oneshot::Sender<Result<()>>,
    ) {
        if !core.storage.configs.is_committed() {
            let _ = resp.send(Err(RaftError::InProgress("configChange")));
            return;
        }
        if core.commit_index < self.start_index {
            let _ = resp.send(Err(RaftError::NotCommitReady));
            return;
        }
        let latest = &core.storage.configs.latest;
        if new_config.index != latest.index {
            let _ = resp.send(Err(RaftError::ConfigChanged));
            return;
        }
        if let Err(e) = new_config.validate() {
            let _ = resp.send(Err(e));
            return;
        }
        for (id, node) in &latest.nodes {
            match new_config.nodes.get(id) {
                None => {
                    let _ = resp.send(Err(RaftError::InvalidConfig(format!(
                        "node {id} cannot be removed directly, use the Remove action"
                    ))));
                    return;
                }
                Some(new_node) if new_node.voter != node.voter => {
                    let _ = resp.send(Err(RaftError::InvalidConfig(format!(
                        "voting right of node {id} cannot change directly"
                    ))));
                    return;
                }
                Some(_) => {}
            }
        }
        for (id, node) in &new_config.nodes {
            if !latest.nodes.contains_key(id) && node.voter {
                let _ = resp.send(Err(RaftError::InvalidConfig(format!(
                    "new node {id} must join as nonvoter"
                ))));
                return;
            }
        }
        let keeps_stable_voter = new_config
            .nodes
            .values()
            .any(|n| n.voter && n.action == ConfigAction::None);
        if !keeps_stable_voter {
            let _ = resp.send(Err(RaftError::InvalidConfig(
                "at least one stable voter must remain".into(),
            )));
            return;
        }

        self.append_config(core, new_config, PendingResp::Unit(resp)).await;
    }

    pub(crate) fn on_wait_stable(
        &mut self,
        core: &Core,
        resp: oneshot::Sender<Result<ClusterConfig>>,
    ) {
        if core.storage.configs.is_stable() {
            let _ = resp.send(Ok(core.storage.configs.latest.clone()));
        } else {
            self.wait_stable.push(resp);
        }
    }

    pub(crate) fn on_transfer_leadership(
        &mut self,
        core: &mut Core,
        target: NodeId,
        timeout: Duration,
        resp: oneshot::Sender<Result<()>>,
    ) {
        if self.transfer.is_some() {
            let _ = resp.send(Err(RaftError::LeadershipTransferInProgress));
            return;
        }
        if target == core.storage.node_id {
            let _ = resp.send(Err(RaftError::InvalidConfig(
                "cannot transfer leadership to self".into(),
            )));
            return;
        }
        let eligible = core
            .storage
            .configs
            .latest
            .nodes
            .get(&target)
            .map(|n| n.voter)
            .unwrap_or(false);
        if !eligible {
            let _ = resp.send(Err(RaftError::InvalidConfig(format!(
                "node {target} is not a voter"
            ))));
            return;
        }

        info!(to = target, "leadership transfer started");
        let caught_up = self
            .flrs
            .get(&target)
            .map(|f| f.match_index >= core.storage.last_log_index)
            .unwrap_or(false);
        self.transfer = Some(Transfer {
            target,
            deadline: Instant::now() + timeout,
            resp,
            timeout_now_sent: caught_up,
        });
        if caught_up {
            core.send_timeout_now(target);
        }
    }
}
