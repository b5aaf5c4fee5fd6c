//! Per-peer replication task.
//!
//! The leader runs one replicator per peer. The task walks `next_index`
//! back until the logs agree, then streams batches of up to the
//! configured maximum, falling back to snapshot installation when the
//! needed prefix has been compacted away. Progress and reachability are
//! published to the leader through the role event channel; the leader
//! pushes `(last_index, commit_index)` updates through a single-slot
//! overwrite mailbox.

use std::sync::Arc;
use std::time::{Duration, Instant};

use raftforge_core::{LogIndex, NodeId, Term};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::message::{AppendReq, InstallSnapshotReq, Request, Response, RpcResult};
use crate::node::RoleEvent;
use crate::storage::{SharedLog, SharedSnapshots};
use crate::transport::{backoff, ConnPool};

/// Leader state pushed to replicators. Sending replaces any unread
/// value, so a replicator always acts on the newest view.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct LeaderUpdate {
    pub(crate) last_index: LogIndex,
    pub(crate) commit_index: LogIndex,
}

/// Everything a replicator needs, fixed for the life of one leadership.
pub(crate) struct FlrConfig {
    pub(crate) peer: NodeId,
    pub(crate) leader: NodeId,
    pub(crate) term: Term,
    pub(crate) pool: Arc<ConnPool>,
    pub(crate) log: SharedLog,
    pub(crate) snaps: SharedSnapshots,
    pub(crate) hb_timeout: Duration,
    pub(crate) max_batch: usize,
    pub(crate) event_tx: mpsc::UnboundedSender<RoleEvent>,
    pub(crate) update_rx: watch::Receiver<LeaderUpdate>,
}

enum Prepared {
    Append { prev_term: Term, entries: Vec<crate::entry::Entry> },
    Snapshot,
}

pub(crate) async fn run_flr(mut cfg: FlrConfig) {
    let mut last = *cfg.update_rx.borrow_and_update();
    let mut next_index = last.last_index + 1;
    let mut match_index: LogIndex = 0;
    let mut match_known = false;
    let mut sent_commit: LogIndex = 0;
    let mut round: u64 = 0;
    let mut contact_lost = false;

    debug!(peer = cfg.peer, term = cfg.term, "replicator started");

    loop {
        last = *cfg.update_rx.borrow_and_update();

        let prepared = prepare(&cfg, next_index, last.last_index).await;

        match prepared {
            Prepared::Snapshot => {
                match send_snapshot(&cfg).await {
                    SnapshotOutcome::Installed(index) => {
                        note_contact(&cfg, &mut contact_lost, &mut round);
                        if index > match_index {
                            match_index = index;
                            publish_match(&cfg, match_index);
                        }
                        match_known = true;
                        next_index = index + 1;
                    }
                    SnapshotOutcome::NewTerm(observed) => {
                        let _ = cfg.event_tx.send(RoleEvent::NewTerm {
                            term: cfg.term,
                            observed,
                        });
                        return;
                    }
                    SnapshotOutcome::Unavailable => {
                        // compacted prefix but no snapshot on disk yet;
                        // wait for the next update
                        if sleep_or_stop(&mut cfg.update_rx, backoff(round)).await {
                            return;
                        }
                    }
                    SnapshotOutcome::Error => {
                        note_no_contact(&cfg, &mut contact_lost);
                        round += 1;
                        if sleep_or_stop(&mut cfg.update_rx, backoff(round)).await {
                            return;
                        }
                    }
                }
                continue;
            }
            Prepared::Append { prev_term, entries } => {
                let prev = next_index - 1;
                let batch_len = entries.len() as u64;
                let leader_commit = if match_known {
                    last.commit_index.min(match_index + batch_len)
                } else {
                    0
                };
                let req = Request::Append(AppendReq {
                    term: cfg.term,
                    leader: cfg.leader,
                    prev_log_index: prev,
                    prev_log_term: prev_term,
                    ldr_commit_index: leader_commit,
                    entries,
                });

                let resp = match cfg.pool.do_rpc(&req).await {
                    Ok(Response::Append(resp)) => resp,
                    Ok(_) => {
                        warn!(peer = cfg.peer, "peer answered with a mismatched response type");
                        return;
                    }
                    Err(e) => {
                        trace!(peer = cfg.peer, error = %e, "append rpc failed");
                        note_no_contact(&cfg, &mut contact_lost);
                        round += 1;
                        if sleep_or_stop(&mut cfg.update_rx, backoff(round)).await {
                            return;
                        }
                        continue;
                    }
                };

                note_contact(&cfg, &mut contact_lost, &mut round);

                if resp.term > cfg.term {
                    let _ = cfg.event_tx.send(RoleEvent::NewTerm {
                        term: cfg.term,
                        observed: resp.term,
                    });
                    return;
                }

                match resp.result {
                    RpcResult::Success => {
                        let replicated = prev + batch_len;
                        match_known = true;
                        if replicated > match_index {
                            match_index = replicated;
                            publish_match(&cfg, match_index);
                        }
                        next_index = match_index + 1;
                        sent_commit = leader_commit;
                    }
                    RpcResult::StaleTerm => {
                        let _ = cfg.event_tx.send(RoleEvent::NewTerm {
                            term: cfg.term,
                            observed: resp.term,
                        });
                        return;
                    }
                    _ => {
                        // log mismatch: jump with the peer's hint when it is
                        // behind, otherwise walk back one entry
                        if resp.last_log_index < prev {
                            next_index = resp.last_log_index + 1;
                        } else if next_index > 1 {
                            next_index -= 1;
                        }
                        trace!(peer = cfg.peer, next_index, "log mismatch, walking back");
                        continue;
                    }
                }
            }
        }

        // idle once the peer is caught up and told about the commit index
        let caught_up = match_known && match_index >= last.last_index;
        let commit_done = sent_commit >= last.commit_index.min(match_index);
        if caught_up && commit_done {
            let heartbeat_in = rand_jitter(cfg.hb_timeout / 10);
            tokio::select! {
                changed = cfg.update_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(heartbeat_in) => {}
            }
        }
    }
}

/// Decide what to send for `next_index`, holding the log's reader guard
/// for the whole fill so compaction cannot race it.
async fn prepare(cfg: &FlrConfig, next_index: LogIndex, last_index: LogIndex) -> Prepared {
    let log = cfg.log.read().await;
    let prev = next_index - 1;

    if prev < log.prev_index() {
        return Prepared::Snapshot;
    }

    let prev_term = if prev == 0 {
        0
    } else if prev == log.prev_index() {
        let snaps = cfg.snaps.lock().expect("snapshot store lock");
        if snaps.index() == prev {
            snaps.term()
        } else {
            return Prepared::Snapshot;
        }
    } else {
        match log.get(prev) {
            Ok(entry) => entry.term,
            Err(_) => return Prepared::Snapshot,
        }
    };

    let mut entries = Vec::new();
    let upto = last_index.min(prev + cfg.max_batch as u64);
    let mut index = next_index;
    while index <= upto {
        match log.get(index) {
            Ok(entry) => entries.push(entry),
            Err(_) => return Prepared::Snapshot,
        }
        index += 1;
    }
    Prepared::Append { prev_term, entries }
}

enum SnapshotOutcome {
    Installed(LogIndex),
    NewTerm(Term),
    Unavailable,
    Error,
}

async fn send_snapshot(cfg: &FlrConfig) -> SnapshotOutcome {
    let (meta, payload) = {
        let snaps = cfg.snaps.lock().expect("snapshot store lock");
        let Some(meta) = snaps.meta().cloned() else {
            return SnapshotOutcome::Unavailable;
        };
        match snaps.read_payload() {
            Ok(payload) => (meta, payload),
            Err(_) => return SnapshotOutcome::Unavailable,
        }
    };

    debug!(peer = cfg.peer, index = meta.index, "sending snapshot");
    let req = Request::InstallSnapshot(InstallSnapshotReq {
        term: cfg.term,
        leader: cfg.leader,
        last_index: meta.index,
        last_term: meta.term,
        config: meta.config.clone(),
        payload,
    });

    match cfg.pool.do_rpc(&req).await {
        Ok(Response::InstallSnapshot(resp)) => {
            if resp.term > cfg.term {
                SnapshotOutcome::NewTerm(resp.term)
            } else if resp.result == RpcResult::Success {
                SnapshotOutcome::Installed(meta.index)
            } else {
                SnapshotOutcome::Error
            }
        }
        Ok(_) => SnapshotOutcome::Error,
        Err(_) => SnapshotOutcome::Error,
    }
}

fn publish_match(cfg: &FlrConfig, match_index: LogIndex) {
    let _ = cfg.event_tx.send(RoleEvent::Match {
        term: cfg.term,
        from: cfg.peer,
        match_index,
    });
}

fn note_no_contact(cfg: &FlrConfig, contact_lost: &mut bool) {
    if !*contact_lost {
        *contact_lost = true;
        let _ = cfg.event_tx.send(RoleEvent::NoContact {
            term: cfg.term,
            from: cfg.peer,
            since: Some(Instant::now()),
        });
    }
}

fn note_contact(cfg: &FlrConfig, contact_lost: &mut bool, round: &mut u64) {
    *round = 0;
    if *contact_lost {
        *contact_lost = false;
        let _ = cfg.event_tx.send(RoleEvent::NoContact {
            term: cfg.term,
            from: cfg.peer,
            since: None,
        });
    }
}

/// Sleep for `wait`, returning true when the leader dropped the update
/// channel and the replicator must stop.
async fn sleep_or_stop(update_rx: &mut watch::Receiver<LeaderUpdate>, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            changed = update_rx.changed() => {
                if changed.is_err() {
                    return true;
                }
            }
        }
    }
}

/// Random duration in `[base, 2*base)`.
pub(crate) fn rand_jitter(base: Duration) -> Duration {
    let millis = base.as_millis().max(1) as u64;
    base + Duration::from_millis(rand::random::<u64>() % millis)
}
