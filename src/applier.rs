//! Applier pipeline.
//!
//! One task owns the state machine and consumes a bounded in-order
//! channel. Committed user entries are applied in strict index order;
//! query and barrier placeholders are served between entries once
//! everything before them has applied; snapshot take/restore requests
//! ride the same channel so they observe a settled state machine.

use raftforge_core::{LogIndex, RaftError, Result, Term};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::fsm::Fsm;
use crate::membership::ClusterConfig;
use crate::node::RoleEvent;
use crate::storage::SharedSnapshots;

/// Work item for the applier task.
pub(crate) enum FsmTask {
    /// Apply a committed user entry.
    Apply {
        index: LogIndex,
        term: Term,
        data: Vec<u8>,
        resp: Option<oneshot::Sender<Result<Vec<u8>>>>,
    },
    /// Serve a read-only query.
    Read {
        data: Vec<u8>,
        resp: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// Acknowledge that everything before this point has applied.
    Barrier {
        resp: oneshot::Sender<Result<()>>,
    },
    /// Snapshot the state machine if enough entries applied since the
    /// last snapshot.
    TakeSnapshot {
        threshold: u64,
        config: ClusterConfig,
        resp: oneshot::Sender<Result<LogIndex>>,
    },
    /// Replace the state machine from snapshot bytes.
    Restore {
        index: LogIndex,
        term: Term,
        payload: Vec<u8>,
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Drive the state machine until the channel closes.
pub(crate) async fn run_applier(
    mut fsm: Box<dyn Fsm>,
    mut rx: mpsc::Receiver<FsmTask>,
    snaps: SharedSnapshots,
    event_tx: mpsc::UnboundedSender<RoleEvent>,
    mut applied_index: LogIndex,
    mut applied_term: Term,
) {
    while let Some(task) = rx.recv().await {
        match task {
            FsmTask::Apply { index, term, data, resp } => {
                // indices are strictly increasing but not contiguous:
                // noop and config entries never reach the state machine
                debug_assert!(index > applied_index, "fsm applies must be in order");
                let out = fsm.apply(&data);
                applied_index = index;
                applied_term = term;
                if let Some(resp) = resp {
                    let _ = resp.send(Ok(out));
                }
            }
            FsmTask::Read { data, resp } => {
                let _ = resp.send(Ok(fsm.read(&data)));
            }
            FsmTask::Barrier { resp } => {
                let _ = resp.send(Ok(()));
            }
            FsmTask::TakeSnapshot { threshold, config, resp } => {
                let result = take_snapshot(
                    fsm.as_ref(),
                    &snaps,
                    threshold,
                    config,
                    applied_index,
                    applied_term,
                );
                if let Ok(index) = result {
                    let _ = event_tx.send(RoleEvent::SnapshotTaken { index });
                }
                let _ = resp.send(result);
            }
            FsmTask::Restore { index, term, payload, resp } => {
                let mut source: &[u8] = &payload;
                match fsm.restore(&mut source) {
                    Ok(()) => {
                        applied_index = index;
                        applied_term = term;
                        debug!(index, "state machine restored from snapshot");
                        let _ = resp.send(Ok(()));
                    }
                    Err(e) => {
                        error!(error = %e, "state machine restore failed");
                        let _ = resp.send(Err(e.into()));
                    }
                }
            }
        }
    }
}

fn take_snapshot(
    fsm: &dyn Fsm,
    snaps: &SharedSnapshots,
    threshold: u64,
    config: ClusterConfig,
    applied_index: LogIndex,
    applied_term: Term,
) -> Result<LogIndex> {
    let snap_index = snaps.lock().expect("snapshot store lock").index();
    if applied_index < snap_index || applied_index - snap_index < threshold.max(1) {
        return Err(RaftError::SnapshotThreshold);
    }

    let mut sink = snaps
        .lock()
        .expect("snapshot store lock")
        .new_sink(applied_index, applied_term, config)?;
    if let Err(e) = fsm.snapshot(&mut sink) {
        sink.abandon();
        return Err(e.into());
    }
    let meta = sink.finish()?;
    snaps.lock().expect("snapshot store lock").commit(meta)?;
    debug!(index = applied_index, "snapshot taken");
    Ok(applied_index)
}
