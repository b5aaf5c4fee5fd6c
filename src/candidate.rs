//! Candidate role: election fan-out and vote counting.

use raftforge_core::NodeId;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::message::{Request, Response, VoteReq};
use crate::node::{Core, RoleEvent};

/// Candidate-local state.
pub(crate) struct CandShip {
    pub(crate) deadline: Instant,
    pub(crate) votes_needed: usize,
}

impl CandShip {
    pub(crate) fn new() -> Self {
        Self { deadline: Instant::now(), votes_needed: 0 }
    }

    /// Bump the term, vote for self (one disk write), and fan vote
    /// requests out to every other voter. Returns true when the
    /// election is already won, which happens in single-voter clusters.
    pub(crate) fn start_election(&mut self, core: &mut Core) -> bool {
        let nid = core.storage.node_id;
        debug_assert!(
            core.storage.configs.latest.is_voter(nid),
            "nonvoter {nid} became candidate"
        );

        self.votes_needed = core.storage.configs.latest.quorum();
        let term = core.storage.term + 1;
        core.storage.set_voted_for(term, nid);
        self.deadline = Instant::now() + core.election_timeout();

        // self vote counts immediately
        self.votes_needed -= 1;
        info!(term, "election started");

        let req = VoteReq {
            term,
            candidate: nid,
            last_log_index: core.storage.last_log_index,
            last_log_term: core.storage.last_log_term,
        };
        let peers: Vec<NodeId> = core
            .storage
            .configs
            .latest
            .nodes
            .values()
            .filter(|n| n.voter && n.id != nid)
            .map(|n| n.id)
            .collect();
        for peer in peers {
            let pool = core.get_conn_pool(peer);
            let event_tx = core.event_tx.clone();
            let req = req.clone();
            tokio::spawn(async move {
                let resp = match pool.do_rpc(&Request::Vote(req)).await {
                    Ok(Response::Vote(resp)) => Some(resp),
                    Ok(_) | Err(_) => None,
                };
                let _ = event_tx.send(RoleEvent::VoteResult { term, from: peer, resp });
            });
        }

        if self.votes_needed == 0 {
            debug!(term, "election won without peers");
            return true;
        }
        false
    }
}
