//! Follower role.

use tokio::time::Instant;

use crate::node::Core;

/// Follower-local state: just the randomized election deadline.
///
/// The deadline resets on every AppendEntries from the leader and on
/// every granted vote. When it fires and this node is a voter in the
/// latest configuration, the replica becomes a candidate; nonvoters
/// re-arm and stay passive.
pub(crate) struct FollowerShip {
    pub(crate) deadline: Instant,
}

impl FollowerShip {
    pub(crate) fn new(core: &Core) -> Self {
        Self { deadline: Instant::now() + core.election_timeout() }
    }

    pub(crate) fn reset_timer(&mut self, core: &Core) {
        self.deadline = Instant::now() + core.election_timeout();
    }
}
