//! State machine contract.

use std::io;

/// The user state machine driven by the replicated log.
///
/// The applier task owns the state machine and invokes `apply` with
/// strictly increasing entry indices, each exactly once per replica.
/// `read` serves query placeholders after every prior entry has been
/// applied; it must not mutate state.
pub trait Fsm: Send + 'static {
    /// Apply a committed user command and return its response.
    fn apply(&mut self, data: &[u8]) -> Vec<u8>;

    /// Serve a read-only query against current state.
    fn read(&self, data: &[u8]) -> Vec<u8>;

    /// Write a point-in-time snapshot of the state into `sink`.
    fn snapshot(&self, sink: &mut dyn io::Write) -> io::Result<()>;

    /// Replace the state with a snapshot previously written by
    /// [`Fsm::snapshot`].
    fn restore(&mut self, source: &mut dyn io::Read) -> io::Result<()>;
}
