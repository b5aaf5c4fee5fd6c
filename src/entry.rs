//! Log entries and their binary encoding.

use std::io;

use raftforge_core::{LogIndex, Term};
use serde::{Deserialize, Serialize};

use crate::wire::{corrupt, put_u32, put_u64, put_u8, Reader};

/// Kind of a log entry.
///
/// `Query` and `Barrier` are never persisted: they flow through the
/// leader's commit pipeline only, to serialize reads and fences against
/// the applied log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Empty entry appended by a new leader to carry its term's commit
    /// forward.
    Noop,
    /// User command, applied to the state machine.
    User,
    /// Unpersisted read-only placeholder.
    Query,
    /// Unpersisted fence that completes when all prior entries applied.
    Barrier,
    /// Cluster membership change.
    Config,
    /// Reserved discriminant, kept for wire compatibility.
    Dummy,
}

impl EntryType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            EntryType::Noop => 0,
            EntryType::User => 1,
            EntryType::Query => 2,
            EntryType::Barrier => 3,
            EntryType::Config => 4,
            EntryType::Dummy => 5,
        }
    }

    pub(crate) fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            0 => Ok(EntryType::Noop),
            1 => Ok(EntryType::User),
            2 => Ok(EntryType::Query),
            3 => Ok(EntryType::Barrier),
            4 => Ok(EntryType::Config),
            5 => Ok(EntryType::Dummy),
            _ => Err(corrupt("unknown entry type")),
        }
    }

    /// Whether entries of this type are written to the durable log.
    pub fn is_persisted(self) -> bool {
        !matches!(self, EntryType::Query | EntryType::Barrier)
    }
}

/// A single entry of the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Log position, strictly monotonic from 1.
    pub index: LogIndex,
    /// Term in which the entry was created by a leader.
    pub term: Term,
    /// Entry kind.
    pub typ: EntryType,
    /// Opaque payload. Empty for `Noop`.
    pub data: Vec<u8>,
}

impl Entry {
    /// Create a no-op entry.
    pub fn noop(index: LogIndex, term: Term) -> Self {
        Self { index, term, typ: EntryType::Noop, data: Vec::new() }
    }

    /// Create a user command entry.
    pub fn user(index: LogIndex, term: Term, data: Vec<u8>) -> Self {
        Self { index, term, typ: EntryType::User, data }
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.index);
        put_u64(buf, self.term);
        put_u8(buf, self.typ.to_u8());
        put_u32(buf, self.data.len() as u32);
        buf.extend_from_slice(&self.data);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> io::Result<Self> {
        let index = r.u64()?;
        let term = r.u64()?;
        let typ = EntryType::from_u8(r.u8()?)?;
        let len = r.u32()? as usize;
        let data = r.raw(len)?.to_vec();
        Ok(Self { index, term, typ, data })
    }

    /// Serialize to a standalone buffer, for the durable log.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(21 + self.data.len());
        self.encode(&mut buf);
        buf
    }

    /// Deserialize from a standalone buffer written by [`Entry::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        let mut r = Reader::new(buf);
        let e = Self::decode(&mut r)?;
        r.finish()?;
        Ok(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip_all_types() {
        let entries = [
            Entry::noop(1, 1),
            Entry::user(2, 1, b"set x=1".to_vec()),
            Entry { index: 3, term: 2, typ: EntryType::Query, data: b"get x".to_vec() },
            Entry { index: 4, term: 2, typ: EntryType::Barrier, data: Vec::new() },
            Entry { index: 5, term: 3, typ: EntryType::Config, data: vec![0, 0, 0, 0] },
            Entry { index: 6, term: 3, typ: EntryType::Dummy, data: vec![1, 2, 3] },
        ];
        for entry in entries {
            let bytes = entry.to_bytes();
            let back = Entry::from_bytes(&bytes).unwrap();
            assert_eq!(back, entry);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = Vec::new();
        put_u64(&mut buf, 1);
        put_u64(&mut buf, 1);
        put_u8(&mut buf, 99);
        put_u32(&mut buf, 0);
        assert!(Entry::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_persistence_rules() {
        assert!(EntryType::Noop.is_persisted());
        assert!(EntryType::User.is_persisted());
        assert!(EntryType::Config.is_persisted());
        assert!(!EntryType::Query.is_persisted());
        assert!(!EntryType::Barrier.is_persisted());
    }
}
