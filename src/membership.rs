//! Cluster membership model.
//!
//! A [`ClusterConfig`] is the set of nodes forming the cluster at a log
//! position. Membership changes are single-step: the leader drives
//! promotion, demotion and removal through per-node [`ConfigAction`]s,
//! each step appended as its own config entry. [`Configs`] tracks the
//! latest appended config alongside the last committed one.

use std::collections::HashMap;
use std::io;

use raftforge_core::{LogIndex, NodeId, RaftError, Result, Term};
use serde::{Deserialize, Serialize};

use crate::entry::{Entry, EntryType};
use crate::wire::{corrupt, put_bool, put_string, put_u32, put_u64, put_u8, Reader};

/// Pending membership action on a node, driven by the leader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigAction {
    /// No pending action; the node is stable.
    #[default]
    None,
    /// Grant voting rights once the node has caught up.
    Promote,
    /// Revoke voting rights.
    Demote,
    /// Demote if needed, then drop the node from the cluster.
    Remove,
}

impl ConfigAction {
    fn to_u8(self) -> u8 {
        match self {
            ConfigAction::None => 0,
            ConfigAction::Promote => 1,
            ConfigAction::Demote => 2,
            ConfigAction::Remove => 3,
        }
    }

    fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            0 => Ok(ConfigAction::None),
            1 => Ok(ConfigAction::Promote),
            2 => Ok(ConfigAction::Demote),
            3 => Ok(ConfigAction::Remove),
            _ => Err(corrupt("unknown config action")),
        }
    }
}

/// A single node in the cluster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Nonzero node identifier.
    pub id: NodeId,
    /// `host:port` address other nodes use to reach this node.
    pub addr: String,
    /// Voters participate in elections and commit advancement.
    pub voter: bool,
    /// Pending action the leader should take on this node.
    pub action: ConfigAction,
}

impl Node {
    /// Create a voter node with no pending action.
    pub fn voter(id: NodeId, addr: impl Into<String>) -> Self {
        Self { id, addr: addr.into(), voter: true, action: ConfigAction::None }
    }

    /// Create a nonvoter node with no pending action.
    pub fn nonvoter(id: NodeId, addr: impl Into<String>) -> Self {
        Self { id, addr: addr.into(), voter: false, action: ConfigAction::None }
    }

    /// A node is stable when no action is pending on it.
    pub fn is_stable(&self) -> bool {
        self.action == ConfigAction::None
    }

    pub(crate) fn wants_promote(&self) -> bool {
        !self.voter && self.action == ConfigAction::Promote
    }

    pub(crate) fn wants_demote(&self) -> bool {
        self.voter && matches!(self.action, ConfigAction::Demote | ConfigAction::Remove)
    }

    pub(crate) fn wants_remove(&self) -> bool {
        !self.voter && self.action == ConfigAction::Remove
    }

    /// Validate the node record on its own.
    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(RaftError::InvalidConfig("node id must be nonzero".into()));
        }
        let (host, port) = self
            .addr
            .rsplit_once(':')
            .ok_or_else(|| RaftError::InvalidConfig(format!("invalid address {}", self.addr)))?;
        if host.is_empty() {
            return Err(RaftError::InvalidConfig(format!("invalid address {}", self.addr)));
        }
        let port: u32 = port
            .parse()
            .map_err(|_| RaftError::InvalidConfig(format!("invalid port in {}", self.addr)))?;
        if port == 0 || port > u16::MAX as u32 {
            return Err(RaftError::InvalidConfig(format!("invalid port in {}", self.addr)));
        }
        if self.action == ConfigAction::Promote && self.voter {
            return Err(RaftError::InvalidConfig(format!("voter {} cannot be promoted", self.id)));
        }
        if self.action == ConfigAction::Demote && !self.voter {
            return Err(RaftError::InvalidConfig(format!("nonvoter {} cannot be demoted", self.id)));
        }
        Ok(())
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.id);
        put_string(buf, &self.addr);
        put_bool(buf, self.voter);
        put_u8(buf, self.action.to_u8());
    }

    fn decode(r: &mut Reader<'_>) -> io::Result<Self> {
        let id = r.u64()?;
        let addr = r.string()?;
        let voter = r.bool()?;
        let action = ConfigAction::from_u8(r.u8()?)?;
        Ok(Self { id, addr, voter, action })
    }
}

/// Cluster configuration as of a log position.
///
/// `index == 0` marks the bootstrap state: no configuration has ever
/// been appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Member nodes, keyed by id.
    pub nodes: HashMap<NodeId, Node>,
    /// Log index of the entry carrying this configuration.
    pub index: LogIndex,
    /// Term of the entry carrying this configuration.
    pub term: Term,
}

impl ClusterConfig {
    /// Build a configuration from nodes, with no log position yet.
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
            index: 0,
            term: 0,
        }
    }

    /// True before any configuration has been committed or appended.
    pub fn is_bootstrap(&self) -> bool {
        self.index == 0
    }

    /// True when every node is stable.
    pub fn is_stable(&self) -> bool {
        self.nodes.values().all(Node::is_stable)
    }

    /// Whether `id` is a voting member.
    pub fn is_voter(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map(|n| n.voter).unwrap_or(false)
    }

    /// Address of a member, if present.
    pub fn addr_of(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(|n| n.addr.as_str())
    }

    /// Number of voting members.
    pub fn num_voters(&self) -> usize {
        self.nodes.values().filter(|n| n.voter).count()
    }

    /// Majority size over the voting members.
    pub fn quorum(&self) -> usize {
        self.num_voters() / 2 + 1
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<()> {
        let mut addrs = HashMap::new();
        for (id, node) in &self.nodes {
            node.validate()?;
            if *id != node.id {
                return Err(RaftError::InvalidConfig(format!(
                    "key {} does not match node id {}",
                    id, node.id
                )));
            }
            if let Some(other) = addrs.insert(node.addr.clone(), node.id) {
                return Err(RaftError::InvalidConfig(format!(
                    "nodes {} and {} share address {}",
                    other, node.id, node.addr
                )));
            }
        }
        if self.num_voters() == 0 {
            return Err(RaftError::InvalidConfig("at least one voter required".into()));
        }
        Ok(())
    }

    /// Encode the node set (not the log position) into `buf`.
    pub(crate) fn encode_nodes(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.nodes.len() as u32);
        // deterministic order keeps encodings comparable
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.nodes[&id].encode(buf);
        }
    }

    /// Decode a node set encoded by [`Self::encode_nodes`], placing it at
    /// the given log position.
    pub(crate) fn decode_nodes(r: &mut Reader<'_>, index: LogIndex, term: Term) -> io::Result<Self> {
        let count = r.u32()?;
        let mut nodes = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let node = Node::decode(r)?;
            nodes.insert(node.id, node);
        }
        Ok(Self { nodes, index, term })
    }

    /// Package this configuration as a log entry at its own position.
    pub(crate) fn to_entry(&self) -> Entry {
        let mut data = Vec::new();
        self.encode_nodes(&mut data);
        Entry { index: self.index, term: self.term, typ: EntryType::Config, data }
    }

    /// Recover a configuration from a config log entry.
    pub(crate) fn from_entry(entry: &Entry) -> io::Result<Self> {
        if entry.typ != EntryType::Config {
            return Err(corrupt("not a config entry"));
        }
        let mut r = Reader::new(&entry.data);
        let config = Self::decode_nodes(&mut r, entry.index, entry.term)?;
        r.finish()?;
        Ok(config)
    }
}

/// The committed and latest configurations of a replica.
///
/// Invariant: `committed.index <= latest.index`. The two are equal
/// exactly when the latest configuration has committed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configs {
    /// Most recent configuration known to be committed.
    pub committed: ClusterConfig,
    /// Most recent configuration appended to the log.
    pub latest: ClusterConfig,
}

impl Configs {
    /// True before any configuration exists.
    pub fn is_bootstrap(&self) -> bool {
        self.latest.is_bootstrap()
    }

    /// True when the latest configuration has committed.
    pub fn is_committed(&self) -> bool {
        self.latest.index == self.committed.index
    }

    /// True when committed and every node of the latest config is stable.
    pub fn is_stable(&self) -> bool {
        self.is_committed() && self.latest.is_stable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> ClusterConfig {
        ClusterConfig::new([
            Node::voter(1, "a:7000"),
            Node::voter(2, "b:7000"),
            Node::voter(3, "c:7000"),
        ])
    }

    #[test]
    fn test_quorum() {
        let mut config = three_nodes();
        assert_eq!(config.num_voters(), 3);
        assert_eq!(config.quorum(), 2);

        config.nodes.get_mut(&3).unwrap().voter = false;
        assert_eq!(config.quorum(), 2);

        config.nodes.remove(&2);
        assert_eq!(config.quorum(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_nodes() {
        let zero_id = ClusterConfig::new([Node::voter(0, "a:7000")]);
        assert!(zero_id.validate().is_err());

        let bad_port = ClusterConfig::new([Node::voter(1, "a:0")]);
        assert!(bad_port.validate().is_err());

        let no_port = ClusterConfig::new([Node::voter(1, "a")]);
        assert!(no_port.validate().is_err());

        let mut dup = three_nodes();
        dup.nodes.get_mut(&2).unwrap().addr = "a:7000".into();
        assert!(dup.validate().is_err());

        let nonvoters = ClusterConfig::new([Node::nonvoter(1, "a:7000")]);
        assert!(nonvoters.validate().is_err());
    }

    #[test]
    fn test_validate_action_constraints() {
        let mut config = three_nodes();
        config.nodes.get_mut(&1).unwrap().action = ConfigAction::Promote;
        assert!(config.validate().is_err());

        let mut config = three_nodes();
        let node = config.nodes.get_mut(&1).unwrap();
        node.voter = false;
        node.action = ConfigAction::Demote;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stability() {
        let mut config = three_nodes();
        assert!(config.is_stable());
        config.nodes.get_mut(&2).unwrap().action = ConfigAction::Remove;
        assert!(!config.is_stable());
    }

    #[test]
    fn test_configs_invariants() {
        let mut configs = Configs::default();
        assert!(configs.is_bootstrap());
        assert!(configs.is_committed());

        let mut latest = three_nodes();
        latest.index = 5;
        latest.term = 2;
        configs.latest = latest;
        assert!(!configs.is_committed());
        assert!(!configs.is_stable());

        configs.committed = configs.latest.clone();
        assert!(configs.is_stable());
    }

    #[test]
    fn test_config_entry_roundtrip() {
        let mut config = three_nodes();
        config.index = 7;
        config.term = 3;
        config.nodes.get_mut(&2).unwrap().voter = false;
        config.nodes.get_mut(&2).unwrap().action = ConfigAction::Promote;

        let entry = config.to_entry();
        assert_eq!(entry.typ, EntryType::Config);
        assert_eq!(entry.index, 7);

        let back = ClusterConfig::from_entry(&entry).unwrap();
        assert_eq!(back, config);
    }
}
