//! Core types used throughout the Raft implementation

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Election term number
///
/// Terms are used to detect stale leaders and ensure safety.
/// Each time a node starts an election, it increments its term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Term(pub u64);

impl Term {
    pub fn increment(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({})", self.0)
    }
}

/// Index into the Raft log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn increment(&mut self) {
        self.0 += 1;
    }

    pub fn decrement(&mut self) {
        assert!(self.0 > 0, "Cannot decrement LogIndex(0)");
        self.0 -= 1;
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogIndex({})", self.0)
    }
}

impl std::ops::Add<u64> for LogIndex {
    type Output = LogIndex;

    fn add(self, rhs: u64) -> Self::Output {
        LogIndex(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for LogIndex {
    type Output = LogIndex;

    fn sub(self, rhs: u64) -> Self::Output {
        LogIndex(self.0.saturating_sub(rhs))
    }
}

/// Voting membership of the cluster: each voter's id and the address peers
/// dial to reach it. Changed only by a committed `EntryKind::Configuration`
/// entry, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    pub voters: Vec<(NodeId, String)>,
}

impl ClusterConfig {
    pub fn single(id: NodeId, advertise_addr: String) -> Self {
        Self {
            voters: vec![(id, advertise_addr)],
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.voters.iter().any(|(v, _)| *v == id)
    }

    pub fn addr_of(&self, id: NodeId) -> Option<&str> {
        self.voters
            .iter()
            .find(|(v, _)| *v == id)
            .map(|(_, addr)| addr.as_str())
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.voters.iter().map(|(v, _)| *v).collect()
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    pub fn with_voter(&self, id: NodeId, advertise_addr: String) -> Self {
        let mut voters: Vec<(NodeId, String)> = self
            .voters
            .iter()
            .cloned()
            .filter(|(v, _)| *v != id)
            .collect();
        voters.push((id, advertise_addr));
        Self { voters }
    }
}

/// What a log entry carries: either an opaque application command or a
/// cluster membership change. Splitting these (rather than smuggling
/// configuration changes through the command payload) lets the state
/// machine bridge stay ignorant of membership entirely -- only the engine
/// ever inspects `EntryKind::Configuration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryKind {
    Command(Vec<u8>),
    Configuration(ClusterConfig),
}

/// A single entry in the Raft log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// The term when this entry was created
    pub term: Term,

    /// The log index for this entry
    pub index: LogIndex,

    /// The payload carried by this entry
    pub kind: EntryKind,
}

impl Entry {
    pub fn new_command(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Command(command),
        }
    }

    pub fn new_configuration(term: Term, index: LogIndex, config: ClusterConfig) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Configuration(config),
        }
    }

    pub fn as_command(&self) -> Option<&[u8]> {
        match &self.kind {
            EntryKind::Command(c) => Some(c),
            EntryKind::Configuration(_) => None,
        }
    }

    pub fn as_configuration(&self) -> Option<&ClusterConfig> {
        match &self.kind {
            EntryKind::Configuration(c) => Some(c),
            EntryKind::Command(_) => None,
        }
    }
}

/// Snapshot metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Index of the last entry included in the snapshot
    pub last_included_index: LogIndex,

    /// Term of the last entry included in the snapshot
    pub last_included_term: Term,

    /// Cluster configuration at the time of the snapshot
    pub configuration: ClusterConfig,
}

/// A complete snapshot of the state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_increment() {
        let mut term = Term(5);
        term.increment();
        assert_eq!(term, Term(6));
    }

    #[test]
    fn test_log_index_ops() {
        let idx = LogIndex(10);
        assert_eq!(idx + 5, LogIndex(15));
        assert_eq!(idx - 3, LogIndex(7));
    }

    #[test]
    fn test_log_index_ordering() {
        assert!(LogIndex(1) < LogIndex(2));
        assert!(LogIndex(100) > LogIndex(50));
    }

    #[test]
    fn test_term_ordering() {
        assert!(Term(1) < Term(2));
        assert!(Term(100) > Term(50));
    }

    #[test]
    fn test_cluster_config_with_voter() {
        let cfg = ClusterConfig::single(NodeId(1), "a:1".into());
        let cfg2 = cfg.with_voter(NodeId(2), "b:1".into());
        assert_eq!(cfg2.len(), 2);
        assert!(cfg2.contains(NodeId(1)));
        assert!(cfg2.contains(NodeId(2)));
        assert_eq!(cfg2.addr_of(NodeId(2)), Some("b:1"));
    }
}
