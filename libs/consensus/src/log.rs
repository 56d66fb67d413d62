//! Persistent log storage for Raft
//!
//! The log is the source of truth for all commands that have been proposed.
//! It must be persisted to stable storage to survive crashes.

use crate::types::{Entry, LogIndex, NodeId, Snapshot, SnapshotMetadata, Term};
use crate::{RaftError, Result};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// Trait for log storage backends
///
/// Implementations must ensure durability (fsync on write)
pub trait LogStorage: Send + Sync {
    /// Append entries to the log
    fn append(&mut self, entries: Vec<Entry>) -> Result<()>;

    /// Get an entry at a specific index
    fn get(&self, index: LogIndex) -> Result<Option<Entry>>;

    /// Get a range of entries [start, end)
    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>>;

    /// Get all entries from start index onwards
    fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>>;

    /// Delete entries from index onwards (used when log conflicts are detected)
    fn delete_from(&mut self, index: LogIndex) -> Result<()>;

    /// Get the index of the last entry
    fn last_index(&self) -> LogIndex;

    /// Get the term of the last entry
    fn last_term(&self) -> Term;

    /// Get the term of a specific entry
    fn get_term(&self, index: LogIndex) -> Result<Option<Term>>;

    /// Set the current snapshot
    fn set_snapshot(&mut self, snapshot: Snapshot) -> Result<()>;

    /// Get the current snapshot
    fn get_snapshot(&self) -> Option<Snapshot>;

    /// Compact the log by removing entries covered by the snapshot
    fn compact(&mut self, through_index: LogIndex) -> Result<()>;

    /// Load the stable state (current term, voted-for) persisted alongside the log
    fn load_stable_state(&self) -> Result<(Term, Option<NodeId>)>;

    /// Persist the stable state. Must happen before responding to the RPC
    /// that caused the change (§4.4 of the design).
    fn save_stable_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()>;
}

/// In-memory log storage (for testing and development)
///
/// In production, you'd use a proper durable storage backend
#[derive(Default)]
pub struct MemoryLogStorage {
    entries: Vec<Entry>,
    snapshot: Option<Snapshot>,
    current_term: Term,
    voted_for: Option<NodeId>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the offset caused by log compaction
    fn offset(&self) -> LogIndex {
        self.snapshot
            .as_ref()
            .map(|s| s.metadata.last_included_index + 1)
            .unwrap_or(LogIndex(1))
    }

    /// Convert a log index to an array index
    fn to_array_index(&self, index: LogIndex) -> Option<usize> {
        let offset = self.offset();
        if index < offset {
            return None;
        }
        Some((index.0 - offset.0) as usize)
    }

    /// Convert an array index to a log index
    fn to_log_index(&self, array_idx: usize) -> LogIndex {
        let offset = self.offset();
        LogIndex(offset.0 + array_idx as u64)
    }
}

impl LogStorage for MemoryLogStorage {
    fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        self.entries.extend(entries);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        if let Some(snapshot) = &self.snapshot {
            if index <= snapshot.metadata.last_included_index {
                return Ok(None); // Entry is in snapshot
            }
        }

        Ok(self
            .to_array_index(index)
            .and_then(|idx| self.entries.get(idx).cloned()))
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        let start_idx = self
            .to_array_index(start)
            .ok_or(RaftError::LogIndexOutOfRange(start))?;
        let end_idx = self
            .to_array_index(end)
            .unwrap_or(self.entries.len())
            .min(self.entries.len());

        Ok(self.entries[start_idx..end_idx].to_vec())
    }

    fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>> {
        let start_idx = match self.to_array_index(start) {
            Some(idx) => idx,
            None => return Ok(self.entries.clone()),
        };
        if start_idx >= self.entries.len() {
            return Ok(vec![]);
        }

        Ok(self.entries[start_idx..].to_vec())
    }

    fn delete_from(&mut self, index: LogIndex) -> Result<()> {
        if let Some(idx) = self.to_array_index(index) {
            self.entries.truncate(idx);
        }
        Ok(())
    }

    fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.snapshot
                .as_ref()
                .map(|s| s.metadata.last_included_index)
                .unwrap_or(LogIndex::ZERO)
        } else {
            self.to_log_index(self.entries.len() - 1)
        }
    }

    fn last_term(&self) -> Term {
        if let Some(last_entry) = self.entries.last() {
            last_entry.term
        } else if let Some(snapshot) = &self.snapshot {
            snapshot.metadata.last_included_term
        } else {
            Term(0)
        }
    }

    fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        if let Some(snapshot) = &self.snapshot {
            if index == snapshot.metadata.last_included_index {
                return Ok(Some(snapshot.metadata.last_included_term));
            }
            if index < snapshot.metadata.last_included_index {
                return Ok(None);
            }
        }

        Ok(self.get(index)?.map(|e| e.term))
    }

    fn set_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn get_snapshot(&self) -> Option<Snapshot> {
        self.snapshot.clone()
    }

    fn compact(&mut self, through_index: LogIndex) -> Result<()> {
        if let Some(idx) = self.to_array_index(through_index) {
            // Remove entries up to through_index
            self.entries.drain(0..=idx);
        }
        Ok(())
    }

    fn load_stable_state(&self) -> Result<(Term, Option<NodeId>)> {
        Ok((self.current_term, self.voted_for))
    }

    fn save_stable_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }
}

const SLED_KEY_TERM: &[u8] = b"__stable_term";
const SLED_KEY_VOTED_FOR: &[u8] = b"__stable_voted_for";
const SLED_KEY_SNAPSHOT: &[u8] = b"__snapshot";
const SLED_ENTRY_PREFIX: &[u8] = b"e:";

/// Durable log storage backed by `sled`.
///
/// A single `sled::Db` opened at `DataDir/logs.dat` holds both the log
/// entries (keyed by big-endian log index so iteration order matches index
/// order) and the stable state (current term, voted-for), matching the
/// design's "a single embedded log store ... holds both log entries and
/// stable state."
pub struct SledLogStorage {
    db: sled::Db,
}

impl SledLogStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| RaftError::Internal(e.to_string()))?;
        Ok(Self { db })
    }

    fn entry_key(index: LogIndex) -> Vec<u8> {
        let mut key = SLED_ENTRY_PREFIX.to_vec();
        key.extend_from_slice(&index.0.to_be_bytes());
        key
    }
}

impl LogStorage for SledLogStorage {
    fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            let key = Self::entry_key(entry.index);
            let value =
                bincode::serialize(&entry).map_err(|e| RaftError::Internal(e.to_string()))?;
            self.db
                .insert(key, value)
                .map_err(|e| RaftError::Internal(e.to_string()))?;
        }
        self.db
            .flush()
            .map_err(|e| RaftError::Internal(e.to_string()))?;
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        match self
            .db
            .get(Self::entry_key(index))
            .map_err(|e| RaftError::Internal(e.to_string()))?
        {
            Some(bytes) => {
                let entry = bincode::deserialize(&bytes)
                    .map_err(|e| RaftError::Internal(e.to_string()))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut idx = start;
        while idx < end {
            if let Some(entry) = self.get(idx)? {
                out.push(entry);
            }
            idx = idx + 1;
        }
        Ok(out)
    }

    fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>> {
        self.get_range(start, self.last_index() + 1)
    }

    fn delete_from(&mut self, index: LogIndex) -> Result<()> {
        let mut idx = index;
        let last = self.last_index();
        while idx <= last {
            self.db
                .remove(Self::entry_key(idx))
                .map_err(|e| RaftError::Internal(e.to_string()))?;
            idx = idx + 1;
        }
        Ok(())
    }

    fn last_index(&self) -> LogIndex {
        let prefix_end = {
            let mut k = SLED_ENTRY_PREFIX.to_vec();
            k.push(0xFF);
            k
        };
        match self
            .db
            .range(SLED_ENTRY_PREFIX.to_vec()..prefix_end)
            .next_back()
        {
            Some(Ok((key, _))) => {
                let idx_bytes = &key[SLED_ENTRY_PREFIX.len()..];
                let mut buf = [0u8; 8];
                buf.copy_from_slice(idx_bytes);
                LogIndex(u64::from_be_bytes(buf))
            }
            _ => self
                .get_snapshot()
                .map(|s| s.metadata.last_included_index)
                .unwrap_or(LogIndex::ZERO),
        }
    }

    fn last_term(&self) -> Term {
        let last = self.last_index();
        if last == LogIndex::ZERO {
            return self
                .get_snapshot()
                .map(|s| s.metadata.last_included_term)
                .unwrap_or(Term(0));
        }
        self.get(last)
            .ok()
            .flatten()
            .map(|e| e.term)
            .unwrap_or(Term(0))
    }

    fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        if let Some(snapshot) = self.get_snapshot() {
            if index == snapshot.metadata.last_included_index {
                return Ok(Some(snapshot.metadata.last_included_term));
            }
        }
        Ok(self.get(index)?.map(|e| e.term))
    }

    fn set_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let value =
            bincode::serialize(&snapshot).map_err(|e| RaftError::Internal(e.to_string()))?;
        self.db
            .insert(SLED_KEY_SNAPSHOT, value)
            .map_err(|e| RaftError::Internal(e.to_string()))?;
        Ok(())
    }

    fn get_snapshot(&self) -> Option<Snapshot> {
        self.db
            .get(SLED_KEY_SNAPSHOT)
            .ok()
            .flatten()
            .and_then(|bytes| bincode::deserialize(&bytes).ok())
    }

    fn compact(&mut self, through_index: LogIndex) -> Result<()> {
        let mut idx = LogIndex(1);
        while idx <= through_index {
            self.db
                .remove(Self::entry_key(idx))
                .map_err(|e| RaftError::Internal(e.to_string()))?;
            idx = idx + 1;
        }
        Ok(())
    }

    fn load_stable_state(&self) -> Result<(Term, Option<NodeId>)> {
        let term = self
            .db
            .get(SLED_KEY_TERM)
            .map_err(|e| RaftError::Internal(e.to_string()))?
            .and_then(|b| b.as_ref().try_into().ok())
            .map(u64::from_be_bytes)
            .map(Term)
            .unwrap_or_default();

        let voted_for = self
            .db
            .get(SLED_KEY_VOTED_FOR)
            .map_err(|e| RaftError::Internal(e.to_string()))?
            .and_then(|b| b.as_ref().try_into().ok())
            .map(u64::from_be_bytes)
            .map(NodeId);

        Ok((term, voted_for))
    }

    fn save_stable_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.db
            .insert(SLED_KEY_TERM, &term.0.to_be_bytes())
            .map_err(|e| RaftError::Internal(e.to_string()))?;
        match voted_for {
            Some(id) => {
                self.db
                    .insert(SLED_KEY_VOTED_FOR, &id.0.to_be_bytes())
                    .map_err(|e| RaftError::Internal(e.to_string()))?;
            }
            None => {
                self.db
                    .remove(SLED_KEY_VOTED_FOR)
                    .map_err(|e| RaftError::Internal(e.to_string()))?;
            }
        }
        self.db
            .flush()
            .map_err(|e| RaftError::Internal(e.to_string()))?;
        Ok(())
    }
}

/// Thread-safe wrapper around log storage
pub struct RaftLog {
    storage: Arc<RwLock<Box<dyn LogStorage>>>,
}

impl RaftLog {
    pub fn new(storage: Box<dyn LogStorage>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    pub fn new_memory() -> Self {
        Self::new(Box::new(MemoryLogStorage::new()))
    }

    /// Open (or create) a durable sled-backed log at `DataDir/logs.dat`.
    pub fn open_sled(data_dir: impl AsRef<Path>) -> Result<Self> {
        let path = data_dir.as_ref().join("logs.dat");
        Ok(Self::new(Box::new(SledLogStorage::open(path)?)))
    }

    pub fn append(&self, entries: Vec<Entry>) -> Result<()> {
        self.storage.write().append(entries)
    }

    pub fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.storage.read().get(index)
    }

    pub fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        self.storage.read().get_range(start, end)
    }

    pub fn get_from(&self, start: LogIndex) -> Result<Vec<Entry>> {
        self.storage.read().get_from(start)
    }

    pub fn delete_from(&self, index: LogIndex) -> Result<()> {
        self.storage.write().delete_from(index)
    }

    pub fn last_index(&self) -> LogIndex {
        self.storage.read().last_index()
    }

    pub fn last_term(&self) -> Term {
        self.storage.read().last_term()
    }

    pub fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        self.storage.read().get_term(index)
    }

    pub fn set_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.storage.write().set_snapshot(snapshot)
    }

    pub fn get_snapshot(&self) -> Option<Snapshot> {
        self.storage.read().get_snapshot()
    }

    pub fn compact(&self, through_index: LogIndex) -> Result<()> {
        self.storage.write().compact(through_index)
    }

    pub fn load_stable_state(&self) -> Result<(Term, Option<NodeId>)> {
        self.storage.read().load_stable_state()
    }

    pub fn save_stable_state(&self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.storage.write().save_stable_state(term, voted_for)
    }
}

impl Clone for RaftLog {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClusterConfig;

    #[test]
    fn test_append_and_get() {
        let mut log = MemoryLogStorage::new();

        let entries = vec![
            Entry::new_command(Term(1), LogIndex(1), b"cmd1".to_vec()),
            Entry::new_command(Term(1), LogIndex(2), b"cmd2".to_vec()),
            Entry::new_command(Term(2), LogIndex(3), b"cmd3".to_vec()),
        ];

        log.append(entries.clone()).unwrap();

        assert_eq!(log.last_index(), LogIndex(3));
        assert_eq!(log.last_term(), Term(2));

        let entry = log.get(LogIndex(2)).unwrap().unwrap();
        assert_eq!(entry.as_command(), Some(b"cmd2".as_slice()));
        assert_eq!(entry.term, Term(1));
    }

    #[test]
    fn test_delete_from() {
        let mut log = MemoryLogStorage::new();

        let entries = vec![
            Entry::new_command(Term(1), LogIndex(1), b"cmd1".to_vec()),
            Entry::new_command(Term(1), LogIndex(2), b"cmd2".to_vec()),
            Entry::new_command(Term(2), LogIndex(3), b"cmd3".to_vec()),
        ];

        log.append(entries).unwrap();
        log.delete_from(LogIndex(2)).unwrap();

        assert_eq!(log.last_index(), LogIndex(1));
        assert!(log.get(LogIndex(2)).unwrap().is_none());
    }

    #[test]
    fn test_get_range() {
        let mut log = MemoryLogStorage::new();

        let entries = vec![
            Entry::new_command(Term(1), LogIndex(1), b"cmd1".to_vec()),
            Entry::new_command(Term(1), LogIndex(2), b"cmd2".to_vec()),
            Entry::new_command(Term(2), LogIndex(3), b"cmd3".to_vec()),
        ];

        log.append(entries).unwrap();

        let range = log.get_range(LogIndex(1), LogIndex(3)).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].as_command(), Some(b"cmd1".as_slice()));
        assert_eq!(range[1].as_command(), Some(b"cmd2".as_slice()));
    }

    #[test]
    fn test_snapshot_compaction() {
        let mut log = MemoryLogStorage::new();

        let entries = vec![
            Entry::new_command(Term(1), LogIndex(1), b"cmd1".to_vec()),
            Entry::new_command(Term(1), LogIndex(2), b"cmd2".to_vec()),
            Entry::new_command(Term(2), LogIndex(3), b"cmd3".to_vec()),
        ];

        log.append(entries).unwrap();

        // Create snapshot up to index 2
        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: LogIndex(2),
                last_included_term: Term(1),
                configuration: ClusterConfig::default(),
            },
            data: b"snapshot_data".to_vec(),
        };

        log.set_snapshot(snapshot).unwrap();
        log.compact(LogIndex(2)).unwrap();

        // Only index 3 should remain
        assert_eq!(log.last_index(), LogIndex(3));
        assert!(log.get(LogIndex(1)).unwrap().is_none()); // In snapshot
        assert_eq!(
            log.get(LogIndex(3)).unwrap().unwrap().as_command(),
            Some(b"cmd3".as_slice())
        );
    }

    #[test]
    fn test_sled_log_roundtrip_through_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = RaftLog::open_sled(dir.path()).unwrap();
            log.save_stable_state(Term(3), Some(NodeId(1))).unwrap();
            log.append(vec![Entry::new_command(Term(3), LogIndex(1), b"x".to_vec())])
                .unwrap();
        }
        // Reopen: everything must still be there.
        let log = RaftLog::open_sled(dir.path()).unwrap();
        assert_eq!(log.last_index(), LogIndex(1));
        assert_eq!(
            log.load_stable_state().unwrap(),
            (Term(3), Some(NodeId(1)))
        );
    }
}
