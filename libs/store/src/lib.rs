//! The KV Store: a thread-safe `key -> value` map with trivial file
//! persistence, applied exclusively from the state-machine bridge.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single exclusive lock guards both the map and the persistence step, so
/// a reader can never observe a torn write. `parking_lot::RwLock` gives
/// genuine shared-mode reads, so `Get`/`Contains` don't block each other.
pub struct KvStore {
    data: RwLock<HashMap<String, String>>,
    path: PathBuf,
}

impl KvStore {
    /// Open (or create) the store's backing file, loading any existing
    /// `key=value\n` lines. A line without `=` is skipped. Load I/O failure
    /// logs a warning and starts the store empty rather than failing
    /// startup -- the node is not crashed by a corrupt KV file, since the
    /// Raft log is authoritative and can rebuild it.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read_to_string(&path) {
            Ok(contents) => parse_lines(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!("failed to load kv store from {:?}: {}", path, e);
                HashMap::new()
            }
        };

        Self {
            data: RwLock::new(data),
            path,
        }
    }

    /// Insert or overwrite `key`. Visible to a subsequent `get` on the same
    /// node as soon as this call returns.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut data = self.data.write();
        data.insert(key.into(), value.into());
        self.persist(&data);
    }

    /// Remove `key` if present. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut data = self.data.write();
        let existed = data.remove(key).is_some();
        self.persist(&data);
        existed
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Rewrite the entire file from the current map. I/O failure here is
    /// logged; the in-memory mutation stands regardless (§7: storage I/O
    /// errors on the KV path are never fatal).
    fn persist(&self, data: &HashMap<String, String>) {
        if let Err(e) = self.write_file(data) {
            tracing::error!("failed to persist kv store to {:?}: {}", self.path, e);
        }
    }

    fn write_file(&self, data: &HashMap<String, String>) -> Result<(), StoreError> {
        let mut contents = String::new();
        for (k, v) in data {
            contents.push_str(k);
            contents.push('=');
            contents.push_str(v);
            contents.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(&self.path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
}

fn parse_lines(contents: &str) -> HashMap<String, String> {
    let mut data = HashMap::new();
    for line in contents.lines() {
        if let Some((k, v)) = line.split_once('=') {
            data.insert(k.to_string(), v.to_string());
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_set_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("kv.db"));
        store.set("a", "1");
        assert_eq!(store.get("a"), Some("1".to_string()));
        assert!(store.contains("a"));
        assert!(!store.contains("b"));
    }

    #[test]
    fn test_delete_returns_existed() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("kv.db"));
        assert!(!store.delete("missing"));
        store.set("a", "1");
        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn test_persistence_round_trip_through_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");

        {
            let store = KvStore::open(&path);
            store.set("hello", "world");
            store.set("role", "admin");
        }

        let store = KvStore::open(&path);
        assert_eq!(store.get("hello"), Some("world".to_string()));
        assert_eq!(store.get("role"), Some("admin".to_string()));
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("does-not-exist.db"));
        assert_eq!(store.get("anything"), None);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        fs::write(&path, "a=1\nnoequalshere\nb=2\n").unwrap();

        let store = KvStore::open(&path);
        assert_eq!(store.get("a"), Some("1".to_string()));
        assert_eq!(store.get("b"), Some("2".to_string()));
    }

    proptest! {
        #[test]
        fn test_set_persists_through_restart_prop(
            key in "[^=\n]{1,16}",
            value in "[^\n]{0,16}",
        ) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("kv.db");

            {
                let store = KvStore::open(&path);
                store.set(key.clone(), value.clone());
            }

            let store = KvStore::open(&path);
            prop_assert_eq!(store.get(&key), Some(value));
        }
    }
}
