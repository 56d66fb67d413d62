//! Bridges committed Raft log entries to mutations on the KV Store
//!
//! `KvStateMachine` is the only piece of this workspace that knows both the
//! wire `Command` codec and the `kvraft_consensus::StateMachine` trait; the
//! consensus engine itself never looks inside a command payload.

use kvraft_codec::{decode, Op};
use kvraft_consensus::StateMachine;
use kvraft_store::KvStore;
use std::sync::Arc;

pub struct KvStateMachine {
    store: Arc<KvStore>,
}

impl KvStateMachine {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }
}

impl StateMachine for KvStateMachine {
    /// Decode `payload` and dispatch on `op`. A decode failure or an
    /// unknown `op` is logged and treated as a no-op -- a payload malformed
    /// on this replica is malformed on every replica, so halting would
    /// wedge the cluster rather than protect it.
    fn apply(&mut self, payload: &[u8]) -> Vec<u8> {
        let command = match decode(payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!("dropping malformed command: {}", e);
                return Vec::new();
            }
        };

        match command.op {
            Op::Set => self.store.set(command.key, command.value),
            Op::Delete => {
                self.store.delete(&command.key);
            }
            Op::Unknown => {
                tracing::warn!("ignoring command with unknown op for key {:?}", command.key);
            }
        }

        Vec::new()
    }

    /// Stub: correct only because the log is never compacted in this
    /// version. A real snapshot must serialize the whole store while
    /// holding its lock.
    fn snapshot(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Stub: correct only because `snapshot` never produces anything to
    /// restore from -- the log replay on restart rebuilds state instead.
    fn restore(&mut self, _snapshot: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvraft_codec::Command;

    fn machine() -> (KvStateMachine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KvStore::open(dir.path().join("kv.db")));
        (KvStateMachine::new(store.clone()), dir)
    }

    #[test]
    fn test_apply_set_then_get() {
        let (mut sm, _dir) = machine();
        let payload = kvraft_codec::encode(&Command::set("hello", "world"));
        sm.apply(&payload);
        assert_eq!(sm.store.get("hello"), Some("world".to_string()));
    }

    #[test]
    fn test_apply_delete() {
        let (mut sm, _dir) = machine();
        sm.apply(&kvraft_codec::encode(&Command::set("x", "1")));
        sm.apply(&kvraft_codec::encode(&Command::delete("x")));
        assert_eq!(sm.store.get("x"), None);
    }

    #[test]
    fn test_apply_delete_is_idempotent() {
        let (mut sm, _dir) = machine();
        sm.apply(&kvraft_codec::encode(&Command::set("x", "1")));
        sm.apply(&kvraft_codec::encode(&Command::delete("x")));
        sm.apply(&kvraft_codec::encode(&Command::delete("x")));
        assert_eq!(sm.store.get("x"), None);
    }

    #[test]
    fn test_apply_malformed_payload_is_noop_and_does_not_panic() {
        let (mut sm, _dir) = machine();
        sm.apply(&[0xFFu8; 4]);
        sm.apply(&kvraft_codec::encode(&Command::set("after", "ok")));
        assert_eq!(sm.store.get("after"), Some("ok".to_string()));
    }

    #[test]
    fn test_snapshot_restore_are_stubs() {
        let (mut sm, _dir) = machine();
        sm.apply(&kvraft_codec::encode(&Command::set("k", "v")));
        assert!(sm.snapshot().is_empty());
        sm.restore(&[]);
        assert_eq!(sm.store.get("k"), Some("v".to_string()));
    }
}
