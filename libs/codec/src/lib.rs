//! Wire encoding for `Command` payloads carried inside Raft log entries
//!
//! Encoded as a loose string-keyed map (MessagePack via `rmp-serde`) rather
//! than a fixed-field struct, so that decoding tolerates unknown fields and
//! a missing `op`/`key` instead of hard-failing -- the payload must decode
//! identically on every replica regardless of which fields a future version
//! of the encoder adds.

use std::collections::BTreeMap;

/// The mutation a `Command` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Set,
    Delete,
    /// Any `op` string other than `SET`/`DELETE`. Decodes successfully and
    /// is a no-op on apply -- a malformed entry must never wedge the
    /// cluster (it would be malformed on every replica).
    Unknown,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Set => "SET",
            Op::Delete => "DELETE",
            Op::Unknown => "UNKNOWN",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "SET" => Op::Set,
            "DELETE" => Op::Delete,
            _ => Op::Unknown,
        }
    }
}

/// One proposed mutation: `SET key value` or `DELETE key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub op: Op,
    pub key: String,
    pub value: String,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: Op::Set,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: Op::Delete,
            key: key.into(),
            value: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed command payload: {0}")]
    Malformed(String),
}

/// Encode a `Command` as a MessagePack map with `op`/`key`/`value` string
/// fields -- never a fixed struct, so the wire shape stays forward
/// compatible with unknown fields a future encoder might add.
pub fn encode(command: &Command) -> Vec<u8> {
    let mut map = BTreeMap::new();
    map.insert("op", command.op.as_str());
    map.insert("key", command.key.as_str());
    map.insert("value", command.value.as_str());

    // A BTreeMap<&str, &str> of our own construction always serializes;
    // an encode failure here would be a programmer error, not a runtime one.
    rmp_serde::to_vec(&map).expect("command map always serializes")
}

/// Decode a byte payload into a `Command`. Missing `op` yields `Op::Unknown`;
/// missing `key` yields the empty string (an invalid, but decodable,
/// command -- invalid commands are a no-op on apply, not a decode error).
pub fn decode(bytes: &[u8]) -> Result<Command, CodecError> {
    let map: BTreeMap<String, String> =
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let op = map
        .get("op")
        .map(|s| Op::from_str(s))
        .unwrap_or(Op::Unknown);
    let key = map.get("key").cloned().unwrap_or_default();
    let value = map.get("value").cloned().unwrap_or_default();

    Ok(Command { op, key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_set_roundtrip() {
        let cmd = Command::set("username", "alice");
        let bytes = encode(&cmd);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_delete_roundtrip() {
        let cmd = Command::delete("username");
        let bytes = encode(&cmd);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(decoded.value, "");
    }

    #[test]
    fn test_unknown_op_is_no_op_marker() {
        let mut map = BTreeMap::new();
        map.insert("op", "UPSERT");
        map.insert("key", "k");
        map.insert("value", "v");
        let bytes = rmp_serde::to_vec(&map).unwrap();

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.op, Op::Unknown);
    }

    #[test]
    fn test_missing_op_defaults_to_unknown() {
        let mut map = BTreeMap::new();
        map.insert("key", "k");
        let bytes = rmp_serde::to_vec(&map).unwrap();

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.op, Op::Unknown);
        assert_eq!(decoded.key, "k");
    }

    #[test]
    fn test_missing_key_defaults_to_empty() {
        let mut map = BTreeMap::new();
        map.insert("op", "SET");
        let bytes = rmp_serde::to_vec(&map).unwrap();

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.key, "");
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let bytes = vec![0xFFu8; 4];
        assert!(decode(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn test_set_delete_roundtrip_prop(key in "\\PC*", value in "\\PC*", is_set: bool) {
            let cmd = if is_set {
                Command::set(key, value)
            } else {
                Command::delete(key)
            };
            let bytes = encode(&cmd);
            let decoded = decode(&bytes).unwrap();
            prop_assert_eq!(decoded, cmd);
        }
    }
}
