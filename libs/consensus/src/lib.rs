//! Raft consensus implementation for distributed systems
//!
//! This library provides a production-ready Raft consensus algorithm implementation
//! that can be used to build strongly consistent distributed systems.
//!
//! # Features
//!
//! - Leader election with randomized timeouts
//! - Log replication with strong consistency
//! - Log compaction via snapshotting
//! - Membership changes
//! - Batched append entries for performance
//!
//! # Example
//!
//! ```no_run
//! use kvraft_consensus::{RaftNode, RaftConfig, StateMachine};
//! use std::net::SocketAddr;
//! use std::time::Duration;
//!
//! struct NoopMachine;
//! impl StateMachine for NoopMachine {
//!     fn apply(&mut self, _command: &[u8]) -> Vec<u8> { Vec::new() }
//!     fn snapshot(&self) -> Vec<u8> { Vec::new() }
//!     fn restore(&mut self, _snapshot: &[u8]) {}
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let bind_addr: SocketAddr = "127.0.0.1:7000".parse()?;
//! let node = kvraft_consensus::RaftNode::new(
//!     kvraft_consensus::NodeId(1),
//!     "127.0.0.1:7000".to_string(),
//!     bind_addr,
//!     None,
//!     RaftConfig::default(),
//!     NoopMachine,
//! )
//! .await?;
//!
//! node.bootstrap().await?;
//! node.propose(b"SET key value".to_vec(), Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod log;
mod node;
mod rpc;
mod state;
mod transport;
mod types;

pub use config::{RaftConfig, RaftConfigBuilder};
pub use log::{LogStorage, MemoryLogStorage, RaftLog, SledLogStorage};
pub use node::{RaftNode, StateMachine};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
pub use state::{NodeState, RaftRole};
pub use transport::{validate_advertise_addr, GrpcServer, RaftRpcHandler, RaftTransport, TonicRaftTransport};
pub use types::{
    ClusterConfig, Entry, EntryKind, LogIndex, NodeId, Snapshot, SnapshotMetadata, Term,
};

/// Result type for Raft operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur during Raft operations
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Not the leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Log index out of range: {0}")]
    LogIndexOutOfRange(LogIndex),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
