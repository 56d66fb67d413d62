//! Core Raft node implementation
//!
//! `RaftNode` is the public handle: a cheap, cloneable `Arc` wrapping a
//! channel into a single task that owns all mutable Raft state. Every other
//! task -- the gRPC server, the per-peer replicators, the election timer --
//! talks to that owning task either through the channel or through the
//! shared, lock-protected pieces in `Shared`.

use crate::config::RaftConfig;
use crate::log::RaftLog;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::state::{NodeState, RaftRole};
use crate::transport::{
    proto, validate_advertise_addr, GrpcServer, RaftRpcHandler, RaftTransport, TonicRaftTransport,
};
use crate::types::{ClusterConfig, Entry, EntryKind, LogIndex, NodeId, Term};
use crate::{RaftError, Result};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Trait for state machines that can be replicated via Raft
///
/// Implement this trait to build a distributed application on top of Raft
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command to the state machine
    ///
    /// This is called in log order for all committed commands
    fn apply(&mut self, command: &[u8]) -> Vec<u8>;

    /// Create a snapshot of the current state machine state
    fn snapshot(&self) -> Vec<u8>;

    /// Restore state machine from a snapshot
    fn restore(&mut self, snapshot: &[u8]);
}

/// Commands sent to the Raft node's owning task
enum RaftCommand {
    Propose {
        command: Vec<u8>,
        timeout: Duration,
        response: oneshot::Sender<Result<()>>,
    },
    Bootstrap {
        response: oneshot::Sender<Result<()>>,
    },
    AddVoter {
        id: NodeId,
        advertise_addr: String,
        timeout: Duration,
        response: oneshot::Sender<Result<()>>,
    },
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response: oneshot::Sender<InstallSnapshotResponse>,
    },
    IsLeader {
        response: oneshot::Sender<bool>,
    },
    LeaderAddr {
        response: oneshot::Sender<Option<String>>,
    },
    Shutdown,
}

/// State shared between the owning task, the replicator tasks and the gRPC
/// server. Each field is independently lock-protected (or lock-free) so
/// these tasks never contend on a single coarse lock for unrelated work.
struct Shared<SM> {
    id: NodeId,
    advertise_addr: String,
    state: RwLock<NodeState>,
    log: RaftLog,
    config: RaftConfig,
    state_machine: RwLock<SM>,
    transport: Arc<dyn RaftTransport>,
    /// Proposers (Propose/AddVoter) waiting on a specific index to commit.
    waiters: Mutex<BTreeMap<LogIndex, oneshot::Sender<()>>>,
    /// Replicator tasks currently running, one per voting peer.
    replicators: Mutex<HashMap<NodeId, JoinHandle<()>>>,
    last_heartbeat: Mutex<Instant>,
}

/// Handle to a running Raft node
pub struct RaftNode {
    id: NodeId,
    command_tx: mpsc::UnboundedSender<RaftCommand>,
}

impl RaftNode {
    /// Construct and start a Raft node.
    ///
    /// `data_dir` picks the log backend: `Some(dir)` opens a durable
    /// `SledLogStorage` at `dir/logs.dat`; `None` uses an in-memory log
    /// (tests only -- nothing survives a restart). Spawns the node's owning
    /// task and a gRPC server bound on `bind_addr` serving the Raft RPCs.
    pub async fn new<SM: StateMachine>(
        id: NodeId,
        advertise_addr: String,
        bind_addr: SocketAddr,
        data_dir: Option<PathBuf>,
        config: RaftConfig,
        state_machine: SM,
    ) -> Result<Arc<Self>> {
        validate_advertise_addr(&advertise_addr)?;

        let log = match &data_dir {
            Some(dir) => RaftLog::open_sled(dir)?,
            None => RaftLog::new_memory(),
        };

        let (current_term, voted_for) = log.load_stable_state()?;
        let mut node_state = NodeState::new(id, advertise_addr.clone());
        node_state.persistent.current_term = current_term;
        node_state.persistent.voted_for = voted_for;

        let shared = Arc::new(Shared {
            id,
            advertise_addr,
            state: RwLock::new(node_state),
            log,
            config,
            state_machine: RwLock::new(state_machine),
            transport: Arc::new(TonicRaftTransport::new()) as Arc<dyn RaftTransport>,
            waiters: Mutex::new(BTreeMap::new()),
            replicators: Mutex::new(HashMap::new()),
            last_heartbeat: Mutex::new(Instant::now()),
        });

        // Rebuild the state machine by re-applying every entry the log
        // already durably holds, and reconstruct `state.config` along the
        // way: `apply_committed` assigns `state.config` from the last
        // `EntryKind::Configuration` entry it walks over, which is the only
        // thing that repopulates membership on a fresh `NodeState` (live
        // operation sets it at append time instead, never through this
        // replay loop). Commit index itself is not persisted separately
        // (only current_term/voted_for are, per the design), so on restart
        // we conservatively treat everything already in the log as
        // committed; this is safe here because the commands this engine
        // replicates (KV sets/deletes) are idempotent to re-apply.
        {
            let mut state = shared.state.write();
            state.volatile.commit_index = shared.log.last_index();
            apply_committed(&shared, &mut state);
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let node = Arc::new(RaftNode { id, command_tx });

        tokio::spawn(run_node(Arc::clone(&shared), command_rx));

        let grpc_handler = Arc::clone(&node);
        tokio::spawn(async move {
            let service = proto::raft_rpc_server::RaftRpcServer::new(GrpcServer::new(grpc_handler));
            if let Err(e) = tonic::transport::Server::builder()
                .add_service(service)
                .serve(bind_addr)
                .await
            {
                tracing::error!("raft rpc server on {} stopped: {}", bind_addr, e);
            }
        });

        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Propose a command to the cluster and wait up to `timeout` for it to
    /// commit. Returns an error if this node is not the leader, or if the
    /// command does not commit in time.
    pub async fn propose(&self, command: Vec<u8>, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Propose {
                command,
                timeout,
                response: tx,
            })
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Bootstrap a brand-new cluster with this node as its sole voter.
    /// Only valid once, from a node with no prior configuration.
    pub async fn bootstrap(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Bootstrap { response: tx })
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Add a new voter to the cluster. Must be called on the leader; blocks
    /// until the membership change commits or `timeout` elapses.
    pub async fn add_voter(
        &self,
        id: NodeId,
        advertise_addr: String,
        timeout: Duration,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::AddVoter {
                id,
                advertise_addr,
                timeout,
                response: tx,
            })
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    pub async fn is_leader(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::IsLeader { response: tx })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// The advertise address of the node this one believes is leader, if any.
    pub async fn leader_addr(&self) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::LeaderAddr { response: tx })
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Handle RequestVote RPC
    pub async fn request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::RequestVote {
                request,
                response: tx,
            })
            .is_err()
        {
            return RequestVoteResponse {
                term: Term(0),
                vote_granted: false,
            };
        }

        rx.await.unwrap_or(RequestVoteResponse {
            term: Term(0),
            vote_granted: false,
        })
    }

    /// Handle AppendEntries RPC
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::AppendEntries {
                request,
                response: tx,
            })
            .is_err()
        {
            return AppendEntriesResponse {
                term: Term(0),
                success: false,
                match_index: None,
                commit_index: LogIndex::ZERO,
            };
        }

        rx.await.unwrap_or(AppendEntriesResponse {
            term: Term(0),
            success: false,
            match_index: None,
            commit_index: LogIndex::ZERO,
        })
    }

    /// Handle InstallSnapshot RPC. Unreachable in practice: the log is never
    /// compacted, so a leader never needs to fall back to a snapshot. Kept
    /// implemented so the wire contract is complete for a future snapshotting
    /// implementer.
    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::InstallSnapshot {
                request,
                response: tx,
            })
            .is_err()
        {
            return InstallSnapshotResponse { term: Term(0) };
        }

        rx.await.unwrap_or(InstallSnapshotResponse { term: Term(0) })
    }

    /// Shutdown the node gracefully
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(RaftCommand::Shutdown);
    }
}

#[async_trait]
impl RaftRpcHandler for RaftNode {
    async fn request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        self.request_vote(request).await
    }

    async fn append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        self.append_entries(request).await
    }

    async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        self.install_snapshot(request).await
    }
}

fn is_election_timeout<SM>(shared: &Shared<SM>) -> bool {
    let min = shared.config.election_timeout_min.as_millis() as u64;
    let max = shared.config.election_timeout_max.as_millis() as u64;
    let timeout_ms = if max > min {
        min + rand::random::<u64>() % (max - min)
    } else {
        min
    };
    shared.last_heartbeat.lock().elapsed() > Duration::from_millis(timeout_ms)
}

fn reset_election_timeout<SM>(shared: &Shared<SM>) {
    *shared.last_heartbeat.lock() = Instant::now();
}

fn stop_replicators<SM>(shared: &Shared<SM>) {
    let mut replicators = shared.replicators.lock();
    for (_, handle) in replicators.drain() {
        handle.abort();
    }
}

/// Apply every entry between `last_applied` and `commit_index` to the state
/// machine, in order, firing any proposer waiting on that index.
fn apply_committed<SM: StateMachine>(shared: &Shared<SM>, state: &mut NodeState) {
    while state.volatile.last_applied < state.volatile.commit_index {
        let next = state.volatile.last_applied + 1;

        if let Ok(Some(entry)) = shared.log.get(next) {
            match &entry.kind {
                EntryKind::Command(cmd) => {
                    let mut sm = shared.state_machine.write();
                    sm.apply(cmd);
                }
                EntryKind::Configuration(cfg) => {
                    // Live operation already applies a Configuration entry's
                    // effect at append time (see handle_append_entries /
                    // do_bootstrap / handle_add_voter), so this is a no-op
                    // there; it's the only place that sets it back on
                    // restart replay, where nothing else ever touches
                    // `state.config` before this loop runs.
                    state.config = cfg.clone();
                }
            }
        }

        state.volatile.last_applied.increment();

        if let Some(tx) = shared.waiters.lock().remove(&next) {
            let _ = tx.send(());
        }
    }
}

fn handle_request_vote<SM: StateMachine>(
    shared: &Shared<SM>,
    req: RequestVoteRequest,
) -> RequestVoteResponse {
    let mut state = shared.state.write();
    let mut persist = req.term > state.persistent.current_term;

    if req.term > state.persistent.current_term {
        state.become_follower(req.term, None);
    }

    let mut vote_granted = false;
    if req.term >= state.persistent.current_term {
        let already_voted = state
            .persistent
            .voted_for
            .map(|v| v != req.candidate_id)
            .unwrap_or(false);

        if !already_voted {
            let our_last_term = shared.log.last_term();
            let our_last_index = shared.log.last_index();
            let log_ok = req.last_log_term > our_last_term
                || (req.last_log_term == our_last_term && req.last_log_index >= our_last_index);

            if log_ok {
                vote_granted = true;
                state.persistent.voted_for = Some(req.candidate_id);
                persist = true;
                reset_election_timeout(shared);

                debug!(
                    "node {} granted vote to {} for term {}",
                    state.id, req.candidate_id, req.term
                );
            }
        }
    }

    let term = state.persistent.current_term;
    let voted_for = state.persistent.voted_for;
    drop(state);

    if persist {
        let _ = shared.log.save_stable_state(term, voted_for);
    }

    RequestVoteResponse { term, vote_granted }
}

fn handle_append_entries<SM: StateMachine>(
    shared: &Shared<SM>,
    req: AppendEntriesRequest,
) -> AppendEntriesResponse {
    let mut state = shared.state.write();
    let was_leader = state.role == RaftRole::Leader;
    let mut persist = false;

    if req.term > state.persistent.current_term {
        state.become_follower(req.term, Some(req.leader_id));
        persist = true;
    } else if req.term == state.persistent.current_term && state.role == RaftRole::Candidate {
        state.become_follower(req.term, Some(req.leader_id));
    }

    if req.term < state.persistent.current_term {
        let term = state.persistent.current_term;
        let commit_index = state.volatile.commit_index;
        return AppendEntriesResponse {
            term,
            success: false,
            match_index: None,
            commit_index,
        };
    }

    reset_election_timeout(shared);
    state.leader_id = Some(req.leader_id);

    if req.prev_log_index > LogIndex::ZERO {
        match shared.log.get_term(req.prev_log_index) {
            Ok(Some(term)) if term == req.prev_log_term => {}
            _ => {
                let term = state.persistent.current_term;
                let voted_for = state.persistent.voted_for;
                let commit_index = state.volatile.commit_index;
                let last_index = shared.log.last_index();
                drop(state);
                if persist {
                    let _ = shared.log.save_stable_state(term, voted_for);
                }
                return AppendEntriesResponse {
                    term,
                    success: false,
                    match_index: Some(last_index),
                    commit_index,
                };
            }
        }
    }

    if !req.entries.is_empty() {
        if let Some(first_new) = req.entries.first() {
            if let Ok(Some(existing_term)) = shared.log.get_term(first_new.index) {
                if existing_term != first_new.term {
                    let _ = shared.log.delete_from(first_new.index);
                }
            }
        }

        if let Err(e) = shared.log.append(req.entries.clone()) {
            warn!("failed to append entries: {}", e);
            let term = state.persistent.current_term;
            let commit_index = state.volatile.commit_index;
            return AppendEntriesResponse {
                term,
                success: false,
                match_index: None,
                commit_index,
            };
        }

        // Membership changes take effect as soon as they are appended, not
        // only once committed -- otherwise a leader could never reach a
        // newly-added voter to get the entry committed in the first place.
        for entry in &req.entries {
            if let Some(cfg) = entry.as_configuration() {
                state.config = cfg.clone();
            }
        }
    }

    if req.leader_commit > state.volatile.commit_index {
        let last_new_index = req
            .entries
            .last()
            .map(|e| e.index)
            .unwrap_or(req.prev_log_index);

        state.volatile.commit_index = req.leader_commit.min(last_new_index);
        apply_committed(shared, &mut state);
    }

    let term = state.persistent.current_term;
    let voted_for = state.persistent.voted_for;
    let commit_index = state.volatile.commit_index;
    let last_index = shared.log.last_index();
    drop(state);

    if persist {
        let _ = shared.log.save_stable_state(term, voted_for);
    }
    if was_leader {
        stop_replicators(shared);
    }

    AppendEntriesResponse {
        term,
        success: true,
        match_index: Some(last_index),
        commit_index,
    }
}

fn handle_install_snapshot<SM: StateMachine>(
    shared: &Shared<SM>,
    req: InstallSnapshotRequest,
) -> InstallSnapshotResponse {
    let mut state = shared.state.write();
    if req.term > state.persistent.current_term {
        state.become_follower(req.term, Some(req.leader_id));
        let term = state.persistent.current_term;
        drop(state);
        let _ = shared.log.save_stable_state(term, None);
        return InstallSnapshotResponse { term };
    }

    InstallSnapshotResponse {
        term: state.persistent.current_term,
    }
}

fn do_bootstrap<SM: StateMachine>(shared: &Shared<SM>) -> Result<()> {
    if !shared.state.read().config.is_empty() || shared.log.last_index() != LogIndex::ZERO {
        return Err(RaftError::Internal("already bootstrapped".to_string()));
    }

    let (term, config) = {
        let mut state = shared.state.write();
        state.persistent.current_term.increment();
        let term = state.persistent.current_term;
        state.persistent.voted_for = Some(state.id);
        let config = ClusterConfig::single(state.id, shared.advertise_addr.clone());
        (term, config)
    };

    let entry = Entry::new_configuration(term, LogIndex(1), config.clone());
    shared.log.append(vec![entry])?;
    shared.log.save_stable_state(term, Some(shared.id))?;

    let mut state = shared.state.write();
    state.config = config;
    state.become_leader(LogIndex(1));

    Ok(())
}

async fn handle_bootstrap<SM: StateMachine>(
    shared: &Arc<Shared<SM>>,
    response: oneshot::Sender<Result<()>>,
) {
    let result = do_bootstrap(shared);
    if result.is_ok() {
        let term = shared.state.read().persistent.current_term;
        try_advance_commit(shared).await;
        sync_replicators(shared, term).await;
    }
    let _ = response.send(result);
}

async fn handle_propose<SM: StateMachine>(
    shared: &Arc<Shared<SM>>,
    command: Vec<u8>,
    timeout: Duration,
    response: oneshot::Sender<Result<()>>,
) {
    let (term, index) = {
        let state = shared.state.read();
        if state.role != RaftRole::Leader {
            let _ = response.send(Err(RaftError::NotLeader(state.leader_id)));
            return;
        }
        (state.persistent.current_term, shared.log.last_index() + 1)
    };

    let entry = Entry::new_command(term, index, command);
    if let Err(e) = shared.log.append(vec![entry]) {
        let _ = response.send(Err(e));
        return;
    }

    await_commit(shared, index, timeout, response).await;
}

async fn handle_add_voter<SM: StateMachine>(
    shared: &Arc<Shared<SM>>,
    id: NodeId,
    advertise_addr: String,
    timeout: Duration,
    response: oneshot::Sender<Result<()>>,
) {
    let (term, index, new_config) = {
        let mut state = shared.state.write();
        if state.role != RaftRole::Leader {
            let _ = response.send(Err(RaftError::NotLeader(state.leader_id)));
            return;
        }
        let new_config = state.config.with_voter(id, advertise_addr);
        let term = state.persistent.current_term;
        let index = shared.log.last_index() + 1;
        state.config = new_config.clone();
        (term, index, new_config)
    };

    let entry = Entry::new_configuration(term, index, new_config);
    if let Err(e) = shared.log.append(vec![entry]) {
        let _ = response.send(Err(e));
        return;
    }

    // Start replicating to the new voter immediately: it cannot ack this
    // entry, and the entry cannot commit, until a replicator exists for it.
    sync_replicators(shared, term).await;

    await_commit(shared, index, timeout, response).await;
}

/// Register a commit waiter for `index`, kick commit-index advancement (for
/// the single-voter case where nothing else will), and resolve `response`
/// once the entry commits or `timeout` elapses.
async fn await_commit<SM: StateMachine>(
    shared: &Arc<Shared<SM>>,
    index: LogIndex,
    timeout: Duration,
    response: oneshot::Sender<Result<()>>,
) {
    let (commit_tx, commit_rx) = oneshot::channel();
    shared.waiters.lock().insert(index, commit_tx);

    try_advance_commit(shared).await;

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let result = match tokio::time::timeout(timeout, commit_rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                shared.waiters.lock().remove(&index);
                Err(RaftError::Rpc("commit wait timed out".to_string()))
            }
        };
        let _ = response.send(result);
    });
}

/// Recompute `commit_index` as the quorum (median) match index among
/// entries from the leader's own term, then apply anything newly committed.
async fn try_advance_commit<SM: StateMachine>(shared: &Arc<Shared<SM>>) {
    let mut state = shared.state.write();
    if state.role != RaftRole::Leader {
        return;
    }

    let current_term = state.persistent.current_term;
    let self_last = shared.log.last_index();
    let candidate = match &state.leader_state {
        Some(ls) => ls.quorum_match_index(self_last),
        None => return,
    };

    if candidate > state.volatile.commit_index {
        if let Ok(Some(t)) = shared.log.get_term(candidate) {
            if t == current_term {
                state.volatile.commit_index = candidate;
            }
        }
    }

    apply_committed(shared, &mut state);
}

/// Spawn replicator tasks for every current voting peer that doesn't
/// already have one, and tear down replicators for peers no longer in the
/// configuration.
async fn sync_replicators<SM: StateMachine>(shared: &Arc<Shared<SM>>, leader_term: Term) {
    let (peers, is_leader) = {
        let state = shared.state.read();
        (
            state.other_peers(),
            state.role == RaftRole::Leader && state.persistent.current_term == leader_term,
        )
    };
    if !is_leader {
        return;
    }

    let peer_set: HashSet<NodeId> = peers.iter().cloned().collect();

    {
        let mut state = shared.state.write();
        let last_index = shared.log.last_index();
        if let Some(ls) = state.leader_state.as_mut() {
            for peer in &peers {
                ls.ensure_peer(*peer, last_index);
            }
            let stale: Vec<NodeId> = ls
                .next_index
                .iter()
                .map(|(id, _)| *id)
                .filter(|id| !peer_set.contains(id))
                .collect();
            for id in stale {
                ls.remove_peer(id);
            }
        }
    }

    let mut replicators = shared.replicators.lock();
    replicators.retain(|id, handle| {
        if peer_set.contains(id) {
            true
        } else {
            handle.abort();
            false
        }
    });

    for peer in peers {
        if replicators.contains_key(&peer) {
            continue;
        }
        let addr = match shared.state.read().config.addr_of(peer) {
            Some(a) => a.to_string(),
            None => continue,
        };
        let shared2 = Arc::clone(shared);
        let handle = tokio::spawn(replicate_to_peer(shared2, peer, addr, leader_term));
        replicators.insert(peer, handle);
    }
}

/// One task per peer while this node is leader: periodically sends
/// AppendEntries starting at the peer's `next_index`, backtracking on
/// mismatch and advancing `match_index` on success.
async fn replicate_to_peer<SM: StateMachine>(
    shared: Arc<Shared<SM>>,
    peer: NodeId,
    addr: String,
    leader_term: Term,
) {
    loop {
        {
            let state = shared.state.read();
            if state.role != RaftRole::Leader || state.persistent.current_term != leader_term {
                return;
            }
        }

        let next_index = shared
            .state
            .read()
            .leader_state
            .as_ref()
            .and_then(|ls| ls.get_next_index(peer))
            .unwrap_or(LogIndex(1));
        let prev_index = next_index - 1;
        let prev_term = shared.log.get_term(prev_index).ok().flatten().unwrap_or(Term(0));

        let mut entries = shared.log.get_from(next_index).unwrap_or_default();
        entries.truncate(shared.config.max_append_entries);

        let leader_commit = shared.state.read().volatile.commit_index;

        let request = AppendEntriesRequest {
            term: leader_term,
            leader_id: shared.id,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries: entries.clone(),
            leader_commit,
        };

        match shared.transport.append_entries(&addr, request).await {
            Ok(resp) if resp.term > leader_term => {
                let mut state = shared.state.write();
                if resp.term > state.persistent.current_term {
                    state.become_follower(resp.term, None);
                    let _ = shared.log.save_stable_state(resp.term, None);
                }
                drop(state);
                stop_replicators(&shared);
                return;
            }
            Ok(resp) if resp.success => {
                let matched = entries.last().map(|e| e.index).unwrap_or(prev_index);
                {
                    let mut state = shared.state.write();
                    if let Some(ls) = state.leader_state.as_mut() {
                        ls.set_match_index(peer, matched);
                        ls.set_next_index(peer, matched + 1);
                    }
                }
                try_advance_commit(&shared).await;
            }
            Ok(_) => {
                let mut state = shared.state.write();
                if let Some(ls) = state.leader_state.as_mut() {
                    let current = ls.get_next_index(peer).unwrap_or(LogIndex(1));
                    ls.set_next_index(peer, LogIndex(current.0.saturating_sub(1).max(1)));
                }
            }
            Err(e) => {
                debug!("append_entries to {} ({}) failed: {}", peer, addr, e);
            }
        }

        tokio::time::sleep(shared.config.heartbeat_interval).await;
    }
}

fn trigger_election<SM: StateMachine>(shared: Arc<Shared<SM>>) {
    let (term, candidate_id, last_log_index, last_log_term, peers) = {
        let mut state = shared.state.write();
        if state.role == RaftRole::Leader {
            return;
        }
        state.become_candidate();
        (
            state.persistent.current_term,
            state.id,
            shared.log.last_index(),
            shared.log.last_term(),
            state.other_peers(),
        )
    };
    reset_election_timeout(&shared);
    let _ = shared.log.save_stable_state(term, Some(candidate_id));

    info!("node {} starting election for term {}", candidate_id, term);
    tokio::spawn(run_election(
        shared,
        term,
        candidate_id,
        last_log_index,
        last_log_term,
        peers,
    ));
}

async fn run_election<SM: StateMachine>(
    shared: Arc<Shared<SM>>,
    term: Term,
    candidate_id: NodeId,
    last_log_index: LogIndex,
    last_log_term: Term,
    peers: Vec<NodeId>,
) {
    let cluster_size = shared.state.read().config.len().max(1);

    if peers.is_empty() {
        maybe_become_leader(&shared, term, 0, cluster_size).await;
        return;
    }

    let request = RequestVoteRequest {
        term,
        candidate_id,
        last_log_index,
        last_log_term,
    };

    let mut handles = Vec::with_capacity(peers.len());
    for peer in &peers {
        let addr = shared.state.read().config.addr_of(*peer).map(str::to_string);
        let Some(addr) = addr else { continue };
        let transport = Arc::clone(&shared.transport);
        let req = request.clone();
        handles.push(tokio::spawn(
            async move { transport.request_vote(&addr, req).await },
        ));
    }

    let mut votes = 0usize;
    for handle in handles {
        if let Ok(Ok(resp)) = handle.await {
            if resp.term > term {
                let mut state = shared.state.write();
                if resp.term > state.persistent.current_term {
                    state.become_follower(resp.term, None);
                    let _ = shared.log.save_stable_state(resp.term, None);
                }
                return;
            }
            if resp.vote_granted {
                votes += 1;
            }
        }
    }

    maybe_become_leader(&shared, term, votes, cluster_size).await;
}

async fn maybe_become_leader<SM: StateMachine>(
    shared: &Arc<Shared<SM>>,
    term: Term,
    peer_votes: usize,
    cluster_size: usize,
) {
    let became_leader = {
        let mut state = shared.state.write();
        let still_candidate =
            state.role == RaftRole::Candidate && state.persistent.current_term == term;
        if still_candidate && (peer_votes + 1) * 2 > cluster_size {
            let last_index = shared.log.last_index();
            state.become_leader(last_index);
            info!("node {} became leader for term {}", state.id, term);
            true
        } else {
            false
        }
    };

    if became_leader {
        sync_replicators(shared, term).await;
        try_advance_commit(shared).await;
    }
}

/// The node's owning task: serializes every state mutation through this
/// single loop, plus a periodic election-timeout check. Replication happens
/// off to the side in per-peer tasks spawned while this node is leader.
async fn run_node<SM: StateMachine>(
    shared: Arc<Shared<SM>>,
    mut command_rx: mpsc::UnboundedReceiver<RaftCommand>,
) {
    let mut election_check = interval(Duration::from_millis(25));

    loop {
        tokio::select! {
            Some(cmd) = command_rx.recv() => {
                match cmd {
                    RaftCommand::Propose { command, timeout, response } => {
                        handle_propose(&shared, command, timeout, response).await;
                    }
                    RaftCommand::Bootstrap { response } => {
                        handle_bootstrap(&shared, response).await;
                    }
                    RaftCommand::AddVoter { id, advertise_addr, timeout, response } => {
                        handle_add_voter(&shared, id, advertise_addr, timeout, response).await;
                    }
                    RaftCommand::RequestVote { request, response } => {
                        let reply = handle_request_vote(&shared, request);
                        let _ = response.send(reply);
                    }
                    RaftCommand::AppendEntries { request, response } => {
                        let reply = handle_append_entries(&shared, request);
                        let _ = response.send(reply);
                    }
                    RaftCommand::InstallSnapshot { request, response } => {
                        let reply = handle_install_snapshot(&shared, request);
                        let _ = response.send(reply);
                    }
                    RaftCommand::IsLeader { response } => {
                        let is_leader = shared.state.read().role == RaftRole::Leader;
                        let _ = response.send(is_leader);
                    }
                    RaftCommand::LeaderAddr { response } => {
                        let addr = {
                            let state = shared.state.read();
                            state
                                .leader_id
                                .and_then(|id| state.config.addr_of(id).map(str::to_string))
                        };
                        let _ = response.send(addr);
                    }
                    RaftCommand::Shutdown => {
                        info!("node {} shutting down", shared.id);
                        stop_replicators(&shared);
                        break;
                    }
                }
            }

            _ = election_check.tick() => {
                let should_elect = {
                    let state = shared.state.read();
                    state.role != RaftRole::Leader && state.is_voter() && is_election_timeout(&shared)
                };
                if should_elect {
                    trigger_election(Arc::clone(&shared));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    #[derive(Default)]
    struct TestKv {
        data: StdHashMap<String, String>,
    }

    impl StateMachine for TestKv {
        fn apply(&mut self, command: &[u8]) -> Vec<u8> {
            let text = String::from_utf8_lossy(command);
            let parts: Vec<&str> = text.split_whitespace().collect();
            match parts.as_slice() {
                ["SET", key, value] => {
                    self.data.insert(key.to_string(), value.to_string());
                }
                ["DELETE", key] => {
                    self.data.remove(*key);
                }
                _ => {}
            }
            Vec::new()
        }

        fn snapshot(&self) -> Vec<u8> {
            Vec::new()
        }

        fn restore(&mut self, _snapshot: &[u8]) {}
    }

    fn fast_config() -> RaftConfig {
        RaftConfig {
            election_timeout_min: Duration::from_millis(100),
            election_timeout_max: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(30),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_node_bootstrap_and_propose() {
        let dir = tempfile::tempdir().unwrap();
        let addr: SocketAddr = "127.0.0.1:17101".parse().unwrap();

        let node = RaftNode::new(
            NodeId(1),
            "127.0.0.1:17101".to_string(),
            addr,
            Some(dir.path().to_path_buf()),
            fast_config(),
            TestKv::default(),
        )
        .await
        .unwrap();

        node.bootstrap().await.unwrap();
        assert!(node.is_leader().await);

        node.propose(b"SET a 1".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();

        // A second bootstrap is rejected.
        assert!(node.bootstrap().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_rebuilds_config_and_can_propose_again() {
        let dir = tempfile::tempdir().unwrap();
        let addr: SocketAddr = "127.0.0.1:17102".parse().unwrap();

        {
            let node = RaftNode::new(
                NodeId(1),
                "127.0.0.1:17102".to_string(),
                addr,
                Some(dir.path().to_path_buf()),
                fast_config(),
                TestKv::default(),
            )
            .await
            .unwrap();

            node.bootstrap().await.unwrap();
            node.propose(b"SET a 1".to_vec(), Duration::from_secs(2))
                .await
                .unwrap();
            node.shutdown().await;
        }

        // Reopen against the same data dir on a different bind address
        // (the previous listener may still be tearing down). If `config`
        // weren't rebuilt from the replayed log, this node would come back
        // with an empty ClusterConfig, never see itself as a voter, and the
        // election-timeout check would never fire a new election.
        let addr2: SocketAddr = "127.0.0.1:17103".parse().unwrap();
        let node2 = RaftNode::new(
            NodeId(1),
            "127.0.0.1:17103".to_string(),
            addr2,
            Some(dir.path().to_path_buf()),
            fast_config(),
            TestKv::default(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(node2.is_leader().await);

        node2
            .propose(b"SET b 2".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_node_cluster_elects_and_replicates() {
        let dirs = [
            tempfile::tempdir().unwrap(),
            tempfile::tempdir().unwrap(),
            tempfile::tempdir().unwrap(),
        ];
        let addrs = ["127.0.0.1:17201", "127.0.0.1:17202", "127.0.0.1:17203"];

        let mut nodes = Vec::new();
        for (i, addr) in addrs.iter().enumerate() {
            let socket: SocketAddr = addr.parse().unwrap();
            let node = RaftNode::new(
                NodeId((i + 1) as u64),
                addr.to_string(),
                socket,
                Some(dirs[i].path().to_path_buf()),
                fast_config(),
                TestKv::default(),
            )
            .await
            .unwrap();
            nodes.push(node);
        }

        nodes[0].bootstrap().await.unwrap();
        assert!(nodes[0].is_leader().await);

        nodes[0]
            .add_voter(NodeId(2), addrs[1].to_string(), Duration::from_secs(3))
            .await
            .unwrap();
        nodes[0]
            .add_voter(NodeId(3), addrs[2].to_string(), Duration::from_secs(3))
            .await
            .unwrap();

        nodes[0]
            .propose(b"SET x 42".to_vec(), Duration::from_secs(3))
            .await
            .unwrap();

        assert!(nodes[0].is_leader().await);
        assert!(!nodes[1].is_leader().await);
        assert!(!nodes[2].is_leader().await);
    }
}
