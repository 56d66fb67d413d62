//! Process glue: wires the KV Store, State Machine and Consensus Engine
//! together, exposes the proposal/read contracts to ingress, and drives the
//! join routine for a node joining an existing cluster.

use crate::config::NodeConfig;
use kvraft_consensus::{NodeId, RaftConfig, RaftNode};
use kvraft_statemachine::KvStateMachine;
use kvraft_store::KvStore;
use std::sync::Arc;
use std::time::Duration;

const PROPOSE_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_INITIAL_DELAY: Duration = Duration::from_secs(2);
const JOIN_RETRY_DELAY: Duration = Duration::from_secs(2);
const JOIN_MAX_ATTEMPTS: u32 = 20;
const JOIN_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Coordinator {
    node: Arc<RaftNode>,
    store: Arc<KvStore>,
    node_id: NodeId,
    advertise_addr: String,
}

impl Coordinator {
    /// Steps 1-5 of the startup sequence: create `DataDir`, construct the
    /// KV Store, the State Machine, and the Consensus Engine, and bootstrap
    /// if requested. Steps 6-9 (management endpoint, join routine, ingress,
    /// shutdown) are driven by the caller -- they are process wiring, not
    /// part of the Coordinator's own state.
    pub async fn start(config: &NodeConfig) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(KvStore::open(config.kv_path()));
        let state_machine = KvStateMachine::new(Arc::clone(&store));

        let node_id = NodeId(config.node_id);
        let node = RaftNode::new(
            node_id,
            config.raft_advertise_addr(),
            config.raft_bind_socket(),
            Some(config.data_dir.clone()),
            RaftConfig::default(),
            state_machine,
        )
        .await?;

        let coordinator = Arc::new(Self {
            node,
            store,
            node_id,
            advertise_addr: config.raft_advertise_addr(),
        });

        if config.bootstrap {
            // "already bootstrapped" on a second call is non-fatal.
            if let Err(e) = coordinator.node.bootstrap().await {
                tracing::warn!("bootstrap skipped: {}", e);
            }
        }

        Ok(coordinator)
    }

    /// Propose an already-encoded command payload. Returns `true` iff the
    /// engine commits it within 5 seconds; any error (timeout, not-leader,
    /// ...) is surfaced as `false`, never propagated as an exception to
    /// ingress.
    pub async fn propose(&self, payload: Vec<u8>) -> bool {
        match self.node.propose(payload, PROPOSE_TIMEOUT).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("proposal failed: {}", e);
                false
            }
        }
    }

    /// Reads bypass Raft entirely and hit the local KV Store -- stale-read
    /// semantics, not linearizable.
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    pub async fn is_leader(&self) -> bool {
        self.node.is_leader().await
    }

    pub async fn leader_addr(&self) -> Option<String> {
        self.node.leader_addr().await
    }

    /// Gracefully stop the consensus engine. Called after ingress has
    /// drained, per the shutdown ordering in the startup sequence.
    pub async fn shutdown(&self) {
        self.node.shutdown().await;
    }

    /// Leader-side join handler: validates both fields non-empty, then
    /// proposes the membership change. Rejecting off-leader explicitly
    /// (rather than relying on library-dependent `AddVoter` behavior) is
    /// this implementation's resolution of the join-to-follower open
    /// question.
    pub async fn handle_join(&self, peer_id: u64, peer_addr: &str) -> Result<(), String> {
        if peer_addr.is_empty() {
            return Err("peerAddress must not be empty".to_string());
        }
        if !self.is_leader().await {
            return Err(format!(
                "not the leader (current leader: {:?})",
                self.leader_addr().await
            ));
        }

        self.node
            .add_voter(NodeId(peer_id), peer_addr.to_string(), PROPOSE_TIMEOUT)
            .await
            .map_err(|e| e.to_string())
    }

    /// Background join routine for a non-leader starting fresh: sleeps,
    /// then retries the management `join` request against `join_addr` up
    /// to `JOIN_MAX_ATTEMPTS` times, each with a 10s deadline. Exhaustion is
    /// logged CRITICAL; the process keeps running.
    pub async fn run_join_routine(self: Arc<Self>, join_addr: String) {
        tokio::time::sleep(JOIN_INITIAL_DELAY).await;

        let client = match reqwest::Client::builder()
            .timeout(JOIN_ATTEMPT_TIMEOUT)
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("CRITICAL: failed to build join HTTP client: {}", e);
                return;
            }
        };

        let url = format!(
            "http://{}/join?peerID={}&peerAddress={}",
            join_addr, self.node_id.0, self.advertise_addr
        );

        for attempt in 1..=JOIN_MAX_ATTEMPTS {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!("joined cluster via {} on attempt {}", join_addr, attempt);
                    return;
                }
                Ok(resp) => {
                    tracing::warn!(
                        "join attempt {} to {} returned {}",
                        attempt,
                        join_addr,
                        resp.status()
                    );
                }
                Err(e) => {
                    tracing::warn!("join attempt {} to {} failed: {}", attempt, join_addr, e);
                }
            }

            if attempt < JOIN_MAX_ATTEMPTS {
                tokio::time::sleep(JOIN_RETRY_DELAY).await;
            }
        }

        tracing::error!(
            "CRITICAL: exhausted {} join attempts against {}; continuing to run unjoined",
            JOIN_MAX_ATTEMPTS,
            join_addr
        );
    }
}
