//! Process configuration: parsed from arguments with environment-variable
//! fallback, mirroring the consensus crate's existing `clap` pin.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "kvraft-node", about = "A Raft-replicated key-value store node")]
pub struct NodeConfig {
    /// Stable cluster identity; must be unique per node.
    #[arg(long, env = "KVRAFT_NODE_ID")]
    pub node_id: u64,

    /// TCP port for the Raft transport.
    #[arg(long, env = "KVRAFT_RAFT_PORT", default_value_t = 7000)]
    pub raft_port: u16,

    /// Interface the Raft transport listens on. Typically a wildcard.
    #[arg(long, env = "KVRAFT_BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// `host:raft_port` peers dial to reach this node. Must not be a
    /// wildcard -- validated fatally at startup.
    #[arg(long, env = "KVRAFT_ADVERTISE_ADDR")]
    pub advertise_addr: String,

    /// Port for client ingress (HTTP).
    #[arg(long, env = "KVRAFT_INGRESS_PORT", default_value_t = 8080)]
    pub ingress_port: u16,

    /// Port for the cluster-management endpoint.
    #[arg(long, env = "KVRAFT_MGMT_PORT", default_value_t = 8090)]
    pub mgmt_port: u16,

    /// Directory for the Raft log/stable store and KV persistence.
    #[arg(long, env = "KVRAFT_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Declares this node the sole voter of a fresh cluster. Exactly one
    /// node of a new cluster sets this true.
    #[arg(long, env = "KVRAFT_BOOTSTRAP", default_value_t = false)]
    pub bootstrap: bool,

    /// `host:mgmt_port` of an existing leader; causes this node to try to
    /// join that cluster instead of bootstrapping.
    #[arg(long, env = "KVRAFT_JOIN_ADDR")]
    pub join_addr: Option<String>,
}

impl NodeConfig {
    pub fn raft_advertise_addr(&self) -> String {
        // advertise_addr already carries host:raft_port per the option table.
        self.advertise_addr.clone()
    }

    pub fn raft_bind_socket(&self) -> std::net::SocketAddr {
        format!("{}:{}", self.bind_addr, self.raft_port)
            .parse()
            .expect("bind_addr/raft_port must form a valid socket address")
    }

    pub fn kv_path(&self) -> PathBuf {
        self.data_dir.join("kv.db")
    }
}
