//! Simple distributed key-value store using Raft consensus
//!
//! This example demonstrates a real 3-node Raft cluster talking over gRPC:
//! node 1 bootstraps, adds the other two as voters, then proposes a few
//! commands and waits for them to commit.
//!
//! Run with: cargo run --example simple_kv

use kvraft_consensus::{NodeId, RaftConfig, RaftNode, StateMachine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Default)]
struct KvStore {
    data: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

impl StateMachine for KvStore {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        match serde_json::from_slice::<Command>(command) {
            Ok(Command::Set { key, value }) => {
                println!("  [SM] SET {} = {}", key, value);
                self.data.insert(key, value);
                b"OK".to_vec()
            }
            Ok(Command::Delete { key }) => {
                println!("  [SM] DELETE {}", key);
                self.data.remove(&key);
                b"OK".to_vec()
            }
            Err(_) => b"ERROR: invalid command".to_vec(),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(&self.data).unwrap_or_default()
    }

    fn restore(&mut self, snapshot: &[u8]) {
        self.data = serde_json::from_slice(snapshot).unwrap_or_default();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== kvraft Demo ===\n");
    println!("Starting a 3-node Raft cluster over gRPC...\n");

    let addrs = [
        "127.0.0.1:17001",
        "127.0.0.1:17002",
        "127.0.0.1:17003",
    ];

    let config = RaftConfig {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(50),
        ..Default::default()
    };

    let mut nodes = Vec::new();
    for (i, addr) in addrs.iter().enumerate() {
        let bind_addr: SocketAddr = addr.parse()?;
        let node = RaftNode::new(
            NodeId((i + 1) as u64),
            addr.to_string(),
            bind_addr,
            None,
            config.clone(),
            KvStore::default(),
        )
        .await?;
        println!("  - node {} listening on {}", i + 1, addr);
        nodes.push(node);
    }

    println!("\nBootstrapping node 1 and adding the other two as voters...");
    nodes[0].bootstrap().await?;
    nodes[0]
        .add_voter(NodeId(2), addrs[1].to_string(), Duration::from_secs(3))
        .await?;
    nodes[0]
        .add_voter(NodeId(3), addrs[2].to_string(), Duration::from_secs(3))
        .await?;
    println!("  \u{2713} cluster formed, node 1 is leader\n");

    println!("Proposing commands...\n");

    let set_cmd = Command::Set {
        key: "username".to_string(),
        value: "alice".to_string(),
    };
    println!("Command 1: SET username = alice");
    match nodes[0]
        .propose(serde_json::to_vec(&set_cmd)?, Duration::from_secs(2))
        .await
    {
        Ok(_) => println!("  \u{2713} committed\n"),
        Err(e) => println!("  \u{2717} error: {}\n", e),
    }

    let set_cmd2 = Command::Set {
        key: "role".to_string(),
        value: "admin".to_string(),
    };
    println!("Command 2: SET role = admin");
    match nodes[0]
        .propose(serde_json::to_vec(&set_cmd2)?, Duration::from_secs(2))
        .await
    {
        Ok(_) => println!("  \u{2713} committed\n"),
        Err(e) => println!("  \u{2717} error: {}\n", e),
    }

    let del_cmd = Command::Delete {
        key: "username".to_string(),
    };
    println!("Command 3: DELETE username");
    match nodes[0]
        .propose(serde_json::to_vec(&del_cmd)?, Duration::from_secs(2))
        .await
    {
        Ok(_) => println!("  \u{2713} committed\n"),
        Err(e) => println!("  \u{2717} error: {}\n", e),
    }

    println!("Shutting down cluster...");
    for node in &nodes {
        node.shutdown().await;
    }
    println!("  \u{2713} all nodes stopped\n");

    Ok(())
}
