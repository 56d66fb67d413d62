//! In-process multi-node integration tests driving `Coordinator` directly,
//! the way `libs/consensus`'s own test module drives multiple `RaftNode`s
//! in-process. These exercise the end-to-end scenarios the Coordinator is
//! responsible for: bootstrap, join, propose, and local reads.

use kvraft_codec::Command;
use kvraft_node::config::NodeConfig;
use kvraft_node::coordinator::Coordinator;
use std::path::PathBuf;
use std::time::Duration;

fn test_config(node_id: u64, raft_port: u16, data_dir: PathBuf, bootstrap: bool) -> NodeConfig {
    NodeConfig {
        node_id,
        raft_port,
        bind_addr: "127.0.0.1".to_string(),
        advertise_addr: format!("127.0.0.1:{raft_port}"),
        ingress_port: 0,
        mgmt_port: 0,
        data_dir,
        bootstrap,
        join_addr: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bootstrap_single_write_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(1, 18101, dir.path().to_path_buf(), true);

    let coordinator = Coordinator::start(&config).await.unwrap();
    assert!(coordinator.is_leader().await);

    let payload = kvraft_codec::encode(&Command::set("hello", "world"));
    assert!(coordinator.propose(payload).await);
    assert_eq!(coordinator.get("hello"), Some("world".to_string()));

    coordinator.shutdown().await;
    drop(coordinator);

    // Restart against the same data dir: the KV file plus replayed log
    // must reconstruct the same state.
    let config2 = test_config(1, 18102, dir.path().to_path_buf(), false);
    let coordinator2 = Coordinator::start(&config2).await.unwrap();
    assert_eq!(coordinator2.get("hello"), Some("world".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_join_and_replicate() {
    let dirs = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];
    let ports = [18201u16, 18202, 18203];

    let config_a = test_config(1, ports[0], dirs[0].path().to_path_buf(), true);
    let a = Coordinator::start(&config_a).await.unwrap();
    assert!(a.is_leader().await);

    let config_b = test_config(2, ports[1], dirs[1].path().to_path_buf(), false);
    let b = Coordinator::start(&config_b).await.unwrap();

    let config_c = test_config(3, ports[2], dirs[2].path().to_path_buf(), false);
    let c = Coordinator::start(&config_c).await.unwrap();

    a.handle_join(2, &format!("127.0.0.1:{}", ports[1]))
        .await
        .unwrap();
    a.handle_join(3, &format!("127.0.0.1:{}", ports[2]))
        .await
        .unwrap();

    let payload = kvraft_codec::encode(&Command::set("k1", "v1"));
    assert!(a.propose(payload).await);

    // Replication is asynchronous past the leader's own commit; give the
    // followers a brief window to catch up before asserting.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(a.get("k1"), Some("v1".to_string()));
    assert_eq!(b.get("k1"), Some("v1".to_string()));
    assert_eq!(c.get("k1"), Some("v1".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(1, 18301, dir.path().to_path_buf(), true);
    let coordinator = Coordinator::start(&config).await.unwrap();

    assert!(
        coordinator
            .propose(kvraft_codec::encode(&Command::set("x", "1")))
            .await
    );
    assert_eq!(coordinator.get("x"), Some("1".to_string()));

    assert!(
        coordinator
            .propose(kvraft_codec::encode(&Command::delete("x")))
            .await
    );
    assert_eq!(coordinator.get("x"), None);

    assert!(
        coordinator
            .propose(kvraft_codec::encode(&Command::delete("x")))
            .await
    );
    assert_eq!(coordinator.get("x"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_rejected_on_non_leader() {
    let dirs = [tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap()];
    let config_a = test_config(1, 18401, dirs[0].path().to_path_buf(), true);
    let a = Coordinator::start(&config_a).await.unwrap();

    let config_b = test_config(2, 18402, dirs[1].path().to_path_buf(), false);
    let b = Coordinator::start(&config_b).await.unwrap();

    // b is not the leader and has no config yet; joining through it must fail.
    assert!(b.handle_join(3, "127.0.0.1:18403").await.is_err());

    // sanity: joining through the real leader still works.
    assert!(a.handle_join(2, "127.0.0.1:18402").await.is_ok());
}
