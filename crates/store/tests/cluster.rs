//! Multi-node replication tests over the in-process transport.

use std::sync::Arc;
use std::time::Duration;

use pinhost_store::fsm::Command;
use pinhost_store::network::TestRouter;
use pinhost_store::{ReplStore, StateStore};

async fn boot_node(router: &TestRouter, id: u64) -> Arc<ReplStore> {
    let config = Arc::new(
        openraft::Config {
            heartbeat_interval: 100,
            election_timeout_min: 200,
            election_timeout_max: 400,
            ..Default::default()
        }
        .validate()
        .unwrap(),
    );
    let addr = format!("127.0.0.1:{}", 9000 + id);
    let store = Arc::new(ReplStore::new(id, &addr, config, router.clone()).await.unwrap());
    router.add_node(id, store.raft().clone());
    store
}

/// Wait until `predicate` holds, or panic after ~5 seconds.
async fn poll(mut predicate: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn three_node_cluster(router: &TestRouter) -> Vec<Arc<ReplStore>> {
    let n1 = boot_node(router, 1).await;
    let n2 = boot_node(router, 2).await;
    let n3 = boot_node(router, 3).await;

    n1.initialize().await.unwrap();
    n1.raft().add_learner(2, openraft::BasicNode::new(n2.addr()), true).await.unwrap();
    n1.raft().add_learner(3, openraft::BasicNode::new(n3.addr()), true).await.unwrap();
    n1.promote_voters([1, 2, 3]).await.unwrap();

    vec![n1, n2, n3]
}

#[tokio::test]
async fn writes_replicate_to_all_nodes() {
    let router = TestRouter::new();
    let nodes = three_node_cluster(&router).await;

    nodes[0]
        .propose(Command::CertInsert { subject: "*.a.b.zone".into(), csr: vec![1, 2, 3] })
        .await
        .unwrap();

    for node in &nodes {
        let node = Arc::clone(node);
        poll(
            move || node.read_local(|fsm| fsm.cert("*.a.b.zone").is_some()),
            "cert row on every node",
        )
        .await;
    }
}

#[tokio::test]
async fn cert_insert_stays_idempotent_across_nodes() {
    let router = TestRouter::new();
    let nodes = three_node_cluster(&router).await;

    nodes[0]
        .propose(Command::CertInsert { subject: "*.k.p.zone".into(), csr: vec![1] })
        .await
        .unwrap();
    nodes[0]
        .propose(Command::CertInsert { subject: "*.k.p.zone".into(), csr: vec![2] })
        .await
        .unwrap();

    let csr = nodes[0].read_local(|fsm| fsm.cert("*.k.p.zone").unwrap().csr.clone());
    assert_eq!(csr, vec![1]);
}

#[tokio::test]
async fn linearizable_read_on_leader_sees_own_write() {
    let router = TestRouter::new();
    let nodes = three_node_cluster(&router).await;
    let leader = Arc::clone(&nodes[0]);

    leader.validation_set("_acme-challenge.x.", "tok").await.unwrap();
    // StateStore validation reads are local-state; the leader just wrote,
    // so its own FSM must already hold the row.
    assert_eq!(
        leader.validation_get("_acme-challenge.x.").await.unwrap().as_deref(),
        Some("tok")
    );
}

#[tokio::test]
async fn validation_rows_gc_on_followers_too() {
    let router = TestRouter::new();
    let nodes = three_node_cluster(&router).await;

    // Two writes: the second carries a timestamp 11 minutes later, so the
    // first row must be swept everywhere once replication catches up.
    nodes[0]
        .propose(Command::ValidationSet { qname: "_acme-challenge.old.".into(), value: "a".into(), now: 1_000 })
        .await
        .unwrap();
    nodes[0]
        .propose(Command::ValidationSet {
            qname: "_acme-challenge.new.".into(),
            value: "b".into(),
            now: 1_000 + 11 * 60,
        })
        .await
        .unwrap();

    for node in &nodes {
        let node = Arc::clone(node);
        poll(
            move || {
                node.read_local(|fsm| {
                    fsm.validation("_acme-challenge.old.").is_none()
                        && fsm.validation("_acme-challenge.new.").is_some()
                })
            },
            "stale validation row swept on every node",
        )
        .await;
    }
}

#[tokio::test]
async fn follower_loss_keeps_quorum_writes_working() {
    let router = TestRouter::new();
    let nodes = three_node_cluster(&router).await;

    // Drop one follower; two of three voters still form a quorum.
    router.remove_node(3);

    nodes[0]
        .propose(Command::AutocertPut { key: "acme_account".into(), data: vec![7] })
        .await
        .unwrap();

    let n2 = Arc::clone(&nodes[1]);
    poll(
        move || n2.read_local(|fsm| fsm.autocert("acme_account").is_some()),
        "write replicated with a follower down",
    )
    .await;
}

#[tokio::test]
async fn shutdown_handover_moves_leadership() {
    let router = TestRouter::new();
    let nodes = three_node_cluster(&router).await;

    let leader = Arc::clone(&nodes[0]);
    poll(move || leader.is_leader(), "node 1 leading").await;

    nodes[0].shutdown_handover(Duration::from_secs(5)).await;
    router.remove_node(1);

    // One of the survivors must take over and accept writes.
    let n2 = Arc::clone(&nodes[1]);
    let n3 = Arc::clone(&nodes[2]);
    poll(
        move || n2.is_leader() || n3.is_leader(),
        "a surviving node elected leader",
    )
    .await;
}
