//! Cluster membership hygiene.
//!
//! The leader keeps the cluster at exactly three voters: learners are
//! promoted to fill empty voter seats, and learners that stop answering a
//! TCP liveness probe on the transport port are evicted. Eviction never
//! runs on clusters of three or fewer nodes, and every pass starts with a
//! random jitter so concurrently-triggered nodes don't herd.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::ReplStore;

/// Voter seats the leader maintains.
pub const TARGET_VOTERS: usize = 3;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const PASS_INTERVAL: Duration = Duration::from_secs(60);

/// Run hygiene passes until cancelled. Leader-only work; followers wake up,
/// notice, and go back to sleep.
pub async fn hygiene_loop(store: std::sync::Arc<ReplStore>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(PASS_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
        if !store.is_leader() {
            continue;
        }
        for line in run_pass(&store).await {
            tracing::info!("hygiene: {line}");
        }
    }
}

/// One hygiene pass. Returns a human-readable report line per action,
/// which the ops `/cleanup` endpoint also serves.
pub async fn run_pass(store: &ReplStore) -> Vec<String> {
    let mut report = Vec::new();

    if !store.is_leader() {
        report.push("not the leader, nothing to do".to_string());
        return report;
    }

    // Jitter keeps simultaneous passes (timer + manual /cleanup across
    // nodes) from racing membership changes.
    let jitter = rand::thread_rng().gen_range(0..1000);
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let metrics = store.raft().metrics().borrow().clone();
    let membership = metrics.membership_config.membership().clone();
    let nodes: BTreeMap<u64, String> =
        membership.nodes().map(|(id, node)| (*id, node.addr.clone())).collect();
    let voters: Vec<u64> = membership.voter_ids().collect();
    let learners: Vec<u64> =
        nodes.keys().copied().filter(|id| !voters.contains(id)).collect();

    // Fill empty voter seats from the learner pool.
    if voters.len() < TARGET_VOTERS && !learners.is_empty() {
        let promote: Vec<u64> =
            learners.iter().copied().take(TARGET_VOTERS - voters.len()).collect();
        match store.promote_voters(promote.clone()).await {
            Ok(()) => report.push(format!("promoted {promote:?} to voter")),
            Err(e) => report.push(format!("voter promotion failed: {e}")),
        }
    }

    // Evict dead learners, but never shrink a minimal cluster.
    if nodes.len() <= TARGET_VOTERS {
        report.push("cluster at or below three nodes, skipping eviction".to_string());
        return report;
    }

    for id in learners {
        let Some(addr) = nodes.get(&id) else { continue };
        if probe(addr).await {
            continue;
        }
        report.push(format!("node {id} at {addr} failed liveness probe, removing"));
        match store.remove_nodes([id]).await {
            Ok(()) => report.push(format!("node {id} removed")),
            Err(e) => report.push(format!("failed to remove node {id}: {e}")),
        }
    }

    if report.is_empty() {
        report.push("cluster healthy".to_string());
    }
    report
}

/// TCP liveness probe against the transport port.
async fn probe(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_fails_for_unbound_port() {
        // TEST-NET-1 with a port nothing listens on; connect either refuses
        // or times out, both count as dead.
        assert!(!probe("192.0.2.1:9").await);
    }

    #[tokio::test]
    async fn probe_succeeds_for_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(probe(&addr.to_string()).await);
    }
}
