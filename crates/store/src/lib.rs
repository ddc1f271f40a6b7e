#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Replicated state store.
//!
//! All cross-node state — certificate rows, in-flight ACME validation
//! records, and the HTTPS listener's own certificate material — lives in a
//! raft-replicated FSM. Writes go through consensus; reads take a
//! linearizable read barrier on the leader (followers forward both). The
//! rest of the system only sees the [`StateStore`] capability, so a
//! single-process [`LocalStore`] and the clustered [`ReplStore`] are
//! interchangeable.

mod config;
pub mod error;
pub mod fsm;
pub mod hygiene;
mod log_store;
pub mod network;
pub mod ops;
pub mod peers;
pub mod snapshot;
mod surface;

pub use config::{Raft, TypeConfig};
pub use error::{Result, StoreError};
pub use surface::{LocalStore, StateStore};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{CheckIsLeaderError, ClientWriteError};
use openraft::{BasicNode, ChangeMembers, Config, RaftNetworkFactory};
use sha2::{Digest, Sha256};

use crate::fsm::{Command, FsmState, Response, StateMachineStore};
use crate::log_store::LogStore;
use crate::network::http::{ReadQuery, ReadReply, RpcContext, RpcResponse};

/// Raft timing used by real deployments.
pub fn default_raft_config() -> Arc<Config> {
    Arc::new(Config {
        heartbeat_interval: 1000,
        election_timeout_min: 3000,
        election_timeout_max: 5000,
        snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(5000),
        max_in_snapshot_log_to_keep: 1000,
        ..Config::default()
    })
}

/// Derive a stable node ID from the transport address.
pub fn node_id_for(addr: &str) -> u64 {
    let digest = Sha256::digest(addr.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) | 1
}

/// Handle on the replicated store: one raft node plus the client helpers
/// for leader forwarding.
pub struct ReplStore {
    id: u64,
    addr: String,
    raft: Raft,
    sm: StateMachineStore,
    http: reqwest::Client,
}

impl ReplStore {
    /// In-memory node (no persistence) over any transport. Used for tests.
    pub async fn new<N: RaftNetworkFactory<TypeConfig>>(
        id: u64,
        addr: &str,
        raft_config: Arc<Config>,
        network: N,
    ) -> Result<Self> {
        let log_store = LogStore::new();
        let sm = StateMachineStore::new();
        let raft =
            openraft::Raft::<TypeConfig>::new(id, raft_config, network, log_store, sm.clone())
                .await
                .map_err(|e: openraft::error::Fatal<u64>| StoreError::Raft(e.to_string()))?;
        Ok(Self { id, addr: addr.to_string(), raft, sm, http: http_client() })
    }

    /// Open a disk-backed node, restoring the last snapshot if one exists.
    pub async fn open<N: RaftNetworkFactory<TypeConfig>>(
        id: u64,
        addr: &str,
        raft_config: Arc<Config>,
        network: N,
        raft_dir: &Path,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(raft_dir).await?;

        let vote = snapshot::disk::read_vote(raft_dir).await?;
        let log_store = LogStore::with_persistence(raft_dir.to_owned(), vote);

        let sm = match snapshot::disk::read_snapshot(raft_dir).await? {
            Some((data, meta)) => {
                let fsm = snapshot::codec::decode(&data)?;
                tracing::info!(
                    snapshot = %meta.snapshot_id,
                    last_log_index = meta.last_log_id.map(|id| id.index).unwrap_or(0),
                    "restored raft snapshot"
                );
                StateMachineStore::from_snapshot(raft_dir.to_owned(), fsm, meta, data)
            }
            None => {
                tracing::info!("no persisted raft snapshot, starting empty");
                StateMachineStore::with_persistence(raft_dir.to_owned())
            }
        };

        let raft =
            openraft::Raft::<TypeConfig>::new(id, raft_config, network, log_store, sm.clone())
                .await
                .map_err(|e: openraft::error::Fatal<u64>| StoreError::Raft(e.to_string()))?;

        Ok(Self { id, addr: addr.to_string(), raft, sm, http: http_client() })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Transport address of this node (`[v6]:9000`).
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    /// RPC context for mounting [`network::http::router`] on the transport
    /// listener.
    pub fn rpc_context(&self) -> RpcContext {
        RpcContext { raft: self.raft.clone(), sm: self.sm.clone() }
    }

    /// Bootstrap a single-node cluster.
    pub async fn initialize(&self) -> Result<()> {
        let mut members = BTreeMap::new();
        members.insert(self.id, BasicNode::new(&self.addr));
        self.raft.initialize(members).await.map_err(|e| StoreError::Raft(e.to_string()))
    }

    /// Whether this raft has any membership at all (fresh vs. restored).
    pub fn is_initialized(&self) -> bool {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.membership_config.membership().nodes().count() > 0
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.id)
    }

    /// Transport base URL of the current leader, if one is known.
    pub fn leader_url(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        let node = metrics.membership_config.membership().get_node(&leader)?.clone();
        Some(format!("http://{}", node.addr))
    }

    /// Form or join the cluster.
    ///
    /// A restored node already has membership and does nothing. A fresh
    /// node with no peers bootstraps alone; otherwise it asks each peer in
    /// turn to admit it as a learner, retrying until one (the leader)
    /// accepts. Voter promotion is the hygiene pass's job.
    pub async fn form_cluster(&self, peer_addrs: &[String], timeout: Duration) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        if peer_addrs.is_empty() {
            tracing::info!("no peers configured, bootstrapping single-node cluster");
            return self.initialize().await;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let req = network::http::JoinRequest { id: self.id, addr: self.addr.clone() };
        loop {
            for peer in peer_addrs {
                let url = format!("http://{peer}/raft/join");
                match self.http.post(&url).json(&req).send().await {
                    Ok(resp) => match resp.json::<RpcResponse<()>>().await {
                        Ok(RpcResponse::Ok(())) => {
                            tracing::info!(peer = %peer, "joined cluster as learner");
                            return Ok(());
                        }
                        Ok(RpcResponse::Err(msg)) => {
                            tracing::debug!(peer = %peer, "join declined: {msg}");
                        }
                        Err(e) => tracing::debug!(peer = %peer, "join response error: {e}"),
                    },
                    Err(e) => tracing::debug!(peer = %peer, "join request failed: {e}"),
                }
            }
            if self.is_initialized() {
                // The leader may have admitted us via replication already.
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StoreError::Unavailable(
                    "no cluster peer accepted the join request".into(),
                ));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Propose a command, forwarding to the leader when this node is a
    /// follower.
    pub async fn propose(&self, cmd: Command) -> Result<Response> {
        match self.raft.client_write(cmd.clone()).await {
            Ok(result) => Ok(result.data),
            Err(openraft::error::RaftError::APIError(ClientWriteError::ForwardToLeader(fwd))) => {
                let Some(node) = fwd.leader_node else {
                    return Err(StoreError::Unavailable("no leader elected".into()));
                };
                self.forward_to(&format!("http://{}", node.addr), &cmd).await
            }
            Err(e) => Err(StoreError::Raft(e.to_string())),
        }
    }

    async fn forward_to(&self, base_url: &str, cmd: &Command) -> Result<Response> {
        let resp = self
            .http
            .post(format!("{base_url}/raft/forward"))
            .json(cmd)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("leader unreachable: {e}")))?;
        match resp
            .json::<RpcResponse<Response>>()
            .await
            .map_err(|e| StoreError::Unavailable(format!("leader response: {e}")))?
        {
            RpcResponse::Ok(r) => Ok(r),
            RpcResponse::Err(msg) => Err(StoreError::Unavailable(msg)),
        }
    }

    /// Linearizable read: barrier + local FSM on the leader, forwarded to
    /// the leader otherwise.
    pub async fn read(&self, query: ReadQuery) -> Result<ReadReply> {
        match self.raft.ensure_linearizable().await {
            Ok(_) => Ok(self.sm.read_state(|fsm| answer_query(fsm, &query))),
            Err(openraft::error::RaftError::APIError(CheckIsLeaderError::ForwardToLeader(
                fwd,
            ))) => {
                let Some(node) = fwd.leader_node else {
                    return Err(StoreError::Unavailable("no leader elected".into()));
                };
                let resp = self
                    .http
                    .post(format!("http://{}/raft/read", node.addr))
                    .json(&query)
                    .send()
                    .await
                    .map_err(|e| StoreError::Unavailable(format!("leader unreachable: {e}")))?;
                match resp
                    .json::<RpcResponse<ReadReply>>()
                    .await
                    .map_err(|e| StoreError::Unavailable(format!("leader response: {e}")))?
                {
                    RpcResponse::Ok(r) => Ok(r),
                    RpcResponse::Err(msg) => Err(StoreError::Unavailable(msg)),
                }
            }
            Err(e) => Err(StoreError::Raft(e.to_string())),
        }
    }

    /// Read local (possibly stale) FSM state. Used by the DNS backend and
    /// the ops endpoints, where replication lag is acceptable.
    pub fn read_local<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&FsmState) -> T,
    {
        self.sm.read_state(f)
    }

    /// Promote learners to voters.
    pub async fn promote_voters(&self, ids: impl IntoIterator<Item = u64>) -> Result<()> {
        let members: std::collections::BTreeSet<u64> = ids.into_iter().collect();
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(members), false)
            .await
            .map_err(|e| StoreError::Raft(e.to_string()))?;
        Ok(())
    }

    /// Remove nodes from the cluster entirely.
    pub async fn remove_nodes(&self, ids: impl IntoIterator<Item = u64>) -> Result<()> {
        let members: std::collections::BTreeSet<u64> = ids.into_iter().collect();
        self.raft
            .change_membership(ChangeMembers::RemoveNodes(members), false)
            .await
            .map_err(|e| StoreError::Raft(e.to_string()))?;
        Ok(())
    }

    /// Graceful departure: hand leadership to the most caught-up voter,
    /// wait (bounded) for it to take over, then shut raft down.
    pub async fn shutdown_handover(&self, timeout: Duration) {
        if self.is_leader()
            && let Some(successor) = self.pick_successor()
        {
            let metrics = self.raft.metrics().borrow().clone();
            let addr = metrics
                .membership_config
                .membership()
                .get_node(&successor)
                .map(|n| n.addr.clone());
            if let Some(addr) = addr {
                tracing::info!(successor, "transferring leadership before shutdown");
                let url = format!("http://{addr}/raft/elect");
                if let Err(e) = self.http.post(&url).send().await {
                    tracing::warn!("leadership transfer request failed: {e}");
                }
                let handover = async {
                    let mut metrics_rx = self.raft.metrics();
                    loop {
                        {
                            let m = metrics_rx.borrow();
                            if m.current_leader.is_some() && m.current_leader != Some(self.id) {
                                break;
                            }
                        }
                        if metrics_rx.changed().await.is_err() {
                            break;
                        }
                    }
                };
                if tokio::time::timeout(timeout, handover).await.is_err() {
                    tracing::warn!("leadership did not move within the shutdown timeout");
                }
            }
        }

        if let Err(e) = self.raft.shutdown().await {
            tracing::warn!("raft shutdown: {e}");
        }
    }

    /// The voter with the most replicated log, excluding this node.
    fn pick_successor(&self) -> Option<u64> {
        let metrics = self.raft.metrics().borrow().clone();
        let voters: Vec<u64> = metrics
            .membership_config
            .membership()
            .voter_ids()
            .filter(|id| *id != self.id)
            .collect();
        let replication = metrics.replication.unwrap_or_default();
        voters.into_iter().max_by_key(|id| {
            replication.get(id).cloned().flatten().map(|log_id| log_id.index).unwrap_or(0)
        })
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

pub(crate) fn answer_query(fsm: &FsmState, query: &ReadQuery) -> ReadReply {
    match query {
        ReadQuery::CertGet { subject } => ReadReply::Cert(fsm.cert(subject).cloned()),
        ReadQuery::CertsWithPrefix { prefix } => ReadReply::Certs(fsm.certs_with_prefix(prefix)),
        ReadQuery::ValidationGet { qname } => {
            ReadReply::Validation(fsm.validation(qname).map(|row| row.value.clone()))
        }
        ReadQuery::AutocertGet { key } => ReadReply::Autocert(fsm.autocert(key).cloned()),
    }
}
