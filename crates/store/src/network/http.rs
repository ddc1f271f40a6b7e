use std::future::Future;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use openraft::error::{
    NetworkError, RPCError, RaftError, ReplicationClosed, StreamingError, Unreachable,
};
use openraft::network::RPCOption;
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::{BasicNode, RaftNetwork, RaftNetworkFactory};
use serde::{Deserialize, Serialize};

use crate::config::{self, TypeConfig};
use crate::fsm::state::CertRow;
use crate::fsm::{Command, Response, StateMachineStore};

/// HTTP-based raft transport.
///
/// Each node exposes axum routes under `/raft/...` on the cluster port;
/// outbound RPCs go to the address recorded in the peer's `BasicNode`.
#[derive(Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl Default for HttpNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpNetwork {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetwork {
    type Network = HttpNetworkConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        HttpNetworkConnection {
            client: self.client.clone(),
            target,
            base_url: format!("http://{}", node.addr),
        }
    }
}

/// A connection to a single peer, backed by HTTP.
pub struct HttpNetworkConnection {
    client: reqwest::Client,
    target: u64,
    base_url: String,
}

impl HttpNetworkConnection {
    async fn post_rpc<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        rpc: &Req,
    ) -> Result<Resp, Unreachable> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(rpc)
            .send()
            .await
            .map_err(|e| Unreachable::new(&e))?;
        let result: RpcResponse<Resp> = resp.json().await.map_err(|e| Unreachable::new(&e))?;
        match result {
            RpcResponse::Ok(v) => Ok(v),
            RpcResponse::Err(msg) => Err(Unreachable::new(&std::io::Error::other(format!(
                "node {}: {msg}",
                self.target
            )))),
        }
    }
}

impl RaftNetwork<TypeConfig> for HttpNetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.post_rpc("/raft/append", &rpc)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, openraft::error::InstallSnapshotError>>,
    > {
        self.post_rpc("/raft/snapshot-chunk", &rpc)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.post_rpc("/raft/vote", &rpc)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))
    }

    async fn full_snapshot(
        &mut self,
        vote: openraft::Vote<u64>,
        snapshot: config::Snapshot,
        _cancel: impl Future<Output = ReplicationClosed> + Send + 'static,
        _option: RPCOption,
    ) -> Result<SnapshotResponse<u64>, StreamingError<TypeConfig, openraft::error::Fatal<u64>>>
    {
        let data = snapshot.snapshot.into_inner();
        let rpc = FullSnapshotRequest { vote, meta: snapshot.meta, data };
        self.post_rpc("/raft/snapshot", &rpc)
            .await
            .map_err(StreamingError::Unreachable)
    }
}

#[derive(Serialize, Deserialize)]
struct FullSnapshotRequest {
    vote: openraft::Vote<u64>,
    meta: config::SnapshotMeta,
    data: Vec<u8>,
}

/// Join request sent by a fresh node to any existing cluster member.
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: u64,
    pub addr: String,
}

/// A linearizable read forwarded to the leader.
#[derive(Debug, Serialize, Deserialize)]
pub enum ReadQuery {
    CertGet { subject: String },
    CertsWithPrefix { prefix: String },
    ValidationGet { qname: String },
    AutocertGet { key: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ReadReply {
    Cert(Option<CertRow>),
    Certs(Vec<(String, CertRow)>),
    Validation(Option<String>),
    Autocert(Option<Vec<u8>>),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "status", content = "body")]
pub enum RpcResponse<T> {
    #[serde(rename = "ok")]
    Ok(T),
    #[serde(rename = "err")]
    Err(String),
}

/// State shared by the inbound RPC handlers.
#[derive(Clone)]
pub struct RpcContext {
    pub raft: config::Raft,
    pub sm: StateMachineStore,
}

/// Build the axum router that handles inbound cluster RPCs.
///
/// Mounted on the cluster transport listener so peers can reach this node:
/// raft internals plus join, leadership-transfer, and leader-side
/// write/read forwarding.
pub fn router(ctx: RpcContext) -> Router {
    Router::new()
        .route("/raft/append", post(handle_append))
        .route("/raft/vote", post(handle_vote))
        .route("/raft/snapshot", post(handle_snapshot))
        .route("/raft/snapshot-chunk", post(handle_snapshot_chunk))
        .route("/raft/join", post(handle_join))
        .route("/raft/elect", post(handle_elect))
        .route("/raft/forward", post(handle_forward))
        .route("/raft/read", post(handle_read))
        .with_state(ctx)
}

async fn handle_append(
    State(ctx): State<RpcContext>,
    Json(rpc): Json<AppendEntriesRequest<TypeConfig>>,
) -> (StatusCode, Json<RpcResponse<AppendEntriesResponse<u64>>>) {
    match ctx.raft.append_entries(rpc).await {
        Ok(resp) => (StatusCode::OK, Json(RpcResponse::Ok(resp))),
        Err(e) => (StatusCode::OK, Json(RpcResponse::Err(e.to_string()))),
    }
}

async fn handle_vote(
    State(ctx): State<RpcContext>,
    Json(rpc): Json<VoteRequest<u64>>,
) -> (StatusCode, Json<RpcResponse<VoteResponse<u64>>>) {
    match ctx.raft.vote(rpc).await {
        Ok(resp) => (StatusCode::OK, Json(RpcResponse::Ok(resp))),
        Err(e) => (StatusCode::OK, Json(RpcResponse::Err(e.to_string()))),
    }
}

async fn handle_snapshot(
    State(ctx): State<RpcContext>,
    Json(rpc): Json<FullSnapshotRequest>,
) -> (StatusCode, Json<RpcResponse<SnapshotResponse<u64>>>) {
    let snapshot =
        config::Snapshot { meta: rpc.meta, snapshot: Box::new(std::io::Cursor::new(rpc.data)) };
    match ctx.raft.install_full_snapshot(rpc.vote, snapshot).await {
        Ok(resp) => (StatusCode::OK, Json(RpcResponse::Ok(resp))),
        Err(e) => (StatusCode::OK, Json(RpcResponse::Err(e.to_string()))),
    }
}

async fn handle_snapshot_chunk(
    State(ctx): State<RpcContext>,
    Json(rpc): Json<InstallSnapshotRequest<TypeConfig>>,
) -> (StatusCode, Json<RpcResponse<InstallSnapshotResponse<u64>>>) {
    match ctx.raft.install_snapshot(rpc).await {
        Ok(resp) => (StatusCode::OK, Json(RpcResponse::Ok(resp))),
        Err(e) => (StatusCode::OK, Json(RpcResponse::Err(e.to_string()))),
    }
}

/// Admit a new node as a learner. Only succeeds on the leader; joiners try
/// each configured peer until one accepts.
async fn handle_join(
    State(ctx): State<RpcContext>,
    Json(req): Json<JoinRequest>,
) -> (StatusCode, Json<RpcResponse<()>>) {
    match ctx.raft.add_learner(req.id, BasicNode::new(&req.addr), true).await {
        Ok(_) => {
            tracing::info!(id = req.id, addr = %req.addr, "admitted cluster node as learner");
            (StatusCode::OK, Json(RpcResponse::Ok(())))
        }
        Err(e) => (StatusCode::OK, Json(RpcResponse::Err(e.to_string()))),
    }
}

/// Ask this node to start an election. Sent by a departing leader so the
/// cluster has a new leader before the old one closes.
async fn handle_elect(
    State(ctx): State<RpcContext>,
) -> (StatusCode, Json<RpcResponse<()>>) {
    match ctx.raft.trigger().elect().await {
        Ok(()) => (StatusCode::OK, Json(RpcResponse::Ok(()))),
        Err(e) => (StatusCode::OK, Json(RpcResponse::Err(e.to_string()))),
    }
}

/// Apply a write on behalf of a follower.
async fn handle_forward(
    State(ctx): State<RpcContext>,
    Json(cmd): Json<Command>,
) -> (StatusCode, Json<RpcResponse<Response>>) {
    match ctx.raft.client_write(cmd).await {
        Ok(result) => (StatusCode::OK, Json(RpcResponse::Ok(result.data))),
        Err(e) => (StatusCode::OK, Json(RpcResponse::Err(e.to_string()))),
    }
}

/// Serve a linearizable read on behalf of a follower: read barrier first,
/// then answer from the local FSM.
async fn handle_read(
    State(ctx): State<RpcContext>,
    Json(query): Json<ReadQuery>,
) -> (StatusCode, Json<RpcResponse<ReadReply>>) {
    if let Err(e) = ctx.raft.ensure_linearizable().await {
        return (StatusCode::OK, Json(RpcResponse::Err(e.to_string())));
    }
    let reply = ctx.sm.read_state(|fsm| crate::answer_query(fsm, &query));
    (StatusCode::OK, Json(RpcResponse::Ok(reply)))
}
