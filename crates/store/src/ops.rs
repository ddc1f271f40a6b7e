//! Internal status/ops HTTP server.
//!
//! Bound to localhost only — these endpoints expose cluster internals and
//! raw relation contents and must never face the public network.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::hygiene;
use crate::ReplStore;

pub const OPS_ADDR: &str = "127.0.0.1:9001";

#[derive(Debug, Serialize)]
struct NodeInfo {
    id: u64,
    addr: String,
    role: &'static str,
    leader: bool,
}

#[derive(Debug, Deserialize)]
struct SqlParams {
    #[serde(default)]
    q: Option<String>,
}

/// Start the ops server. Returns once the listener is bound; serving
/// continues in a background task.
pub async fn serve(store: Arc<ReplStore>) -> Result<()> {
    let router = Router::new()
        .route("/nodes", get(nodes))
        .route("/dump", get(dump))
        .route("/cleanup", post(cleanup).get(cleanup))
        .route("/sql", get(sql_get).post(sql_post))
        .with_state(store);

    let listener = tokio::net::TcpListener::bind(OPS_ADDR)
        .await
        .map_err(|e| StoreError::Unavailable(format!("bind {OPS_ADDR}: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("ops server exited: {e}");
        }
    });
    Ok(())
}

async fn nodes(State(store): State<Arc<ReplStore>>) -> Json<Vec<NodeInfo>> {
    let metrics = store.raft().metrics().borrow().clone();
    let membership = metrics.membership_config.membership().clone();
    let voters: Vec<u64> = membership.voter_ids().collect();
    let list = membership
        .nodes()
        .map(|(id, node)| NodeInfo {
            id: *id,
            addr: node.addr.clone(),
            role: if voters.contains(id) { "voter" } else { "spare" },
            leader: metrics.current_leader == Some(*id),
        })
        .collect();
    Json(list)
}

async fn dump(State(store): State<Arc<ReplStore>>) -> Json<serde_json::Value> {
    let value = store.read_local(|fsm| serde_json::to_value(fsm).unwrap_or_default());
    Json(value)
}

async fn cleanup(State(store): State<Arc<ReplStore>>) -> String {
    let mut out = hygiene::run_pass(&store).await.join("\n");
    out.push_str("\nOK\n");
    out
}

async fn sql_get(
    State(store): State<Arc<ReplStore>>,
    Query(params): Query<SqlParams>,
) -> (StatusCode, String) {
    let Some(query) = params.q else {
        return (StatusCode::BAD_REQUEST, "missing q parameter\n".to_string());
    };
    run_sql(&store, &query)
}

async fn sql_post(State(store): State<Arc<ReplStore>>, body: String) -> (StatusCode, String) {
    run_sql(&store, &body)
}

/// Restricted read-only query surface over the replicated relations.
///
/// Supports exactly the shapes the system itself uses:
/// `SELECT * FROM <certs|validations|autocert>` with an optional
/// `WHERE <pk> = 'x'` or `WHERE <pk> LIKE 'prefix%'`. Results come back as
/// CSV with blob columns reduced to lengths.
fn run_sql(store: &ReplStore, query: &str) -> (StatusCode, String) {
    let Ok(re) = regex::Regex::new(
        r"(?i)^\s*select\s+\*\s+from\s+(\w+)(?:\s+where\s+(\w+)\s*(=|like)\s*'([^']*)')?\s*;?\s*$",
    ) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "query parser unavailable\n".to_string());
    };
    let Some(caps) = re.captures(query) else {
        return (
            StatusCode::BAD_REQUEST,
            "unsupported query; expected SELECT * FROM <table> [WHERE pk = '..'|LIKE '..%']\n"
                .to_string(),
        );
    };

    let table = caps[1].to_lowercase();
    let filter = caps.get(4).map(|m| m.as_str().to_string());
    let is_like = caps.get(3).map(|m| m.as_str().eq_ignore_ascii_case("like")).unwrap_or(false);
    let prefix = filter.as_deref().map(|f| f.trim_end_matches('%').to_string());

    let matches_filter = |key: &str| match (&filter, is_like) {
        (None, _) => true,
        (Some(_), true) => prefix.as_deref().is_some_and(|p| key.starts_with(p)),
        (Some(exact), false) => key == exact,
    };

    let body = store.read_local(|fsm| match table.as_str() {
        "certs" => {
            let mut out = String::from("subject,csr_bytes,cert_bytes,expiry\n");
            for (subject, row) in &fsm.certs {
                if matches_filter(subject) {
                    out.push_str(&format!(
                        "{subject},{},{},{}\n",
                        row.csr.len(),
                        row.cert_pem.len(),
                        row.expiry
                    ));
                }
            }
            Some(out)
        }
        "validations" => {
            let mut out = String::from("qname,value,created\n");
            for (qname, row) in &fsm.validations {
                if matches_filter(qname) {
                    out.push_str(&format!("{qname},{},{}\n", row.value, row.created));
                }
            }
            Some(out)
        }
        "autocert" => {
            let mut out = String::from("key,bytes\n");
            for (key, data) in &fsm.autocert {
                if matches_filter(key) {
                    out.push_str(&format!("{key},{}\n", data.len()));
                }
            }
            Some(out)
        }
        _ => None,
    });

    match body {
        Some(csv) => (StatusCode::OK, csv),
        None => (StatusCode::BAD_REQUEST, format!("unknown table: {table}\n")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TestRouter;

    async fn single_node_store() -> Arc<ReplStore> {
        let router = TestRouter::new();
        let config = Arc::new(
            openraft::Config { enable_heartbeat: false, ..Default::default() }
                .validate()
                .unwrap(),
        );
        let store =
            Arc::new(ReplStore::new(1, "127.0.0.1:9000", config, router.clone()).await.unwrap());
        router.add_node(1, store.raft().clone());
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn sql_rejects_writes() {
        let store = single_node_store().await;
        let (status, _) = run_sql(&store, "DELETE FROM certs");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = run_sql(&store, "INSERT INTO certs VALUES ('a')");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sql_selects_with_prefix() {
        let store = single_node_store().await;
        store
            .propose(crate::fsm::Command::CertInsert { subject: "*.aa.zone".into(), csr: vec![1] })
            .await
            .unwrap();
        store
            .propose(crate::fsm::Command::CertInsert { subject: "*.bb.zone".into(), csr: vec![2] })
            .await
            .unwrap();

        let (status, csv) = run_sql(&store, "SELECT * FROM certs WHERE subject LIKE '*.aa%'");
        assert_eq!(status, StatusCode::OK);
        assert!(csv.contains("*.aa.zone"));
        assert!(!csv.contains("*.bb.zone"));

        let (_, all) = run_sql(&store, "select * from certs;");
        assert!(all.contains("*.aa.zone") && all.contains("*.bb.zone"));
    }

    #[tokio::test]
    async fn sql_unknown_table_rejected() {
        let store = single_node_store().await;
        let (status, _) = run_sql(&store, "SELECT * FROM secrets");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
