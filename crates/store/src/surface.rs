use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, StoreError};
use crate::fsm::state::CertRow;
use crate::fsm::{apply_command, Command, FsmState, Response};
use crate::network::http::{ReadQuery, ReadReply};
use crate::ReplStore;

/// The capability the rest of the system depends on: linearizable relations
/// with upsert, insert-if-absent, point reads and prefix reads.
///
/// Two implementations exist — the clustered [`ReplStore`] and the
/// single-process [`LocalStore`] — and they must stay drop-in
/// interchangeable.
pub trait StateStore: Clone + Send + Sync + 'static {
    /// Point read of a certificate row.
    fn cert_get(&self, subject: &str) -> impl Future<Output = Result<Option<CertRow>>> + Send;

    /// `INSERT OR IGNORE (subject, csr)` — never touches an existing row.
    fn cert_insert(
        &self,
        subject: &str,
        csr: &[u8],
    ) -> impl Future<Output = Result<()>> + Send;

    /// `INSERT OR REPLACE` the full row after issuance.
    fn cert_upsert(
        &self,
        subject: &str,
        csr: &[u8],
        cert_pem: &str,
        expiry: i64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Range read: all rows whose subject starts with `prefix`.
    fn certs_with_prefix(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<(String, CertRow)>>> + Send;

    /// Upsert a validation token; sweeps rows older than ten minutes.
    fn validation_set(
        &self,
        qname: &str,
        value: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Read a validation token. A miss is `None`, never an error.
    fn validation_get(&self, qname: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    fn autocert_get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    fn autocert_put(&self, key: &str, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    fn autocert_delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn check(resp: Response) -> Result<()> {
    match resp {
        Response::Ok => Ok(()),
        Response::Error(msg) => Err(StoreError::Rejected(msg)),
    }
}

impl StateStore for Arc<ReplStore> {
    async fn cert_get(&self, subject: &str) -> Result<Option<CertRow>> {
        match self.read(ReadQuery::CertGet { subject: subject.to_string() }).await? {
            ReadReply::Cert(row) => Ok(row),
            _ => Err(StoreError::Raft("mismatched read reply".into())),
        }
    }

    async fn cert_insert(&self, subject: &str, csr: &[u8]) -> Result<()> {
        check(
            self.propose(Command::CertInsert {
                subject: subject.to_string(),
                csr: csr.to_vec(),
            })
            .await?,
        )
    }

    async fn cert_upsert(
        &self,
        subject: &str,
        csr: &[u8],
        cert_pem: &str,
        expiry: i64,
    ) -> Result<()> {
        check(
            self.propose(Command::CertUpsert {
                subject: subject.to_string(),
                csr: csr.to_vec(),
                cert_pem: cert_pem.to_string(),
                expiry,
            })
            .await?,
        )
    }

    async fn certs_with_prefix(&self, prefix: &str) -> Result<Vec<(String, CertRow)>> {
        match self.read(ReadQuery::CertsWithPrefix { prefix: prefix.to_string() }).await? {
            ReadReply::Certs(rows) => Ok(rows),
            _ => Err(StoreError::Raft("mismatched read reply".into())),
        }
    }

    async fn validation_set(&self, qname: &str, value: &str) -> Result<()> {
        check(
            self.propose(Command::ValidationSet {
                qname: qname.to_string(),
                value: value.to_string(),
                now: unix_now(),
            })
            .await?,
        )
    }

    async fn validation_get(&self, qname: &str) -> Result<Option<String>> {
        // DNS answers tolerate replication lag; skip the read barrier and
        // answer from local state.
        Ok(self.read_local(|fsm| fsm.validation(qname).map(|row| row.value.clone())))
    }

    async fn autocert_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.read(ReadQuery::AutocertGet { key: key.to_string() }).await? {
            ReadReply::Autocert(data) => Ok(data),
            _ => Err(StoreError::Raft("mismatched read reply".into())),
        }
    }

    async fn autocert_put(&self, key: &str, data: &[u8]) -> Result<()> {
        check(
            self.propose(Command::AutocertPut { key: key.to_string(), data: data.to_vec() })
                .await?,
        )
    }

    async fn autocert_delete(&self, key: &str) -> Result<()> {
        check(self.propose(Command::AutocertDelete { key: key.to_string() }).await?)
    }
}

/// Single-process implementation of [`StateStore`].
///
/// Same relations, same apply function, no consensus — used by tests and
/// single-node deployments where a cluster would be overhead.
#[derive(Clone, Default)]
pub struct LocalStore {
    state: Arc<RwLock<FsmState>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, cmd: Command) -> Result<()> {
        check(apply_command(&mut self.state.write(), cmd))
    }

    /// Read the relations directly (test assertions).
    pub fn read_state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&FsmState) -> T,
    {
        f(&self.state.read())
    }
}

impl StateStore for LocalStore {
    async fn cert_get(&self, subject: &str) -> Result<Option<CertRow>> {
        Ok(self.state.read().cert(subject).cloned())
    }

    async fn cert_insert(&self, subject: &str, csr: &[u8]) -> Result<()> {
        self.apply(Command::CertInsert { subject: subject.to_string(), csr: csr.to_vec() })
    }

    async fn cert_upsert(
        &self,
        subject: &str,
        csr: &[u8],
        cert_pem: &str,
        expiry: i64,
    ) -> Result<()> {
        self.apply(Command::CertUpsert {
            subject: subject.to_string(),
            csr: csr.to_vec(),
            cert_pem: cert_pem.to_string(),
            expiry,
        })
    }

    async fn certs_with_prefix(&self, prefix: &str) -> Result<Vec<(String, CertRow)>> {
        Ok(self.state.read().certs_with_prefix(prefix))
    }

    async fn validation_set(&self, qname: &str, value: &str) -> Result<()> {
        self.apply(Command::ValidationSet {
            qname: qname.to_string(),
            value: value.to_string(),
            now: unix_now(),
        })
    }

    async fn validation_get(&self, qname: &str) -> Result<Option<String>> {
        Ok(self.state.read().validation(qname).map(|row| row.value.clone()))
    }

    async fn autocert_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().autocert(key).cloned())
    }

    async fn autocert_put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.apply(Command::AutocertPut { key: key.to_string(), data: data.to_vec() })
    }

    async fn autocert_delete(&self, key: &str) -> Result<()> {
        self.apply(Command::AutocertDelete { key: key.to_string() })
    }
}
