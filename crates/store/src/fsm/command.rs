use serde::{Deserialize, Serialize};

/// A write applied to the FSM through raft consensus.
///
/// Each variant corresponds to one of the SQL-flavored statements the rest
/// of the system issues against the shared relations. Anything
/// time-dependent carries its timestamp in the command so that replaying
/// the log on any node produces identical state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// `INSERT OR IGNORE` a certificate row: records the first CSR seen for
    /// a subject, never touching an existing row.
    CertInsert { subject: String, csr: Vec<u8> },

    /// `INSERT OR REPLACE` the full certificate row after issuance.
    CertUpsert { subject: String, csr: Vec<u8>, cert_pem: String, expiry: i64 },

    /// Upsert an ACME validation TXT value; in the same apply, delete every
    /// row created more than ten minutes before `now`.
    ValidationSet { qname: String, value: String, now: i64 },

    /// Upsert a blob in the autocert relation (the HTTPS listener's own
    /// certificate material).
    AutocertPut { key: String, data: Vec<u8> },

    /// Delete an autocert row.
    AutocertDelete { key: String },
}

/// Response from applying a command to the FSM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(String),
}
