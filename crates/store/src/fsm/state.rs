use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How long a validation row may live; every write sweeps older rows.
pub const VALIDATION_TTL_SECS: i64 = 10 * 60;

/// The complete FSM state — the three replicated relations.
///
/// `BTreeMap` keys give us ordered prefix scans, which is all the
/// `LIKE 'prefix%'` reads of the SQL surface need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsmState {
    /// subject (`*.<base>`) → certificate row.
    pub certs: BTreeMap<String, CertRow>,
    /// `_acme-challenge.` qname → in-flight validation token.
    pub validations: BTreeMap<String, ValidationRow>,
    /// Cache for the HTTPS listener's own certificate material.
    pub autocert: BTreeMap<String, Vec<u8>>,
}

/// One row of the certificate relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRow {
    /// DER CSR as first submitted; never replaced once set.
    pub csr: Vec<u8>,
    /// PEM chain, empty until first issuance.
    pub cert_pem: String,
    /// Leaf NotAfter as unix seconds, 0 until issued.
    pub expiry: i64,
}

/// One row of the validation relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRow {
    pub value: String,
    /// Unix seconds at write time, used for the ten-minute sweep.
    pub created: i64,
}

impl FsmState {
    pub fn cert(&self, subject: &str) -> Option<&CertRow> {
        self.certs.get(subject)
    }

    /// All cert rows whose subject starts with `prefix`, in key order.
    pub fn certs_with_prefix(&self, prefix: &str) -> Vec<(String, CertRow)> {
        self.certs
            .range(prefix.to_string()..)
            .take_while(|(subject, _)| subject.starts_with(prefix))
            .map(|(subject, row)| (subject.clone(), row.clone()))
            .collect()
    }

    pub fn validation(&self, qname: &str) -> Option<&ValidationRow> {
        self.validations.get(qname)
    }

    pub fn autocert(&self, key: &str) -> Option<&Vec<u8>> {
        self.autocert.get(key)
    }
}
