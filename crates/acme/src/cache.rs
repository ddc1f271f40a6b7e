//! Certificate cache over the replicated store.
//!
//! One row per pinned subject. `put_csr` is idempotent and monotone — a
//! row, once created, keeps its CSR, and only `put` ever touches the chain
//! and expiry.

use pinhost_store::fsm::state::CertRow;
use pinhost_store::StateStore;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::{AcmeError, Result};

#[derive(Clone)]
pub struct CertCache<S> {
    store: S,
}

impl<S: StateStore> CertCache<S> {
    pub fn new(store: S) -> CertCache<S> {
        CertCache { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fetch a row. A missing subject comes back as an all-zero row, never
    /// an error.
    pub async fn get(&self, subject: &str) -> Result<CertRow> {
        Ok(self.store.cert_get(subject).await?.unwrap_or(CertRow {
            csr: Vec::new(),
            cert_pem: String::new(),
            expiry: 0,
        }))
    }

    /// Store an issued chain. The subject is taken from the leaf: common
    /// name if set, else the first DNS SAN.
    pub async fn put(&self, csr_der: &[u8], chain_pem: &str) -> Result<()> {
        let (subject, expiry) = leaf_subject_and_expiry(chain_pem)?;
        self.store.cert_upsert(&subject, csr_der, chain_pem, expiry).await?;
        Ok(())
    }

    /// Validate and record a CSR, first writer wins. Returns the base name.
    pub async fn put_csr(&self, csr: &[u8], origin: &str) -> Result<String> {
        let der = pinhost_pin::decode_csr(csr)?;
        let base = pinhost_pin::csr_base_name(&der, origin)?;
        self.store.cert_insert(&format!("*.{base}"), &der).await?;
        Ok(base)
    }

    /// Derive the pin for a private key, generate its CSR, and record it.
    /// Returns the hostname.
    pub async fn put_key(&self, key_pem: &str, origin: &str) -> Result<String> {
        let hostname = pinhost_pin::hostname(key_pem, origin)?;
        let csr_pem = pinhost_pin::generate_csr(key_pem, &hostname)?;
        self.put_csr(csr_pem.as_bytes(), origin).await?;
        Ok(hostname)
    }
}

/// Parse the first certificate of a PEM chain for its subject and expiry.
pub fn leaf_subject_and_expiry(chain_pem: &str) -> Result<(String, i64)> {
    let (_, block) = x509_parser::pem::parse_x509_pem(chain_pem.as_bytes())
        .map_err(|e| AcmeError::Certificate(format!("failed to decode PEM certificate: {e}")))?;
    let (_, cert) = X509Certificate::from_der(&block.contents)
        .map_err(|e| AcmeError::Certificate(format!("failed to parse certificate: {e}")))?;

    let subject = leaf_subject(&cert)?;
    let expiry = cert.validity().not_after.timestamp();
    Ok((subject, expiry))
}

fn leaf_subject(cert: &X509Certificate<'_>) -> Result<String> {
    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .filter(|cn| !cn.is_empty())
    {
        return Ok(cn.to_string());
    }

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                return Ok((*dns).to_string());
            }
        }
    }

    Err(AcmeError::Certificate("no common name or DNS names in certificate".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinhost_store::LocalStore;

    const ORIGIN: &str = "tls.example";

    fn cache() -> CertCache<LocalStore> {
        CertCache::new(LocalStore::new())
    }

    /// Self-signed stand-in for a CA-issued chain covering `subject`.
    fn chain_for(subject: &str) -> String {
        let mut params = rcgen::CertificateParams::new(vec![subject.to_string()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key_pair = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key_pair).unwrap().pem()
    }

    #[tokio::test]
    async fn get_missing_is_zero_row() {
        let row = cache().get("*.nope.tls.example").await.unwrap();
        assert!(row.csr.is_empty());
        assert!(row.cert_pem.is_empty());
        assert_eq!(row.expiry, 0);
    }

    #[tokio::test]
    async fn put_csr_records_and_put_csr_again_keeps_first() {
        let cache = cache();
        let key = pinhost_pin::generate_key().unwrap();
        let hostname = pinhost_pin::hostname(&key, ORIGIN).unwrap();
        let csr = pinhost_pin::generate_csr(&key, &hostname).unwrap();

        let base = cache.put_csr(csr.as_bytes(), ORIGIN).await.unwrap();
        assert_eq!(base, hostname);

        let row = cache.get(&format!("*.{hostname}")).await.unwrap();
        assert!(!row.csr.is_empty());
        let first_csr = row.csr.clone();

        // A new CSR for the same key (same subject) must not replace it.
        let csr2 = pinhost_pin::generate_csr(&key, &hostname).unwrap();
        cache.put_csr(csr2.as_bytes(), ORIGIN).await.unwrap();
        assert_eq!(cache.get(&format!("*.{hostname}")).await.unwrap().csr, first_csr);
    }

    #[tokio::test]
    async fn put_csr_rejects_foreign_names() {
        let cache = cache();
        let key = pinhost_pin::generate_key().unwrap();
        let csr = pinhost_pin::generate_csr(&key, "stolen.example.com").unwrap();
        assert!(matches!(
            cache.put_csr(csr.as_bytes(), ORIGIN).await,
            Err(AcmeError::Pin(_))
        ));
    }

    #[tokio::test]
    async fn put_key_round_trips() {
        let cache = cache();
        let key = pinhost_pin::generate_key().unwrap();
        let hostname = cache.put_key(&key, ORIGIN).await.unwrap();
        let row = cache.get(&format!("*.{hostname}")).await.unwrap();
        assert!(!row.csr.is_empty());
    }

    #[tokio::test]
    async fn put_fills_chain_and_expiry_from_leaf() {
        let cache = cache();
        let key = pinhost_pin::generate_key().unwrap();
        let hostname = cache.put_key(&key, ORIGIN).await.unwrap();
        let subject = format!("*.{hostname}");
        let row = cache.get(&subject).await.unwrap();

        let chain = chain_for(&subject);
        cache.put(&row.csr, &chain).await.unwrap();

        let row = cache.get(&subject).await.unwrap();
        assert_eq!(row.cert_pem, chain);
        assert!(row.expiry > 0);

        // And put_csr afterwards must not clear any of it.
        let csr2 = pinhost_pin::generate_csr(&key, &hostname).unwrap();
        cache.put_csr(csr2.as_bytes(), ORIGIN).await.unwrap();
        let row = cache.get(&subject).await.unwrap();
        assert_eq!(row.cert_pem, chain);
    }

    #[test]
    fn leaf_parse_reports_subject() {
        let chain = chain_for("*.a.b.tls.example");
        let (subject, expiry) = leaf_subject_and_expiry(&chain).unwrap();
        assert_eq!(subject, "*.a.b.tls.example");
        assert!(expiry > 0);
    }

    #[test]
    fn junk_chain_is_an_error() {
        assert!(leaf_subject_and_expiry("not pem").is_err());
    }
}
