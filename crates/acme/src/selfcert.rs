//! The HTTPS listener's own certificate for the bare origin.
//!
//! Issued through the same ACME account as client certificates but over
//! http-01 on the :80 listener — the DNS-01 path can't bootstrap the API
//! because the API is what clients use once DNS already works. Key and
//! chain live in the replicated autocert relation so any node can serve.

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use pinhost_store::StateStore;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::leaf_subject_and_expiry;
use crate::challenges::ChallengeStore;
use crate::client::Client;
use crate::error::{AcmeError, Result};

/// Autocert relation keys.
pub const AUTOCERT_KEY: &str = "origin/key.pem";
pub const AUTOCERT_CHAIN: &str = "origin/chain.pem";

/// Renew when less than thirty days remain.
const RENEWAL_WINDOW: i64 = 30 * 24 * 60 * 60;
const CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// The currently-served certificate, swappable under renewal.
#[derive(Clone)]
pub struct SelfCert {
    current: Arc<RwLock<Arc<CertifiedKey>>>,
}

impl SelfCert {
    pub fn current(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.current.read())
    }

    fn replace(&self, key: Arc<CertifiedKey>) {
        *self.current.write() = key;
    }
}

/// Make sure a usable certificate for the bare origin exists, issuing one
/// if the cached material is missing or stale.
pub async fn ensure_self_cert<S: StateStore>(
    client: &Arc<Mutex<Client>>,
    store: &S,
    challenges: &ChallengeStore,
    origin: &str,
) -> Result<SelfCert> {
    let cached_key = store.autocert_get(AUTOCERT_KEY).await?;
    let cached_chain = store.autocert_get(AUTOCERT_CHAIN).await?;

    if let (Some(key), Some(chain)) = (cached_key, cached_chain) {
        let key_pem = String::from_utf8_lossy(&key).to_string();
        let chain_pem = String::from_utf8_lossy(&chain).to_string();
        if let Ok((_, expiry)) = leaf_subject_and_expiry(&chain_pem)
            && expiry - unix_now() > RENEWAL_WINDOW
        {
            let certified = certified_key(&chain_pem, &key_pem)?;
            return Ok(SelfCert { current: Arc::new(RwLock::new(certified)) });
        }
        tracing::info!("cached origin certificate is stale, reissuing");
    }

    let (key_pem, chain_pem) = issue_http01(client, challenges, origin).await?;
    store.autocert_put(AUTOCERT_KEY, key_pem.as_bytes()).await?;
    store.autocert_put(AUTOCERT_CHAIN, chain_pem.as_bytes()).await?;

    let certified = certified_key(&chain_pem, &key_pem)?;
    Ok(SelfCert { current: Arc::new(RwLock::new(certified)) })
}

/// Order a certificate for the bare origin via http-01.
async fn issue_http01(
    client: &Arc<Mutex<Client>>,
    challenges: &ChallengeStore,
    origin: &str,
) -> Result<(String, String)> {
    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| AcmeError::Certificate(format!("origin key generation: {e}")))?;
    let mut params = rcgen::CertificateParams::new(vec![origin.to_string()])
        .map_err(|e| AcmeError::Certificate(format!("origin csr params: {e}")))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| AcmeError::Certificate(format!("origin csr: {e}")))?;
    let csr_der = csr.der().to_vec();

    let client = client.lock().await;
    let (order, order_url) = client.new_order(&[origin]).await?;

    let mut tokens: Vec<String> = Vec::new();
    let result = async {
        for auth_url in &order.authorizations {
            let auth = client.fetch_authorization(auth_url).await?;
            let challenge = auth
                .challenges
                .iter()
                .find(|c| c.kind == "http-01")
                .ok_or_else(|| {
                    AcmeError::Order(format!("no http-01 challenge for {}", auth.identifier.value))
                })?;

            let key_auth = client.key_authorization(&challenge.token);
            challenges.insert(challenge.token.clone(), key_auth);
            tokens.push(challenge.token.clone());

            client.accept_challenge(&challenge.url).await?;
            client.wait_authorization(auth_url).await?;
        }

        let cert_url = client.finalize(&order_url, &order.finalize, &csr_der).await?;
        client.download_certificate(&cert_url).await
    }
    .await;

    for token in &tokens {
        challenges.remove(token);
    }

    let chain_pem = result?;
    tracing::info!(origin, "issued listener certificate via http-01");
    Ok((key_pair.serialize_pem(), chain_pem))
}

/// Renew the origin certificate well before expiry. Checks immediately,
/// then daily; failures are logged and retried next cycle.
pub async fn renewal_loop<S: StateStore>(
    client: Arc<Mutex<Client>>,
    store: S,
    challenges: ChallengeStore,
    origin: String,
    self_cert: SelfCert,
    cancel: CancellationToken,
) {
    loop {
        check_and_renew(&client, &store, &challenges, &origin, &self_cert).await;

        tokio::select! {
            _ = tokio::time::sleep(CHECK_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
    }
}

async fn check_and_renew<S: StateStore>(
    client: &Arc<Mutex<Client>>,
    store: &S,
    challenges: &ChallengeStore,
    origin: &str,
    self_cert: &SelfCert,
) {
    let chain = match store.autocert_get(AUTOCERT_CHAIN).await {
        Ok(Some(chain)) => String::from_utf8_lossy(&chain).to_string(),
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("renewal: failed to read cached chain: {e}");
            return;
        }
    };

    match leaf_subject_and_expiry(&chain) {
        Ok((_, expiry)) if expiry - unix_now() > RENEWAL_WINDOW => return,
        Ok(_) => {}
        Err(e) => tracing::warn!("renewal: cached chain unparseable, reissuing: {e}"),
    }

    tracing::info!(origin, "origin certificate expiring soon, renewing");
    match issue_http01(client, challenges, origin).await {
        Ok((key_pem, chain_pem)) => {
            if let Err(e) = store.autocert_put(AUTOCERT_KEY, key_pem.as_bytes()).await {
                tracing::warn!("renewal: failed to store key: {e}");
                return;
            }
            if let Err(e) = store.autocert_put(AUTOCERT_CHAIN, chain_pem.as_bytes()).await {
                tracing::warn!("renewal: failed to store chain: {e}");
                return;
            }
            match certified_key(&chain_pem, &key_pem) {
                Ok(certified) => {
                    self_cert.replace(certified);
                    tracing::info!(origin, "renewed origin certificate");
                }
                Err(e) => tracing::warn!("renewal: renewed material unusable: {e}"),
            }
        }
        Err(e) => tracing::warn!("renewal: issuance failed, keeping existing cert: {e}"),
    }
}

/// Parse PEM chain + key into a rustls `CertifiedKey`.
pub fn certified_key(chain_pem: &str, key_pem: &str) -> Result<Arc<CertifiedKey>> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(chain_pem.as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AcmeError::Certificate(format!("failed to parse chain PEM: {e}")))?;
    if certs.is_empty() {
        return Err(AcmeError::Certificate("no certificates in PEM".into()));
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
            .map_err(|e| AcmeError::Certificate(format!("failed to parse key PEM: {e}")))?
            .ok_or_else(|| AcmeError::Certificate("no private key in PEM".into()))?;

    let signing_key = any_supported_type(&key)
        .map_err(|e| AcmeError::Certificate(format!("unsupported key type: {e}")))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(subject: &str) -> (String, String) {
        let mut params = rcgen::CertificateParams::new(vec![subject.to_string()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (key_pair.serialize_pem(), cert.pem())
    }

    #[test]
    fn certified_key_round_trip() {
        let (key_pem, chain_pem) = self_signed("tls.example");
        let certified = certified_key(&chain_pem, &key_pem).unwrap();
        assert_eq!(certified.cert.len(), 1);
    }

    #[test]
    fn certified_key_rejects_empty_chain() {
        let (key_pem, _) = self_signed("tls.example");
        assert!(certified_key("", &key_pem).is_err());
    }

    #[tokio::test]
    async fn ensure_uses_fresh_cached_material() {
        use pinhost_store::{LocalStore, StateStore as _};

        let store = LocalStore::new();
        let (key_pem, chain_pem) = self_signed("tls.example");
        store.autocert_put(AUTOCERT_KEY, key_pem.as_bytes()).await.unwrap();
        store.autocert_put(AUTOCERT_CHAIN, chain_pem.as_bytes()).await.unwrap();

        let client = Arc::new(Mutex::new(Client::test_stub(
            crate::account::AccountKey::generate().unwrap(),
        )));
        let challenges = ChallengeStore::new();

        // rcgen self-signed certs default to a long validity, so the cached
        // pair is fresh and no CA round-trip happens.
        let self_cert =
            ensure_self_cert(&client, &store, &challenges, "tls.example").await.unwrap();
        assert_eq!(self_cert.current().cert.len(), 1);
    }
}
