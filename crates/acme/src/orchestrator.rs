//! DNS-01 issuance orchestration.
//!
//! One straight-line flow per request: cache gate, order, challenge TXT
//! into the validation store, fixed propagation wait, accept, poll,
//! finalize with the client's CSR, persist. The whole thing sits behind an
//! exponential-backoff retry and a ten-minute outer timeout.

use std::sync::Arc;
use std::time::Duration;

use pinhost_store::StateStore;
use tokio::sync::Mutex;

use crate::cache::CertCache;
use crate::client::Client;
use crate::error::{AcmeError, Result};

/// How long the CA gets to see the TXT record before we ask it to look.
const PROPAGATION_WAIT: Duration = Duration::from_secs(10);

/// Tuning for [`Issuer::request_cert`].
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Cached chains with at least this much life left short-circuit the
    /// whole flow.
    pub min_life: Duration,
    /// Order attempts before giving up.
    pub retries: u32,
    /// First inter-attempt delay; doubles each retry.
    pub retry_delay: Duration,
    /// Outer bound on one `request_cert` call.
    pub timeout: Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        IssuerConfig {
            min_life: Duration::from_secs(60 * 24 * 60 * 60),
            retries: 3,
            retry_delay: Duration::from_secs(15),
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// The certificate issuance pipeline.
pub struct Issuer<S> {
    client: Arc<Mutex<Client>>,
    cache: CertCache<S>,
    store: S,
    config: IssuerConfig,
}

impl<S: StateStore> Issuer<S> {
    pub fn new(client: Arc<Mutex<Client>>, store: S, config: IssuerConfig) -> Issuer<S> {
        Issuer { client, cache: CertCache::new(store.clone()), store, config }
    }

    pub fn cache(&self) -> &CertCache<S> {
        &self.cache
    }

    /// Obtain the wildcard chain for `base`, from cache or the CA.
    ///
    /// Retries the full order flow up to the configured attempt count with
    /// a doubling delay, all bounded by the outer timeout.
    pub async fn request_cert(&self, base: &str, csr_der: &[u8]) -> Result<String> {
        let work = async {
            let mut delay = self.config.retry_delay;
            let mut last_err = None;
            for attempt in 0..self.config.retries {
                match self.request_cert_once(base, csr_der).await {
                    Ok(chain) => return Ok(chain),
                    Err(e) => {
                        tracing::warn!(base, attempt, "certificate request failed: {e}");
                        last_err = Some(e);
                    }
                }
                if attempt + 1 < self.config.retries {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
            Err(last_err
                .unwrap_or_else(|| AcmeError::Order("no attempts were made".into())))
        };

        match tokio::time::timeout(self.config.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(AcmeError::Timeout(format!(
                "certificate request for {base} exceeded {:?}",
                self.config.timeout
            ))),
        }
    }

    async fn request_cert_once(&self, base: &str, csr_der: &[u8]) -> Result<String> {
        let subject = format!("*.{base}");

        // Cache gate: a fresh-enough chain ends the request here, which is
        // also what keeps concurrent requests for one base from burning CA
        // rate budget.
        let row = self.cache.get(&subject).await?;
        if !row.cert_pem.is_empty() && row.expiry - unix_now() > self.config.min_life.as_secs() as i64
        {
            return Ok(row.cert_pem);
        }

        let client = self.client.lock().await;

        let (order, order_url) = client.new_order(&[subject.as_str()]).await?;

        for auth_url in &order.authorizations {
            let auth = client.fetch_authorization(auth_url).await?;

            let challenge = auth
                .challenges
                .iter()
                .find(|c| c.kind == "dns-01")
                .ok_or_else(|| {
                    AcmeError::Order(format!("no dns-01 challenge for {}", auth.identifier.value))
                })?;

            let qname = format!("_acme-challenge.{base}.");
            let value = client.dns01_value(&challenge.token);
            self.store.validation_set(&qname, &value).await?;

            // Fixed wait for our own authoritative servers (and any anycast
            // recursors in front of the CA) to converge on the new TXT.
            tokio::time::sleep(PROPAGATION_WAIT).await;

            client.accept_challenge(&challenge.url).await?;
            client.wait_authorization(auth_url).await?;
        }

        let cert_url = client.finalize(&order_url, &order.finalize, csr_der).await?;
        let chain_pem = client.download_certificate(&cert_url).await?;
        drop(client);

        self.cache.put(csr_der, &chain_pem).await?;
        Ok(chain_pem)
    }
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
    use crate::account::AccountKey;
    use pinhost_store::LocalStore;

    const ORIGIN: &str = "tls.example";

    async fn issuer_with(config: IssuerConfig) -> (Issuer<LocalStore>, LocalStore) {
        // Directory fields never dereferenced by the cache-gate paths these
        // tests exercise.
        let client = Client::test_stub(AccountKey::generate().unwrap());
        let store = LocalStore::new();
        (Issuer::new(Arc::new(Mutex::new(client)), store.clone(), config), store)
    }

    fn chain_for(subject: &str, not_after: time::OffsetDateTime) -> String {
        let mut params = rcgen::CertificateParams::new(vec![subject.to_string()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.not_after = not_after;
        let key_pair = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key_pair).unwrap().pem()
    }

    #[tokio::test]
    async fn fresh_cached_chain_short_circuits() {
        let (issuer, _store) = issuer_with(IssuerConfig::default()).await;

        let key = pinhost_pin::generate_key().unwrap();
        let base = issuer.cache().put_key(&key, ORIGIN).await.unwrap();
        let subject = format!("*.{base}");
        let row = issuer.cache().get(&subject).await.unwrap();

        // Chain valid for ~90 days: comfortably above the 60-day MinLife.
        let chain = chain_for(
            &subject,
            time::OffsetDateTime::now_utc() + time::Duration::days(90),
        );
        issuer.cache().put(&row.csr, &chain).await.unwrap();

        let got = issuer.request_cert(&base, &row.csr).await.unwrap();
        assert_eq!(got, chain);
    }

    #[tokio::test]
    async fn stale_chain_attempts_reorder_and_retries() {
        // A nearly-expired chain must not short-circuit; with an
        // unreachable CA the request fails after exhausting retries.
        let config = IssuerConfig {
            retries: 2,
            retry_delay: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
            ..IssuerConfig::default()
        };
        let (issuer, _store) = issuer_with(config).await;

        let key = pinhost_pin::generate_key().unwrap();
        let base = issuer.cache().put_key(&key, ORIGIN).await.unwrap();
        let subject = format!("*.{base}");
        let row = issuer.cache().get(&subject).await.unwrap();

        let chain = chain_for(
            &subject,
            time::OffsetDateTime::now_utc() + time::Duration::days(10),
        );
        issuer.cache().put(&row.csr, &chain).await.unwrap();

        let err = issuer.request_cert(&base, &row.csr).await.unwrap_err();
        assert!(matches!(err, AcmeError::Order(_) | AcmeError::Protocol(_)));
    }

    #[tokio::test]
    async fn outer_timeout_caps_the_retry_loop() {
        let config = IssuerConfig {
            retries: 100,
            retry_delay: Duration::from_secs(60),
            timeout: Duration::from_millis(200),
            ..IssuerConfig::default()
        };
        let (issuer, _store) = issuer_with(config).await;

        let key = pinhost_pin::generate_key().unwrap();
        let base = issuer.cache().put_key(&key, ORIGIN).await.unwrap();
        let row = issuer.cache().get(&format!("*.{base}")).await.unwrap();

        let err = issuer.request_cert(&base, &row.csr).await.unwrap_err();
        assert!(matches!(err, AcmeError::Timeout(_)));
    }
}
