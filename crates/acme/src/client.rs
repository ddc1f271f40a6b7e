//! ACME v2 protocol client (RFC 8555).
//!
//! Directory → nonce → signed JWS POSTs. Only what the pipeline needs:
//! account registration (with optional EAB), order creation, authorization
//! handling for dns-01 and http-01, finalization with a caller-supplied
//! CSR, and certificate download.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::account::{AccountKey, EabCredentials};
use crate::error::{AcmeError, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub status: String,
    #[serde(default)]
    pub authorizations: Vec<String>,
    #[serde(default)]
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Authorization {
    pub status: String,
    pub identifier: Identifier,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub token: String,
    pub status: String,
}

/// The protocol client: one per process, shared by the DNS-01 issuance
/// pipeline and the listener's own HTTP-01 self-cert path.
pub struct Client {
    http: reqwest::Client,
    directory: Directory,
    key: AccountKey,
    /// Account URL; set once registered or loaded.
    kid: Option<String>,
}

impl Client {
    /// Fetch the directory and wrap the account key.
    pub async fn new(directory_url: &str, key: AccountKey) -> Result<Client> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AcmeError::Protocol(format!("http client: {e}")))?;

        let resp = http
            .get(directory_url)
            .send()
            .await
            .map_err(|e| AcmeError::Protocol(format!("directory fetch: {e}")))?;
        if !resp.status().is_success() {
            return Err(AcmeError::Protocol(format!(
                "directory returned HTTP {}",
                resp.status()
            )));
        }
        let directory: Directory = resp
            .json()
            .await
            .map_err(|e| AcmeError::Protocol(format!("directory parse: {e}")))?;

        Ok(Client { http, directory, key, kid: None })
    }

    /// Client with an unfetched directory, for exercising pipeline paths
    /// that never reach the CA.
    #[cfg(any(test, feature = "test-util"))]
    pub fn test_stub(key: AccountKey) -> Client {
        Client {
            http: reqwest::Client::new(),
            directory: Directory {
                new_nonce: String::new(),
                new_account: String::new(),
                new_order: String::new(),
            },
            key,
            kid: None,
        }
    }

    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    pub fn set_kid(&mut self, kid: String) {
        self.kid = Some(kid);
    }

    pub fn account_key(&self) -> &AccountKey {
        &self.key
    }

    async fn nonce(&self) -> Result<String> {
        let resp = self
            .http
            .head(&self.directory.new_nonce)
            .send()
            .await
            .map_err(|e| AcmeError::Protocol(format!("nonce request: {e}")))?;
        resp.headers()
            .get("replay-nonce")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Protocol("no replay-nonce header".into()))
    }

    fn jws(&self, url: &str, payload: &str, nonce: &str) -> Result<String> {
        let header = match &self.kid {
            Some(kid) => serde_json::json!({
                "alg": "ES384",
                "kid": kid,
                "nonce": nonce,
                "url": url,
            }),
            None => serde_json::json!({
                "alg": "ES384",
                "jwk": self.key.jwk(),
                "nonce": nonce,
                "url": url,
            }),
        };

        let protected = URL_SAFE_NO_PAD.encode(header.to_string().as_bytes());
        // Empty payload = POST-as-GET.
        let payload_b64 = if payload.is_empty() {
            String::new()
        } else {
            URL_SAFE_NO_PAD.encode(payload.as_bytes())
        };

        let signature = self.key.sign(format!("{protected}.{payload_b64}").as_bytes())?;
        Ok(serde_json::json!({
            "protected": protected,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature),
        })
        .to_string())
    }

    /// JWS-signed POST; returns the response for the caller to interpret.
    async fn post(&self, url: &str, payload: &str) -> Result<reqwest::Response> {
        let nonce = self.nonce().await?;
        let body = self.jws(url, payload, &nonce)?;
        self.http
            .post(url)
            .header("Content-Type", "application/jose+json")
            .body(body)
            .send()
            .await
            .map_err(|e| AcmeError::Protocol(format!("POST {url}: {e}")))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        payload: &str,
        what: &str,
    ) -> Result<T> {
        let resp = self.post(url, payload).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AcmeError::Protocol(format!("{what} failed (HTTP {status}): {body}")));
        }
        resp.json().await.map_err(|e| AcmeError::Protocol(format!("{what} parse: {e}")))
    }

    /// Register the account (terms accepted), returning the KID.
    ///
    /// `only_return_existing` semantics come for free: the CA returns the
    /// existing account URL for a known key.
    pub async fn register(
        &mut self,
        contact: Option<&str>,
        eab: Option<&EabCredentials>,
    ) -> Result<String> {
        let mut payload = serde_json::json!({
            "termsOfServiceAgreed": true,
        });
        if let Some(contact) = contact {
            payload["contact"] = serde_json::json!([contact]);
        }
        if let Some(eab) = eab {
            payload["externalAccountBinding"] =
                eab.binding_jws(&self.key.jwk(), &self.directory.new_account)?;
        }

        let resp = self.post(&self.directory.new_account, &payload.to_string()).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AcmeError::Account(format!(
                "registration failed (HTTP {status}): {body}"
            )));
        }
        let kid = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Account("no Location header on registration".into()))?;

        tracing::info!(kid = %kid, "acme account registered");
        self.kid = Some(kid.clone());
        Ok(kid)
    }

    /// Reconcile a loaded account with the CA (POST-as-GET to the KID).
    pub async fn fetch_account(&self) -> Result<serde_json::Value> {
        let kid = self.kid.as_deref().ok_or_else(|| AcmeError::Account("no KID set".into()))?;
        self.post_json(kid, "", "account fetch").await
    }

    /// Open an order for the given identifiers. Returns the order and its
    /// URL for polling.
    pub async fn new_order(&self, identifiers: &[&str]) -> Result<(Order, String)> {
        let ids: Vec<serde_json::Value> = identifiers
            .iter()
            .map(|name| serde_json::json!({"type": "dns", "value": name}))
            .collect();
        let payload = serde_json::json!({ "identifiers": ids }).to_string();

        let resp = self.post(&self.directory.new_order, &payload).await?;
        let status = resp.status();
        let order_url = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AcmeError::Order(format!("order creation (HTTP {status}): {body}")));
        }
        let order: Order =
            resp.json().await.map_err(|e| AcmeError::Order(format!("order parse: {e}")))?;
        Ok((order, order_url))
    }

    pub async fn fetch_authorization(&self, auth_url: &str) -> Result<Authorization> {
        self.post_json(auth_url, "", "authorization fetch").await
    }

    /// The TXT value for a dns-01 challenge:
    /// `b64url(sha256(token.thumbprint))`.
    pub fn dns01_value(&self, token: &str) -> String {
        let key_auth = format!("{token}.{}", self.key.jwk_thumbprint());
        URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth.as_bytes()))
    }

    /// The full key authorization served for an http-01 challenge.
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.key.jwk_thumbprint())
    }

    /// Tell the CA the challenge is ready to validate.
    pub async fn accept_challenge(&self, challenge_url: &str) -> Result<()> {
        let resp = self.post(challenge_url, "{}").await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AcmeError::Order(format!(
                "challenge accept (HTTP {status}): {body}"
            )));
        }
        Ok(())
    }

    /// Poll an authorization until it leaves the pending states.
    pub async fn wait_authorization(&self, auth_url: &str) -> Result<()> {
        for _ in 0..POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let auth: Authorization = match self.post_json(auth_url, "", "authorization poll").await
            {
                Ok(a) => a,
                Err(e) => {
                    tracing::debug!("authorization poll error, retrying: {e}");
                    continue;
                }
            };
            match auth.status.as_str() {
                "valid" => return Ok(()),
                "invalid" | "deactivated" | "expired" | "revoked" => {
                    return Err(AcmeError::Order(format!(
                        "authorization for {} became {}",
                        auth.identifier.value, auth.status
                    )));
                }
                _ => {}
            }
        }
        Err(AcmeError::Timeout(format!("authorization {auth_url} still pending")))
    }

    /// Submit the caller's CSR to the finalize URL, then poll the order
    /// until the certificate URL appears.
    pub async fn finalize(&self, order_url: &str, finalize_url: &str, csr_der: &[u8]) -> Result<String> {
        let payload =
            serde_json::json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) }).to_string();
        let order: Order = self.post_json(finalize_url, &payload, "finalize").await?;
        if let Some(cert_url) = order.certificate {
            return Ok(cert_url);
        }

        for _ in 0..POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let order: Order = match self.post_json(order_url, "", "order poll").await {
                Ok(o) => o,
                Err(e) => {
                    tracing::debug!("order poll error, retrying: {e}");
                    continue;
                }
            };
            match order.status.as_str() {
                "valid" => {
                    if let Some(cert_url) = order.certificate {
                        return Ok(cert_url);
                    }
                }
                "invalid" => return Err(AcmeError::Order("order became invalid".into())),
                _ => {}
            }
        }
        Err(AcmeError::Timeout(format!("order {order_url} never produced a certificate")))
    }

    /// Download the issued chain as PEM.
    pub async fn download_certificate(&self, cert_url: &str) -> Result<String> {
        let resp = self.post(cert_url, "").await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AcmeError::Order(format!(
                "certificate download (HTTP {status}): {body}"
            )));
        }
        resp.text()
            .await
            .map_err(|e| AcmeError::Order(format!("certificate download body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountKey;

    #[test]
    fn directory_parses_known_fields() {
        let dir: Directory = serde_json::from_str(
            r#"{
                "newNonce": "https://ca.example/nonce",
                "newAccount": "https://ca.example/account",
                "newOrder": "https://ca.example/order",
                "revokeCert": "https://ca.example/revoke"
            }"#,
        )
        .unwrap();
        assert_eq!(dir.new_order, "https://ca.example/order");
    }

    #[test]
    fn order_parses_without_certificate() {
        let order: Order = serde_json::from_str(
            r#"{"status":"pending","authorizations":["https://ca.example/authz/1"],"finalize":"https://ca.example/finalize/1"}"#,
        )
        .unwrap();
        assert_eq!(order.status, "pending");
        assert!(order.certificate.is_none());
    }

    #[test]
    fn challenge_parses() {
        let challenge: Challenge = serde_json::from_str(
            r#"{"type":"dns-01","url":"https://ca.example/chall/1","token":"tok","status":"pending"}"#,
        )
        .unwrap();
        assert_eq!(challenge.kind, "dns-01");
        assert_eq!(challenge.token, "tok");
    }

    #[test]
    fn dns01_value_is_digest_of_key_authorization() {
        let key = AccountKey::generate().unwrap();
        let client = Client::test_stub(key);

        let key_auth = client.key_authorization("tok");
        assert!(key_auth.starts_with("tok."));

        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth.as_bytes()));
        assert_eq!(client.dns01_value("tok"), expected);
        // 32-byte digest → 43 chars, no padding.
        assert_eq!(client.dns01_value("tok").len(), 43);
    }

    #[test]
    fn jws_header_switches_from_jwk_to_kid() {
        let key = AccountKey::generate().unwrap();
        let mut client = Client::test_stub(key);

        let jws = client.jws("https://ca.example/new-account", "{}", "n1").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&jws).unwrap();
        let header: serde_json::Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(parsed["protected"].as_str().unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(header["alg"], "ES384");
        assert!(header["jwk"].is_object());
        assert!(header.get("kid").is_none());

        client.set_kid("https://ca.example/acct/1".to_string());
        let jws = client.jws("https://ca.example/order", "{}", "n2").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&jws).unwrap();
        let header: serde_json::Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(parsed["protected"].as_str().unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(header["kid"], "https://ca.example/acct/1");
        assert!(header.get("jwk").is_none());
    }

    #[test]
    fn post_as_get_has_empty_payload() {
        let key = AccountKey::generate().unwrap();
        let client = Client::test_stub(key);
        let jws = client.jws("https://ca.example/authz", "", "n3").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&jws).unwrap();
        assert_eq!(parsed["payload"], "");
    }
}
