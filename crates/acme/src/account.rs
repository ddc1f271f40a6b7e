//! ACME account key and its on-disk form.
//!
//! One account per cluster, ECDSA P-384. The file is a PKCS#8 `PRIVATE
//! KEY` PEM block followed by the account KID URL on its own line, mode
//! 0600 — readable by any ACME tooling an operator might point at it.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P384_SHA384_FIXED_SIGNING};
use sha2::{Digest, Sha256};

use crate::error::{AcmeError, Result};

/// P-384 coordinate width in bytes.
const COORD_LEN: usize = 48;

/// The account signing key (ES384).
pub struct AccountKey {
    key_pair: EcdsaKeyPair,
    pkcs8_der: Vec<u8>,
}

impl AccountKey {
    /// Generate a fresh P-384 key pair.
    pub fn generate() -> Result<AccountKey> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, &rng)
            .map_err(|e| AcmeError::Account(format!("failed to generate account key: {e}")))?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    /// Load from PKCS#8 DER bytes.
    pub fn from_pkcs8(der: &[u8]) -> Result<AccountKey> {
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, der, &rng)
            .map_err(|e| AcmeError::Account(format!("failed to parse account key: {e}")))?;
        Ok(AccountKey { key_pair, pkcs8_der: der.to_vec() })
    }

    /// The JWK for `jwk`-authenticated requests (newAccount).
    pub fn jwk(&self) -> serde_json::Value {
        let (x, y) = self.coordinates();
        serde_json::json!({
            "kty": "EC",
            "crv": "P-384",
            "x": URL_SAFE_NO_PAD.encode(x),
            "y": URL_SAFE_NO_PAD.encode(y),
        })
    }

    /// RFC 7638 thumbprint: SHA-256 over the required JWK members in
    /// lexicographic order.
    pub fn jwk_thumbprint(&self) -> String {
        let (x, y) = self.coordinates();
        let jwk = format!(
            r#"{{"crv":"P-384","kty":"EC","x":"{}","y":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(x),
            URL_SAFE_NO_PAD.encode(y),
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(jwk.as_bytes()))
    }

    fn coordinates(&self) -> (&[u8], &[u8]) {
        // Uncompressed point: 0x04 || x || y.
        let public_key = self.key_pair.public_key().as_ref();
        (&public_key[1..1 + COORD_LEN], &public_key[1 + COORD_LEN..1 + 2 * COORD_LEN])
    }

    /// Sign a JWS signing input; fixed-width (r || s) form.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        let sig = self
            .key_pair
            .sign(&rng, data)
            .map_err(|e| AcmeError::Account(format!("signing failed: {e}")))?;
        Ok(sig.as_ref().to_vec())
    }

    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_der
    }
}

/// The persisted account: key plus the CA-assigned KID URL.
pub struct AccountFile {
    pub key: AccountKey,
    pub kid: String,
}

impl AccountFile {
    /// Load the account file, or `None` if it doesn't exist yet.
    pub fn load(path: &Path) -> Result<Option<AccountFile>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AcmeError::Account(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let block = pem::parse(&contents)
            .map_err(|e| AcmeError::Account(format!("bad account file: {e}")))?;
        if block.tag() != "PRIVATE KEY" {
            return Err(AcmeError::Account(format!(
                "unexpected PEM block {:?} in account file",
                block.tag()
            )));
        }
        let key = AccountKey::from_pkcs8(block.contents())?;

        let kid = contents
            .rsplit_once("-----END PRIVATE KEY-----")
            .map(|(_, rest)| rest.trim().to_string())
            .unwrap_or_default();
        if kid.is_empty() {
            return Err(AcmeError::Account("no KID line in account file".into()));
        }

        Ok(Some(AccountFile { key, kid }))
    }

    /// Write key + KID, mode 0600.
    pub fn save(&self, path: &Path) -> Result<()> {
        let block = pem::Pem::new("PRIVATE KEY", self.key.pkcs8_der().to_vec());
        let mut contents = pem::encode(&block);
        contents.push_str(&self.kid);
        contents.push('\n');

        std::fs::write(path, contents)
            .map_err(|e| AcmeError::Account(format!("failed to write {}: {e}", path.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| AcmeError::Account(format!("failed to chmod account file: {e}")))?;
        }
        Ok(())
    }
}

/// External Account Binding credentials, from a two-line file: the key ID,
/// then the raw-base64url HMAC key.
#[derive(Debug, Clone)]
pub struct EabCredentials {
    pub key_id: String,
    pub hmac_key: Vec<u8>,
}

impl EabCredentials {
    /// Load the EAB file, or `None` if it doesn't exist.
    pub fn load(path: &Path) -> Result<Option<EabCredentials>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AcmeError::Account(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        Self::parse(&contents).map(Some)
    }

    pub fn parse(contents: &str) -> Result<EabCredentials> {
        let mut lines = contents.lines();
        let key_id = lines.next().unwrap_or_default().trim().to_string();
        let hmac_b64 = lines.next().unwrap_or_default().trim().to_string();
        if key_id.is_empty() || hmac_b64.is_empty() {
            return Err(AcmeError::Account(
                "EAB file must contain two lines (key ID, HMAC key)".into(),
            ));
        }
        let hmac_key = URL_SAFE_NO_PAD
            .decode(&hmac_b64)
            .map_err(|e| AcmeError::Account(format!("failed to decode EAB HMAC key: {e}")))?;
        Ok(EabCredentials { key_id, hmac_key })
    }

    /// The inner `externalAccountBinding` JWS binding `account_jwk` to this
    /// pre-authorized key, signed HS256.
    pub fn binding_jws(
        &self,
        account_jwk: &serde_json::Value,
        new_account_url: &str,
    ) -> Result<serde_json::Value> {
        let protected = serde_json::json!({
            "alg": "HS256",
            "kid": self.key_id,
            "url": new_account_url,
        });
        let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string().as_bytes());
        let payload_b64 = URL_SAFE_NO_PAD.encode(account_jwk.to_string().as_bytes());

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.hmac_key)
            .map_err(|e| AcmeError::Account(format!("bad EAB HMAC key length: {e}")))?;
        mac.update(format!("{protected_b64}.{payload_b64}").as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(serde_json::json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": signature,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_has_p384_jwk() {
        let key = AccountKey::generate().unwrap();
        let jwk = key.jwk();
        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["crv"], "P-384");
        // 48-byte coordinates encode to 64 base64url chars.
        assert_eq!(jwk["x"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn thumbprint_is_stable_and_urlsafe() {
        let key = AccountKey::generate().unwrap();
        let a = key.jwk_thumbprint();
        let b = key.jwk_thumbprint();
        assert_eq!(a, b);
        assert_eq!(a.len(), 43);
        assert!(!a.contains('+') && !a.contains('/') && !a.contains('='));
    }

    #[test]
    fn account_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme-account");

        assert!(AccountFile::load(&path).unwrap().is_none());

        let account = AccountFile {
            key: AccountKey::generate().unwrap(),
            kid: "https://ca.example/acct/42".to_string(),
        };
        account.save(&path).unwrap();

        let loaded = AccountFile::load(&path).unwrap().unwrap();
        assert_eq!(loaded.kid, "https://ca.example/acct/42");
        assert_eq!(loaded.key.pkcs8_der(), account.key.pkcs8_der());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn account_file_without_kid_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme-account");
        let key = AccountKey::generate().unwrap();
        let block = pem::Pem::new("PRIVATE KEY", key.pkcs8_der().to_vec());
        std::fs::write(&path, pem::encode(&block)).unwrap();

        assert!(AccountFile::load(&path).is_err());
    }

    #[test]
    fn eab_parse_two_lines() {
        let creds = EabCredentials::parse("kid-1\naGVsbG8\n").unwrap();
        assert_eq!(creds.key_id, "kid-1");
        assert_eq!(creds.hmac_key, b"hello");
    }

    #[test]
    fn eab_missing_line_rejected() {
        assert!(EabCredentials::parse("kid-only\n").is_err());
        assert!(EabCredentials::parse("").is_err());
    }

    #[test]
    fn eab_binding_shape() {
        let creds = EabCredentials::parse("kid-1\naGVsbG8\n").unwrap();
        let key = AccountKey::generate().unwrap();
        let jws = creds
            .binding_jws(&key.jwk(), "https://ca.example/new-account")
            .unwrap();
        assert!(jws["protected"].is_string());
        assert!(jws["payload"].is_string());
        assert!(jws["signature"].is_string());

        let protected: serde_json::Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(jws["protected"].as_str().unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(protected["alg"], "HS256");
        assert_eq!(protected["kid"], "kid-1");
    }
}
