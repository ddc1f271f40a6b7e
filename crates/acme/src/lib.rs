#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! ACME client and certificate pipeline.
//!
//! One account per cluster; one protocol client per process, shared by the
//! DNS-01 issuance orchestrator and the listener's own http-01 self-cert
//! path. Issued chains live in the replicated cert cache.

pub mod account;
pub mod cache;
pub mod challenges;
mod error;
pub mod client;
pub mod orchestrator;
pub mod selfcert;

pub use account::{AccountFile, AccountKey, EabCredentials};
pub use cache::CertCache;
pub use challenges::ChallengeStore;
pub use client::Client;
pub use error::{AcmeError, Result};
pub use orchestrator::{Issuer, IssuerConfig};
pub use selfcert::SelfCert;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Load the cluster account or create it on first startup.
///
/// With no account file present a fresh P-384 key is generated and
/// registered (terms accepted, EAB attached when the credentials file
/// exists), then key + KID are persisted. Otherwise the key is loaded and
/// the account reconciled with the CA.
pub async fn open_account(
    directory_url: &str,
    account_path: &Path,
    eab_path: &Path,
    contact: Option<&str>,
) -> Result<Arc<Mutex<Client>>> {
    let client = match AccountFile::load(account_path)? {
        Some(account) => {
            let mut client = Client::new(directory_url, account.key).await?;
            client.set_kid(account.kid);
            let info = client.fetch_account().await?;
            tracing::info!(
                kid = client.kid().unwrap_or_default(),
                status = info["status"].as_str().unwrap_or("unknown"),
                "loaded acme account"
            );
            client
        }
        None => {
            let eab = EabCredentials::load(eab_path)?;
            let key = AccountKey::generate()?;
            let mut client = Client::new(directory_url, key).await?;
            let kid = client.register(contact, eab.as_ref()).await?;

            let account = AccountFile {
                key: AccountKey::from_pkcs8(client.account_key().pkcs8_der())?,
                kid,
            };
            account.save(account_path)?;
            client
        }
    };

    Ok(Arc::new(Mutex::new(client)))
}
