#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Authoritative DNS for the origin zone.
//!
//! Three kinds of answers come out of here: static zone records (with the
//! CAA policy and DNSSEC apex records appended at startup), A/AAAA records
//! synthesized from address literals encoded in pinned-hostname labels, and
//! TXT answers for in-flight ACME DNS-01 validations read from the shared
//! store. Everything is signed online with the zone-signing key.

pub mod backend;
pub mod dnssec;
mod error;
pub mod server;
pub mod zone;

pub use backend::Backend;
pub use dnssec::ZoneSigner;
pub use error::{DnsError, Result};
pub use server::DnsServer;

use std::sync::Arc;

use pinhost_store::StateStore;

use zone::ZoneMap;

/// Assemble the serving state: augment the parsed zone with the CAA policy
/// and the DNSSEC apex records, then wire up the backend.
pub fn build_backend<S: StateStore>(
    origin: &str,
    ca_domain: &str,
    mut zone: ZoneMap,
    signer: &ZoneSigner,
    store: S,
) -> Result<Arc<Backend<S>>> {
    zone::add_caa_records(&mut zone, origin, ca_domain)?;

    let apex = format!("{origin}.");
    zone::push_record(&mut zone, &apex, signer.dnskey_record());
    zone::push_record(&mut zone, &apex, signer.cdnskey_record());
    zone::push_record(&mut zone, &apex, signer.cds_record());

    Ok(Backend::new(origin, zone, store)?.into_shared())
}
