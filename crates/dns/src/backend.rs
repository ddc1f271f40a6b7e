use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use hickory_proto::rr::rdata::{A, AAAA, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record};
use pinhost_store::StateStore;
use regex::Regex;

use crate::error::{DnsError, Result};
use crate::zone::ZoneMap;

/// Synthesized A/AAAA answers are effectively immutable: thirty days.
pub const IP_SYNTHESIS_TTL: u32 = 30 * 24 * 60 * 60;

/// Answers qnames under the origin.
///
/// The static zone map is built once at startup and never mutated while
/// serving; only the validation lookups go to the shared store.
pub struct Backend<S> {
    origin: String,
    zone: ZoneMap,
    store: S,
    /// `<ip-label>.<hex32>.<hex32>.<origin>.` — the shape of pinned names
    /// whose leftmost label may encode an address literal.
    wildcard_name: Regex,
}

impl<S: StateStore> Backend<S> {
    pub fn new(origin: &str, zone: ZoneMap, store: S) -> Result<Backend<S>> {
        let escaped = regex::escape(origin);
        let wildcard_name = Regex::new(&format!(
            r"^[0-9a-f-]{{3,45}}\.[0-9a-f]{{32}}\.[0-9a-f]{{32}}\.{escaped}\.$"
        ))
        .map_err(|e| DnsError::Zone(format!("wildcard pattern: {e}")))?;
        Ok(Backend { origin: origin.to_string(), zone, store, wildcard_name })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Whether a canonical qname falls under the origin zone.
    pub fn in_zone(&self, qname: &str) -> bool {
        qname == format!("{}.", self.origin) || qname.ends_with(&format!(".{}.", self.origin))
    }

    /// The apex SOA record, used in negative answers.
    pub fn soa(&self) -> Option<&Record> {
        self.zone
            .get(&format!("{}.", self.origin))?
            .iter()
            .find(|r| r.record_type() == hickory_proto::rr::RecordType::SOA)
    }

    /// Look up all records at a canonical (lowercase, dot-terminated) qname.
    ///
    /// Order matters:
    /// 1. `_acme-challenge.` names answer from the validation store (TTL 0).
    /// 2. Pinned names whose leftmost label parses as an IP literal get a
    ///    synthesized A or AAAA — taking precedence over any static
    ///    wildcard.
    /// 3. Exact static match.
    /// 4. Wildcard walk, shallowest suffix first, owner rewritten to the
    ///    qname.
    pub async fn lookup(&self, qname: &str) -> Result<Vec<Record>> {
        if qname.starts_with("_acme-challenge.") {
            let value = self.store.validation_get(qname).await?;
            let mut records = Vec::new();
            if let Some(value) = value
                && !value.is_empty()
            {
                records.push(validation_txt(qname, &value)?);
            }
            return Ok(records);
        }

        if self.wildcard_name.is_match(qname) {
            let ip_label = qname.split('.').next().unwrap_or_default();
            if let Some(record) = synthesize_ip(qname, ip_label)? {
                return Ok(vec![record]);
            }
        }

        if let Some(records) = self.zone.get(qname) {
            return Ok(records.clone());
        }

        let labels: Vec<&str> = qname.split('.').collect();
        for i in 1..labels.len().saturating_sub(1) {
            let wildcard = format!("*.{}", labels[i..].join("."));
            if let Some(records) = self.zone.get(&wildcard) {
                let owner = Name::from_utf8(qname)
                    .map_err(|e| DnsError::Zone(format!("bad qname {qname:?}: {e}")))?;
                return Ok(records
                    .iter()
                    .map(|record| {
                        let mut copy = record.clone();
                        copy.set_name(owner.clone());
                        copy
                    })
                    .collect());
            }
        }

        Ok(Vec::new())
    }
}

// Shared handles clone cheaply into the per-connection tasks.
impl<S: StateStore> Backend<S> {
    pub fn into_shared(self) -> Arc<Backend<S>> {
        Arc::new(self)
    }
}

fn validation_txt(qname: &str, value: &str) -> Result<Record> {
    let name =
        Name::from_utf8(qname).map_err(|e| DnsError::Zone(format!("bad qname {qname:?}: {e}")))?;
    // TTL 0: the CA must always see the freshest token.
    let mut record =
        Record::from_rdata(name, 0, RData::TXT(TXT::new(vec![value.to_string()])));
    record.set_dns_class(DNSClass::IN);
    Ok(record)
}

/// Decode the leftmost label as an IP literal: dashes become dots for IPv4,
/// colons for IPv6. Returns `None` when the label is neither.
fn synthesize_ip(qname: &str, ip_label: &str) -> Result<Option<Record>> {
    let name =
        Name::from_utf8(qname).map_err(|e| DnsError::Zone(format!("bad qname {qname:?}: {e}")))?;

    if let Ok(v4) = ip_label.replace('-', ".").parse::<Ipv4Addr>() {
        let mut record = Record::from_rdata(name, IP_SYNTHESIS_TTL, RData::A(A(v4)));
        record.set_dns_class(DNSClass::IN);
        return Ok(Some(record));
    }

    if let Ok(v6) = ip_label.replace('-', ":").parse::<Ipv6Addr>() {
        let mut record = Record::from_rdata(name, IP_SYNTHESIS_TTL, RData::AAAA(AAAA(v6)));
        record.set_dns_class(DNSClass::IN);
        return Ok(Some(record));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::parse_zone;
    use hickory_proto::rr::RecordType;
    use pinhost_store::LocalStore;

    const PIN: &str = "9b7d8f4b4f45183149c1b666d08d1f8c.bfcd0704a087908e509c39b1c2b98cc5";

    const ZONE: &str = "\
$TTL 300
@   IN SOA ns1.tls.example. ops.tls.example. 2024010101 7200 3600 1209600 300
@   IN NS  ns1.tls.example.
@   IN A   192.0.2.80
*   IN A   192.0.2.90
*.apps IN A 192.0.2.99
";

    async fn backend() -> Backend<LocalStore> {
        let zone = parse_zone(ZONE, "tls.example").unwrap();
        Backend::new("tls.example", zone, LocalStore::new()).unwrap()
    }

    #[tokio::test]
    async fn exact_match_wins() {
        let b = backend().await;
        let records = b.lookup("tls.example.").await.unwrap();
        assert!(records.iter().any(|r| r.record_type() == RecordType::A));
        assert!(records.iter().any(|r| r.record_type() == RecordType::SOA));
    }

    #[tokio::test]
    async fn wildcard_rewrites_owner() {
        let b = backend().await;
        let records = b.lookup("anything.tls.example.").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name().to_string().to_lowercase(), "anything.tls.example.");
        let RData::A(A(ip)) = records[0].data().unwrap() else { panic!("expected A") };
        assert_eq!(*ip, Ipv4Addr::new(192, 0, 2, 90));
    }

    #[tokio::test]
    async fn deeper_wildcard_matches_first() {
        let b = backend().await;
        let records = b.lookup("x.apps.tls.example.").await.unwrap();
        let RData::A(A(ip)) = records[0].data().unwrap() else { panic!("expected A") };
        assert_eq!(*ip, Ipv4Addr::new(192, 0, 2, 99));
    }

    #[tokio::test]
    async fn synthesizes_ipv4() {
        let b = backend().await;
        let qname = format!("203-0-113-1.{PIN}.tls.example.");
        let records = b.lookup(&qname).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ttl(), 2_592_000);
        let RData::A(A(ip)) = records[0].data().unwrap() else { panic!("expected A") };
        assert_eq!(*ip, Ipv4Addr::new(203, 0, 113, 1));
    }

    #[tokio::test]
    async fn synthesizes_ipv6_loopback() {
        let b = backend().await;
        let qname = format!("0--1.{PIN}.tls.example.");
        let records = b.lookup(&qname).await.unwrap();
        let RData::AAAA(AAAA(ip)) = records[0].data().unwrap() else { panic!("expected AAAA") };
        assert_eq!(*ip, Ipv6Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn synthesizes_ipv6_documentation_address() {
        let b = backend().await;
        let qname = format!("2001-db8-0--1.{PIN}.tls.example.");
        let records = b.lookup(&qname).await.unwrap();
        let RData::AAAA(AAAA(ip)) = records[0].data().unwrap() else { panic!("expected AAAA") };
        assert_eq!(*ip, "2001:db8::1".parse::<Ipv6Addr>().unwrap());
    }

    #[tokio::test]
    async fn ip_synthesis_beats_static_wildcard() {
        // The catch-all `*` A record would otherwise match this qname.
        let b = backend().await;
        let qname = format!("127-0-0-1.{PIN}.tls.example.");
        let records = b.lookup(&qname).await.unwrap();
        let RData::A(A(ip)) = records[0].data().unwrap() else { panic!("expected A") };
        assert_eq!(*ip, Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn non_ip_label_falls_through_to_wildcard() {
        let b = backend().await;
        // Matches the pinned-name shape but is not an address literal.
        let qname = format!("abcdef.{PIN}.tls.example.");
        let records = b.lookup(&qname).await.unwrap();
        let RData::A(A(ip)) = records[0].data().unwrap() else { panic!("expected A") };
        assert_eq!(*ip, Ipv4Addr::new(192, 0, 2, 90));
    }

    #[tokio::test]
    async fn validation_records_answer_with_ttl_zero() {
        let store = LocalStore::new();
        let qname = format!("_acme-challenge.{PIN}.tls.example.");
        store.validation_set(&qname, "tok123").await.unwrap();

        let zone = parse_zone(ZONE, "tls.example").unwrap();
        let b = Backend::new("tls.example", zone, store).unwrap();

        let records = b.lookup(&qname).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ttl(), 0);
        let RData::TXT(txt) = records[0].data().unwrap() else { panic!("expected TXT") };
        assert_eq!(txt.txt_data()[0].as_ref(), b"tok123");
    }

    #[tokio::test]
    async fn absent_validation_record_is_nodata() {
        let b = backend().await;
        let records =
            b.lookup("_acme-challenge.nobody.tls.example.").await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn in_zone_check() {
        let b = backend().await;
        assert!(b.in_zone("tls.example."));
        assert!(b.in_zone("a.b.tls.example."));
        assert!(!b.in_zone("example.com."));
        assert!(!b.in_zone("nottls.example.com."));
    }
}
