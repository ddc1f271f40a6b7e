use std::collections::HashMap;
use std::path::Path;

use hickory_proto::rr::rdata::caa::CAA;
use hickory_proto::rr::{DNSClass, Name, RData, Record};
use hickory_proto::serialize::txt::Parser;

use crate::error::{DnsError, Result};

/// Records carry this TTL when the zone file doesn't say otherwise.
pub const DEFAULT_TTL: u32 = 5 * 60;

/// The static zone: master-file records keyed by lowercase FQDN.
///
/// Built once at startup and never mutated while serving. The CAA and
/// DNSSEC apex records are appended before the map is handed to the
/// backend.
pub type ZoneMap = HashMap<String, Vec<Record>>;

/// Parse a zone master file, substituting `origin` into bare names.
pub fn load_zone_file(path: &Path, origin: &str) -> Result<ZoneMap> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| DnsError::Zone(format!("failed to read {}: {e}", path.display())))?;
    parse_zone(&data, origin)
}

/// Parse zone file contents into the record map.
pub fn parse_zone(data: &str, origin: &str) -> Result<ZoneMap> {
    let origin_name = Name::from_utf8(format!("{origin}."))
        .map_err(|e| DnsError::Zone(format!("bad origin {origin:?}: {e}")))?;

    let (_, rrsets) = Parser::new(data, None, Some(origin_name))
        .parse()
        .map_err(|e| DnsError::Zone(format!("parse error: {e}")))?;

    let mut zone: ZoneMap = HashMap::new();
    let mut count = 0usize;
    for (_key, rrset) in rrsets {
        for record in rrset.records_without_rrsigs() {
            let mut record = record.clone();
            if record.ttl() == 0 {
                record.set_ttl(DEFAULT_TTL);
            }
            let name = canonical_owner(record.name());
            zone.entry(name).or_default().push(record);
            count += 1;
        }
    }
    tracing::info!("loaded {count} records from zone file");
    Ok(zone)
}

/// Lowercase FQDN string form used as the zone map key.
pub fn canonical_owner(name: &Name) -> String {
    let mut owner = name.to_string().to_lowercase();
    if !owner.ends_with('.') {
        owner.push('.');
    }
    owner
}

/// Publish the CAA policy for the zone:
///
/// - apex: only `ca_domain` may issue,
/// - every subdomain: nobody may issue non-wildcard certificates,
/// - every subdomain: only `ca_domain` may issue wildcards.
///
/// All three are flagged critical.
pub fn add_caa_records(zone: &mut ZoneMap, origin: &str, ca_domain: &str) -> Result<()> {
    let apex = format!("{origin}.");
    let wildcard = format!("*.{origin}.");
    let ca_name = Name::from_utf8(ca_domain)
        .map_err(|e| DnsError::Zone(format!("bad CAA identifier {ca_domain:?}: {e}")))?;

    let apex_name = Name::from_utf8(&apex)
        .map_err(|e| DnsError::Zone(format!("bad origin {origin:?}: {e}")))?;
    let wildcard_name = Name::from_utf8(&wildcard)
        .map_err(|e| DnsError::Zone(format!("bad origin {origin:?}: {e}")))?;

    let issue_apex = CAA::new_issue(true, Some(ca_name.clone()), Vec::new());
    // An empty issuer list canonically renders as ";": no CA at all.
    let deny_issue = CAA::new_issue(true, None, Vec::new());
    let issuewild = CAA::new_issuewild(true, Some(ca_name), Vec::new());

    push_record(zone, &apex, record(apex_name, RData::CAA(issue_apex)));
    push_record(zone, &wildcard, record(wildcard_name.clone(), RData::CAA(deny_issue)));
    push_record(zone, &wildcard, record(wildcard_name, RData::CAA(issuewild)));
    Ok(())
}

fn record(name: Name, rdata: RData) -> Record {
    let mut record = Record::from_rdata(name, DEFAULT_TTL, rdata);
    record.set_dns_class(DNSClass::IN);
    record
}

pub(crate) fn push_record(zone: &mut ZoneMap, owner: &str, record: Record) {
    zone.entry(owner.to_lowercase()).or_default().push(record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::RecordType;

    const ZONE: &str = "\
$TTL 300
@   IN SOA ns1.tls.example. ops.tls.example. 2024010101 7200 3600 1209600 300
@   IN NS  ns1.tls.example.
ns1 IN A   192.0.2.53
@   IN A   192.0.2.80
www IN A   192.0.2.81
*.apps IN A 192.0.2.99
";

    #[test]
    fn parses_records_under_origin() {
        let zone = parse_zone(ZONE, "tls.example").unwrap();
        assert!(zone.contains_key("tls.example."));
        assert!(zone.contains_key("ns1.tls.example."));
        assert!(zone.contains_key("*.apps.tls.example."));

        let apex = &zone["tls.example."];
        assert!(apex.iter().any(|r| r.record_type() == RecordType::SOA));
        assert!(apex.iter().any(|r| r.record_type() == RecordType::NS));
    }

    #[test]
    fn records_carry_ttl() {
        let zone = parse_zone(ZONE, "tls.example").unwrap();
        for records in zone.values() {
            for record in records {
                assert!(record.ttl() > 0);
            }
        }
    }

    #[test]
    fn caa_triplet_is_published() {
        let mut zone = parse_zone(ZONE, "tls.example").unwrap();
        add_caa_records(&mut zone, "tls.example", "letsencrypt.org").unwrap();

        let apex_caa: Vec<_> = zone["tls.example."]
            .iter()
            .filter(|r| r.record_type() == RecordType::CAA)
            .collect();
        assert_eq!(apex_caa.len(), 1);

        let wildcard_caa: Vec<_> = zone["*.tls.example."]
            .iter()
            .filter(|r| r.record_type() == RecordType::CAA)
            .collect();
        assert_eq!(wildcard_caa.len(), 2);

        // All critical.
        for record in apex_caa.iter().chain(wildcard_caa.iter()) {
            let RData::CAA(caa) = record.data().unwrap() else {
                panic!("expected CAA rdata")
            };
            assert!(caa.issuer_critical());
        }
    }

    #[test]
    fn bad_zone_is_an_error() {
        assert!(parse_zone("@ IN SOA not-enough-fields", "tls.example").is_err());
    }
}
