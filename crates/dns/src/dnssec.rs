//! Online DNSSEC signing.
//!
//! The zone-signing key is ECDSA P-256 (algorithm 13). Answers are signed
//! per RRset as they go out the door; negative answers get a minimal NSEC.
//! The key lives on disk in the BIND private-key text format so operators
//! can move it between DNS stacks.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hickory_proto::rr::dnssec::rdata::{DNSSECRData, DNSKEY, DS, NSEC, RRSIG};
use hickory_proto::rr::dnssec::{Algorithm, DigestType};
use hickory_proto::rr::rdata::NULL;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};

use crate::error::{DnsError, Result};
use crate::zone::DEFAULT_TTL;

/// DNSKEY flags: ZONE | SEP.
const ZSK_FLAGS: u16 = 0x0101;
/// Always 3 for DNSSEC.
const PROTOCOL: u8 = 3;
/// CDS / CDNSKEY record type codes (published as RFC 3597 unknown types;
/// their wire formats are identical to DS / DNSKEY).
const TYPE_CDS: u16 = 59;
const TYPE_CDNSKEY: u16 = 60;

/// Signatures are valid from an hour ago to two days out; online signing
/// regenerates them on every response.
const INCEPTION_SKEW_SECS: u64 = 60 * 60;
const EXPIRATION_SECS: u64 = 2 * 24 * 60 * 60;

/// The zone-signing key plus the precomputed apex material derived from it.
pub struct ZoneSigner {
    origin: Name,
    key: SigningKey,
    /// DNSKEY rdata wire form: flags | protocol | algorithm | public key.
    dnskey_rdata: Vec<u8>,
    key_tag: u16,
}

impl ZoneSigner {
    /// Load the key file, or generate a fresh key and persist it.
    ///
    /// On generation the DS record for the parent zone is logged — without
    /// it in the parent, resolvers can't build the chain of trust.
    pub fn load_or_generate(path: &Path, origin: &str) -> Result<ZoneSigner> {
        let origin = Name::from_utf8(format!("{origin}."))
            .map_err(|e| DnsError::Key(format!("bad origin: {e}")))?;

        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let key = parse_private_key(&contents)?;
                Ok(Self::from_key(origin, key))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("zone key file not found: {}", path.display());
                let key = SigningKey::random(&mut rand::rngs::OsRng);
                let signer = Self::from_key(origin, key);
                signer.save(path)?;
                tracing::info!(
                    "generated new zone-signing key; add this record to the parent zone:\n{}",
                    signer.ds_presentation()
                );
                Ok(signer)
            }
            Err(e) => Err(DnsError::Key(format!("failed to read {}: {e}", path.display()))),
        }
    }

    fn from_key(origin: Name, key: SigningKey) -> ZoneSigner {
        let point = key.verifying_key().to_encoded_point(false);
        // Uncompressed SEC1 point minus the 0x04 prefix: x || y.
        let public_key = point.as_bytes()[1..].to_vec();

        let mut dnskey_rdata = Vec::with_capacity(4 + public_key.len());
        dnskey_rdata.extend_from_slice(&ZSK_FLAGS.to_be_bytes());
        dnskey_rdata.push(PROTOCOL);
        dnskey_rdata.push(Algorithm::ECDSAP256SHA256.into());
        dnskey_rdata.extend_from_slice(&public_key);

        let key_tag = key_tag(&dnskey_rdata);
        ZoneSigner { origin, key, dnskey_rdata, key_tag }
    }

    /// Persist the key in BIND private-key format, mode 0600.
    fn save(&self, path: &Path) -> Result<()> {
        let contents = format!(
            "Private-key-format: v1.3\n\
             Algorithm: 13 (ECDSAP256SHA256)\n\
             PrivateKey: {}\n",
            BASE64.encode(self.key.to_bytes())
        );
        std::fs::write(path, contents)
            .map_err(|e| DnsError::Key(format!("failed to write {}: {e}", path.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| DnsError::Key(format!("failed to chmod key file: {e}")))?;
        }
        Ok(())
    }

    pub fn key_tag(&self) -> u16 {
        self.key_tag
    }

    pub fn origin(&self) -> &Name {
        &self.origin
    }

    /// The DNSKEY record for the apex.
    pub fn dnskey_record(&self) -> Record {
        let public_key = self.dnskey_rdata[4..].to_vec();
        let dnskey = DNSKEY::new(true, true, false, Algorithm::ECDSAP256SHA256, public_key);
        let mut record = Record::from_rdata(
            self.origin.clone(),
            DEFAULT_TTL,
            RData::DNSSEC(DNSSECRData::DNSKEY(dnskey)),
        );
        record.set_dns_class(DNSClass::IN);
        record
    }

    /// CDNSKEY: the DNSKEY rdata under the child-publication type code.
    pub fn cdnskey_record(&self) -> Record {
        self.unknown_type_record(TYPE_CDNSKEY, self.dnskey_rdata.clone())
    }

    /// CDS: the SHA-256 DS rdata under the child-publication type code.
    pub fn cds_record(&self) -> Record {
        self.unknown_type_record(TYPE_CDS, self.ds_rdata())
    }

    fn unknown_type_record(&self, code: u16, rdata: Vec<u8>) -> Record {
        let mut record = Record::from_rdata(
            self.origin.clone(),
            DEFAULT_TTL,
            RData::Unknown { code: hickory_proto::rr::RecordType::Unknown(code), rdata: NULL::with(rdata) },
        );
        record.set_dns_class(DNSClass::IN);
        record
    }

    /// DS rdata: key tag | algorithm | digest type | SHA-256 digest.
    fn ds_rdata(&self) -> Vec<u8> {
        let mut rdata = Vec::new();
        rdata.extend_from_slice(&self.key_tag.to_be_bytes());
        rdata.push(Algorithm::ECDSAP256SHA256.into());
        rdata.push(u8::from(DigestType::SHA256));
        rdata.extend_from_slice(&self.ds_digest());
        rdata
    }

    /// SHA-256 over the canonical owner name plus the DNSKEY rdata.
    fn ds_digest(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(canonical_name_wire(&self.origin));
        hasher.update(&self.dnskey_rdata);
        hasher.finalize().to_vec()
    }

    /// The DS record in presentation format, for the operator log.
    pub fn ds_presentation(&self) -> String {
        format!(
            "{} IN DS {} 13 2 {}",
            self.origin,
            self.key_tag,
            hex::encode(self.ds_digest()).to_uppercase()
        )
    }

    /// DS rdata as a hickory record (used by tests to cross-check).
    pub fn ds_record(&self) -> Record {
        let ds = DS::new(
            self.key_tag,
            Algorithm::ECDSAP256SHA256,
            DigestType::SHA256,
            self.ds_digest(),
        );
        let mut record = Record::from_rdata(
            self.origin.clone(),
            DEFAULT_TTL,
            RData::DNSSEC(DNSSECRData::DS(ds)),
        );
        record.set_dns_class(DNSClass::IN);
        record
    }

    /// Sign one RRset, returning its RRSIG record.
    ///
    /// All records must share owner, type, class and TTL (an RRset by
    /// definition). Signing input follows RFC 4034 §3.1.8.1: the RRSIG
    /// rdata up to the signer name, then each RR in canonical form, sorted
    /// by rdata.
    pub fn sign_rrset(&self, records: &[Record]) -> Result<Record> {
        let first = records.first().ok_or_else(|| DnsError::Sign("empty rrset".into()))?;
        let owner = first.name().to_lowercase();
        let type_covered = first.record_type();
        let original_ttl = first.ttl();
        let labels = owner.num_labels();

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let inception = (now - INCEPTION_SKEW_SECS) as u32;
        let expiration = (now + EXPIRATION_SECS) as u32;

        let mut signed_data = Vec::new();
        signed_data.extend_from_slice(&u16::from(type_covered).to_be_bytes());
        signed_data.push(Algorithm::ECDSAP256SHA256.into());
        signed_data.push(labels);
        signed_data.extend_from_slice(&original_ttl.to_be_bytes());
        signed_data.extend_from_slice(&expiration.to_be_bytes());
        signed_data.extend_from_slice(&inception.to_be_bytes());
        signed_data.extend_from_slice(&self.key_tag.to_be_bytes());
        signed_data.extend_from_slice(&canonical_name_wire(&self.origin));

        let owner_wire = canonical_name_wire(&owner);
        let mut wire_rrs = Vec::with_capacity(records.len());
        for record in records {
            let rdata = rdata_wire(record)?;
            let mut rr = Vec::new();
            rr.extend_from_slice(&owner_wire);
            rr.extend_from_slice(&u16::from(type_covered).to_be_bytes());
            rr.extend_from_slice(&u16::from(DNSClass::IN).to_be_bytes());
            rr.extend_from_slice(&original_ttl.to_be_bytes());
            rr.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            rr.extend_from_slice(&rdata);
            wire_rrs.push(rr);
        }
        // Canonical RRset order is by rdata; owner/type/class/ttl are equal
        // across the set, so sorting the full wire form is equivalent.
        wire_rrs.sort();
        for rr in &wire_rrs {
            signed_data.extend_from_slice(rr);
        }

        let signature: Signature = self.key.sign(&signed_data);
        let rrsig = RRSIG::new(
            type_covered,
            Algorithm::ECDSAP256SHA256,
            labels,
            original_ttl,
            expiration,
            inception,
            self.key_tag,
            self.origin.clone(),
            signature.to_bytes().to_vec(),
        );

        let mut record = Record::from_rdata(
            first.name().clone(),
            original_ttl,
            RData::DNSSEC(DNSSECRData::RRSIG(rrsig)),
        );
        record.set_dns_class(DNSClass::IN);
        Ok(record)
    }

    /// Minimal NSEC for a NODATA answer at `qname`: the next name is the
    /// immediate successor (a zero label prepended), and the bitmap admits
    /// only NSEC and RRSIG, denying everything actually asked about.
    pub fn nsec_nodata(&self, qname: &Name) -> Result<Record> {
        let next = Name::from_labels(
            std::iter::once(&b"\x00"[..]).chain(qname.iter()),
        )
        .map_err(|e| DnsError::Sign(format!("nsec successor name: {e}")))?;

        let nsec = NSEC::new(next, vec![RecordType::NSEC, RecordType::RRSIG]);
        let mut record = Record::from_rdata(
            qname.clone(),
            DEFAULT_TTL,
            RData::DNSSEC(DNSSECRData::NSEC(nsec)),
        );
        record.set_dns_class(DNSClass::IN);
        Ok(record)
    }
}

/// Parse the BIND private-key text format (v1.2 / v1.3, algorithm 13).
fn parse_private_key(contents: &str) -> Result<SigningKey> {
    let mut format = None;
    let mut algorithm = None;
    let mut private_key = None;

    for line in contents.lines() {
        // Everything after ';' is comment.
        let line = line.split(';').next().unwrap_or_default().trim();
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim().to_string();
        match key.trim().to_lowercase().as_str() {
            "private-key-format" => format = Some(value),
            "algorithm" => {
                algorithm = Some(value.split_whitespace().next().unwrap_or_default().to_string())
            }
            "privatekey" => private_key = Some(value),
            _ => {}
        }
    }

    match format.as_deref() {
        Some("v1.2") | Some("v1.3") => {}
        other => {
            return Err(DnsError::Key(format!("unsupported private key format: {other:?}")));
        }
    }
    match algorithm.as_deref() {
        Some("13") => {}
        other => return Err(DnsError::Key(format!("unsupported algorithm: {other:?}"))),
    }

    let encoded = private_key.ok_or_else(|| DnsError::Key("no PrivateKey field".into()))?;
    let scalar =
        BASE64.decode(&encoded).map_err(|e| DnsError::Key(format!("bad PrivateKey: {e}")))?;
    SigningKey::from_slice(&scalar).map_err(|e| DnsError::Key(format!("bad scalar: {e}")))
}

/// Canonical (lowercase, uncompressed) wire form of a name.
fn canonical_name_wire(name: &Name) -> Vec<u8> {
    let mut wire = Vec::new();
    for label in name.iter() {
        wire.push(label.len() as u8);
        wire.extend(label.iter().map(|b| b.to_ascii_lowercase()));
    }
    wire.push(0);
    wire
}

/// RFC 4034 appendix B key tag over the DNSKEY rdata.
fn key_tag(rdata: &[u8]) -> u16 {
    let mut acc: u32 = 0;
    for (i, byte) in rdata.iter().enumerate() {
        acc += if i & 1 == 0 { u32::from(*byte) << 8 } else { u32::from(*byte) };
    }
    acc += (acc >> 16) & 0xffff;
    (acc & 0xffff) as u16
}

/// Canonical wire form of a record's rdata.
fn rdata_wire(record: &Record) -> Result<Vec<u8>> {
    let rdata = record.data().ok_or_else(|| DnsError::Sign("record without rdata".into()))?;
    let mut buf = Vec::new();
    {
        let mut encoder = BinEncoder::new(&mut buf);
        encoder.set_canonical_names(true);
        rdata.emit(&mut encoder).map_err(|e| DnsError::Sign(e.to_string()))?;
    }
    Ok(buf)
}
