use std::net::{Ipv4Addr, Ipv6Addr};

use sha2::{Digest, Sha256};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::error::{PinError, Result};

/// Accept a CSR as either PEM or raw DER, returning the DER bytes.
pub fn decode_csr(data: &[u8]) -> Result<Vec<u8>> {
    if data.windows(4).any(|w| w == b"----") {
        let block = pem::parse(data).map_err(|e| PinError::Parse(e.to_string()))?;
        Ok(block.into_contents())
    } else {
        Ok(data.to_vec())
    }
}

/// Validate a DER CSR against its key pin and return the base name.
///
/// Recomputes the pinned hostname from the CSR's own public key and checks
/// that every name the CSR asserts — common name plus all SANs of any kind —
/// equals `*.<pin>.<origin>`. A CSR that bundles any other name alongside
/// the pinned one is rejected outright.
pub fn csr_base_name(csr_der: &[u8], origin: &str) -> Result<String> {
    let (_, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| PinError::Parse(e.to_string()))?;

    let info = &csr.certification_request_info;
    let fingerprint = hex::encode(Sha256::digest(info.subject_pki.raw));
    let base_name = format!("{}.{}.{}", &fingerprint[..32], &fingerprint[32..], origin);
    let expected = format!("*.{base_name}");

    let names = collect_names(&csr)?;
    for name in &names {
        if name != &expected {
            return Err(PinError::PinMismatch(name.clone()));
        }
    }
    if names.is_empty() {
        return Err(PinError::NoNames);
    }

    Ok(base_name)
}

/// Every name a CSR asserts: CN, then DNS / email / IP / URI SANs.
fn collect_names(csr: &X509CertificationRequest<'_>) -> Result<Vec<String>> {
    let mut names = Vec::new();

    for cn in csr.certification_request_info.subject.iter_common_name() {
        let value = cn.as_str().map_err(|e| PinError::Parse(e.to_string()))?;
        if !value.is_empty() {
            names.push(value.to_string());
        }
    }

    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for general_name in &san.general_names {
                    match general_name {
                        GeneralName::DNSName(dns) => names.push((*dns).to_string()),
                        GeneralName::RFC822Name(email) => names.push((*email).to_string()),
                        GeneralName::URI(uri) => names.push((*uri).to_string()),
                        GeneralName::IPAddress(bytes) => names.push(render_ip(bytes)),
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(names)
}

fn render_ip(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string(),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ipv6Addr::from(octets).to_string()
        }
        // Malformed address payloads can never equal the expected hostname,
        // so any placeholder fails the pin check.
        _ => format!("<invalid ip: {}>", hex::encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{KEY_FIXTURE, KEY_FIXTURE_HOSTNAME};
    use crate::{generate_csr, hostname};

    fn fixture_csr_der() -> Vec<u8> {
        let pem = generate_csr(KEY_FIXTURE, KEY_FIXTURE_HOSTNAME).unwrap();
        decode_csr(pem.as_bytes()).unwrap()
    }

    #[test]
    fn decode_passes_der_through() {
        let der = fixture_csr_der();
        assert_eq!(decode_csr(&der).unwrap(), der);
    }

    #[test]
    fn valid_csr_returns_base_name() {
        let base = csr_base_name(&fixture_csr_der(), "example.com").unwrap();
        assert_eq!(base, KEY_FIXTURE_HOSTNAME);
    }

    #[test]
    fn wrong_origin_is_a_mismatch() {
        let err = csr_base_name(&fixture_csr_der(), "example.org").unwrap_err();
        match err {
            PinError::PinMismatch(name) => {
                assert_eq!(name, format!("*.{KEY_FIXTURE_HOSTNAME}"))
            }
            other => panic!("expected PinMismatch, got {other:?}"),
        }
    }

    #[test]
    fn extra_san_is_rejected() {
        // A CSR carrying a second SAN alongside the correctly pinned one.
        let key_pair = rcgen::KeyPair::from_pem(KEY_FIXTURE).unwrap();
        let mut params = rcgen::CertificateParams::new(vec![
            format!("*.{KEY_FIXTURE_HOSTNAME}"),
            "*.attacker.example.com".to_string(),
        ])
        .unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr = params.serialize_request(&key_pair).unwrap();

        let err = csr_base_name(csr.der(), "example.com").unwrap_err();
        match err {
            PinError::PinMismatch(name) => assert_eq!(name, "*.attacker.example.com"),
            other => panic!("expected PinMismatch, got {other:?}"),
        }
    }

    #[test]
    fn san_under_wrong_key_is_rejected() {
        // CSR signed by a fresh key but claiming the fixture key's hostname.
        let other_key = crate::generate_key().unwrap();
        let pem = generate_csr(&other_key, KEY_FIXTURE_HOSTNAME).unwrap();
        let der = decode_csr(pem.as_bytes()).unwrap();
        assert!(matches!(
            csr_base_name(&der, "example.com"),
            Err(PinError::PinMismatch(_))
        ));
    }

    #[test]
    fn garbage_fails_parse() {
        assert!(matches!(
            csr_base_name(b"not a csr", "example.com"),
            Err(PinError::Parse(_))
        ));
    }

    #[test]
    fn hostname_matches_csr_derivation() {
        // The pin computed from the private key and the pin recomputed from
        // the CSR's embedded public key must agree.
        let from_key = hostname(KEY_FIXTURE, "example.com").unwrap();
        let from_csr = csr_base_name(&fixture_csr_der(), "example.com").unwrap();
        assert_eq!(from_key, from_csr);
    }
}
