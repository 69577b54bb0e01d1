// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Software crypto: self-signed CA roots and the TLS certificates the CA
//! server listens with.

use crate::error::{OperatorError, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

/// CA roots are valid for 15 years, like fabric-ca's own default
const CA_VALIDITY_DAYS: i64 = 15 * 365;

/// Server TLS certificates are valid for one year
const TLS_VALIDITY_DAYS: i64 = 365;

/// A generated certificate and its private key, both PEM encoded
#[derive(Debug, Clone)]
pub struct GeneratedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

fn validity(days: i64) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    (now, now + time::Duration::days(days))
}

fn params(common_name: &str, hosts: &[String], days: i64) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(hosts.to_vec())
        .map_err(|e| OperatorError::CryptoError(format!("invalid host name: {}", e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Hyperledger");
    dn.push(DnType::OrganizationalUnitName, "Fabric");
    params.distinguished_name = dn;

    let (not_before, not_after) = validity(days);
    params.not_before = not_before;
    params.not_after = not_after;
    Ok(params)
}

/// ECDSA P-256 self-signed CA root
pub fn self_signed_ca(common_name: &str, hosts: &[String]) -> Result<GeneratedCert> {
    let mut params = params(common_name, hosts, CA_VALIDITY_DAYS)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    sign(params)
}

/// Self-signed server certificate covering `hosts`
pub fn tls_cert(common_name: &str, hosts: &[String]) -> Result<GeneratedCert> {
    let mut params = params(common_name, hosts, TLS_VALIDITY_DAYS)?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    sign(params)
}

fn sign(params: CertificateParams) -> Result<GeneratedCert> {
    let key = KeyPair::generate()
        .map_err(|e| OperatorError::CryptoError(format!("key generation failed: {}", e)))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| OperatorError::CryptoError(format!("certificate signing failed: {}", e)))?;
    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Validity end of a PEM certificate as a unix timestamp
pub fn not_after(cert_pem: &[u8]) -> Result<i64> {
    let (_, pem) = parse_x509_pem(cert_pem)
        .map_err(|e| OperatorError::CertificateError(format!("invalid PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| OperatorError::CertificateError(format!("invalid certificate: {}", e)))?;
    Ok(cert.validity().not_after.timestamp())
}

/// DNS and IP subject alternative names of a PEM certificate
pub fn subject_alt_names(cert_pem: &[u8]) -> Result<Vec<String>> {
    let (_, pem) = parse_x509_pem(cert_pem)
        .map_err(|e| OperatorError::CertificateError(format!("invalid PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| OperatorError::CertificateError(format!("invalid certificate: {}", e)))?;
    let Some(san) = cert
        .subject_alternative_name()
        .map_err(|e| OperatorError::CertificateError(format!("invalid SAN extension: {}", e)))?
    else {
        return Ok(vec![]);
    };

    Ok(san
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            GeneralName::IPAddress(ip) => ip_to_string(ip),
            _ => None,
        })
        .collect())
}

fn ip_to_string(raw: &[u8]) -> Option<String> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

/// True when the certificate lists every host
pub fn covers_hosts(cert_pem: &[u8], hosts: &[String]) -> bool {
    match subject_alt_names(cert_pem) {
        Ok(names) => hosts.iter().all(|h| names.contains(h)),
        Err(_) => false,
    }
}
