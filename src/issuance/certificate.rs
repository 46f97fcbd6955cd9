//! Inspection helpers for issued certificates and their key material.

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use openssl::{hash::MessageDigest, pkey::PKey, x509::X509};
use pem::Pem;
use sha2::{Digest, Sha256};
use x509_parser::{extensions::GeneralName, pem::parse_x509_pem};

/// Facts about a leaf certificate that the engine decides and reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Uppercase hex SHA-1 of the DER encoding, the form the host certificate store keys on.
    pub thumbprint: String,
    /// Lowercase hex SHA-256 of the DER encoding.
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subjects: Vec<String>,
}

pub fn inspect(cert_pem: &str) -> Result<CertificateInfo> {
    let (leaf, _) = split_certificate_chain(cert_pem)?;
    let (_, pem_block) = parse_x509_pem(leaf.as_bytes())
        .map_err(|e| anyhow!("failed to parse certificate PEM: {e}"))?;
    let cert = pem_block
        .parse_x509()
        .map_err(|e| anyhow!("failed to parse certificate: {e}"))?;

    let not_before = timestamp(cert.validity().not_before.timestamp())?;
    let not_after = timestamp(cert.validity().not_after.timestamp())?;

    let mut subjects = Vec::new();
    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        subjects.push(cn.to_lowercase());
    }
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            let value = match name {
                GeneralName::DNSName(dns) => dns.to_lowercase(),
                GeneralName::IPAddress(raw) => match raw.len() {
                    4 => std::net::Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]).to_string(),
                    16 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(raw);
                        std::net::Ipv6Addr::from(octets).to_string()
                    }
                    _ => continue,
                },
                _ => continue,
            };
            if !subjects.contains(&value) {
                subjects.push(value);
            }
        }
    }

    let fingerprint = {
        let mut hasher = Sha256::new();
        hasher.update(&pem_block.contents);
        hex::encode(hasher.finalize())
    };

    Ok(CertificateInfo {
        thumbprint: thumbprint(&leaf)?,
        fingerprint,
        not_before,
        not_after,
        subjects,
    })
}

/// Host certificate store thumbprint (SHA-1) of the first certificate in `cert_pem`.
pub fn thumbprint(cert_pem: &str) -> Result<String> {
    let cert = X509::from_pem(cert_pem.as_bytes())
        .map_err(|e| anyhow!("failed to load certificate: {e}"))?;
    let digest = cert
        .digest(MessageDigest::sha1())
        .map_err(|e| anyhow!("failed to hash certificate: {e}"))?;
    Ok(hex::encode_upper(&*digest))
}

/// True when the private key is the counterpart of the leaf certificate's public key.
pub fn key_matches_certificate(private_key_pem: &str, cert_pem: &str) -> Result<bool> {
    let cert = X509::from_pem(cert_pem.as_bytes())
        .map_err(|e| anyhow!("failed to load certificate: {e}"))?;
    let key = PKey::private_key_from_pem(private_key_pem.as_bytes())
        .map_err(|e| anyhow!("failed to load private key: {e}"))?;
    let public = cert
        .public_key()
        .map_err(|e| anyhow!("failed to read certificate public key: {e}"))?;
    Ok(public.public_eq(&key))
}

/// Splits a PEM bundle into the leaf and the remaining chain (possibly empty).
pub fn split_certificate_chain(bundle_pem: &str) -> Result<(String, String)> {
    let blocks = pem::parse_many(bundle_pem)
        .map_err(|err| anyhow!("failed to parse certificate chain PEM: {err}"))?;
    let cert_blocks: Vec<Pem> = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .collect();

    let mut encoded = cert_blocks.iter().map(pem::encode);
    let leaf = encoded
        .next()
        .ok_or_else(|| anyhow!("no certificate PEM blocks found"))?;
    Ok((leaf, encoded.collect::<Vec<_>>().join("")))
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| anyhow!("certificate validity timestamp out of range: {secs}"))
}
