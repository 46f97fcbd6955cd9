use anyhow::{Result, anyhow};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use zeroize::Zeroizing;

/// A freshly generated key pair and the signing request built from it.
pub struct GeneratedRequest {
    pub private_key_pem: Zeroizing<String>,
    pub csr_pem: String,
}

/// Generates an ECDSA P-256 key and a CSR whose CN is the first domain and
/// whose SANs cover every domain. IP literals become IP SANs.
pub fn generate_signing_request(domains: &[String]) -> Result<GeneratedRequest> {
    let primary = domains
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("primary domain missing"))?;

    let key = KeyPair::generate().map_err(|e| anyhow!("failed to generate private key: {e}"))?;
    let mut params = CertificateParams::new(domains.to_vec())
        .map_err(|e| anyhow!("invalid subject alternative names: {e}"))?;
    let mut subject = DistinguishedName::new();
    subject.push(DnType::CommonName, primary);
    params.distinguished_name = subject;

    let csr_pem = params
        .serialize_request(&key)
        .and_then(|csr| csr.pem())
        .map_err(|e| anyhow!("failed to build signing request: {e}"))?;

    Ok(GeneratedRequest {
        private_key_pem: Zeroizing::new(key.serialize_pem()),
        csr_pem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_request_for_all_domains() {
        let domains = vec!["example.com".to_string(), "www.example.com".to_string()];
        let generated = generate_signing_request(&domains).expect("csr");
        assert!(generated.csr_pem.contains("BEGIN CERTIFICATE REQUEST"));
        assert!(generated.private_key_pem.contains("BEGIN PRIVATE KEY"));

        let req = openssl::x509::X509Req::from_pem(generated.csr_pem.as_bytes()).expect("parse");
        let key = openssl::pkey::PKey::private_key_from_pem(generated.private_key_pem.as_bytes())
            .expect("key");
        assert!(req.public_key().expect("public").public_eq(&key));
    }

    #[test]
    fn rejects_empty_domain_list() {
        assert!(generate_signing_request(&[]).is_err());
    }
}
