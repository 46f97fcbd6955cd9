use openssl::{
    hash::MessageDigest,
    nid::Nid,
    pkcs12::Pkcs12,
    pkey::PKey,
    stack::Stack,
    x509::X509,
};

use super::{CertificateMaterial, DeployError, host::CertificateConverter};
use crate::issuance::certificate::split_certificate_chain;

/// PEM to PFX conversion with OpenSSL.
pub struct OpensslPfxConverter {
    /// Older hosts cannot import AES-protected PFX files; use 3DES and SHA-1 MAC.
    legacy_encryption: bool,
}

impl OpensslPfxConverter {
    pub fn new(legacy_encryption: bool) -> Self {
        Self { legacy_encryption }
    }
}

fn conversion(context: &str) -> impl Fn(openssl::error::ErrorStack) -> DeployError + '_ {
    move |err| DeployError::Conversion(format!("{context}: {err}"))
}

impl CertificateConverter for OpensslPfxConverter {
    fn to_pfx(
        &self,
        material: &CertificateMaterial,
        password: &str,
        friendly_name: &str,
    ) -> Result<Vec<u8>, DeployError> {
        // Issuers sometimes hand back the leaf with its chain appended.
        let (leaf_pem, bundled_chain) = split_certificate_chain(&material.certificate_pem)
            .map_err(|err| DeployError::Conversion(err.to_string()))?;
        let leaf = X509::from_pem(leaf_pem.as_bytes()).map_err(conversion("certificate"))?;
        let key = PKey::private_key_from_pem(material.private_key_pem.as_bytes())
            .map_err(conversion("private key"))?;
        let leaf_key = leaf.public_key().map_err(conversion("certificate public key"))?;
        if !leaf_key.public_eq(&key) {
            return Err(DeployError::Conversion(
                "private key does not match certificate".into(),
            ));
        }

        let mut ca = Stack::new().map_err(conversion("chain"))?;
        let chain_pem = format!(
            "{}{}",
            bundled_chain,
            material.chain_pem.as_deref().unwrap_or_default()
        );
        if !chain_pem.trim().is_empty() {
            for cert in X509::stack_from_pem(chain_pem.as_bytes()).map_err(conversion("chain"))? {
                ca.push(cert).map_err(conversion("chain"))?;
            }
        }

        let mut builder = Pkcs12::builder();
        builder.name(friendly_name).pkey(&key).cert(&leaf).ca(ca);
        if self.legacy_encryption {
            builder
                .key_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
                .cert_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
                .mac_md(MessageDigest::sha1());
        }
        let pfx = builder.build2(password).map_err(conversion("pkcs12"))?;
        pfx.to_der().map_err(conversion("pkcs12 encoding"))
    }
}
