use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

const SEALED_PREFIX: &str = "v1.";
const NONCE_LEN: usize = 12;
pub const MASTER_KEY_LEN: usize = 32;

/// Errors produced by secret storage backends.
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store error: {0}")]
    Store(String),
    #[error("secret vault is locked: {0}")]
    Locked(String),
}

/// Encrypts `plaintext` with AES-256-GCM. `context` is bound as associated data,
/// so a sealed blob only opens under the same context it was sealed with.
pub fn seal(master_key: &[u8], context: &str, plaintext: &[u8]) -> Result<String, SecretStoreError> {
    let cipher = Aes256Gcm::new_from_slice(master_key)
        .map_err(|err| SecretStoreError::Store(format!("invalid master key: {err}")))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: context.as_bytes(),
            },
        )
        .map_err(|_| SecretStoreError::Store("encryption failed".into()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(format!("{SEALED_PREFIX}{}", general_purpose::STANDARD.encode(blob)))
}

pub fn open(
    master_key: &[u8],
    context: &str,
    sealed: &str,
) -> Result<Zeroizing<Vec<u8>>, SecretStoreError> {
    let encoded = sealed
        .trim()
        .strip_prefix(SEALED_PREFIX)
        .ok_or_else(|| SecretStoreError::Store("unrecognized sealed secret format".into()))?;
    let blob = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| SecretStoreError::Store(format!("sealed secret is not base64: {err}")))?;
    if blob.len() <= NONCE_LEN {
        return Err(SecretStoreError::Store("sealed secret is truncated".into()));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(master_key)
        .map_err(|err| SecretStoreError::Store(format!("invalid master key: {err}")))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: context.as_bytes(),
            },
        )
        .map_err(|_| {
            SecretStoreError::Store("decryption failed; wrong master key or tampered data".into())
        })?;
    Ok(Zeroizing::new(plaintext))
}

pub fn generate_master_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; MASTER_KEY_LEN]);
    rand::thread_rng().fill_bytes(&mut key);
    key
}
