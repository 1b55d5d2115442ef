//! Secure channel codec: AES-256-GCM with detached tags.
//!
//! Every chat payload is sealed into a [`SealedPayload`], which travels as
//! three Base64 strings (`nonce`, `tag`, `ciphertext`). A fresh random
//! 96-bit nonce is drawn for every call to [`seal`].

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Session key size in bytes (AES-256).
pub const SESSION_KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM.
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for AES-GCM.
pub const TAG_SIZE: usize = 16;

/// Errors that can occur during symmetric encryption.
#[derive(Error, Debug)]
pub enum SymmetricError {
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Tag mismatch, wrong key, bad field length or bad Base64.
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Invalid session key length: expected {SESSION_KEY_SIZE}, got {0}")]
    InvalidKeyLength(usize),
}

/// A 256-bit symmetric session key, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

impl SessionKey {
    /// Generates a random session key.
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Builds a session key from raw bytes, which must be exactly 32 long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SymmetricError> {
        let key: [u8; SESSION_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| SymmetricError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

/// Wire form of a sealed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SealedPayload {
    pub nonce: String,
    pub tag: String,
    pub ciphertext: String,
}

/// Encrypts `plaintext` under `key`.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<SealedPayload, SymmetricError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let mut buffer = plaintext.to_vec();
    let tag = key
        .cipher()
        .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), b"", &mut buffer)
        .map_err(|_| SymmetricError::EncryptionFailed)?;

    Ok(SealedPayload {
        nonce: BASE64.encode(nonce_bytes),
        tag: BASE64.encode(tag),
        ciphertext: BASE64.encode(buffer),
    })
}

/// Decrypts and verifies a sealed payload.
///
/// Never returns partially decrypted data: any failure yields
/// [`SymmetricError::AuthenticationFailure`].
pub fn open(key: &SessionKey, sealed: &SealedPayload) -> Result<Vec<u8>, SymmetricError> {
    let nonce = decode_field("nonce", &sealed.nonce, Some(NONCE_SIZE))?;
    let tag = decode_field("tag", &sealed.tag, Some(TAG_SIZE))?;
    let mut buffer = decode_field("ciphertext", &sealed.ciphertext, None)?;

    key.cipher()
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            b"",
            &mut buffer,
            Tag::from_slice(&tag),
        )
        .map_err(|_| SymmetricError::AuthenticationFailure("tag mismatch".to_string()))?;

    Ok(buffer)
}

/// Opens a sealed payload and requires UTF-8 text inside.
pub fn open_text(key: &SessionKey, sealed: &SealedPayload) -> Result<String, SymmetricError> {
    String::from_utf8(open(key, sealed)?).map_err(|_| {
        SymmetricError::AuthenticationFailure("plaintext is not UTF-8".to_string())
    })
}

fn decode_field(
    name: &str,
    value: &str,
    expected_len: Option<usize>,
) -> Result<Vec<u8>, SymmetricError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|e| SymmetricError::AuthenticationFailure(format!("{}: {}", name, e)))?;

    match expected_len {
        Some(len) if bytes.len() != len => Err(SymmetricError::AuthenticationFailure(format!(
            "{}: expected {} bytes, got {}",
            name,
            len,
            bytes.len()
        ))),
        _ => Ok(bytes),
    }
}
