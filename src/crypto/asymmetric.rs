//! RSA-OAEP encryption used during the handshake.
//!
//! Only small secrets travel this way: the 6-digit challenge and the 32-byte
//! session key. On the wire the ciphertext is Base64 text.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

/// Errors that can occur during asymmetric encryption operations.
#[derive(Error, Debug)]
pub enum AsymmetricError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
}

/// Encrypts `plaintext` for the holder of `recipient`'s private key.
pub fn encrypt(plaintext: &[u8], recipient: &RsaPublicKey) -> Result<Vec<u8>, AsymmetricError> {
    recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| AsymmetricError::EncryptionFailed(e.to_string()))
}

/// Decrypts an OAEP ciphertext with our private key.
pub fn decrypt(ciphertext: &[u8], private: &RsaPrivateKey) -> Result<Vec<u8>, AsymmetricError> {
    private
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| AsymmetricError::DecryptionFailed(e.to_string()))
}

/// Encrypts and Base64-encodes in one step.
pub fn encrypt_to_base64(
    plaintext: &[u8],
    recipient: &RsaPublicKey,
) -> Result<String, AsymmetricError> {
    Ok(BASE64.encode(encrypt(plaintext, recipient)?))
}

/// Base64-decodes and decrypts in one step.
pub fn decrypt_from_base64(
    encoded: &str,
    private: &RsaPrivateKey,
) -> Result<Vec<u8>, AsymmetricError> {
    let ciphertext = BASE64.decode(encoded.trim())?;
    decrypt(&ciphertext, private)
}
