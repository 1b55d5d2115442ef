//! RSA key generation and PEM handling for Sirius.
//!
//! Every endpoint generates a fresh RSA key pair at startup. Only the public
//! half ever leaves the process, encoded as SPKI PEM
//! (`-----BEGIN PUBLIC KEY-----`). PKCS#1 PEM
//! (`-----BEGIN RSA PUBLIC KEY-----`) is accepted on input for older peers.

use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

/// Smallest modulus we generate or accept from a peer.
pub const MIN_RSA_BITS: usize = 2048;

/// Default modulus size for freshly generated key pairs.
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Errors that can occur during key operations.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key size too small: {bits} bits (minimum {min})")]
    KeyTooSmall { bits: usize, min: usize },

    #[error("Invalid PEM format: {0}")]
    InvalidPemFormat(String),
}

/// An RSA key pair. The private half never leaves this struct.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    public_pem: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("bits", &self.bits())
            .field("private", &"[REDACTED]")
            .finish()
    }
}

impl KeyPair {
    /// Generates a new key pair with the default modulus size.
    pub fn generate() -> Result<Self, KeyError> {
        Self::generate_with_bits(DEFAULT_RSA_BITS)
    }

    /// Generates a new key pair with an explicit modulus size.
    pub fn generate_with_bits(bits: usize) -> Result<Self, KeyError> {
        if bits < MIN_RSA_BITS {
            return Err(KeyError::KeyTooSmall {
                bits,
                min: MIN_RSA_BITS,
            });
        }

        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;
        let public = private.to_public_key();
        let public_pem = encode_public_key_pem(&public)?;

        Ok(Self {
            private,
            public,
            public_pem,
        })
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Returns the private key.
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// Returns the public key as SPKI PEM text, ready for the wire.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.public.size() * 8
    }
}

/// Encodes a public key as SPKI PEM with LF line endings.
pub fn encode_public_key_pem(key: &RsaPublicKey) -> Result<String, KeyError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| KeyError::InvalidPemFormat(e.to_string()))
}

/// Decodes a peer's public key from PEM text.
///
/// Accepts SPKI (`PUBLIC KEY`) and PKCS#1 (`RSA PUBLIC KEY`) encodings and
/// rejects moduli smaller than [`MIN_RSA_BITS`].
pub fn decode_public_key_pem(pem: &str) -> Result<RsaPublicKey, KeyError> {
    let pem = pem.trim();
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|spki_err| {
            RsaPublicKey::from_pkcs1_pem(pem).map_err(|_| spki_err.to_string())
        })
        .map_err(KeyError::InvalidPemFormat)?;

    let bits = key.size() * 8;
    if bits < MIN_RSA_BITS {
        return Err(KeyError::KeyTooSmall {
            bits,
            min: MIN_RSA_BITS,
        });
    }

    Ok(key)
}
