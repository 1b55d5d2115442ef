//! Cryptographic primitives for Sirius.
//!
//! This module provides:
//! - RSA key pairs and PEM encoding ([`keys`])
//! - RSA-OAEP encryption for handshake secrets ([`asymmetric`])
//! - One-time numeric challenges ([`challenge`])
//! - The AES-256-GCM secure channel codec ([`symmetric`])

pub mod asymmetric;
pub mod challenge;
pub mod keys;
pub mod symmetric;

pub use asymmetric::{decrypt_from_base64, encrypt_to_base64, AsymmetricError};
pub use challenge::{Challenge, CHALLENGE_DIGITS};
pub use keys::{
    decode_public_key_pem, encode_public_key_pem, KeyError, KeyPair, DEFAULT_RSA_BITS,
    MIN_RSA_BITS,
};
pub use symmetric::{open, open_text, seal, SealedPayload, SessionKey, SymmetricError};
