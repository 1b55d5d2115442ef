//! One-time numeric challenges for proving possession of a private key.

use rand::{rngs::OsRng, Rng};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Number of decimal digits in a challenge.
pub const CHALLENGE_DIGITS: usize = 6;

/// A freshly generated challenge. Zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Challenge(String);

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Challenge([REDACTED])")
    }
}

impl Challenge {
    /// Draws a uniformly random 6-digit challenge (leading zeros kept).
    pub fn generate() -> Self {
        let value: u32 = OsRng.gen_range(0..10u32.pow(CHALLENGE_DIGITS as u32));
        Self(format!("{:0width$}", value, width = CHALLENGE_DIGITS))
    }

    /// The challenge text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares a decrypted response against this challenge in constant time.
    pub fn verify(&self, response: &[u8]) -> bool {
        self.0.as_bytes().ct_eq(response).into()
    }
}
