//! Handshake crypto: ephemeral key agreement for Quest/Reply, signatures for Probe.

pub mod dh;
pub mod sign;

use sha2::{Digest, Sha256};

pub use dh::{DhAlgorithm, KeyExchangeSession};
pub use sign::{verify, SignAlgorithm, SignatureContext};

/// Shared secret length in bytes (256 bits).
pub const SECRET_SIZE: usize = 32;

/// Shared secret after hashing; ready to key the AEAD cipher.
pub type Secret = [u8; SECRET_SIZE];

/// Hash a raw agreed value into a `Secret`.
/// Every DH algorithm goes through this, so secrets have one length and distribution.
pub fn hash_secret(raw: &[u8]) -> Secret {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    hasher.finalize().into()
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("unsupported algorithm tag {0}")]
    UnsupportedAlgorithm(u8),
    #[error("invalid peer public key")]
    InvalidPeerKey,
    #[error("no private key in signature context")]
    MissingPrivateKey,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
