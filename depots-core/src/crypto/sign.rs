//! Probe signatures (Ed25519).

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use super::CryptoError;

/// Signature algorithm. One byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignAlgorithm {
    /// Alias for the default algorithm (Ed25519).
    Traditional = 0,
    Ed25519 = 1,
}

impl SignAlgorithm {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn canonical(self) -> Self {
        match self {
            SignAlgorithm::Traditional => SignAlgorithm::Ed25519,
            other => other,
        }
    }

    /// Verify `signature` over `message` with a raw public key. Pure; malformed input is `false`.
    pub fn verify(self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        // Ed25519 is the only concrete algorithm; `Traditional` resolves to it.
        let Ok(key) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_strict(message, &sig).is_ok()
    }
}

impl TryFrom<u8> for SignAlgorithm {
    type Error = CryptoError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(SignAlgorithm::Traditional),
            1 => Ok(SignAlgorithm::Ed25519),
            other => Err(CryptoError::UnsupportedAlgorithm(other)),
        }
    }
}

/// Signing state for Probe advertisements.
/// The private key is absent when the context only verifies.
pub struct SignatureContext {
    algorithm: SignAlgorithm,
    signing: Option<SigningKey>,
}

impl SignatureContext {
    /// New context with a freshly generated private key.
    pub fn generate(algorithm: SignAlgorithm) -> Self {
        Self {
            algorithm: algorithm.canonical(),
            signing: Some(SigningKey::generate(&mut OsRng)),
        }
    }

    /// Generate from a raw wire tag.
    pub fn from_tag(tag: u8) -> Result<Self, CryptoError> {
        SignAlgorithm::try_from(tag).map(Self::generate)
    }

    /// Wrap an existing Ed25519 private key (32-byte seed).
    pub fn from_secret_bytes(algorithm: SignAlgorithm, secret: &[u8; 32]) -> Self {
        Self {
            algorithm: algorithm.canonical(),
            signing: Some(SigningKey::from_bytes(secret)),
        }
    }

    /// Verification-only context.
    pub fn verifier(algorithm: SignAlgorithm) -> Self {
        Self {
            algorithm: algorithm.canonical(),
            signing: None,
        }
    }

    pub fn algorithm(&self) -> SignAlgorithm {
        self.algorithm
    }

    pub fn can_sign(&self) -> bool {
        self.signing.is_some()
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.signing.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        Ok(key.sign(message).to_bytes().to_vec())
    }

    pub fn public_key_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let key = self.signing.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        Ok(key.verifying_key().to_bytes().to_vec())
    }

    pub fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        self.algorithm.verify(public_key, message, signature)
    }
}

/// Stateless verification; needs only the public key.
pub fn verify(
    algorithm: SignAlgorithm,
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> bool {
    algorithm.verify(public_key, message, signature)
}
