//! Ephemeral key agreement (X25519, ECDH P-256/P-384) and AEAD over the agreed secret.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::{hash_secret, CryptoError, Secret};

/// ChaCha20-Poly1305 nonce length; the nonce is prepended to every ciphertext.
pub const NONCE_SIZE: usize = 12;

const TAG_SIZE: usize = 16;

/// Key agreement algorithm. One byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DhAlgorithm {
    /// Alias for the default algorithm (X25519).
    Traditional = 0,
    X25519 = 1,
    P256 = 2,
    P384 = 3,
}

impl DhAlgorithm {
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Resolve the `Traditional` alias.
    pub fn canonical(self) -> Self {
        match self {
            DhAlgorithm::Traditional => DhAlgorithm::X25519,
            other => other,
        }
    }

    /// Length of the canonical public key encoding.
    pub fn public_key_len(self) -> usize {
        match self.canonical() {
            DhAlgorithm::P256 => 65,
            DhAlgorithm::P384 => 97,
            _ => 32,
        }
    }
}

impl TryFrom<u8> for DhAlgorithm {
    type Error = CryptoError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(DhAlgorithm::Traditional),
            1 => Ok(DhAlgorithm::X25519),
            2 => Ok(DhAlgorithm::P256),
            3 => Ok(DhAlgorithm::P384),
            other => Err(CryptoError::UnsupportedAlgorithm(other)),
        }
    }
}

enum DhSecret {
    X25519(StaticSecret),
    P256(p256::ecdh::EphemeralSecret),
    P384(p384::ecdh::EphemeralSecret),
}

/// One handshake's private key. Create per Quest/Reply, drop after use.
pub struct KeyExchangeSession {
    algorithm: DhAlgorithm,
    secret: DhSecret,
    public: Vec<u8>,
}

impl KeyExchangeSession {
    /// Generate a fresh private key for `algorithm`.
    pub fn generate(algorithm: DhAlgorithm) -> Self {
        let algorithm = algorithm.canonical();
        let (secret, public) = match algorithm {
            DhAlgorithm::P256 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (DhSecret::P256(secret), public)
            }
            DhAlgorithm::P384 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (DhSecret::P384(secret), public)
            }
            _ => {
                let secret = StaticSecret::random_from_rng(OsRng);
                let public = X25519PublicKey::from(&secret).to_bytes().to_vec();
                (DhSecret::X25519(secret), public)
            }
        };
        Self {
            algorithm,
            secret,
            public,
        }
    }

    /// Generate from a raw wire tag. Unknown tags fail with `UnsupportedAlgorithm`.
    pub fn from_tag(tag: u8) -> Result<Self, CryptoError> {
        DhAlgorithm::try_from(tag).map(Self::generate)
    }

    pub fn algorithm(&self) -> DhAlgorithm {
        self.algorithm
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Agree on a secret with the peer's public key. The raw value is always hashed.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<Secret, CryptoError> {
        if peer_public.len() != self.algorithm.public_key_len() {
            return Err(CryptoError::InvalidPeerKey);
        }
        match &self.secret {
            DhSecret::X25519(secret) => {
                let mut peer = [0u8; 32];
                peer.copy_from_slice(peer_public);
                let shared = secret.diffie_hellman(&X25519PublicKey::from(peer));
                // Low-order points give an all-zero, non-contributory result.
                if !shared.was_contributory() {
                    return Err(CryptoError::InvalidPeerKey);
                }
                Ok(hash_secret(shared.as_bytes()))
            }
            DhSecret::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| CryptoError::InvalidPeerKey)?;
                let shared = secret.diffie_hellman(&peer);
                nonzero_secret(shared.raw_secret_bytes().as_slice())
            }
            DhSecret::P384(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| CryptoError::InvalidPeerKey)?;
                let shared = secret.diffie_hellman(&peer);
                nonzero_secret(shared.raw_secret_bytes().as_slice())
            }
        }
    }

    /// Encrypt for the peer: nonce (12 bytes) followed by ChaCha20-Poly1305 output.
    pub fn encrypt(&self, peer_public: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.shared_secret(peer_public)?;
        seal(&key, plaintext)
    }

    /// Decrypt data from the peer. Any tampering fails; no partial plaintext is returned.
    pub fn decrypt(&self, peer_public: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.shared_secret(peer_public)?;
        open(&key, ciphertext)
    }
}

fn nonzero_secret(raw: &[u8]) -> Result<Secret, CryptoError> {
    if raw.iter().all(|b| *b == 0) {
        return Err(CryptoError::InvalidPeerKey);
    }
    Ok(hash_secret(raw))
}

fn seal(key: &Secret, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let body = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + body.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&body);
    Ok(out)
}

fn open(key: &Secret, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Decrypt);
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    let (nonce, body) = data.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| CryptoError::Decrypt)
}
