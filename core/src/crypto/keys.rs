// Key material — this node's secrets and the public bundle peers exchange

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::CryptoError;

/// Length of a serialized `KeyBundle`
pub const KEY_BUNDLE_SIZE: usize = 96;

/// This node's private keys.
///
/// - `agreement`: X25519 static secret used to derive per-peer shared keys
/// - `signing`: Ed25519 key that signs outgoing packets
/// - `identity`: long-term Ed25519 key whose public half names this node
#[derive(Clone)]
pub struct LocalKeys {
    agreement: StaticSecret,
    signing: SigningKey,
    identity: SigningKey,
}

impl LocalKeys {
    /// Generate a fresh set of keys
    pub fn generate() -> Self {
        Self {
            agreement: StaticSecret::random_from_rng(OsRng),
            signing: random_signing_key(),
            identity: random_signing_key(),
        }
    }

    /// Rebuild keys from persisted 32-byte secrets
    pub fn from_secret_bytes(agreement: [u8; 32], signing: [u8; 32], identity: [u8; 32]) -> Self {
        Self {
            agreement: StaticSecret::from(agreement),
            signing: SigningKey::from_bytes(&signing),
            identity: SigningKey::from_bytes(&identity),
        }
    }

    /// Public half of every key, ready to send in a KeyExchange packet
    pub fn bundle(&self) -> KeyBundle {
        KeyBundle {
            agreement: X25519PublicKey::from(&self.agreement).to_bytes(),
            signing: self.signing.verifying_key().to_bytes(),
            identity: self.identity.verifying_key().to_bytes(),
        }
    }

    pub(crate) fn agreement(&self) -> &StaticSecret {
        &self.agreement
    }

    pub(crate) fn signing(&self) -> &SigningKey {
        &self.signing
    }
}

impl fmt::Debug for LocalKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeys")
            .field("fingerprint", &self.bundle().fingerprint())
            .finish_non_exhaustive()
    }
}

fn random_signing_key() -> SigningKey {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    let key = SigningKey::from_bytes(&secret);
    secret.zeroize();
    key
}

/// Combined public key material: agreement ‖ signing ‖ identity (96 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBundle {
    pub agreement: [u8; 32],
    pub signing: [u8; 32],
    pub identity: [u8; 32],
}

impl KeyBundle {
    pub fn to_bytes(&self) -> [u8; KEY_BUNDLE_SIZE] {
        let mut out = [0u8; KEY_BUNDLE_SIZE];
        out[..32].copy_from_slice(&self.agreement);
        out[32..64].copy_from_slice(&self.signing);
        out[64..].copy_from_slice(&self.identity);
        out
    }

    /// Parse exactly 96 bytes. The two Ed25519 halves must be valid curve points.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_BUNDLE_SIZE {
            return Err(CryptoError::InvalidKeyBundle(bytes.len()));
        }
        let mut bundle = Self {
            agreement: [0u8; 32],
            signing: [0u8; 32],
            identity: [0u8; 32],
        };
        bundle.agreement.copy_from_slice(&bytes[..32]);
        bundle.signing.copy_from_slice(&bytes[32..64]);
        bundle.identity.copy_from_slice(&bytes[64..]);

        bundle.verifying_key()?;
        bundle.identity_key()?;
        Ok(bundle)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.signing).map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn identity_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.identity).map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// SHA-256 of the identity key, hex-encoded
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.identity))
    }
}

/// Supplies this node's keys at startup (platform keystore, file, or fresh)
pub trait KeySource: Send + Sync {
    fn load(&self) -> Result<LocalKeys, CryptoError>;
}

/// Generates new keys on every load; nothing survives a restart
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralKeySource;

impl KeySource for EphemeralKeySource {
    fn load(&self) -> Result<LocalKeys, CryptoError> {
        Ok(LocalKeys::generate())
    }
}
