// Cryptography module — key bundles, per-peer AEAD, signatures, room keys

pub mod encrypt;
pub mod keys;
pub mod room;

pub use encrypt::{open_with_key, seal_with_key, PeerEncryptionStore};
pub use keys::{EphemeralKeySource, KeyBundle, KeySource, LocalKeys, KEY_BUNDLE_SIZE};
pub use room::RoomKey;

use crate::wire::PeerId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("No shared secret for peer {0}")]
    NoSharedSecret(PeerId),

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Invalid key bundle: expected 96 bytes, got {0}")]
    InvalidKeyBundle(usize),

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid signature")]
    InvalidSignature,
}
