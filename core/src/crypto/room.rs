// Room keys — password-derived symmetric keys for channel messages

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

use super::encrypt::{open_with_key, seal_with_key};
use super::CryptoError;

/// PBKDF2 rounds for room key derivation
pub const ROOM_KEY_ITERATIONS: u32 = 100_000;

const ROOM_SALT_PREFIX: &str = "bitchat-room-";

/// 32-byte ChaCha20-Poly1305 key shared by everyone who knows the room password
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey(Zeroizing<[u8; 32]>);

impl RoomKey {
    /// PBKDF2-HMAC-SHA256(password, "bitchat-room-" ‖ room)
    pub fn derive(room: &str, password: &str) -> Self {
        Self::derive_with_iterations(room, password, ROOM_KEY_ITERATIONS)
    }

    pub(crate) fn derive_with_iterations(room: &str, password: &str, iterations: u32) -> Self {
        let salt = format!("{ROOM_SALT_PREFIX}{room}");
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), iterations, &mut key[..]);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal_with_key(&self.0, plaintext)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open_with_key(&self.0, data)
    }
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic_and_salted_by_room() {
        let a = RoomKey::derive_with_iterations("#general", "hunter2", 1_000);
        let b = RoomKey::derive_with_iterations("#general", "hunter2", 1_000);
        let c = RoomKey::derive_with_iterations("#random", "hunter2", 1_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_full_iteration_count_matches_explicit() {
        let a = RoomKey::derive("#mesh", "pw");
        let b = RoomKey::derive_with_iterations("#mesh", "pw", ROOM_KEY_ITERATIONS);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_room_roundtrip_and_wrong_password() {
        let key = RoomKey::derive_with_iterations("#ops", "right", 1_000);
        let wrong = RoomKey::derive_with_iterations("#ops", "wrong", 1_000);
        let ct = key.encrypt(b"meet at noon").unwrap();
        assert_eq!(key.decrypt(&ct).unwrap(), b"meet at noon");
        assert_eq!(wrong.decrypt(&ct), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_debug_redacts() {
        let key = RoomKey::from_bytes([7; 32]);
        assert_eq!(format!("{key:?}"), "RoomKey(..)");
    }
}
