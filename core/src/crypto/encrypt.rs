// Per-peer encryption: X25519 agreement + HKDF-SHA256 + ChaCha20-Poly1305
//
// Flow:
// 1. Peer sends its KeyBundle (agreement ‖ signing ‖ identity)
// 2. ECDH: local_agreement_secret × peer_agreement_public → shared_secret
// 3. KDF: HKDF-SHA256(salt = "bitchat-v1", info = "") → 32-byte key
// 4. Encrypt: ChaCha20-Poly1305(key, random 12-byte nonce, plaintext)
// 5. Output: nonce ‖ ciphertext ‖ tag
//
// Keys live only in memory and are zeroized when dropped or replaced.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, VerifyingKey};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use tracing::debug;
use x25519_dalek::PublicKey as X25519PublicKey;
use zeroize::Zeroizing;

use super::keys::{KeyBundle, LocalKeys};
use super::CryptoError;
use crate::wire::PeerId;

/// HKDF salt. Changing this breaks compatibility with every deployed node.
const KDF_SALT: &[u8] = b"bitchat-v1";

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Derived state for one remote peer
struct PeerKeyState {
    shared_key: Zeroizing<[u8; 32]>,
    verifying_key: Option<VerifyingKey>,
    identity_key: Option<VerifyingKey>,
}

/// Owns this node's keys and every per-peer shared key.
pub struct PeerEncryptionStore {
    local: LocalKeys,
    peers: RwLock<HashMap<PeerId, PeerKeyState>>,
}

impl PeerEncryptionStore {
    pub fn new(local: LocalKeys) -> Self {
        Self {
            local,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Public bundle to advertise in KeyExchange packets
    pub fn local_bundle(&self) -> KeyBundle {
        self.local.bundle()
    }

    /// Derive and store the shared key for `peer`. Calling again overwrites
    /// the key but keeps any verification keys already recorded.
    pub fn derive_shared_key(
        &self,
        peer: PeerId,
        peer_agreement_key: &[u8; 32],
    ) -> Result<(), CryptoError> {
        let shared_key = derive_key(&self.local, peer_agreement_key)?;

        let mut peers = self.peers.write();
        match peers.get_mut(&peer) {
            Some(state) => state.shared_key = shared_key,
            None => {
                peers.insert(
                    peer,
                    PeerKeyState {
                        shared_key,
                        verifying_key: None,
                        identity_key: None,
                    },
                );
            }
        }
        Ok(())
    }

    /// Feed a peer's full key bundle: derives the shared key and records the
    /// signing and identity keys. Returns true if this peer was unknown.
    pub fn add_peer_bundle(&self, peer: PeerId, bundle: &KeyBundle) -> Result<bool, CryptoError> {
        let verifying_key = bundle.verifying_key()?;
        let identity_key = bundle.identity_key()?;
        let shared_key = derive_key(&self.local, &bundle.agreement)?;

        let previous = self.peers.write().insert(
            peer,
            PeerKeyState {
                shared_key,
                verifying_key: Some(verifying_key),
                identity_key: Some(identity_key),
            },
        );

        debug!("Stored key bundle for peer {} ({})", peer, bundle.fingerprint());
        Ok(previous.is_none())
    }

    /// Parse a raw 96-byte bundle and feed it to `add_peer_bundle`
    pub fn add_peer_bundle_bytes(&self, peer: PeerId, bytes: &[u8]) -> Result<bool, CryptoError> {
        let bundle = KeyBundle::from_bytes(bytes)?;
        self.add_peer_bundle(peer, &bundle)
    }

    pub fn has_shared_secret(&self, peer: &PeerId) -> bool {
        self.peers.read().contains_key(peer)
    }

    /// Long-term identity key of `peer`, if a bundle was received
    pub fn peer_identity(&self, peer: &PeerId) -> Option<[u8; 32]> {
        self.peers
            .read()
            .get(peer)
            .and_then(|s| s.identity_key)
            .map(|k| k.to_bytes())
    }

    pub fn encrypt(&self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.shared_key(peer)?;
        seal_with_key(&key, plaintext)
    }

    pub fn decrypt(&self, peer: &PeerId, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.shared_key(peer)?;
        open_with_key(&key, data)
    }

    /// Sign with the local signing key
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.local.signing().sign(data).to_bytes()
    }

    /// Check `signature` against the verification key recorded for `peer`.
    ///
    /// `Ok(false)` means the key is known but the signature does not match.
    pub fn verify(&self, peer: &PeerId, signature: &[u8; 64], data: &[u8]) -> Result<bool, CryptoError> {
        let verifying_key = self
            .peers
            .read()
            .get(peer)
            .and_then(|s| s.verifying_key)
            .ok_or(CryptoError::NoSharedSecret(*peer))?;

        let sig = Signature::from_bytes(signature);
        Ok(verifying_key.verify_strict(data, &sig).is_ok())
    }

    /// Copy of the shared key; the copy wipes itself on drop
    fn shared_key(&self, peer: &PeerId) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        self.peers
            .read()
            .get(peer)
            .map(|s| s.shared_key.clone())
            .ok_or(CryptoError::NoSharedSecret(*peer))
    }
}

fn derive_key(local: &LocalKeys, peer_agreement_key: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let peer_public = X25519PublicKey::from(*peer_agreement_key);
    let shared_secret = local.agreement().diffie_hellman(&peer_public);

    // Low-order points yield an all-zero secret
    if !shared_secret.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), shared_secret.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(&[], &mut key[..])
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(key)
}

/// AEAD-seal `plaintext` under `key` with a fresh random nonce.
/// Output: nonce(12) ‖ ciphertext ‖ tag(16).
pub fn seal_with_key(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverse of `seal_with_key`. Anything of 12 bytes or fewer cannot hold a
/// nonce plus ciphertext and is rejected outright.
pub fn open_with_key(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() <= NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (PeerEncryptionStore, PeerEncryptionStore, PeerId, PeerId) {
        let alice = PeerEncryptionStore::new(LocalKeys::generate());
        let bob = PeerEncryptionStore::new(LocalKeys::generate());
        let alice_id = PeerId::from_str_lossy("alice");
        let bob_id = PeerId::from_str_lossy("bob");
        alice.add_peer_bundle(bob_id, &bob.local_bundle()).unwrap();
        bob.add_peer_bundle(alice_id, &alice.local_bundle()).unwrap();
        (alice, bob, alice_id, bob_id)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (alice, bob, alice_id, bob_id) = pair();
        let ct = alice.encrypt(&bob_id, b"Hello, this is a secret message!").unwrap();
        assert_eq!(ct.len(), NONCE_SIZE + 32 + TAG_SIZE);
        let pt = bob.decrypt(&alice_id, &ct).unwrap();
        assert_eq!(pt, b"Hello, this is a secret message!");
    }

    #[test]
    fn test_empty_plaintext() {
        let (alice, bob, alice_id, bob_id) = pair();
        let ct = alice.encrypt(&bob_id, b"").unwrap();
        assert_eq!(ct.len(), NONCE_SIZE + TAG_SIZE);
        assert!(bob.decrypt(&alice_id, &ct).unwrap().is_empty());
    }

    #[test]
    fn test_no_shared_secret() {
        let store = PeerEncryptionStore::new(LocalKeys::generate());
        let stranger = PeerId::from_str_lossy("nobody");
        assert_eq!(
            store.encrypt(&stranger, b"hi"),
            Err(CryptoError::NoSharedSecret(stranger))
        );
        assert_eq!(
            store.decrypt(&stranger, &[0u8; 40]),
            Err(CryptoError::NoSharedSecret(stranger))
        );
        assert!(matches!(
            store.verify(&stranger, &[0u8; 64], b"data"),
            Err(CryptoError::NoSharedSecret(_))
        ));
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let (_, bob, alice_id, _) = pair();
        assert_eq!(bob.decrypt(&alice_id, &[0u8; 12]), Err(CryptoError::DecryptionFailed));
        assert_eq!(bob.decrypt(&alice_id, &[]), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (alice, bob, alice_id, bob_id) = pair();
        let mut ct = alice.encrypt(&bob_id, b"Secret message").unwrap();
        if let Some(byte) = ct.last_mut() {
            *byte ^= 0xFF;
        }
        assert_eq!(bob.decrypt(&alice_id, &ct), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_third_party_cannot_decrypt() {
        let (alice, _, alice_id, bob_id) = pair();
        let eve = PeerEncryptionStore::new(LocalKeys::generate());
        eve.add_peer_bundle(alice_id, &alice.local_bundle()).unwrap();

        let ct = alice.encrypt(&bob_id, b"for bob only").unwrap();
        assert_eq!(eve.decrypt(&alice_id, &ct), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let (alice, _, _, bob_id) = pair();
        let a = alice.encrypt(&bob_id, b"message 1").unwrap();
        let b = alice.encrypt(&bob_id, b"message 1").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn test_sign_verify() {
        let (alice, bob, alice_id, _) = pair();
        let sig = alice.sign(b"payload");
        assert!(bob.verify(&alice_id, &sig, b"payload").unwrap());
        assert!(!bob.verify(&alice_id, &sig, b"tampered").unwrap());

        let mut bad = sig;
        bad[0] ^= 0xFF;
        assert!(!bob.verify(&alice_id, &bad, b"payload").unwrap());
    }

    #[test]
    fn test_add_bundle_reports_new_peer_once() {
        let store = PeerEncryptionStore::new(LocalKeys::generate());
        let other = LocalKeys::generate().bundle();
        let peer = PeerId::from_str_lossy("p");
        assert!(store.add_peer_bundle(peer, &other).unwrap());
        assert!(!store.add_peer_bundle(peer, &other).unwrap());
        assert!(store.has_shared_secret(&peer));
        assert_eq!(store.peer_identity(&peer), Some(other.identity));
    }

    #[test]
    fn test_derive_shared_key_overwrites() {
        let (alice, bob, _, bob_id) = pair();
        let ct_before = alice.encrypt(&bob_id, b"x").unwrap();

        // Bob rejoins with new keys
        let bob2 = PeerEncryptionStore::new(LocalKeys::generate());
        alice
            .derive_shared_key(bob_id, &bob2.local_bundle().agreement)
            .unwrap();
        let ct_after = alice.encrypt(&bob_id, b"x").unwrap();

        let alice_id = PeerId::from_str_lossy("alice");
        bob2.add_peer_bundle(alice_id, &alice.local_bundle()).unwrap();
        assert_eq!(bob2.decrypt(&alice_id, &ct_after).unwrap(), b"x");
        assert!(bob2.decrypt(&alice_id, &ct_before).is_err());
        assert!(bob.decrypt(&alice_id, &ct_after).is_err());

        // Verification key from the first bundle is retained
        let sig = bob.sign(b"y");
        assert!(alice.verify(&bob_id, &sig, b"y").unwrap());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let store = PeerEncryptionStore::new(LocalKeys::generate());
        let result = store.derive_shared_key(PeerId::from_str_lossy("evil"), &[0u8; 32]);
        assert_eq!(result, Err(CryptoError::InvalidPublicKey));
    }

    #[test]
    fn test_seal_open_with_raw_key() {
        let key = [42u8; 32];
        let sealed = seal_with_key(&key, b"room text").unwrap();
        assert_eq!(open_with_key(&key, &sealed).unwrap(), b"room text");
        assert!(open_with_key(&[41u8; 32], &sealed).is_err());
    }
}
