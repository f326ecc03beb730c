//! Noise IKpsk2 symmetric state
//!
//! Pattern: Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s. Both handshake roles
//! share this state object; the message flow lives in `device::handshake`.

use zeroize::Zeroize;

use super::{aead, blake2s};
use crate::error::CryptoError;

/// Noise construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// Protocol identifier mixed into the initial hash
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Running chaining-key / hash pair for an in-flight handshake
#[derive(Clone)]
pub struct SymmetricState {
    pub chaining_key: [u8; blake2s::HASH_LEN],
    pub hash: [u8; blake2s::HASH_LEN],
}

impl SymmetricState {
    /// ck = HASH(CONSTRUCTION)
    pub fn initial_chaining_key() -> [u8; blake2s::HASH_LEN] {
        blake2s::hash(CONSTRUCTION)
    }

    /// h = HASH(HASH(ck || IDENTIFIER) || responder_static)
    ///
    /// Both roles seed the hash with the responder's static public key.
    pub fn new(responder_static: &[u8; 32]) -> Self {
        let ck = Self::initial_chaining_key();
        let h = blake2s::hash_two(&blake2s::hash_two(&ck, IDENTIFIER), responder_static);
        Self {
            chaining_key: ck,
            hash: h,
        }
    }

    /// h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    /// ck = KDF1(ck, ikm); used for ephemerals which carry no key output
    pub fn mix_chain(&mut self, ikm: &[u8]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, ikm);
    }

    /// (ck, k) = KDF2(ck, ikm); returns k
    pub fn mix_key(&mut self, ikm: &[u8]) -> [u8; 32] {
        let (ck, key) = blake2s::kdf2(&self.chaining_key, ikm);
        self.chaining_key = ck;
        key
    }

    /// (ck, t, k) = KDF3(ck, psk); t is mixed into the hash, k returned
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let (ck, mut tau, key) = blake2s::kdf3(&self.chaining_key, psk);
        self.chaining_key = ck;
        self.mix_hash(&tau);
        tau.zeroize();
        key
    }

    /// c = AEAD(k, 0, p, h); h = HASH(h || c)
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::seal(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// p = AEAD-open(k, 0, c, h); h = HASH(h || c)
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::open(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Final transport keys: (send, recv) = KDF2(ck, "") from the
    /// initiator's perspective; the responder swaps them.
    pub fn derive_transport_keys(&self, initiator: bool) -> ([u8; 32], [u8; 32]) {
        let (t1, t2) = blake2s::kdf2(&self.chaining_key, &[]);
        if initiator {
            (t1, t2)
        } else {
            (t2, t1)
        }
    }
}

impl Drop for SymmetricState {
    fn drop(&mut self) {
        self.chaining_key.zeroize();
        self.hash.zeroize();
    }
}

/// mac1_key = HASH(LABEL_MAC1 || receiver_static)
pub fn mac1_key(receiver_static: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_MAC1, receiver_static)
}

/// cookie_key = HASH(LABEL_COOKIE || receiver_static)
pub fn cookie_key(receiver_static: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_COOKIE, receiver_static)
}
