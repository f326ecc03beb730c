//! ChaCha20-Poly1305 AEAD for transport and handshake payloads
//!
//! The transport nonce is the 64-bit send counter zero-padded to 96 bits
//! (counter in the last 8 bytes, little-endian). Cookie boxes use
//! XChaCha20-Poly1305 with an explicit 24-byte nonce.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;

/// Poly1305 authentication tag length
pub const TAG_LEN: usize = 16;

/// AEAD key length
pub const KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

fn counter_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}

/// Seal plaintext under a counter nonce
pub fn seal(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(&counter_nonce(counter), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Open ciphertext under a counter nonce
pub fn open(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(&counter_nonce(counter), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}

/// Seal under an explicit 24-byte nonce (cookie replies)
pub fn xseal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Open under an explicit 24-byte nonce (cookie replies)
pub fn xopen(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}
