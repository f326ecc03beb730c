//! Cryptographic primitives for the WireGuard protocol
//!
//! BLAKE2s hashing and key derivation, ChaCha20-Poly1305 AEAD,
//! X25519 Diffie-Hellman, and the Noise IKpsk2 symmetric state.

pub mod aead;
pub mod blake2s;
pub mod noise;
pub mod x25519;
