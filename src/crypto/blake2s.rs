//! BLAKE2s primitives: hash, keyed MAC, HMAC, and the KDF chain
//!
//! The KDFs follow the HKDF-like counter construction the protocol
//! requires; outputs must match other WireGuard implementations bit for
//! bit.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;

/// RFC 2104 HMAC over BLAKE2s-256 (what every interoperating
/// implementation uses, despite the whitepaper's MAC notation)
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// BLAKE2s-256 output length, also the chaining key length
pub const HASH_LEN: usize = 32;

/// Keyed MAC output length (MAC1/MAC2 are truncated to 16 bytes)
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut h = Blake2s256::new();
    Digest::update(&mut h, data);
    h.finalize().into()
}

/// BLAKE2s-256 of a concatenation: HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut h = Blake2s256::new();
    Digest::update(&mut h, a);
    Digest::update(&mut h, b);
    h.finalize().into()
}

/// Keyed BLAKE2s MAC with 16-byte output
///
/// Accepts 32-byte keys (MAC1) and 16-byte cookie keys (MAC2).
pub fn keyed_mac(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac =
        Blake2sMac::<U16>::new_from_slice(key).expect("BLAKE2s accepts keys up to 32 bytes");
    MacTrait::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// HMAC-BLAKE2s
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// KDF1: one 32-byte output
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let prk = hmac(key, input);
    hmac(&prk, &[0x01])
}

/// KDF2: two 32-byte outputs
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = hmac(key, input);
    let t1 = hmac(&prk, &[0x01]);
    let t2 = hmac(&prk, &chained(&t1, 0x02));
    (t1, t2)
}

/// KDF3: three 32-byte outputs
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = hmac(key, input);
    let t1 = hmac(&prk, &[0x01]);
    let t2 = hmac(&prk, &chained(&t1, 0x02));
    let t3 = hmac(&prk, &chained(&t2, 0x03));
    (t1, t2, t3)
}

/// T(n-1) || n, the expansion input for the next KDF block
fn chained(prev: &[u8; HASH_LEN], counter: u8) -> [u8; HASH_LEN + 1] {
    let mut buf = [0u8; HASH_LEN + 1];
    buf[..HASH_LEN].copy_from_slice(prev);
    buf[HASH_LEN] = counter;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_concat_equivalence() {
        // hash_two(a, b) must equal hash(a || b)
        let joined = hash(b"chainingkey material");
        let split = hash_two(b"chaining", b"key material");
        assert_eq!(joined, split);
    }

    #[test]
    fn test_keyed_mac_both_key_lengths() {
        let mac1 = keyed_mac(&[7u8; 32], b"handshake bytes");
        let mac2 = keyed_mac(&[7u8; 16], b"handshake bytes");
        assert_eq!(mac1.len(), MAC_LEN);
        assert_ne!(mac1, mac2);
    }

    #[test]
    fn test_kdf_outputs_distinct() {
        let ck = [3u8; HASH_LEN];

        let k1 = kdf1(&ck, b"ikm");
        let (k2a, k2b) = kdf2(&ck, b"ikm");
        let (k3a, k3b, k3c) = kdf3(&ck, b"ikm");

        // T1 is shared by all arities; later blocks must differ
        assert_eq!(k1, k2a);
        assert_eq!(k2a, k3a);
        assert_eq!(k2b, k3b);
        assert_ne!(k3a, k3b);
        assert_ne!(k3b, k3c);
    }

    #[test]
    fn test_kdf_sensitive_to_input() {
        let ck = [0u8; HASH_LEN];
        assert_ne!(kdf1(&ck, b"a"), kdf1(&ck, b"b"));
        assert_ne!(kdf1(&[1u8; 32], b"a"), kdf1(&ck, b"a"));
    }
}
