//! X25519 Diffie-Hellman operations

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Curve25519 key length
pub const KEY_LEN: usize = 32;

/// Generate a fresh keypair, returned as (private, public)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive the public key for a private key
pub fn public_key(private: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private);
    PublicKey::from(&secret).to_bytes()
}

/// Compute the shared secret between our private key and their public key
pub fn dh(private: &[u8; KEY_LEN], public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private);
    let peer = PublicKey::from(*public);
    secret.diffie_hellman(&peer).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret_agreement() {
        let (a_priv, a_pub) = generate_keypair();
        let (b_priv, b_pub) = generate_keypair();

        assert_eq!(dh(&a_priv, &b_pub), dh(&b_priv, &a_pub));
        assert_ne!(dh(&a_priv, &b_pub), dh(&a_priv, &a_pub));
    }

    #[test]
    fn test_public_key_derivation_stable() {
        let (private, public) = generate_keypair();
        assert_eq!(public_key(&private), public);
    }
}
