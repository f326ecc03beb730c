//! Cookie subsystem: handshake MACs and DoS throttling
//!
//! Every handshake message carries MAC1, keyed by the receiver's static
//! public key; it proves the sender knows who it is talking to and is
//! checked before any expensive work. Under load the receiver answers
//! with an encrypted cookie bound to the source address, and demands it
//! back as MAC2 on the retried message.
//!
//! `CookieGenerator` is the sender half (one per peer), `CookieChecker`
//! the receiver half (one per device).

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::{aead, blake2s, noise};
use crate::error::{CryptoError, ProtocolError};
use crate::protocol::messages::CookieReply;
use crate::protocol::COOKIE_REFRESH_TIME;

/// Cookie length inside a reply
pub const COOKIE_LEN: usize = 16;

/// Sender-side MAC state for one peer
pub struct CookieGenerator {
    /// HASH(LABEL_MAC1 || peer_static)
    mac1_key: [u8; 32],
    /// HASH(LABEL_COOKIE || peer_static), opens cookie replies
    cookie_key: [u8; 32],
    /// MAC1 of the last handshake message we sent (reply AAD)
    last_mac1: Option<[u8; 16]>,
    /// Latest decrypted cookie and when it arrived
    cookie: Option<([u8; COOKIE_LEN], Instant)>,
}

impl CookieGenerator {
    pub fn new(peer_static: &[u8; 32]) -> Self {
        Self {
            mac1_key: noise::mac1_key(peer_static),
            cookie_key: noise::cookie_key(peer_static),
            last_mac1: None,
            cookie: None,
        }
    }

    /// Stamp MAC1 (always) and MAC2 (when a live cookie is held) onto a
    /// serialized handshake message. `mac1_offset` is also where MAC1's
    /// input ends; MAC2 covers everything through MAC1.
    pub fn add_macs(&mut self, msg: &mut [u8], mac1_offset: usize) {
        let mac2_offset = mac1_offset + 16;

        let mac1 = blake2s::keyed_mac(&self.mac1_key, &msg[..mac1_offset]);
        msg[mac1_offset..mac2_offset].copy_from_slice(&mac1);
        self.last_mac1 = Some(mac1);

        if let Some((cookie, received)) = &self.cookie {
            if received.elapsed() < COOKIE_REFRESH_TIME {
                let mac2 = blake2s::keyed_mac(cookie, &msg[..mac2_offset]);
                msg[mac2_offset..mac2_offset + 16].copy_from_slice(&mac2);
                return;
            }
        }
        // No valid cookie: MAC2 stays zero
        for b in &mut msg[mac2_offset..mac2_offset + 16] {
            *b = 0;
        }
    }

    /// Decrypt and store the cookie from a reply to our last message
    pub fn consume_reply(&mut self, reply: &CookieReply) -> Result<(), ProtocolError> {
        let last_mac1 = self
            .last_mac1
            .ok_or(ProtocolError::InvalidHandshakeState)?;

        let opened = aead::xopen(
            &self.cookie_key,
            &reply.nonce,
            &reply.encrypted_cookie,
            &last_mac1,
        )
        .map_err(|_| ProtocolError::MacVerificationFailed)?;

        if opened.len() != COOKIE_LEN {
            return Err(ProtocolError::MacVerificationFailed);
        }

        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&opened);
        self.cookie = Some((cookie, Instant::now()));
        tracing::debug!("stored handshake cookie");
        Ok(())
    }

    /// Forget MAC state, e.g. when the handshake is zeroed
    pub fn clear(&mut self) {
        self.last_mac1 = None;
        if let Some((mut cookie, _)) = self.cookie.take() {
            cookie.zeroize();
        }
    }
}

/// Rotating secret the receiver derives cookies from
struct CookieSecret {
    secret: [u8; 32],
    created: Instant,
}

/// Receiver-side MAC validation for the whole device
pub struct CookieChecker {
    /// HASH(LABEL_MAC1 || our_static_public)
    mac1_key: [u8; 32],
    /// HASH(LABEL_COOKIE || our_static_public), seals cookie replies
    cookie_key: [u8; 32],
    secret: Mutex<CookieSecret>,
}

impl CookieChecker {
    pub fn new(our_static_public: &[u8; 32]) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            mac1_key: noise::mac1_key(our_static_public),
            cookie_key: noise::cookie_key(our_static_public),
            secret: Mutex::new(CookieSecret {
                secret,
                created: Instant::now(),
            }),
        }
    }

    /// Validate MAC1 on a serialized handshake message
    pub fn check_mac1(&self, msg: &[u8], mac1_offset: usize) -> bool {
        let expected = blake2s::keyed_mac(&self.mac1_key, &msg[..mac1_offset]);
        let actual = &msg[mac1_offset..mac1_offset + 16];
        expected.ct_eq(actual).into()
    }

    /// Validate MAC2 against the cookie currently valid for `src`
    pub fn check_mac2(&self, msg: &[u8], mac1_offset: usize, src: &SocketAddr) -> bool {
        let mac2_offset = mac1_offset + 16;
        let cookie = self.current_cookie(src);
        let expected = blake2s::keyed_mac(&cookie, &msg[..mac2_offset]);
        let actual = &msg[mac2_offset..mac2_offset + 16];
        expected.ct_eq(actual).into()
    }

    /// Build an encrypted cookie reply for a throttled message
    pub fn create_reply(
        &self,
        msg_mac1: &[u8; 16],
        receiver_index: u32,
        src: &SocketAddr,
    ) -> Result<CookieReply, CryptoError> {
        let cookie = self.current_cookie(src);

        let mut nonce = [0u8; aead::XNONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = aead::xseal(&self.cookie_key, &nonce, &cookie, msg_mac1)?;
        let mut encrypted_cookie = [0u8; 32];
        encrypted_cookie.copy_from_slice(&sealed);

        Ok(CookieReply {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }

    /// cookie = MAC(secret, source address bytes), rotating the secret
    /// every COOKIE_REFRESH_TIME
    fn current_cookie(&self, src: &SocketAddr) -> [u8; COOKIE_LEN] {
        let mut state = self.secret.lock().expect("cookie secret lock");
        if state.created.elapsed() >= COOKIE_REFRESH_TIME {
            state.secret.zeroize();
            rand::thread_rng().fill_bytes(&mut state.secret);
            state.created = Instant::now();
        }

        let mut addr = Vec::with_capacity(18);
        match src {
            SocketAddr::V4(a) => addr.extend_from_slice(&a.ip().octets()),
            SocketAddr::V6(a) => addr.extend_from_slice(&a.ip().octets()),
        }
        addr.extend_from_slice(&src.port().to_le_bytes());

        blake2s::keyed_mac(&state.secret, &addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::HandshakeInitiation;

    fn test_src() -> SocketAddr {
        "203.0.113.9:51820".parse().unwrap()
    }

    #[test]
    fn test_mac1_generate_and_check() {
        let (_, peer_public) = crate::crypto::x25519::generate_keypair();
        let mut generator = CookieGenerator::new(&peer_public);
        let checker = CookieChecker::new(&peer_public);

        let mut msg = [0x5Au8; HandshakeInitiation::SIZE];
        generator.add_macs(&mut msg, HandshakeInitiation::MAC1_OFFSET);

        assert!(checker.check_mac1(&msg, HandshakeInitiation::MAC1_OFFSET));
        // MAC2 is zero without a cookie
        assert_eq!(&msg[HandshakeInitiation::MAC2_OFFSET..], &[0u8; 16]);

        // Any body flip invalidates MAC1
        msg[10] ^= 1;
        assert!(!checker.check_mac1(&msg, HandshakeInitiation::MAC1_OFFSET));
    }

    #[test]
    fn test_cookie_roundtrip_enables_mac2() {
        let (_, our_public) = crate::crypto::x25519::generate_keypair();
        let mut generator = CookieGenerator::new(&our_public);
        let checker = CookieChecker::new(&our_public);
        let src = test_src();

        // First message: MAC1 only
        let mut first = [0x11u8; HandshakeInitiation::SIZE];
        generator.add_macs(&mut first, HandshakeInitiation::MAC1_OFFSET);
        assert!(!checker.check_mac2(&first, HandshakeInitiation::MAC1_OFFSET, &src));

        // Receiver throttles with a cookie reply
        let mut mac1 = [0u8; 16];
        mac1.copy_from_slice(
            &first[HandshakeInitiation::MAC1_OFFSET..HandshakeInitiation::MAC2_OFFSET],
        );
        let reply = checker.create_reply(&mac1, 77, &src).unwrap();
        generator.consume_reply(&reply).unwrap();

        // Retry now carries a MAC2 the checker accepts for that source
        let mut retry = [0x11u8; HandshakeInitiation::SIZE];
        generator.add_macs(&mut retry, HandshakeInitiation::MAC1_OFFSET);
        assert!(checker.check_mac2(&retry, HandshakeInitiation::MAC1_OFFSET, &src));

        // But not for a different source address
        let other: SocketAddr = "203.0.113.10:51820".parse().unwrap();
        assert!(!checker.check_mac2(&retry, HandshakeInitiation::MAC1_OFFSET, &other));
    }

    #[test]
    fn test_reply_without_prior_message_rejected() {
        let (_, public) = crate::crypto::x25519::generate_keypair();
        let mut generator = CookieGenerator::new(&public);
        let reply = CookieReply {
            receiver_index: 1,
            nonce: [0u8; 24],
            encrypted_cookie: [0u8; 32],
        };
        assert!(generator.consume_reply(&reply).is_err());
    }

    #[test]
    fn test_tampered_reply_rejected() {
        let (_, public) = crate::crypto::x25519::generate_keypair();
        let mut generator = CookieGenerator::new(&public);
        let checker = CookieChecker::new(&public);

        let mut msg = [0x22u8; HandshakeInitiation::SIZE];
        generator.add_macs(&mut msg, HandshakeInitiation::MAC1_OFFSET);
        let mut mac1 = [0u8; 16];
        mac1.copy_from_slice(
            &msg[HandshakeInitiation::MAC1_OFFSET..HandshakeInitiation::MAC2_OFFSET],
        );

        let mut reply = checker.create_reply(&mac1, 3, &test_src()).unwrap();
        reply.encrypted_cookie[0] ^= 1;
        assert!(generator.consume_reply(&reply).is_err());
    }
}
