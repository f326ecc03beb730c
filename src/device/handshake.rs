//! The Noise-IK handshake state machine, both roles
//!
//! Three messages move a peer between four states:
//!
//! ```text
//! Idle -> InitiationSent        local side sends an initiation
//! any  -> InitiationReceived    validated inbound initiation with a
//!                               newer timestamp
//! InitiationSent -> Established validated response; session keys derived
//! Established -> Idle           rekey gives up or key material is zeroed
//! ```
//!
//! The state lives under its own lock, separate from the peer lock.
//! Message parsing, MAC handling, and peer lookup happen in the device;
//! this module owns the cryptographic transcript.

use std::time::Instant;

use zeroize::Zeroize;

use crate::crypto::noise::SymmetricState;
use crate::crypto::x25519;
use crate::device::ratelimit::TokenBucket;
use crate::error::{CryptoError, ProtocolError};
use crate::protocol::messages::{HandshakeInitiation, HandshakeResponse};
use crate::protocol::{Timestamp, HANDSHAKE_INITIATION_BURST, HANDSHAKE_INITIATION_RATE};

/// WireGuard v1 compatibility: the PSK slot is mixed as zeros when no
/// preshared key is configured.
const ZERO_PSK: [u8; 32] = [0u8; 32];

/// Handshake progress from this peer's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    InitiationSent,
    InitiationReceived,
    Established,
}

/// Per-peer handshake state
pub struct Handshake {
    pub state: HandshakeState,
    /// The peer's identity
    pub remote_static: [u8; 32],
    /// DH(device static, peer static), computed once at peer creation
    pub precomputed_static_static: [u8; 32],
    chain: Option<SymmetricState>,
    ephemeral_private: [u8; 32],
    pub remote_ephemeral: [u8; 32],
    /// Our session index while the handshake is in flight
    pub local_index: u32,
    pub remote_index: u32,
    /// Greatest initiation timestamp accepted from this peer; it must
    /// strictly increase and survives handshake clears
    pub last_timestamp: Timestamp,
    /// Paces outbound initiations to one per REKEY_TIMEOUT
    pub last_sent_initiation: Option<Instant>,
    /// Throttles inbound initiations we accept from this peer
    pub initiation_limit: TokenBucket,
}

impl Handshake {
    pub fn new(remote_static: [u8; 32], precomputed_static_static: [u8; 32]) -> Self {
        Self {
            state: HandshakeState::Idle,
            remote_static,
            precomputed_static_static,
            chain: None,
            ephemeral_private: [0u8; 32],
            remote_ephemeral: [0u8; 32],
            local_index: 0,
            remote_index: 0,
            last_timestamp: Timestamp::zero(),
            last_sent_initiation: None,
            initiation_limit: TokenBucket::new(
                HANDSHAKE_INITIATION_BURST,
                HANDSHAKE_INITIATION_RATE,
            ),
        }
    }

    /// Wipe transcript state. Identity, the timestamp high-water mark,
    /// and the rate limiter survive; the caller removes `local_index`
    /// from the device index table first.
    pub fn clear(&mut self) {
        self.state = HandshakeState::Idle;
        self.chain = None;
        self.ephemeral_private.zeroize();
        self.remote_ephemeral.zeroize();
        self.local_index = 0;
        self.remote_index = 0;
    }

    /// Build an initiation. `local_index` must already be registered in
    /// the device index table.
    pub fn create_initiation(
        &mut self,
        local_static_private: &[u8; 32],
        local_static_public: &[u8; 32],
        local_index: u32,
    ) -> Result<HandshakeInitiation, CryptoError> {
        let mut chain = SymmetricState::new(&self.remote_static);

        let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();
        chain.mix_hash(&ephemeral_public);
        chain.mix_chain(&ephemeral_public);

        // es
        let key = chain.mix_key(&x25519::dh(&ephemeral_private, &self.remote_static));
        let sealed_static = chain.encrypt_and_hash(&key, local_static_public)?;
        let encrypted_static: [u8; 48] = sealed_static
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        // ss
        let key = chain.mix_key(&self.precomputed_static_static);
        let timestamp = Timestamp::now();
        let sealed_timestamp = chain.encrypt_and_hash(&key, &timestamp.to_bytes())?;
        let encrypted_timestamp: [u8; 28] = sealed_timestamp
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        self.chain = Some(chain);
        self.ephemeral_private = ephemeral_private;
        self.local_index = local_index;
        self.state = HandshakeState::InitiationSent;

        Ok(HandshakeInitiation {
            sender_index: local_index,
            ephemeral: ephemeral_public,
            encrypted_static,
            encrypted_timestamp,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        })
    }

    /// Consume a response and derive the session keys (initiator side).
    /// Returns (send_key, receive_key). The transcript is only
    /// committed when the response authenticates.
    pub fn consume_response(
        &mut self,
        msg: &HandshakeResponse,
        local_static_private: &[u8; 32],
    ) -> Result<([u8; 32], [u8; 32]), ProtocolError> {
        if self.state != HandshakeState::InitiationSent {
            return Err(ProtocolError::InvalidHandshakeState);
        }
        if msg.receiver_index != self.local_index {
            return Err(ProtocolError::UnknownIndex {
                index: msg.receiver_index,
            });
        }

        let mut chain = self
            .chain
            .clone()
            .ok_or(ProtocolError::InvalidHandshakeState)?;

        chain.mix_hash(&msg.ephemeral);
        chain.mix_chain(&msg.ephemeral);
        // ee
        chain.mix_chain(&x25519::dh(&self.ephemeral_private, &msg.ephemeral));
        // se
        chain.mix_chain(&x25519::dh(local_static_private, &msg.ephemeral));

        let key = chain.mix_key_and_hash(&ZERO_PSK);
        chain
            .decrypt_and_hash(&key, &msg.encrypted_nothing)
            .map_err(|_| ProtocolError::MacVerificationFailed)?;

        let (send_key, receive_key) = chain.derive_transport_keys(true);

        self.chain = None;
        self.ephemeral_private.zeroize();
        self.remote_ephemeral = msg.ephemeral;
        self.remote_index = msg.sender_index;
        // The index now belongs to the keypair; the next initiation
        // must not tear it down.
        self.local_index = 0;
        self.state = HandshakeState::Established;

        Ok((send_key, receive_key))
    }

    /// Adopt a fully validated inbound initiation. The caller has
    /// already verified timestamp monotonicity and the rate limit under
    /// this handshake's lock.
    pub fn adopt_initiation(&mut self, consumed: ConsumedInitiation) {
        self.chain = Some(consumed.chain);
        self.remote_ephemeral = consumed.remote_ephemeral;
        self.remote_index = consumed.remote_index;
        self.last_timestamp = consumed.timestamp;
        self.ephemeral_private.zeroize();
        self.state = HandshakeState::InitiationReceived;
    }

    /// Build the response and derive session keys (responder side).
    /// Returns the message plus (send_key, receive_key).
    pub fn create_response(
        &mut self,
        local_index: u32,
    ) -> Result<(HandshakeResponse, [u8; 32], [u8; 32]), ProtocolError> {
        if self.state != HandshakeState::InitiationReceived {
            return Err(ProtocolError::InvalidHandshakeState);
        }
        let mut chain = self
            .chain
            .take()
            .ok_or(ProtocolError::InvalidHandshakeState)?;

        let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();
        chain.mix_hash(&ephemeral_public);
        chain.mix_chain(&ephemeral_public);
        // ee
        chain.mix_chain(&x25519::dh(&ephemeral_private, &self.remote_ephemeral));
        // se
        chain.mix_chain(&x25519::dh(&ephemeral_private, &self.remote_static));

        let key = chain.mix_key_and_hash(&ZERO_PSK);
        let sealed = chain
            .encrypt_and_hash(&key, &[])
            .map_err(|_| ProtocolError::InvalidHandshakeState)?;
        let encrypted_nothing: [u8; 16] = sealed
            .try_into()
            .map_err(|_| ProtocolError::InvalidHandshakeState)?;

        let (send_key, receive_key) = chain.derive_transport_keys(false);

        let msg = HandshakeResponse {
            sender_index: local_index,
            receiver_index: self.remote_index,
            ephemeral: ephemeral_public,
            encrypted_nothing,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };

        // The index belongs to the keypair from here on
        self.local_index = 0;
        self.state = HandshakeState::Established;

        Ok((msg, send_key, receive_key))
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.ephemeral_private.zeroize();
        self.precomputed_static_static.zeroize();
    }
}

/// Result of decrypting an inbound initiation, pending the per-peer
/// monotonicity and rate checks
pub struct ConsumedInitiation {
    pub peer_static: [u8; 32],
    pub remote_ephemeral: [u8; 32],
    pub remote_index: u32,
    pub timestamp: Timestamp,
    pub chain: SymmetricState,
}

/// First phase of consuming an initiation: everything that can be done
/// before the sender's identity is known. Returns the decrypted static
/// key and the transcript so far.
pub fn consume_initiation_static(
    msg: &HandshakeInitiation,
    local_static_private: &[u8; 32],
    local_static_public: &[u8; 32],
) -> Result<(SymmetricState, [u8; 32]), ProtocolError> {
    let mut chain = SymmetricState::new(local_static_public);
    chain.mix_hash(&msg.ephemeral);
    chain.mix_chain(&msg.ephemeral);

    // es from the receiving side
    let key = chain.mix_key(&x25519::dh(local_static_private, &msg.ephemeral));
    let static_bytes = chain
        .decrypt_and_hash(&key, &msg.encrypted_static)
        .map_err(|_| ProtocolError::MacVerificationFailed)?;

    let peer_static: [u8; 32] = static_bytes
        .try_into()
        .map_err(|_| ProtocolError::MacVerificationFailed)?;
    Ok((chain, peer_static))
}

/// Second phase, once the peer (and its precomputed static-static
/// secret) is known: decrypt and return the replay-protection timestamp.
pub fn consume_initiation_timestamp(
    mut chain: SymmetricState,
    msg: &HandshakeInitiation,
    peer_static: [u8; 32],
    precomputed_static_static: &[u8; 32],
) -> Result<ConsumedInitiation, ProtocolError> {
    // ss
    let key = chain.mix_key(precomputed_static_static);
    let ts_bytes = chain
        .decrypt_and_hash(&key, &msg.encrypted_timestamp)
        .map_err(|_| ProtocolError::MacVerificationFailed)?;

    let stamp: [u8; 12] = ts_bytes
        .try_into()
        .map_err(|_| ProtocolError::MacVerificationFailed)?;

    Ok(ConsumedInitiation {
        peer_static,
        remote_ephemeral: msg.ephemeral,
        remote_index: msg.sender_index,
        timestamp: Timestamp::from_bytes(stamp),
        chain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Party {
        static_private: [u8; 32],
        static_public: [u8; 32],
        handshake: Handshake,
    }

    fn parties() -> (Party, Party) {
        let (a_priv, a_pub) = x25519::generate_keypair();
        let (b_priv, b_pub) = x25519::generate_keypair();
        let ss = x25519::dh(&a_priv, &b_pub);
        (
            Party {
                static_private: a_priv,
                static_public: a_pub,
                handshake: Handshake::new(b_pub, ss),
            },
            Party {
                static_private: b_priv,
                static_public: b_pub,
                handshake: Handshake::new(a_pub, ss),
            },
        )
    }

    /// Drive a full three-message exchange and return both key pairs
    fn complete_handshake(
        initiator: &mut Party,
        responder: &mut Party,
    ) -> (([u8; 32], [u8; 32]), ([u8; 32], [u8; 32])) {
        let init = initiator
            .handshake
            .create_initiation(&initiator.static_private, &initiator.static_public, 100)
            .unwrap();
        assert_eq!(initiator.handshake.state, HandshakeState::InitiationSent);

        let (chain, peer_static) = consume_initiation_static(
            &init,
            &responder.static_private,
            &responder.static_public,
        )
        .unwrap();
        assert_eq!(peer_static, initiator.static_public);

        let consumed = consume_initiation_timestamp(
            chain,
            &init,
            peer_static,
            &responder.handshake.precomputed_static_static,
        )
        .unwrap();
        assert!(consumed
            .timestamp
            .after(&responder.handshake.last_timestamp));

        responder.handshake.adopt_initiation(consumed);
        assert_eq!(
            responder.handshake.state,
            HandshakeState::InitiationReceived
        );

        let (response, r_send, r_recv) = responder.handshake.create_response(200).unwrap();
        assert_eq!(responder.handshake.state, HandshakeState::Established);
        assert_eq!(response.receiver_index, 100);

        let (i_send, i_recv) = initiator
            .handshake
            .consume_response(&response, &initiator.static_private)
            .unwrap();
        assert_eq!(initiator.handshake.state, HandshakeState::Established);
        assert_eq!(initiator.handshake.remote_index, 200);

        ((i_send, i_recv), (r_send, r_recv))
    }

    #[test]
    fn test_full_handshake_derives_mirrored_keys() {
        let (mut initiator, mut responder) = parties();
        let ((i_send, i_recv), (r_send, r_recv)) =
            complete_handshake(&mut initiator, &mut responder);

        assert_eq!(i_send, r_recv);
        assert_eq!(i_recv, r_send);
        assert_ne!(i_send, i_recv);
    }

    #[test]
    fn test_response_to_wrong_index_rejected() {
        let (mut initiator, mut responder) = parties();
        let init = initiator
            .handshake
            .create_initiation(&initiator.static_private, &initiator.static_public, 100)
            .unwrap();

        let (chain, peer_static) = consume_initiation_static(
            &init,
            &responder.static_private,
            &responder.static_public,
        )
        .unwrap();
        let consumed = consume_initiation_timestamp(
            chain,
            &init,
            peer_static,
            &responder.handshake.precomputed_static_static,
        )
        .unwrap();
        responder.handshake.adopt_initiation(consumed);

        let (mut response, _, _) = responder.handshake.create_response(200).unwrap();
        response.receiver_index = 101;
        assert!(initiator
            .handshake
            .consume_response(&response, &initiator.static_private)
            .is_err());
        // State intact; a correct retransmission would still work
        assert_eq!(initiator.handshake.state, HandshakeState::InitiationSent);
    }

    #[test]
    fn test_tampered_response_keeps_state() {
        let (mut initiator, mut responder) = parties();
        let init = initiator
            .handshake
            .create_initiation(&initiator.static_private, &initiator.static_public, 100)
            .unwrap();

        let (chain, peer_static) = consume_initiation_static(
            &init,
            &responder.static_private,
            &responder.static_public,
        )
        .unwrap();
        let consumed = consume_initiation_timestamp(
            chain,
            &init,
            peer_static,
            &responder.handshake.precomputed_static_static,
        )
        .unwrap();
        responder.handshake.adopt_initiation(consumed);
        let (mut response, _, _) = responder.handshake.create_response(200).unwrap();

        response.encrypted_nothing[0] ^= 1;
        assert!(initiator
            .handshake
            .consume_response(&response, &initiator.static_private)
            .is_err());
        assert_eq!(initiator.handshake.state, HandshakeState::InitiationSent);
    }

    #[test]
    fn test_initiation_to_wrong_responder_fails() {
        let (mut initiator, _) = parties();
        let (other_priv, other_pub) = x25519::generate_keypair();

        let init = initiator
            .handshake
            .create_initiation(&initiator.static_private, &initiator.static_public, 1)
            .unwrap();

        assert!(consume_initiation_static(&init, &other_priv, &other_pub).is_err());
    }

    #[test]
    fn test_timestamps_increase_across_initiations() {
        let (mut initiator, mut responder) = parties();
        complete_handshake(&mut initiator, &mut responder);
        let first = responder.handshake.last_timestamp;

        // A replayed (equal) timestamp would not pass the monotonicity
        // check the device applies before adopt_initiation.
        assert!(!first.after(&first));

        initiator.handshake.clear();
        std::thread::sleep(std::time::Duration::from_millis(30));
        complete_handshake(&mut initiator, &mut responder);
        assert!(responder.handshake.last_timestamp.after(&first));
    }

    #[test]
    fn test_clear_preserves_timestamp_watermark() {
        let (mut initiator, mut responder) = parties();
        complete_handshake(&mut initiator, &mut responder);
        let watermark = responder.handshake.last_timestamp;

        responder.handshake.clear();
        assert_eq!(responder.handshake.state, HandshakeState::Idle);
        assert_eq!(responder.handshake.last_timestamp, watermark);
        assert_eq!(responder.handshake.local_index, 0);
    }

    #[test]
    fn test_response_requires_initiation_received() {
        let (_, mut responder) = parties();
        assert!(responder.handshake.create_response(1).is_err());
    }
}
