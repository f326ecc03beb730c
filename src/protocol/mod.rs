//! Wire formats and time-based protocol rules
//!
//! The four packet layouts, the whitened TAI64N timestamp, the cookie
//! subsystem, and the session-lifetime constants every other module
//! keys off.

use std::time::Duration;

pub mod cookie;
pub mod messages;
pub mod tai64n;

pub use cookie::{CookieChecker, CookieGenerator};
pub use messages::{
    CookieReply, DataHeader, HandshakeInitiation, HandshakeResponse, MessageType,
};
pub use tai64n::Timestamp;

/// Initiate rekey once a keypair is this old (initiator only)
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Refuse a keypair for both directions past this age
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Handshake retransmission interval (jitter is added on top)
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Passive keepalive deadline after receiving data
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Give up an in-flight handshake after this many retransmissions
pub const MAX_TIMER_HANDSHAKES: u32 = 18;

/// Initiate rekey once the send counter passes this
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Refuse to send once the counter reaches this (2^64 - 2^13 - 1)
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);

/// Rotating cookie-secret lifetime, also the cookie validity window
pub const COOKIE_REFRESH_TIME: Duration = Duration::from_secs(120);

/// Initiations accepted per peer per second once the bucket drains
pub const HANDSHAKE_INITIATION_RATE: f64 = 20.0;

/// Token-bucket burst capacity for inbound initiations
pub const HANDSHAKE_INITIATION_BURST: f64 = 10.0;

/// Upper bound on peers per device
pub const MAX_PEERS: usize = 1 << 16;

/// Bound on the in-order outbound element channel
pub const QUEUE_OUTBOUND_SIZE: usize = 1024;

/// Bound on the in-order inbound element channel
pub const QUEUE_INBOUND_SIZE: usize = 1024;

/// Bound on packets parked while awaiting a keypair
pub const QUEUE_STAGED_SIZE: usize = 128;

/// Width of the inbound anti-replay window in packets
pub const REPLAY_WINDOW_SIZE: u64 = 2048;
