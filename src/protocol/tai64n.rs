//! Whitened TAI64N timestamps for handshake replay protection
//!
//! Initiations carry a 12-byte external timestamp that the responder
//! requires to strictly increase per peer. The nanosecond field is
//! truncated to ~16.8 ms granularity so the timestamp leaks less about
//! the sender's clock while staying monotonic at that scale.

use std::time::SystemTime;

use tai64::{Tai64, Tai64N};

/// Encoded timestamp length
pub const TIMESTAMP_LEN: usize = 12;

/// TAI64 label for the Unix epoch as interoperating tunnels encode it
const BASE: u64 = 0x4000_0000_0000_000a;

/// Low nanosecond bits cleared before encoding
const WHITENER_MASK: u32 = 0x0100_0000 - 1;

/// A whitened TAI64N timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp([u8; TIMESTAMP_LEN]);

impl Timestamp {
    /// Stamp the current wall-clock time
    pub fn now() -> Self {
        Self::stamp(SystemTime::now())
    }

    /// Stamp an arbitrary wall-clock time
    pub fn stamp(at: SystemTime) -> Self {
        let since_epoch = at
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let secs = BASE + since_epoch.as_secs();
        let nanos = since_epoch.subsec_nanos() & !WHITENER_MASK;
        Self(Tai64N(Tai64(secs), nanos).to_bytes())
    }

    /// The zero timestamp, ordered before every stamped time
    pub fn zero() -> Self {
        Self([0u8; TIMESTAMP_LEN])
    }

    /// Strictly-greater comparison; equal timestamps are not "after"
    pub fn after(&self, other: &Timestamp) -> bool {
        self.0 > other.0
    }

    pub fn to_bytes(self) -> [u8; TIMESTAMP_LEN] {
        self.0
    }

    pub fn from_bytes(bytes: [u8; TIMESTAMP_LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_whitening_hides_small_steps() {
        // Align to just under the next whitening boundary, then step 1 ns:
        // the stamp must not change.
        let start = SystemTime::now();
        let since = start
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap();
        let to_boundary = WHITENER_MASK - (since.subsec_nanos() & WHITENER_MASK);
        let same = start + Duration::from_nanos(to_boundary as u64);
        let next = start + Duration::from_nanos(to_boundary as u64 + 1);

        assert!(!Timestamp::stamp(same).after(&Timestamp::stamp(start)));
        assert!(Timestamp::stamp(next).after(&Timestamp::stamp(start)));
    }

    #[test]
    fn test_coarse_steps_always_increase() {
        // 20 ms exceeds the whitening granularity, so it always crosses
        // a boundary.
        let t = SystemTime::now();
        let a = Timestamp::stamp(t);
        let b = Timestamp::stamp(t + Duration::from_millis(20));
        assert!(b.after(&a));
        assert!(!a.after(&b));
    }

    #[test]
    fn test_one_nanosecond_compares_equal() {
        // Anchor at a whole second so the 1 ns step stays inside one
        // whitening bucket.
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = Timestamp::stamp(t);
        let b = Timestamp::stamp(t + Duration::from_nanos(1));
        assert_eq!(a, b);
        assert!(!b.after(&a));
    }

    #[test]
    fn test_zero_precedes_everything() {
        assert!(Timestamp::now().after(&Timestamp::zero()));
    }

    #[test]
    fn test_byte_roundtrip() {
        let a = Timestamp::now();
        assert_eq!(Timestamp::from_bytes(a.to_bytes()), a);
    }

    #[test]
    fn test_epoch_label() {
        // Seconds field carries the TAI64 label, not raw Unix time
        let bytes = Timestamp::stamp(SystemTime::UNIX_EPOCH).to_bytes();
        let secs = u64::from_be_bytes(bytes[..8].try_into().unwrap());
        assert_eq!(secs, BASE);
    }
}
