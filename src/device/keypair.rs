//! Session keypairs and their rotation
//!
//! A keypair is one bidirectional AEAD session produced by a completed
//! handshake. Each peer holds up to three: *previous*, *current*, and
//! *next*. A fresh keypair always lands in *next*; its first use
//! promotes it (previous ← current, current ← next) and the displaced
//! *previous* is dropped. Rotation is strictly one-way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use zeroize::Zeroize;

use crate::protocol::{
    REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME,
    REPLAY_WINDOW_SIZE,
};

/// One directional AEAD session
pub struct Keypair {
    pub send_key: [u8; 32],
    pub receive_key: [u8; 32],
    /// Next outbound nonce; REJECT_AFTER_MESSAGES means exhausted
    pub send_nonce: AtomicU64,
    pub replay_filter: Mutex<ReplayFilter>,
    pub is_initiator: bool,
    pub created: Instant,
    pub local_index: u32,
    pub remote_index: u32,
}

impl Keypair {
    pub fn new(
        send_key: [u8; 32],
        receive_key: [u8; 32],
        is_initiator: bool,
        local_index: u32,
        remote_index: u32,
    ) -> Self {
        Self {
            send_key,
            receive_key,
            send_nonce: AtomicU64::new(0),
            replay_filter: Mutex::new(ReplayFilter::new()),
            is_initiator,
            created: Instant::now(),
            local_index,
            remote_index,
        }
    }

    /// Past REJECT_AFTER_TIME the keypair may neither seal nor open
    pub fn expired(&self) -> bool {
        self.created.elapsed() >= REJECT_AFTER_TIME
    }

    /// Claim the next outbound nonce, or None once the counter space or
    /// session age is spent. The nonce worker is the only caller, so
    /// claimed nonces are strictly increasing per keypair.
    pub fn next_send_nonce(&self) -> Option<u64> {
        if self.expired() {
            self.send_nonce.store(REJECT_AFTER_MESSAGES, Ordering::Relaxed);
            return None;
        }
        let nonce = self.send_nonce.fetch_add(1, Ordering::Relaxed);
        if nonce >= REJECT_AFTER_MESSAGES {
            self.send_nonce.store(REJECT_AFTER_MESSAGES, Ordering::Relaxed);
            return None;
        }
        Some(nonce)
    }

    /// Should the local side (as initiator) start a fresh handshake
    /// before this keypair runs out?
    pub fn needs_rekey(&self) -> bool {
        self.is_initiator
            && (self.created.elapsed() >= REKEY_AFTER_TIME
                || self.send_nonce.load(Ordering::Relaxed) >= REKEY_AFTER_MESSAGES)
    }

    /// Unable to produce further outbound packets
    pub fn send_exhausted(&self) -> bool {
        self.expired() || self.send_nonce.load(Ordering::Relaxed) >= REJECT_AFTER_MESSAGES
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.send_key.zeroize();
        self.receive_key.zeroize();
    }
}

const BLOCK_BITS: u64 = 64;
const RING_BLOCKS: u64 = REPLAY_WINDOW_SIZE / BLOCK_BITS + 1;

/// Sliding-bitmap filter over inbound nonces
///
/// Accepts each nonce within REPLAY_WINDOW_SIZE of the greatest seen
/// exactly once; everything older is rejected.
pub struct ReplayFilter {
    greatest: u64,
    ring: [u64; RING_BLOCKS as usize],
    empty: bool,
}

impl Default for ReplayFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayFilter {
    pub fn new() -> Self {
        Self {
            greatest: 0,
            ring: [0u64; RING_BLOCKS as usize],
            empty: true,
        }
    }

    /// Check a counter and mark it seen; false means replay or
    /// out-of-window.
    pub fn validate(&mut self, counter: u64) -> bool {
        if counter >= REJECT_AFTER_MESSAGES {
            return false;
        }

        let block = counter / BLOCK_BITS;
        if self.empty || counter > self.greatest {
            // Window advances: clear the blocks the jump skips over
            let current = self.greatest / BLOCK_BITS;
            let skipped = if self.empty {
                RING_BLOCKS
            } else {
                (block - current).min(RING_BLOCKS)
            };
            for i in 1..=skipped {
                self.ring[((current + i) % RING_BLOCKS) as usize] = 0;
            }
            self.greatest = counter;
            self.empty = false;
        } else if self.greatest - counter >= REPLAY_WINDOW_SIZE {
            return false;
        }

        let bit = 1u64 << (counter % BLOCK_BITS);
        let word = &mut self.ring[(block % RING_BLOCKS) as usize];
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        true
    }
}

/// The three rotation slots, all under one lock
#[derive(Default)]
struct Slots {
    previous: Option<Arc<Keypair>>,
    current: Option<Arc<Keypair>>,
    next: Option<Arc<Keypair>>,
}

#[derive(Default)]
pub struct KeypairStore {
    slots: Mutex<Slots>,
}

impl KeypairStore {
    /// Install a freshly derived keypair into the *next* slot.
    /// Returns the keypairs displaced out of the store so the caller
    /// can drop their index-table entries.
    pub fn install_next(&self, keypair: Arc<Keypair>) -> Vec<Arc<Keypair>> {
        let mut slots = self.slots.lock().expect("keypair slots lock");
        let displaced = slots.next.replace(keypair);
        displaced.into_iter().collect()
    }

    /// Current keypair regardless of validity
    pub fn current(&self) -> Option<Arc<Keypair>> {
        self.slots.lock().expect("keypair slots lock").current.clone()
    }

    /// Pick the keypair for an outbound packet, promoting *next* when
    /// it is the only live candidate. Returns the keypair plus any
    /// displaced ones.
    pub fn current_for_send(&self) -> (Option<Arc<Keypair>>, Vec<Arc<Keypair>>) {
        let mut slots = self.slots.lock().expect("keypair slots lock");
        let mut displaced = Vec::new();

        let current_usable = slots
            .current
            .as_ref()
            .map_or(false, |kp| !kp.send_exhausted());
        if !current_usable {
            if let Some(next) = slots.next.take() {
                if !next.send_exhausted() {
                    displaced.extend(slots.previous.take());
                    slots.previous = slots.current.take();
                    slots.current = Some(next);
                } else {
                    displaced.push(next);
                }
            }
        }

        let chosen = slots
            .current
            .clone()
            .filter(|kp| !kp.send_exhausted());
        (chosen, displaced)
    }

    /// Promote *next* after its first successful decrypt. Returns the
    /// displaced keypairs, or None when `received` is not *next*.
    pub fn promote_on_receive(&self, received: &Arc<Keypair>) -> Option<Vec<Arc<Keypair>>> {
        let mut slots = self.slots.lock().expect("keypair slots lock");
        let is_next = slots
            .next
            .as_ref()
            .map_or(false, |next| Arc::ptr_eq(next, received));
        if !is_next {
            return None;
        }

        let mut displaced = Vec::new();
        displaced.extend(slots.previous.take());
        slots.previous = slots.current.take();
        slots.current = slots.next.take();
        Some(displaced)
    }

    /// A keypair is acceptable for receive while it occupies any slot
    /// and has not aged out
    pub fn accepts_for_receive(&self, keypair: &Arc<Keypair>) -> bool {
        if keypair.expired() {
            return false;
        }
        let slots = self.slots.lock().expect("keypair slots lock");
        let found = [&slots.previous, &slots.current, &slots.next]
            .into_iter()
            .any(|slot| slot.as_ref().map_or(false, |kp| Arc::ptr_eq(kp, keypair)));
        found
    }

    /// Empty all three slots, returning their contents for index
    /// removal and zeroization
    pub fn clear(&self) -> Vec<Arc<Keypair>> {
        let mut slots = self.slots.lock().expect("keypair slots lock");
        let mut removed = Vec::new();
        removed.extend(slots.previous.take());
        removed.extend(slots.current.take());
        removed.extend(slots.next.take());
        removed
    }

    /// Force current and next into the exhausted state so the next
    /// outbound packet must re-handshake
    pub fn expire_for_send(&self) {
        let slots = self.slots.lock().expect("keypair slots lock");
        for slot in [&slots.current, &slots.next] {
            if let Some(kp) = slot {
                kp.send_nonce.store(REJECT_AFTER_MESSAGES, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(initiator: bool) -> Arc<Keypair> {
        Arc::new(Keypair::new([1u8; 32], [2u8; 32], initiator, 10, 20))
    }

    #[test]
    fn test_nonces_strictly_increase() {
        let kp = keypair(true);
        let a = kp.next_send_nonce().unwrap();
        let b = kp.next_send_nonce().unwrap();
        let c = kp.next_send_nonce().unwrap();
        assert!(a < b && b < c);
        assert_eq!(a, 0);
    }

    #[test]
    fn test_nonce_exhaustion_refuses_send() {
        let kp = keypair(true);
        kp.send_nonce
            .store(REJECT_AFTER_MESSAGES - 1, Ordering::Relaxed);
        assert!(kp.next_send_nonce().is_some());
        assert!(kp.next_send_nonce().is_none());
        assert!(kp.send_exhausted());
        // and stays refused
        assert!(kp.next_send_nonce().is_none());
    }

    #[test]
    fn test_rekey_by_counter_initiator_only() {
        let kp = keypair(true);
        kp.send_nonce.store(REKEY_AFTER_MESSAGES, Ordering::Relaxed);
        assert!(kp.needs_rekey());

        let responder = keypair(false);
        responder
            .send_nonce
            .store(REKEY_AFTER_MESSAGES, Ordering::Relaxed);
        assert!(!responder.needs_rekey());
    }

    #[test]
    fn test_replay_filter_exactly_once() {
        let mut filter = ReplayFilter::new();
        assert!(filter.validate(0));
        assert!(!filter.validate(0));
        assert!(filter.validate(1));
        assert!(filter.validate(5));
        assert!(!filter.validate(5));
        // gaps are acceptable out of order, once
        assert!(filter.validate(3));
        assert!(!filter.validate(3));
    }

    #[test]
    fn test_replay_filter_window_edges() {
        let mut filter = ReplayFilter::new();
        assert!(filter.validate(10_000));

        // inside the window
        assert!(filter.validate(10_000 - REPLAY_WINDOW_SIZE + 1));
        // at or past the trailing edge
        assert!(!filter.validate(10_000 - REPLAY_WINDOW_SIZE));
        assert!(!filter.validate(0));

        // far jumps reset cleanly
        assert!(filter.validate(1_000_000));
        assert!(!filter.validate(10_000));
    }

    #[test]
    fn test_replay_filter_rejects_terminal_counters() {
        let mut filter = ReplayFilter::new();
        assert!(!filter.validate(REJECT_AFTER_MESSAGES));
        assert!(!filter.validate(u64::MAX));
        assert!(filter.validate(REJECT_AFTER_MESSAGES - 1));
    }

    #[test]
    fn test_install_and_promote_on_receive() {
        let store = KeypairStore::default();
        let first = keypair(false);
        assert!(store.install_next(first.clone()).is_empty());
        assert!(store.current().is_none());

        // first decrypt with *next* promotes it
        let displaced = store.promote_on_receive(&first).unwrap();
        assert!(displaced.is_empty());
        assert!(Arc::ptr_eq(&store.current().unwrap(), &first));

        // promoting a non-next keypair is a no-op
        assert!(store.promote_on_receive(&first).is_none());
    }

    #[test]
    fn test_rotation_displaces_one_way() {
        let store = KeypairStore::default();
        let first = keypair(false);
        let second = keypair(false);
        let third = keypair(false);

        store.install_next(first.clone());
        store.promote_on_receive(&first).unwrap();
        store.install_next(second.clone());
        store.promote_on_receive(&second).unwrap();

        // previous=first, current=second; a third rotation drops first
        store.install_next(third.clone());
        let displaced = store.promote_on_receive(&third).unwrap();
        assert_eq!(displaced.len(), 1);
        assert!(Arc::ptr_eq(&displaced[0], &first));
        assert!(Arc::ptr_eq(&store.current().unwrap(), &third));
    }

    #[test]
    fn test_send_promotes_only_live_keypair() {
        let store = KeypairStore::default();
        let kp = keypair(true);
        store.install_next(kp.clone());

        let (chosen, displaced) = store.current_for_send();
        assert!(Arc::ptr_eq(&chosen.unwrap(), &kp));
        assert!(displaced.is_empty());
    }

    #[test]
    fn test_send_refuses_exhausted() {
        let store = KeypairStore::default();
        let kp = keypair(true);
        store.install_next(kp.clone());
        store.promote_on_receive(&kp).unwrap();
        store.expire_for_send();

        let (chosen, _) = store.current_for_send();
        assert!(chosen.is_none());
    }

    #[test]
    fn test_clear_empties_all_slots() {
        let store = KeypairStore::default();
        let a = keypair(false);
        let b = keypair(false);
        store.install_next(a.clone());
        store.promote_on_receive(&a).unwrap();
        store.install_next(b);

        let removed = store.clear();
        assert_eq!(removed.len(), 2);
        assert!(store.current().is_none());
        let (chosen, _) = store.current_for_send();
        assert!(chosen.is_none());
    }

    #[test]
    fn test_receive_acceptance_tracks_slots() {
        let store = KeypairStore::default();
        let kp = keypair(false);
        assert!(!store.accepts_for_receive(&kp));
        store.install_next(kp.clone());
        assert!(store.accepts_for_receive(&kp));
        store.clear();
        assert!(!store.accepts_for_receive(&kp));
    }
}
