//! Pipeline queues and work elements
//!
//! Outbound and inbound elements flow through bounded channels in
//! strict order; the AEAD result arrives later through each element's
//! completion signal. Plaintext waiting for a keypair sits in the
//! staged queue, which drops its oldest entry on overflow.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify};

use crate::bind::Endpoint;
use crate::device::keypair::Keypair;

/// One outbound packet moving toward the transport. The sealed
/// datagram arrives on `done`; `None` means the seal failed and the
/// element is skipped.
pub struct OutboundElement {
    pub keypair: Arc<Keypair>,
    /// Empty plaintext, i.e. a keepalive
    pub is_keepalive: bool,
    pub done: oneshot::Receiver<Option<Vec<u8>>>,
}

/// One inbound datagram moving toward the TUN device. The decrypted
/// plaintext arrives on `done`; `None` means authentication failed.
pub struct InboundElement {
    pub keypair: Arc<Keypair>,
    pub counter: u64,
    pub endpoint: Endpoint,
    /// Wire size, counted into rx statistics on acceptance
    pub datagram_len: usize,
    pub done: oneshot::Receiver<Option<Vec<u8>>>,
}

/// Bounded FIFO for plaintext parked before a keypair exists
pub struct StagedQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    /// Wakes the nonce worker when work is staged
    pub notify: Notify,
}

impl StagedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Stage a frame, dropping the oldest entry when full
    pub fn push(&self, frame: Vec<u8>) {
        let mut frames = self.frames.lock().expect("staged queue lock");
        if frames.len() == self.capacity {
            frames.pop_front();
            tracing::debug!("staged queue full, dropping oldest packet");
        }
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<Vec<u8>> {
        self.frames.lock().expect("staged queue lock").pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().expect("staged queue lock").is_empty()
    }

    pub fn clear(&self) {
        self.frames.lock().expect("staged queue lock").clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}
