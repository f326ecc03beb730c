//! Per-peer protocol timers
//!
//! Six logical timers drive retransmission, keepalives, rekeying, and
//! key-material hygiene. All deadlines multiplex onto one scheduler
//! task per peer; arm/disarm are idempotent and cheap, and expiry
//! handlers run outside the deadline bookkeeping so a slow handler
//! never skews the clock.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{watch, Notify};

use crate::device::peer::Peer;
use crate::protocol::{
    KEEPALIVE_TIMEOUT, MAX_TIMER_HANDSHAKES, REJECT_AFTER_TIME, REKEY_TIMEOUT,
};

/// Max jitter added to the handshake retransmission deadline
const REKEY_TIMEOUT_JITTER_MAX: Duration = Duration::from_millis(334);

/// The five armable timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    RetransmitHandshake = 0,
    SendKeepalive = 1,
    NewHandshake = 2,
    ZeroKeyMaterial = 3,
    PersistentKeepalive = 4,
}

const TIMER_COUNT: usize = 5;

const ALL_TIMERS: [TimerKind; TIMER_COUNT] = [
    TimerKind::RetransmitHandshake,
    TimerKind::SendKeepalive,
    TimerKind::NewHandshake,
    TimerKind::ZeroKeyMaterial,
    TimerKind::PersistentKeepalive,
];

/// Timer state shared between event callers and the scheduler task
pub struct Timers {
    deadlines: Mutex<[Option<Instant>; TIMER_COUNT]>,
    /// Wakes the scheduler whenever a deadline changes
    pub(crate) wake: Arc<Notify>,
    pub(crate) handshake_attempts: std::sync::atomic::AtomicU32,
    pub(crate) need_another_keepalive: std::sync::atomic::AtomicBool,
    pub(crate) sent_last_minute_handshake: std::sync::atomic::AtomicBool,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            deadlines: Mutex::new([None; TIMER_COUNT]),
            wake: Arc::new(Notify::new()),
            handshake_attempts: std::sync::atomic::AtomicU32::new(0),
            need_another_keepalive: std::sync::atomic::AtomicBool::new(false),
            sent_last_minute_handshake: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl Timers {
    /// Arm (or re-arm) a timer to fire after `after`
    pub fn arm(&self, kind: TimerKind, after: Duration) {
        let mut deadlines = self.deadlines.lock().expect("timer lock");
        deadlines[kind as usize] = Some(Instant::now() + after);
        drop(deadlines);
        self.wake.notify_one();
    }

    /// Arm only if not already pending
    pub fn arm_if_idle(&self, kind: TimerKind, after: Duration) {
        let mut deadlines = self.deadlines.lock().expect("timer lock");
        if deadlines[kind as usize].is_none() {
            deadlines[kind as usize] = Some(Instant::now() + after);
            drop(deadlines);
            self.wake.notify_one();
        }
    }

    pub fn disarm(&self, kind: TimerKind) {
        self.deadlines.lock().expect("timer lock")[kind as usize] = None;
        self.wake.notify_one();
    }

    pub fn disarm_all(&self) {
        *self.deadlines.lock().expect("timer lock") = [None; TIMER_COUNT];
        self.wake.notify_one();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.lock().expect("timer lock")[kind as usize].is_some()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines
            .lock()
            .expect("timer lock")
            .iter()
            .flatten()
            .min()
            .copied()
    }

    /// Disarm and return every timer due at `now`
    fn take_due(&self, now: Instant) -> Vec<TimerKind> {
        let mut deadlines = self.deadlines.lock().expect("timer lock");
        let mut due = Vec::new();
        for kind in ALL_TIMERS {
            if let Some(deadline) = deadlines[kind as usize] {
                if deadline <= now {
                    deadlines[kind as usize] = None;
                    due.push(kind);
                }
            }
        }
        due
    }
}

/// The per-peer timer scheduler. Sleeps until the earliest armed
/// deadline, dispatches expiries, and re-evaluates whenever a timer is
/// armed or disarmed.
pub(crate) async fn run_scheduler(peer: Arc<Peer>, mut stop: watch::Receiver<bool>) {
    let wake = peer.timers.wake.clone();
    loop {
        let next = peer.timers.next_deadline();
        tokio::select! {
            _ = stop.changed() => break,
            _ = wake.notified() => continue,
            _ = async {
                match next {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                for kind in peer.timers.take_due(Instant::now()) {
                    timer_expired(&peer, kind).await;
                }
            }
        }
    }
}

async fn timer_expired(peer: &Arc<Peer>, kind: TimerKind) {
    match kind {
        TimerKind::RetransmitHandshake => {
            let attempts = peer.timers.handshake_attempts.load(Ordering::Relaxed);
            if attempts >= MAX_TIMER_HANDSHAKES {
                tracing::warn!(
                    peer = %peer,
                    attempts,
                    "handshake did not complete, giving up"
                );
                peer.timers.disarm(TimerKind::SendKeepalive);
                peer.flush_staged_packets();
                peer.timers
                    .arm_if_idle(TimerKind::ZeroKeyMaterial, REJECT_AFTER_TIME * 3);
            } else {
                peer.timers
                    .handshake_attempts
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    peer = %peer,
                    attempt = attempts + 1,
                    "handshake response missing, retrying"
                );
                peer.send_handshake_initiation(true).await;
            }
        }
        TimerKind::SendKeepalive => {
            peer.send_keepalive();
            if peer
                .timers
                .need_another_keepalive
                .swap(false, Ordering::Relaxed)
            {
                peer.timers.arm(TimerKind::SendKeepalive, KEEPALIVE_TIMEOUT);
            }
        }
        TimerKind::NewHandshake => {
            tracing::debug!(
                peer = %peer,
                "no reply to authenticated traffic, initiating new handshake"
            );
            peer.send_handshake_initiation(false).await;
        }
        TimerKind::ZeroKeyMaterial => {
            tracing::debug!(peer = %peer, "discarding stale key material");
            peer.zero_and_flush_all();
        }
        TimerKind::PersistentKeepalive => {
            if peer.persistent_keepalive_interval() > 0 {
                peer.send_keepalive();
            }
        }
    }
}

/// Timer event rules, mirroring the protocol's arm/cancel table.
/// These are methods on `Peer` so call sites read like the protocol
/// description.
impl Peer {
    fn timers_active(&self) -> bool {
        self.is_running()
    }

    /// An initiation went out
    pub(crate) fn timers_handshake_initiated(&self) {
        if self.timers_active() {
            let jitter = rand::thread_rng().gen_range(Duration::ZERO..=REKEY_TIMEOUT_JITTER_MAX);
            self.timers
                .arm(TimerKind::RetransmitHandshake, REKEY_TIMEOUT + jitter);
        }
    }

    /// A handshake finished (response consumed, or next promoted)
    pub(crate) fn timers_handshake_complete(&self) {
        if self.timers_active() {
            self.timers.disarm(TimerKind::RetransmitHandshake);
        }
        self.timers.handshake_attempts.store(0, Ordering::Relaxed);
        self.timers
            .sent_last_minute_handshake
            .store(false, Ordering::Relaxed);
    }

    /// New session keys exist (either role)
    pub(crate) fn timers_session_derived(&self) {
        if self.timers_active() {
            self.timers
                .arm(TimerKind::ZeroKeyMaterial, REJECT_AFTER_TIME * 3);
        }
    }

    /// An authenticated data packet was handed to the transport
    pub(crate) fn timers_data_sent(&self) {
        if self.timers_active() {
            self.timers
                .arm_if_idle(TimerKind::NewHandshake, KEEPALIVE_TIMEOUT + REKEY_TIMEOUT);
        }
    }

    /// An authenticated data packet arrived
    pub(crate) fn timers_data_received(&self) {
        if self.timers_active() {
            if self.timers.is_armed(TimerKind::SendKeepalive) {
                self.timers
                    .need_another_keepalive
                    .store(true, Ordering::Relaxed);
            } else {
                self.timers.arm(TimerKind::SendKeepalive, KEEPALIVE_TIMEOUT);
            }
        }
    }

    /// Any authenticated packet went out (data or keepalive)
    pub(crate) fn timers_any_authenticated_packet_sent(&self) {
        if self.timers_active() {
            self.timers.disarm(TimerKind::SendKeepalive);
        }
    }

    /// Any authenticated packet arrived (data or keepalive)
    pub(crate) fn timers_any_authenticated_packet_received(&self) {
        if self.timers_active() {
            self.timers.disarm(TimerKind::NewHandshake);
        }
    }

    /// Any authenticated packet crossed the wire in either direction
    pub(crate) fn timers_any_authenticated_packet_traversal(&self) {
        let interval = self.persistent_keepalive_interval();
        if interval > 0 && self.timers_active() {
            self.timers.arm(
                TimerKind::PersistentKeepalive,
                Duration::from_secs(interval as u64),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_disarm_idempotent() {
        let timers = Timers::default();
        assert!(!timers.is_armed(TimerKind::SendKeepalive));

        timers.arm(TimerKind::SendKeepalive, Duration::from_secs(10));
        timers.arm(TimerKind::SendKeepalive, Duration::from_secs(10));
        assert!(timers.is_armed(TimerKind::SendKeepalive));

        timers.disarm(TimerKind::SendKeepalive);
        timers.disarm(TimerKind::SendKeepalive);
        assert!(!timers.is_armed(TimerKind::SendKeepalive));
    }

    #[test]
    fn test_arm_if_idle_does_not_postpone() {
        let timers = Timers::default();
        timers.arm(TimerKind::NewHandshake, Duration::from_millis(1));
        let first = timers.next_deadline().unwrap();

        timers.arm_if_idle(TimerKind::NewHandshake, Duration::from_secs(60));
        assert_eq!(timers.next_deadline().unwrap(), first);
    }

    #[test]
    fn test_next_deadline_is_earliest() {
        let timers = Timers::default();
        timers.arm(TimerKind::ZeroKeyMaterial, Duration::from_secs(540));
        timers.arm(TimerKind::SendKeepalive, Duration::from_secs(10));
        timers.arm(TimerKind::NewHandshake, Duration::from_secs(15));

        let next = timers.next_deadline().unwrap();
        let eta = next.saturating_duration_since(Instant::now());
        assert!(eta <= Duration::from_secs(10));
        assert!(eta > Duration::from_secs(9));
    }

    #[test]
    fn test_take_due_disarms_only_expired() {
        let timers = Timers::default();
        timers.arm(TimerKind::SendKeepalive, Duration::ZERO);
        timers.arm(TimerKind::ZeroKeyMaterial, Duration::from_secs(540));

        let due = timers.take_due(Instant::now() + Duration::from_millis(1));
        assert_eq!(due, vec![TimerKind::SendKeepalive]);
        assert!(!timers.is_armed(TimerKind::SendKeepalive));
        assert!(timers.is_armed(TimerKind::ZeroKeyMaterial));
    }

    #[test]
    fn test_disarm_all() {
        let timers = Timers::default();
        for kind in ALL_TIMERS {
            timers.arm(kind, Duration::from_secs(5));
        }
        timers.disarm_all();
        assert_eq!(timers.next_deadline(), None);
    }
}
