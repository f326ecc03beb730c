//! Outbound pipeline: nonce assignment and in-order sending
//!
//! The nonce worker drains the staged queue once a usable keypair
//! exists, stamping each packet with the next send counter and handing
//! the AEAD work to the runtime. The sequential sender awaits each
//! element's completion in the order nonces were assigned, so packets
//! leave on the wire in nonce order.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};

use crate::crypto::aead;
use crate::device::keypair::Keypair;
use crate::device::peer::Peer;
use crate::device::queue::OutboundElement;
use crate::protocol::messages::{DataHeader, HandshakeInitiation};
use crate::protocol::REKEY_TIMEOUT;

/// Seal one packet off the ordered path; the sealed datagram comes
/// back through the element's completion channel.
fn spawn_seal(
    keypair: Arc<Keypair>,
    nonce: u64,
    plaintext: Vec<u8>,
) -> oneshot::Receiver<Option<Vec<u8>>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let sealed = aead::seal(&keypair.send_key, nonce, &plaintext, &[])
            .ok()
            .map(|ct| DataHeader::assemble(keypair.remote_index, nonce, &ct));
        let _ = tx.send(sealed);
    });
    rx
}

/// The nonce worker: parks until staged work or a fresh keypair wakes
/// it, then converts staged plaintext into ordered outbound elements.
pub(crate) async fn run_nonce_worker(
    peer: Arc<Peer>,
    outbound_tx: mpsc::Sender<OutboundElement>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = peer.staged.notify.notified() => {}
            _ = peer.keypair_arrived.notified() => {}
        }
        if drain_staged(&peer, &outbound_tx, &mut stop).await {
            break;
        }
    }
    tracing::debug!(peer = %peer, "nonce worker stopped");
}

/// Move staged packets into the outbound channel. Returns true when
/// the stop token fired mid-drain.
async fn drain_staged(
    peer: &Arc<Peer>,
    outbound_tx: &mpsc::Sender<OutboundElement>,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    let (keypair, displaced) = peer.keypairs.current_for_send();
    if let Some(device) = peer.device.upgrade() {
        for old in &displaced {
            device.index_table.delete(old.local_index);
        }
    }

    let Some(keypair) = keypair else {
        // No usable keypair: leave packets parked and ask for one
        if !peer.staged.is_empty() {
            peer.send_handshake_initiation(false).await;
        }
        return false;
    };

    if keypair.needs_rekey() {
        peer.send_handshake_initiation(false).await;
    }

    while let Some(plaintext) = peer.staged.pop() {
        let Some(nonce) = keypair.next_send_nonce() else {
            // Counter space or session age spent mid-drain; park the
            // packet again and negotiate fresh keys
            peer.stage_outbound(plaintext);
            peer.send_handshake_initiation(false).await;
            return false;
        };

        let element = OutboundElement {
            keypair: keypair.clone(),
            is_keepalive: plaintext.is_empty(),
            done: spawn_seal(keypair.clone(), nonce, plaintext),
        };
        tokio::select! {
            _ = stop.changed() => return true,
            sent = outbound_tx.send(element) => {
                if sent.is_err() {
                    return true;
                }
            }
        }
    }
    false
}

/// The sequential sender: awaits each sealed element in order and
/// hands it to the transport.
pub(crate) async fn run_sequential_sender(
    peer: Arc<Peer>,
    mut outbound_rx: mpsc::Receiver<OutboundElement>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let element = tokio::select! {
            _ = stop.changed() => break,
            element = outbound_rx.recv() => match element {
                Some(element) => element,
                None => break,
            },
        };

        let Ok(Some(datagram)) = element.done.await else {
            continue;
        };

        if let Err(err) = peer.send_buffer(&datagram).await {
            tracing::debug!(peer = %peer, %err, "transport send failed");
            continue;
        }

        peer.timers_any_authenticated_packet_traversal();
        peer.timers_any_authenticated_packet_sent();
        if !element.is_keepalive {
            peer.timers_data_sent();
        }

        if element.keypair.needs_rekey() {
            peer.send_handshake_initiation(false).await;
        }
    }
    tracing::debug!(peer = %peer, "sequential sender stopped");
}

impl Peer {
    /// Build, MAC, and transmit a handshake initiation, paced to one
    /// per REKEY_TIMEOUT. Retransmissions keep the attempt counter;
    /// fresh attempts reset it.
    pub(crate) async fn send_handshake_initiation(self: &Arc<Self>, is_retry: bool) {
        if !is_retry {
            self.timers.handshake_attempts.store(0, Ordering::Relaxed);
        }

        let Some(device) = self.device.upgrade() else {
            return;
        };
        let Some(identity) = device.identity() else {
            return;
        };

        {
            let handshake = self.handshake.lock().expect("handshake lock");
            if let Some(last) = handshake.last_sent_initiation {
                if last.elapsed() < REKEY_TIMEOUT {
                    return;
                }
            }
        }

        let local_index = device.index_table.new_index(Arc::downgrade(self));
        let msg = {
            let mut handshake = self.handshake.lock().expect("handshake lock");
            // Re-check under the lock; a racing initiation wins
            if let Some(last) = handshake.last_sent_initiation {
                if last.elapsed() < REKEY_TIMEOUT {
                    device.index_table.delete(local_index);
                    return;
                }
            }
            handshake.last_sent_initiation = Some(Instant::now());

            if handshake.local_index != 0 {
                device.index_table.delete(handshake.local_index);
            }
            match handshake.create_initiation(&identity.0, &identity.1, local_index) {
                Ok(msg) => msg,
                Err(err) => {
                    device.index_table.delete(local_index);
                    tracing::debug!(peer = %self, %err, "building initiation failed");
                    return;
                }
            }
        };

        tracing::debug!(peer = %self, "sending handshake initiation");

        let mut packet = msg.to_bytes().to_vec();
        self.cookie
            .lock()
            .expect("cookie lock")
            .add_macs(&mut packet, HandshakeInitiation::MAC1_OFFSET);

        self.timers_any_authenticated_packet_traversal();
        self.timers_any_authenticated_packet_sent();

        if let Err(err) = self.send_buffer(&packet).await {
            tracing::debug!(peer = %self, %err, "sending initiation failed");
        }

        self.timers_handshake_initiated();
    }
}
