//! Inbound pipeline: datagram dispatch and in-order delivery
//!
//! The device receive loop classifies each datagram by its first byte.
//! Handshake messages are validated and answered inline; data packets
//! are demultiplexed through the index table, decrypted off the
//! ordered path, and delivered by the peer's sequential receiver in
//! arrival order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::bind::Endpoint;
use crate::crypto::aead;
use crate::device::allowed_ips::source_address;
use crate::device::handshake::{consume_initiation_static, consume_initiation_timestamp};
use crate::device::index::IndexKind;
use crate::device::keypair::Keypair;
use crate::device::peer::Peer;
use crate::device::queue::InboundElement;
use crate::device::Device;
use crate::protocol::messages::{
    message_type, CookieReply, DataHeader, HandshakeInitiation, HandshakeResponse, MessageType,
};
use crate::protocol::{KEEPALIVE_TIMEOUT, REJECT_AFTER_TIME, REKEY_TIMEOUT};

/// Decrypt one datagram off the ordered path; plaintext comes back
/// through the element's completion channel.
fn spawn_open(
    keypair: Arc<Keypair>,
    counter: u64,
    datagram: Vec<u8>,
) -> oneshot::Receiver<Option<Vec<u8>>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let plaintext =
            aead::open(&keypair.receive_key, counter, DataHeader::ciphertext(&datagram), &[]).ok();
        let _ = tx.send(plaintext);
    });
    rx
}

impl Device {
    /// Classify and handle one inbound datagram
    pub(crate) async fn handle_datagram(self: &Arc<Self>, datagram: &[u8], src: Endpoint) {
        match message_type(datagram) {
            Ok(MessageType::HandshakeInitiation) => {
                self.handle_initiation(datagram, src).await;
            }
            Ok(MessageType::HandshakeResponse) => {
                self.handle_response(datagram, src).await;
            }
            Ok(MessageType::CookieReply) => {
                self.handle_cookie_reply(datagram);
            }
            Ok(MessageType::Data) => {
                self.handle_data(datagram, src);
            }
            Err(_) => {
                tracing::trace!(%src, "dropping unclassifiable datagram");
            }
        }
    }

    async fn handle_initiation(self: &Arc<Self>, datagram: &[u8], src: Endpoint) {
        if datagram.len() != HandshakeInitiation::SIZE {
            return;
        }
        let Some(checker) = self.cookie_checker() else {
            return;
        };
        if !checker.check_mac1(datagram, HandshakeInitiation::MAC1_OFFSET) {
            tracing::trace!(%src, "initiation with bad mac1");
            return;
        }
        let Ok(msg) = HandshakeInitiation::from_bytes(datagram) else {
            return;
        };
        let Some(identity) = self.identity() else {
            return;
        };

        let Ok((chain, peer_static)) = consume_initiation_static(&msg, &identity.0, &identity.1)
        else {
            tracing::trace!(%src, "initiation failed static decryption");
            return;
        };
        let Some(peer) = self.peer_by_key(&peer_static) else {
            tracing::trace!(%src, "initiation from unknown peer");
            return;
        };

        let precomputed = peer
            .handshake
            .lock()
            .expect("handshake lock")
            .precomputed_static_static;
        let Ok(consumed) = consume_initiation_timestamp(chain, &msg, peer_static, &precomputed)
        else {
            tracing::trace!(peer = %peer, "initiation failed timestamp decryption");
            return;
        };

        // Monotonicity and rate limiting under the handshake lock
        let mut throttled = false;
        {
            let mut handshake = peer.handshake.lock().expect("handshake lock");
            if !consumed.timestamp.after(&handshake.last_timestamp) {
                tracing::trace!(peer = %peer, "initiation timestamp not monotonic");
                return;
            }
            if !handshake.initiation_limit.allow()
                && !checker.check_mac2(datagram, HandshakeInitiation::MAC1_OFFSET, &src)
            {
                throttled = true;
            } else {
                handshake.adopt_initiation(consumed);
            }
        }
        if throttled {
            tracing::debug!(peer = %peer, %src, "initiation throttled, sending cookie");
            if let Ok(reply) = checker.create_reply(&msg.mac1, msg.sender_index, &src) {
                if let Some(bind) = self.bind() {
                    let _ = bind.send(&reply.to_bytes(), &src).await;
                }
            }
            return;
        }

        peer.set_endpoint_from_packet(src);
        if peer.endpoint().is_none() {
            peer.set_endpoint(src);
        }

        self.send_response(&peer).await;
    }

    /// Build and transmit the response, deriving the *next* keypair
    async fn send_response(self: &Arc<Self>, peer: &Arc<Peer>) {
        let local_index = self.index_table.new_index(Arc::downgrade(peer));

        let created = {
            let mut handshake = peer.handshake.lock().expect("handshake lock");
            if handshake.local_index != 0 {
                self.index_table.delete(handshake.local_index);
            }
            handshake.create_response(local_index)
        };
        let (msg, send_key, receive_key) = match created {
            Ok(parts) => parts,
            Err(err) => {
                self.index_table.delete(local_index);
                tracing::debug!(peer = %peer, %err, "building response failed");
                return;
            }
        };

        let keypair = Arc::new(Keypair::new(
            send_key,
            receive_key,
            false,
            local_index,
            msg.receiver_index,
        ));
        self.index_table
            .swap_to_keypair(local_index, Arc::downgrade(&keypair));
        for old in peer.keypairs.install_next(keypair) {
            self.index_table.delete(old.local_index);
        }
        peer.timers_session_derived();

        let mut packet = msg.to_bytes().to_vec();
        peer.cookie
            .lock()
            .expect("cookie lock")
            .add_macs(&mut packet, HandshakeResponse::MAC1_OFFSET);

        peer.timers_any_authenticated_packet_traversal();
        peer.timers_any_authenticated_packet_sent();

        tracing::debug!(peer = %peer, "sending handshake response");
        if let Err(err) = peer.send_buffer(&packet).await {
            tracing::debug!(peer = %peer, %err, "sending response failed");
        }
    }

    async fn handle_response(self: &Arc<Self>, datagram: &[u8], src: Endpoint) {
        if datagram.len() != HandshakeResponse::SIZE {
            return;
        }
        let Some(checker) = self.cookie_checker() else {
            return;
        };
        if !checker.check_mac1(datagram, HandshakeResponse::MAC1_OFFSET) {
            tracing::trace!(%src, "response with bad mac1");
            return;
        }
        let Ok(msg) = HandshakeResponse::from_bytes(datagram) else {
            return;
        };
        let Some(identity) = self.identity() else {
            return;
        };

        let Some(entry) = self.index_table.lookup(msg.receiver_index) else {
            tracing::trace!(%src, index = msg.receiver_index, "response to unknown index");
            return;
        };
        let (Some(peer), IndexKind::Handshake) = (entry.peer.upgrade(), entry.kind) else {
            return;
        };

        let consumed = {
            let mut handshake = peer.handshake.lock().expect("handshake lock");
            handshake.consume_response(&msg, &identity.0)
        };
        let (send_key, receive_key) = match consumed {
            Ok(keys) => keys,
            Err(err) => {
                tracing::trace!(peer = %peer, %err, "response rejected");
                return;
            }
        };

        let keypair = Arc::new(Keypair::new(
            send_key,
            receive_key,
            true,
            msg.receiver_index,
            msg.sender_index,
        ));
        self.index_table
            .swap_to_keypair(msg.receiver_index, Arc::downgrade(&keypair));
        for old in peer.keypairs.install_next(keypair) {
            self.index_table.delete(old.local_index);
        }

        peer.set_endpoint_from_packet(src);
        peer.set_last_handshake_now();
        peer.timers_handshake_complete();
        peer.timers_session_derived();

        tracing::info!(peer = %peer, "handshake completed as initiator");

        // Wake parked plaintext and confirm the session so the
        // responder can promote its *next* keypair.
        peer.keypair_arrived.notify_one();
        peer.send_keepalive();
    }

    fn handle_cookie_reply(&self, datagram: &[u8]) {
        if datagram.len() != CookieReply::SIZE {
            return;
        }
        let Ok(msg) = CookieReply::from_bytes(datagram) else {
            return;
        };
        let Some(entry) = self.index_table.lookup(msg.receiver_index) else {
            return;
        };
        let Some(peer) = entry.peer.upgrade() else {
            return;
        };
        let result = peer.cookie.lock().expect("cookie lock").consume_reply(&msg);
        match result {
            Ok(()) => tracing::debug!(peer = %peer, "cookie reply accepted"),
            Err(err) => tracing::trace!(peer = %peer, %err, "cookie reply rejected"),
        }
    }

    /// Demultiplex a data packet and hand it to the owning peer's
    /// receive pipeline. Dispatch never blocks on a slow peer.
    fn handle_data(&self, datagram: &[u8], src: Endpoint) {
        if datagram.len() < DataHeader::MIN_PACKET {
            return;
        }
        let Ok(header) = DataHeader::from_bytes(datagram) else {
            return;
        };
        let Some(entry) = self.index_table.lookup(header.receiver_index) else {
            tracing::trace!(%src, index = header.receiver_index, "data for unknown index");
            return;
        };
        let Some(peer) = entry.peer.upgrade() else {
            return;
        };
        let IndexKind::Keypair(keypair) = entry.kind else {
            return;
        };
        let Some(keypair) = keypair.upgrade() else {
            return;
        };
        if keypair.expired() {
            tracing::trace!(peer = %peer, "data on expired keypair");
            return;
        }
        let Some(inbound_tx) = peer.inbound_sender() else {
            return;
        };

        let element = InboundElement {
            keypair: keypair.clone(),
            counter: header.counter,
            endpoint: src,
            datagram_len: datagram.len(),
            done: spawn_open(keypair, header.counter, datagram.to_vec()),
        };
        if inbound_tx.try_send(element).is_err() {
            tracing::debug!(peer = %peer, "inbound queue full, dropping packet");
        }
    }
}

/// The sequential receiver: delivers decrypted packets in arrival
/// order, enforcing the replay window and driving roaming, promotion,
/// statistics, and timers.
pub(crate) async fn run_sequential_receiver(
    peer: Arc<Peer>,
    mut inbound_rx: mpsc::Receiver<InboundElement>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let element = tokio::select! {
            _ = stop.changed() => break,
            element = inbound_rx.recv() => match element {
                Some(element) => element,
                None => break,
            },
        };

        let Ok(Some(plaintext)) = element.done.await else {
            tracing::trace!(peer = %peer, "inbound packet failed authentication");
            continue;
        };

        if !element
            .keypair
            .replay_filter
            .lock()
            .expect("replay filter lock")
            .validate(element.counter)
        {
            tracing::trace!(peer = %peer, counter = element.counter, "replayed or out-of-window counter");
            continue;
        }

        if !peer.keypairs.accepts_for_receive(&element.keypair) {
            continue;
        }

        peer.set_endpoint_from_packet(element.endpoint);

        // First traffic on the *next* keypair completes its rotation
        if let Some(displaced) = peer.keypairs.promote_on_receive(&element.keypair) {
            if let Some(device) = peer.device.upgrade() {
                for old in displaced {
                    device.index_table.delete(old.local_index);
                }
            }
            peer.set_last_handshake_now();
            peer.timers_handshake_complete();
            peer.keypair_arrived.notify_one();
            tracing::info!(peer = %peer, "session confirmed, keypair rotated in");
        }

        keep_key_fresh_receiving(&peer, &element.keypair).await;

        peer.timers_any_authenticated_packet_traversal();
        peer.timers_any_authenticated_packet_received();
        peer.add_rx_bytes(element.datagram_len as u64);

        if plaintext.is_empty() {
            tracing::trace!(peer = %peer, "keepalive received");
            continue;
        }
        peer.timers_data_received();

        // Cryptokey routing: the inner source must belong to this peer
        let routed = source_address(&plaintext).and_then(|ip| {
            peer.device
                .upgrade()
                .and_then(|device| device.lookup_allowed_ip(ip))
        });
        match routed {
            Some(owner) if Arc::ptr_eq(&owner, &peer) => {}
            _ => {
                tracing::debug!(peer = %peer, "inner source not allowed, dropping");
                continue;
            }
        }

        if let Some(device) = peer.device.upgrade() {
            if let Err(err) = device.tun().write(&plaintext).await {
                tracing::debug!(peer = %peer, %err, "tun write failed");
            }
        }
    }
    tracing::debug!(peer = %peer, "sequential receiver stopped");
}

/// If this session nears its hard expiry and we were its initiator,
/// fire one last handshake so the tunnel survives the cutoff.
async fn keep_key_fresh_receiving(peer: &Arc<Peer>, keypair: &Arc<Keypair>) {
    use std::sync::atomic::Ordering;

    if peer
        .timers
        .sent_last_minute_handshake
        .load(Ordering::Relaxed)
    {
        return;
    }
    let last_minute = REJECT_AFTER_TIME - KEEPALIVE_TIMEOUT - REKEY_TIMEOUT;
    if keypair.is_initiator && keypair.created.elapsed() >= last_minute {
        peer.timers
            .sent_last_minute_handshake
            .store(true, Ordering::Relaxed);
        peer.send_handshake_initiation(false).await;
    }
}
