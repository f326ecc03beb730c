//! The per-peer aggregate: lifecycle, endpoint, statistics
//!
//! A peer owns its handshake, keypairs, timers, queues, and the three
//! pipeline tasks plus the timer scheduler. Start and Stop are
//! serialized; Stop cancels timers first, signals the stop token,
//! waits for every task to exit, then zeroizes key material.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Instant, SystemTime};

use ipnet::IpNet;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::bind::Endpoint;
use crate::device::handshake::Handshake;
use crate::device::keypair::KeypairStore;
use crate::device::queue::{InboundElement, StagedQueue};
use crate::device::timers::Timers;
use crate::device::Device;
use crate::error::{DeviceError, NetworkError, Result};
use crate::protocol::{
    CookieGenerator, QUEUE_INBOUND_SIZE, QUEUE_OUTBOUND_SIZE, QUEUE_STAGED_SIZE, REKEY_TIMEOUT,
};

/// Pipeline senders, live while the peer runs. The outbound sender is
/// owned by the nonce worker; the device receive loop clones the
/// inbound sender per packet.
pub(crate) struct PeerChannels {
    pub inbound_tx: mpsc::Sender<InboundElement>,
}

/// Start/stop coordination
#[derive(Default)]
struct Routines {
    stop: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

/// Transfer statistics, snapshot via [`Peer::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    /// Wall time of the last completed handshake, nanoseconds since the
    /// Unix epoch; 0 when none has completed
    pub last_handshake_nanos: i64,
}

pub struct Peer {
    // The three 64-bit statistics lead the struct, keeping the layout
    // of the protocol description; they are only ever touched with
    // atomic loads and stores.
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    last_handshake_nanos: AtomicI64,
    running: AtomicBool,

    pub(crate) device: Weak<Device>,
    public_key: [u8; 32],
    endpoint: RwLock<Option<Endpoint>>,
    /// Snapshot of configured prefixes; routing authority is the
    /// device's allowed-IP table
    allowed_ips: RwLock<Vec<IpNet>>,
    persistent_keepalive_secs: AtomicU32,

    pub(crate) handshake: Mutex<Handshake>,
    pub(crate) keypairs: KeypairStore,
    pub(crate) cookie: Mutex<CookieGenerator>,
    pub(crate) timers: Timers,

    /// Plaintext parked until a keypair exists
    pub(crate) staged: StagedQueue,
    /// Signals the nonce worker that a fresh keypair was installed
    pub(crate) keypair_arrived: Notify,
    pub(crate) channels: RwLock<Option<PeerChannels>>,
    routines: tokio::sync::Mutex<Routines>,
}

impl Peer {
    pub(crate) fn new(
        device: Weak<Device>,
        public_key: [u8; 32],
        precomputed_static_static: [u8; 32],
    ) -> Arc<Self> {
        Arc::new(Self {
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            last_handshake_nanos: AtomicI64::new(0),
            running: AtomicBool::new(false),
            device,
            public_key,
            endpoint: RwLock::new(None),
            allowed_ips: RwLock::new(Vec::new()),
            persistent_keepalive_secs: AtomicU32::new(0),
            handshake: Mutex::new(Handshake::new(public_key, precomputed_static_static)),
            keypairs: KeypairStore::default(),
            cookie: Mutex::new(CookieGenerator::new(&public_key)),
            timers: Timers::default(),
            staged: StagedQueue::new(QUEUE_STAGED_SIZE),
            keypair_arrived: Notify::new(),
            channels: RwLock::new(None),
            routines: tokio::sync::Mutex::new(Routines::default()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether a confirmed session (a current keypair) exists
    pub fn has_session(&self) -> bool {
        self.keypairs.current().is_some()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// Spawn the pipelines and the timer scheduler. Errors if the
    /// device is closed or the peer already runs.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let device = self.device.upgrade().ok_or(DeviceError::Closed)?;
        if device.is_closed() {
            return Err(DeviceError::Closed.into());
        }

        let mut routines = self.routines.lock().await;
        if self.is_running() {
            return Err(DeviceError::AlreadyRunning.into());
        }
        tracing::debug!(peer = %self, "starting");

        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_OUTBOUND_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_INBOUND_SIZE);
        *self.channels.write().expect("channels lock") = Some(PeerChannels { inbound_tx });

        // Let the first staged packet trigger an initiation immediately
        // instead of waiting out a full REKEY_TIMEOUT.
        self.handshake.lock().expect("handshake lock").last_sent_initiation =
            Some(Instant::now() - REKEY_TIMEOUT);

        let (stop_tx, stop_rx) = watch::channel(false);
        routines.handles = vec![
            tokio::spawn(crate::device::timers::run_scheduler(
                self.clone(),
                stop_rx.clone(),
            )),
            tokio::spawn(crate::device::send::run_nonce_worker(
                self.clone(),
                outbound_tx,
                stop_rx.clone(),
            )),
            tokio::spawn(crate::device::send::run_sequential_sender(
                self.clone(),
                outbound_rx,
                stop_rx.clone(),
            )),
            tokio::spawn(crate::device::receive::run_sequential_receiver(
                self.clone(),
                inbound_rx,
                stop_rx,
            )),
        ];
        routines.stop = Some(stop_tx);

        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop every task, close the queues, and wipe key material.
    /// Safe to call redundantly.
    pub async fn stop(&self) {
        let mut routines = self.routines.lock().await;
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(peer = %self, "stopping");

        // No timer may schedule new work while tasks wind down
        self.timers.disarm_all();

        if let Some(stop) = routines.stop.take() {
            let _ = stop.send(true);
        }
        for handle in routines.handles.drain(..) {
            let _ = handle.await;
        }

        // Queues close only after the tasks exited, never the reverse
        *self.channels.write().expect("channels lock") = None;

        self.zero_and_flush_all();
    }

    /// Hand a datagram to the transport toward the current endpoint
    pub(crate) async fn send_buffer(&self, buf: &[u8]) -> Result<()> {
        let device = self.device.upgrade().ok_or(DeviceError::Closed)?;
        let bind = device.bind().ok_or(NetworkError::NoBind)?;
        let endpoint = self
            .endpoint()
            .ok_or(NetworkError::NoEndpoint)?;

        bind.send(buf, &endpoint).await?;
        self.tx_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        *self.endpoint.read().expect("endpoint lock")
    }

    pub fn set_endpoint(&self, endpoint: Endpoint) {
        *self.endpoint.write().expect("endpoint lock") = Some(endpoint);
    }

    /// Passive roaming: adopt the source address of an authenticated
    /// inbound packet, unless roaming is disabled or the address is
    /// routed to a peer (which would loop the tunnel through itself).
    pub(crate) fn set_endpoint_from_packet(&self, src: Endpoint) {
        let Some(device) = self.device.upgrade() else {
            return;
        };
        if device.config.disable_roaming {
            return;
        }
        if self.endpoint() == Some(src) {
            return;
        }
        if let Some(owner) = device.lookup_allowed_ip(src.ip()) {
            tracing::debug!(peer = %self, src = %src, owner = %owner, "source routed to a peer, not roaming");
            return;
        }
        tracing::info!(peer = %self, endpoint = %src, "endpoint roamed");
        self.set_endpoint(src);
    }

    /// Park an outbound plaintext frame for the nonce worker
    pub(crate) fn stage_outbound(&self, frame: Vec<u8>) {
        self.staged.push(frame);
    }

    /// Queue an empty (keepalive) packet unless data is already staged
    pub(crate) fn send_keepalive(&self) {
        if self.staged.is_empty() {
            self.staged.push(Vec::new());
        } else {
            self.staged.notify.notify_one();
        }
    }

    /// Drop everything parked in the staged queue
    pub(crate) fn flush_staged_packets(&self) {
        self.staged.clear();
    }

    /// Remove all session state: keypair slots, handshake transcript,
    /// their index entries, and parked plaintext. The timestamp
    /// high-water mark survives.
    pub fn zero_and_flush_all(&self) {
        let device = self.device.upgrade();

        let removed = self.keypairs.clear();
        if let Some(device) = &device {
            for keypair in &removed {
                device.index_table.delete(keypair.local_index);
            }
        }

        let mut handshake = self.handshake.lock().expect("handshake lock");
        if let Some(device) = &device {
            if handshake.local_index != 0 {
                device.index_table.delete(handshake.local_index);
            }
        }
        handshake.clear();
        drop(handshake);

        self.cookie.lock().expect("cookie lock").clear();
        self.flush_staged_packets();
    }

    /// Force the live keypairs into the exhausted state and clear the
    /// handshake, so the next outbound packet must negotiate afresh.
    pub fn expire_current_keypairs(&self) {
        let device = self.device.upgrade();

        let mut handshake = self.handshake.lock().expect("handshake lock");
        if let Some(device) = &device {
            if handshake.local_index != 0 {
                device.index_table.delete(handshake.local_index);
            }
        }
        handshake.clear();
        handshake.last_sent_initiation = Some(Instant::now() - REKEY_TIMEOUT);
        drop(handshake);

        self.keypairs.expire_for_send();
    }

    pub fn persistent_keepalive_interval(&self) -> u16 {
        self.persistent_keepalive_secs.load(Ordering::Relaxed) as u16
    }

    /// Reconfigure the persistent keepalive; a non-zero interval on a
    /// running peer re-arms the timer immediately
    pub fn set_persistent_keepalive(&self, secs: u16) {
        self.persistent_keepalive_secs
            .store(secs as u32, Ordering::Relaxed);
        if secs == 0 {
            self.timers
                .disarm(crate::device::timers::TimerKind::PersistentKeepalive);
        } else if self.is_running() {
            self.timers.arm(
                crate::device::timers::TimerKind::PersistentKeepalive,
                std::time::Duration::from_secs(secs as u64),
            );
        }
    }

    pub(crate) fn record_allowed_ip(&self, net: IpNet) {
        self.allowed_ips.write().expect("allowed ips lock").push(net);
    }

    pub fn allowed_ips(&self) -> Vec<IpNet> {
        self.allowed_ips.read().expect("allowed ips lock").clone()
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            last_handshake_nanos: self.last_handshake_nanos.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_rx_bytes(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn set_last_handshake_now(&self) {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        self.last_handshake_nanos.store(nanos, Ordering::Relaxed);
    }

    pub(crate) fn inbound_sender(&self) -> Option<mpsc::Sender<InboundElement>> {
        self.channels
            .read()
            .expect("channels lock")
            .as_ref()
            .map(|c| c.inbound_tx.clone())
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.public_key();
        write!(f, "peer({}…)", hex::encode(&key[..4]))
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
