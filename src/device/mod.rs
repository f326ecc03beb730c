//! The tunnel device: peers, identity, routing, and the I/O loops
//!
//! A device owns its peers exclusively; peers reach back through a
//! non-owning handle. Lock order, outermost first: device peer map,
//! peer state, keypair store, handshake, index table. Never inverted.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use zeroize::Zeroize;

use crate::bind::{Bind, UdpBind};
use crate::config::{parse_endpoint, Config, PeerConfig};
use crate::crypto::x25519;
use crate::device::allowed_ips::{destination_address, AllowedIps};
use crate::device::index::IndexTable;
use crate::device::peer::Peer;
use crate::error::{ConfigError, DeviceError, Result};
use crate::protocol::{CookieChecker, MAX_PEERS};
use crate::tun::TunDevice;

pub mod allowed_ips;
pub mod handshake;
pub mod index;
pub mod keypair;
pub mod peer;
pub mod queue;
pub mod ratelimit;
mod receive;
mod send;
pub mod timers;

/// A peer's identity on the wire
pub type PublicKey = [u8; 32];

/// Per-device behavior switches
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Refuse passive endpoint roaming; configured endpoints stay
    /// authoritative
    pub disable_roaming: bool,
    /// Upper bound on simultaneous peers
    pub max_peers: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            disable_roaming: false,
            max_peers: MAX_PEERS,
        }
    }
}

struct StaticIdentity {
    private: [u8; 32],
    public: [u8; 32],
}

impl Drop for StaticIdentity {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

#[derive(Default)]
struct NetState {
    bind: Option<Arc<dyn Bind>>,
    listen_port: u16,
    fwmark: u32,
}

#[derive(Default)]
struct Loops {
    stop: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

pub struct Device {
    static_identity: RwLock<Option<StaticIdentity>>,
    cookie_checker: RwLock<Option<Arc<CookieChecker>>>,
    peers: RwLock<HashMap<PublicKey, Arc<Peer>>>,
    pub(crate) index_table: IndexTable,
    allowed_ips: RwLock<AllowedIps>,
    net: RwLock<NetState>,
    tun: Arc<dyn TunDevice>,
    pub(crate) config: DeviceConfig,
    up: AtomicBool,
    closed: AtomicBool,
    loops: tokio::sync::Mutex<Loops>,
}

impl Device {
    pub fn new(tun: Arc<dyn TunDevice>, config: DeviceConfig) -> Arc<Self> {
        Arc::new(Self {
            static_identity: RwLock::new(None),
            cookie_checker: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            index_table: IndexTable::default(),
            allowed_ips: RwLock::new(AllowedIps::default()),
            net: RwLock::new(NetState::default()),
            tun,
            config,
            up: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            loops: tokio::sync::Mutex::new(Loops::default()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Install the device identity. Existing sessions are expired so
    /// every peer renegotiates under the new key.
    pub fn set_private_key(&self, private: [u8; 32]) {
        let public = x25519::public_key(&private);

        *self.static_identity.write().expect("identity lock") = Some(StaticIdentity {
            private,
            public,
        });
        *self.cookie_checker.write().expect("cookie checker lock") =
            Some(Arc::new(CookieChecker::new(&public)));

        let peers: Vec<Arc<Peer>> = self
            .peers
            .read()
            .expect("peer map lock")
            .values()
            .cloned()
            .collect();
        for peer in peers {
            let pk = peer.public_key();
            peer.expire_current_keypairs();
            peer.handshake
                .lock()
                .expect("handshake lock")
                .precomputed_static_static = x25519::dh(&private, &pk);
        }
    }

    pub(crate) fn identity(&self) -> Option<([u8; 32], [u8; 32])> {
        self.static_identity
            .read()
            .expect("identity lock")
            .as_ref()
            .map(|id| (id.private, id.public))
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.identity().map(|(_, public)| public)
    }

    pub(crate) fn cookie_checker(&self) -> Option<Arc<CookieChecker>> {
        self.cookie_checker
            .read()
            .expect("cookie checker lock")
            .clone()
    }

    pub(crate) fn bind(&self) -> Option<Arc<dyn Bind>> {
        self.net.read().expect("net lock").bind.clone()
    }

    pub(crate) fn tun(&self) -> Arc<dyn TunDevice> {
        self.tun.clone()
    }

    /// Port requested for the next `up`; 0 delegates to the OS
    pub fn set_listen_port(&self, port: u16) {
        self.net.write().expect("net lock").listen_port = port;
    }

    pub fn set_fwmark(&self, mark: u32) -> Result<()> {
        let mut net = self.net.write().expect("net lock");
        net.fwmark = mark;
        if let Some(bind) = &net.bind {
            bind.set_mark(mark)?;
        }
        Ok(())
    }

    /// Create a peer for `public_key` and start it when the device is
    /// up. Fails on a closed device, a duplicate key, or the peer cap.
    pub async fn new_peer(self: &Arc<Self>, public_key: PublicKey) -> Result<Arc<Peer>> {
        if self.is_closed() {
            return Err(DeviceError::Closed.into());
        }

        let precomputed = self
            .identity()
            .map(|(private, _)| x25519::dh(&private, &public_key))
            .unwrap_or([0u8; 32]);

        let peer = {
            let mut peers = self.peers.write().expect("peer map lock");
            if peers.len() >= self.config.max_peers {
                return Err(DeviceError::TooManyPeers.into());
            }
            if peers.contains_key(&public_key) {
                return Err(DeviceError::DuplicatePeer.into());
            }
            let peer = Peer::new(Arc::downgrade(self), public_key, precomputed);
            peers.insert(public_key, peer.clone());
            peer
        };

        if self.is_up() {
            peer.start().await?;
        }
        Ok(peer)
    }

    pub fn peer_by_key(&self, public_key: &PublicKey) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer map lock")
            .get(public_key)
            .cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("peer map lock").len()
    }

    /// Stop and discard one peer, removing its routes
    pub async fn remove_peer(&self, public_key: &PublicKey) {
        let removed = self
            .peers
            .write()
            .expect("peer map lock")
            .remove(public_key);
        if let Some(peer) = removed {
            peer.stop().await;
            self.allowed_ips
                .write()
                .expect("allowed ips lock")
                .remove_peer(&peer);
        }
    }

    pub async fn remove_all_peers(&self) {
        let drained: Vec<Arc<Peer>> = {
            let mut peers = self.peers.write().expect("peer map lock");
            peers.drain().map(|(_, peer)| peer).collect()
        };
        for peer in drained {
            peer.stop().await;
            self.allowed_ips
                .write()
                .expect("allowed ips lock")
                .remove_peer(&peer);
        }
    }

    /// Route a prefix to a peer
    pub fn add_allowed_ip(&self, net: ipnet::IpNet, peer: &Arc<Peer>) {
        self.allowed_ips
            .write()
            .expect("allowed ips lock")
            .insert(net, Arc::downgrade(peer));
        peer.record_allowed_ip(net);
    }

    pub(crate) fn lookup_allowed_ip(&self, ip: IpAddr) -> Option<Arc<Peer>> {
        self.allowed_ips.read().expect("allowed ips lock").lookup(ip)
    }

    /// Open a UDP bind on the configured port and bring the device up.
    /// Returns the actual port.
    pub async fn up(self: &Arc<Self>) -> Result<u16> {
        let port = self.net.read().expect("net lock").listen_port;
        let (bind, actual) = UdpBind::open(port).await?;
        self.up_with_bind(Arc::new(bind)).await?;
        Ok(actual)
    }

    /// Bring the device up over a caller-provided transport
    pub async fn up_with_bind(self: &Arc<Self>, bind: Arc<dyn Bind>) -> Result<()> {
        if self.is_closed() {
            return Err(DeviceError::Closed.into());
        }
        let mut loops = self.loops.lock().await;
        if self.is_up() {
            return Ok(());
        }

        {
            let mut net = self.net.write().expect("net lock");
            if net.fwmark != 0 {
                bind.set_mark(net.fwmark)?;
            }
            net.bind = Some(bind.clone());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        loops.handles = vec![
            tokio::spawn(run_udp_loop(
                Arc::downgrade(self),
                bind,
                stop_rx.clone(),
            )),
            tokio::spawn(run_tun_loop(Arc::downgrade(self), stop_rx)),
        ];
        loops.stop = Some(stop_tx);
        self.up.store(true, Ordering::Release);
        drop(loops);

        let peers: Vec<Arc<Peer>> = self
            .peers
            .read()
            .expect("peer map lock")
            .values()
            .cloned()
            .collect();
        for peer in peers {
            peer.start().await?;
        }

        tracing::info!("device up");
        Ok(())
    }

    /// Stop all peers and release the transport
    pub async fn down(&self) {
        let mut loops = self.loops.lock().await;
        if !self.up.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(stop) = loops.stop.take() {
            let _ = stop.send(true);
        }
        for handle in loops.handles.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
        drop(loops);

        let peers: Vec<Arc<Peer>> = self
            .peers
            .read()
            .expect("peer map lock")
            .values()
            .cloned()
            .collect();
        for peer in peers {
            peer.stop().await;
        }

        let bind = self.net.write().expect("net lock").bind.take();
        if let Some(bind) = bind {
            bind.close().await;
        }
        tracing::info!("device down");
    }

    /// Tear the device down permanently
    pub async fn close(&self) {
        self.down().await;
        self.closed.store(true, Ordering::Release);
        self.remove_all_peers().await;
    }

    /// Apply a parsed UAPI configuration. Failures abort the current
    /// operation; peers already configured are untouched.
    pub async fn apply_uapi(self: &Arc<Self>, cfg: &Config) -> Result<()> {
        if let Some(private) = cfg.private_key {
            self.set_private_key(private);
        }
        if cfg.listen_port != 0 {
            self.set_listen_port(cfg.listen_port);
        }

        for pc in &cfg.peers {
            let peer = match self.peer_by_key(&pc.public_key) {
                Some(existing) => existing,
                None => self.new_peer(pc.public_key).await?,
            };

            if !pc.endpoints.is_empty() {
                let first = pc
                    .endpoints
                    .split(',')
                    .next()
                    .expect("split yields at least one item");
                let (host, port) = parse_endpoint(first)?;
                let resolved = tokio::net::lookup_host((host.as_str(), port))
                    .await
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .ok_or_else(|| ConfigError::InvalidValue {
                        why: "unresolvable endpoint".to_string(),
                        offender: first.to_string(),
                    })?;
                peer.set_endpoint(resolved);
            }

            peer.set_persistent_keepalive(pc.persistent_keepalive);
            for net in &pc.allowed_ips {
                self.add_allowed_ip(*net, &peer);
            }
        }
        Ok(())
    }

    /// Snapshot the device as a UAPI configuration
    pub fn export_uapi(&self) -> Config {
        let peers = self
            .peers
            .read()
            .expect("peer map lock")
            .values()
            .map(|peer| PeerConfig {
                public_key: peer.public_key(),
                endpoints: peer
                    .endpoint()
                    .map(|ep| ep.to_string())
                    .unwrap_or_default(),
                persistent_keepalive: peer.persistent_keepalive_interval(),
                allowed_ips: peer.allowed_ips(),
            })
            .collect();

        Config {
            private_key: self.identity().map(|(private, _)| private),
            listen_port: self.net.read().expect("net lock").listen_port,
            peers,
        }
    }
}

/// Receive loop: one per bind, demultiplexing datagrams to peers
async fn run_udp_loop(
    device: Weak<Device>,
    bind: Arc<dyn Bind>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let received = tokio::select! {
            _ = stop.changed() => break,
            received = bind.recv(&mut buf) => received,
        };
        let Some(device) = device.upgrade() else {
            break;
        };
        match received {
            Ok((len, src)) => device.handle_datagram(&buf[..len], src).await,
            Err(err) => {
                tracing::debug!(%err, "transport receive failed");
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
    tracing::debug!("udp receive loop stopped");
}

/// TUN loop: route outbound plaintext to the owning peer
async fn run_tun_loop(device: Weak<Device>, mut stop: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let Some(device) = device.upgrade() else {
            break;
        };
        let tun = device.tun();
        let read = tokio::select! {
            _ = stop.changed() => break,
            read = tun.read(&mut buf) => read,
        };
        let len = match read {
            Ok(len) => len,
            Err(err) => {
                tracing::debug!(%err, "tun read failed");
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                continue;
            }
        };
        let frame = &buf[..len];

        let Some(dst) = destination_address(frame) else {
            tracing::trace!("unroutable frame from tun");
            continue;
        };
        let Some(peer) = device.lookup_allowed_ip(dst) else {
            tracing::trace!(%dst, "no peer for destination");
            continue;
        };
        peer.stage_outbound(frame.to_vec());
    }
    tracing::debug!("tun loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::ChannelTun;

    fn test_device(max_peers: usize) -> Arc<Device> {
        let (tun, _handle) = ChannelTun::new(1420);
        let device = Device::new(
            Arc::new(tun),
            DeviceConfig {
                max_peers,
                ..DeviceConfig::default()
            },
        );
        device.set_private_key(x25519::generate_keypair().0);
        device
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let device = test_device(3);
        for i in 0..3u8 {
            let mut key = [0u8; 32];
            key[0] = i + 1;
            device.new_peer(key).await.unwrap();
        }

        let err = device.new_peer([9u8; 32]).await.unwrap_err();
        assert_eq!(err.to_string(), "device error: too many peers");
        assert_eq!(device.peer_count(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let device = test_device(16);
        device.new_peer([1u8; 32]).await.unwrap();
        let err = device.new_peer([1u8; 32]).await.unwrap_err();
        assert_eq!(err.to_string(), "device error: adding existing peer");
    }

    #[tokio::test]
    async fn test_new_peer_on_closed_device() {
        let device = test_device(16);
        device.close().await;
        assert!(device.new_peer([1u8; 32]).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_peer_clears_routes() {
        let device = test_device(16);
        let peer = device.new_peer([1u8; 32]).await.unwrap();
        device.add_allowed_ip("10.1.0.0/16".parse().unwrap(), &peer);

        assert!(device
            .lookup_allowed_ip("10.1.2.3".parse().unwrap())
            .is_some());
        device.remove_peer(&[1u8; 32]).await;
        assert!(device
            .lookup_allowed_ip("10.1.2.3".parse().unwrap())
            .is_none());
        assert_eq!(device.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_precomputed_secret_matches_both_sides() {
        let (a_priv, a_pub) = x25519::generate_keypair();
        let (b_priv, b_pub) = x25519::generate_keypair();

        let device = test_device(16);
        device.set_private_key(a_priv);
        let peer = device.new_peer(b_pub).await.unwrap();

        let ours = peer
            .handshake
            .lock()
            .unwrap()
            .precomputed_static_static;
        assert_eq!(ours, x25519::dh(&b_priv, &a_pub));
    }

    #[tokio::test]
    async fn test_export_reflects_configuration() {
        let device = test_device(16);
        let peer = device.new_peer([7u8; 32]).await.unwrap();
        peer.set_persistent_keepalive(25);
        device.add_allowed_ip("10.0.0.0/24".parse().unwrap(), &peer);
        device.set_listen_port(51820);

        let cfg = device.export_uapi();
        assert_eq!(cfg.listen_port, 51820);
        assert_eq!(cfg.peers.len(), 1);
        assert_eq!(cfg.peers[0].persistent_keepalive, 25);
        assert_eq!(cfg.peers[0].allowed_ips.len(), 1);
    }
}
