//! Transport seam: unreliable datagram send/receive
//!
//! The device reaches the network only through [`Bind`]. The production
//! implementation wraps a tokio UDP socket; tests wire two devices
//! together with [`ChannelBind`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::error::{NetworkError, Result};

/// An opaque transport address for a peer
pub type Endpoint = SocketAddr;

/// Datagram transport used by a device
#[async_trait]
pub trait Bind: Send + Sync {
    /// Send one datagram to an endpoint
    async fn send(&self, buf: &[u8], endpoint: &Endpoint) -> Result<()>;

    /// Receive one datagram; returns its length and source endpoint
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, Endpoint)>;

    /// The port actually bound (after 0 was resolved by the OS)
    fn local_port(&self) -> u16;

    /// Set the firewall mark on outgoing packets, where supported
    fn set_mark(&self, mark: u32) -> Result<()>;

    /// Release the transport. Sends and receives fail afterwards; the
    /// default relies on drop.
    async fn close(&self) {}
}

/// UDP implementation of [`Bind`]
pub struct UdpBind {
    socket: UdpSocket,
    port: u16,
}

impl UdpBind {
    /// Bind a dual-purpose UDP socket; `port` 0 asks the OS to choose
    pub async fn open(port: u16) -> Result<(Self, u16)> {
        let addr = format!("0.0.0.0:{port}");
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let actual = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed {
                addr,
                reason: e.to_string(),
            })?
            .port();
        Ok((
            Self {
                socket,
                port: actual,
            },
            actual,
        ))
    }
}

#[async_trait]
impl Bind for UdpBind {
    async fn send(&self, buf: &[u8], endpoint: &Endpoint) -> Result<()> {
        self.socket
            .send_to(buf, endpoint)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, Endpoint)> {
        let (len, from) = self
            .socket
            .recv_from(buf)
            .await
            .map_err(|e| NetworkError::ReceiveFailed {
                reason: e.to_string(),
            })?;
        Ok((len, from))
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn set_mark(&self, _mark: u32) -> Result<()> {
        // SO_MARK is Linux-only and needs a raw fd; accepted and ignored
        // elsewhere so configs stay portable.
        Ok(())
    }
}

/// In-memory datagram pair for tests: everything sent on one half
/// arrives on the other, tagged with the sender's synthetic endpoint.
pub struct ChannelBind {
    tx: mpsc::UnboundedSender<(Vec<u8>, Endpoint)>,
    rx: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, Endpoint)>>,
    local: Endpoint,
}

impl ChannelBind {
    /// Create two connected binds with the given synthetic endpoints
    pub fn pair(a: Endpoint, b: Endpoint) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx: a_tx,
                rx: Mutex::new(a_rx),
                local: a,
            }),
            Arc::new(Self {
                tx: b_tx,
                rx: Mutex::new(b_rx),
                local: b,
            }),
        )
    }
}

#[async_trait]
impl Bind for ChannelBind {
    async fn send(&self, buf: &[u8], _endpoint: &Endpoint) -> Result<()> {
        self.tx
            .send((buf.to_vec(), self.local))
            .map_err(|_| NetworkError::SendFailed {
                reason: "peer bind closed".to_string(),
            })?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, Endpoint)> {
        let mut rx = self.rx.lock().await;
        let (packet, from) = rx.recv().await.ok_or(NetworkError::ReceiveFailed {
            reason: "peer bind closed".to_string(),
        })?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok((len, from))
    }

    fn local_port(&self) -> u16 {
        self.local.port()
    }

    fn set_mark(&self, _mark: u32) -> Result<()> {
        Ok(())
    }
}
