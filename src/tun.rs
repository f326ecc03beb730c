//! TUN seam: source and sink of plaintext frames
//!
//! The runtime core neither creates nor configures a platform TUN
//! device; embedders hand in anything implementing [`TunDevice`].
//! [`ChannelTun`] backs the device with in-memory channels for tests
//! and userspace embedding.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{NetworkError, Result};

/// Plaintext frame source/sink
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one frame into `buf`, returning its length
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one decrypted frame
    async fn write(&self, frame: &[u8]) -> Result<usize>;

    /// Interface MTU
    fn mtu(&self) -> u16;
}

/// Channel-backed [`TunDevice`]
///
/// Frames pushed with [`ChannelTun::inject`] appear as reads (outbound
/// plaintext); frames the device writes are collected from
/// [`ChannelTun::outgoing`].
pub struct ChannelTun {
    read_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    mtu: u16,
}

/// The embedder's half of a [`ChannelTun`]
pub struct ChannelTunHandle {
    /// Push a frame for the device to read
    pub inject: mpsc::UnboundedSender<Vec<u8>>,
    /// Frames the device has written
    pub outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelTun {
    pub fn new(mtu: u16) -> (Self, ChannelTunHandle) {
        let (inject, read_rx) = mpsc::unbounded_channel();
        let (write_tx, outgoing) = mpsc::unbounded_channel();
        (
            Self {
                read_rx: Mutex::new(read_rx),
                write_tx,
                mtu,
            },
            ChannelTunHandle { inject, outgoing },
        )
    }
}

#[async_trait]
impl TunDevice for ChannelTun {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut rx = self.read_rx.lock().await;
        let frame = rx.recv().await.ok_or(NetworkError::ReceiveFailed {
            reason: "tun closed".to_string(),
        })?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }

    async fn write(&self, frame: &[u8]) -> Result<usize> {
        self.write_tx
            .send(frame.to_vec())
            .map_err(|_| NetworkError::SendFailed {
                reason: "tun closed".to_string(),
            })?;
        Ok(frame.len())
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_tun_both_directions() {
        let (tun, mut handle) = ChannelTun::new(1420);
        assert_eq!(tun.mtu(), 1420);

        handle.inject.send(vec![1, 2, 3]).unwrap();
        let mut buf = [0u8; 8];
        let len = tun.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3]);

        tun.write(&[4, 5]).await.unwrap();
        assert_eq!(handle.outgoing.recv().await.unwrap(), vec![4, 5]);
    }
}
