//! ferrotun: per-peer runtime core of a WireGuard-compatible tunnel
//!
//! The crate owns the lifecycle of remote peers on a tunnel device:
//! the Noise-IK handshake state machine, rotating session keys, the
//! pipelines carrying plaintext to encrypted datagrams and back, and
//! the timer web driving rekeying, keepalives, and liveness.
//!
//! The transport ([`bind::Bind`]) and the plaintext interface
//! ([`tun::TunDevice`]) are narrow seams supplied by the embedder;
//! configuration arrives through the UAPI text format
//! ([`config::Config`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ferrotun::config::Config;
//! use ferrotun::device::{Device, DeviceConfig};
//! use ferrotun::tun::ChannelTun;
//!
//! # async fn run() -> ferrotun::error::Result<()> {
//! let (tun, _handle) = ChannelTun::new(1420);
//! let device = Device::new(Arc::new(tun), DeviceConfig::default());
//!
//! let cfg = Config::from_uapi(
//!     "private_key=003ed5d73b55806c30de3f8a7bdab38af13539220533055e635690b8b87ad641\n\
//!      listen_port=51820\n",
//! )?;
//! device.apply_uapi(&cfg).await?;
//! let port = device.up().await?;
//! tracing::info!(port, "tunnel listening");
//! # Ok(())
//! # }
//! ```

pub mod bind;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod protocol;
pub mod tun;

pub use config::Config;
pub use device::{Device, DeviceConfig};
pub use error::FerrotunError;
