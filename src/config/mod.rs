//! Runtime configuration via the UAPI text format

pub mod uapi;

pub use uapi::{parse_endpoint, Config, PeerConfig};
