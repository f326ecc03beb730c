//! Error types for the ferrotun runtime core

use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum FerrotunError {
    /// Configuration errors (UAPI parse, invalid keys, bad endpoints)
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Device and peer lifecycle errors
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// System I/O errors
    #[error("system error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
///
/// These abort the current control-channel operation but never affect
/// peers already configured.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("{why}: '{offender}'")]
    InvalidValue { why: String, offender: String },

    #[error("keys must decode to exactly 32 bytes: '{value}'")]
    InvalidKey { value: String },

    #[error("invalid port: '{value}'")]
    InvalidPort { value: String },

    #[error("invalid CIDR notation: '{value}'")]
    InvalidCidr { value: String },

    #[error("unexpected key: '{key}'")]
    UnexpectedKey { key: String },
}

/// Cryptographic operation errors
///
/// On the datagram hot path these are counted and dropped, never surfaced.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("replayed or out-of-window counter {counter}")]
    ReplayDetected { counter: u64 },

    #[error("handshake initiation timestamp not monotonic")]
    StaleTimestamp,

    #[error("no session index {index}")]
    UnknownIndex { index: u32 },

    #[error("keypair expired")]
    KeypairExpired,

    #[error("no established keypair")]
    NoKeypair,

    #[error("handshake state does not permit this message")]
    InvalidHandshakeState,
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    #[error("receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("no bind open")]
    NoBind,

    #[error("no known endpoint for peer")]
    NoEndpoint,
}

/// Device and peer lifecycle errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device closed")]
    Closed,

    #[error("too many peers")]
    TooManyPeers,

    #[error("adding existing peer")]
    DuplicatePeer,

    #[error("start called on running peer")]
    AlreadyRunning,
}

/// Result type alias for ferrotun operations
pub type Result<T> = std::result::Result<T, FerrotunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FerrotunError::from(DeviceError::TooManyPeers);
        assert_eq!(err.to_string(), "device error: too many peers");

        let err = FerrotunError::from(ConfigError::InvalidValue {
            why: "Invalid endpoint host".to_string(),
            offender: "[::1".to_string(),
        });
        assert!(err.to_string().contains("[::1"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: FerrotunError = io.into();
        assert!(matches!(err, FerrotunError::System(_)));
    }
}
