//! WireGuard v1 wire formats
//!
//! Four packet types, first byte the type code, little-endian fixed
//! layout:
//! - Type 1: Handshake Initiation (148 bytes)
//! - Type 2: Handshake Response (92 bytes)
//! - Type 3: Cookie Reply (64 bytes)
//! - Type 4: Data (16-byte header + ciphertext)

use crate::error::ProtocolError;

/// Packet type codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    Data = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::Data),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

/// First-byte dispatch for an inbound datagram
pub fn message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    match data.first() {
        Some(&b) => MessageType::try_from(b),
        None => Err(ProtocolError::InvalidMessageLength {
            expected: 1,
            got: 0,
        }),
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().expect("4-byte slice"))
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().expect("8-byte slice"))
}

fn require_len(data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() < expected {
        return Err(ProtocolError::InvalidMessageLength {
            expected,
            got: data.len(),
        });
    }
    Ok(())
}

fn require_type(data: &[u8], ty: MessageType) -> Result<(), ProtocolError> {
    if data[0] != ty as u8 {
        return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
    }
    Ok(())
}

/// Handshake Initiation (148 bytes)
///
/// ```text
/// type(1) reserved(3) sender(4) ephemeral(32)
/// encrypted_static(48) encrypted_timestamp(28) mac1(16) mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral: [u8; 32],
    pub encrypted_static: [u8; 48],
    pub encrypted_timestamp: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    pub const SIZE: usize = 148;

    /// Offset where MAC1 starts; everything before it is MAC1's input
    pub const MAC1_OFFSET: usize = 116;

    /// Offset where MAC2 starts; everything before it is MAC2's input
    pub const MAC2_OFFSET: usize = 132;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeInitiation as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        require_len(data, Self::SIZE)?;
        require_type(data, MessageType::HandshakeInitiation)?;

        let mut msg = Self {
            sender_index: read_u32(data, 4),
            ephemeral: [0u8; 32],
            encrypted_static: [0u8; 48],
            encrypted_timestamp: [0u8; 28],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        msg.ephemeral.copy_from_slice(&data[8..40]);
        msg.encrypted_static.copy_from_slice(&data[40..88]);
        msg.encrypted_timestamp.copy_from_slice(&data[88..116]);
        msg.mac1.copy_from_slice(&data[116..132]);
        msg.mac2.copy_from_slice(&data[132..148]);
        Ok(msg)
    }
}

/// Handshake Response (92 bytes)
///
/// ```text
/// type(1) reserved(3) sender(4) receiver(4) ephemeral(32)
/// encrypted_nothing(16) mac1(16) mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral: [u8; 32],
    pub encrypted_nothing: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    pub const SIZE: usize = 92;
    pub const MAC1_OFFSET: usize = 60;
    pub const MAC2_OFFSET: usize = 76;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeResponse as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        require_len(data, Self::SIZE)?;
        require_type(data, MessageType::HandshakeResponse)?;

        let mut msg = Self {
            sender_index: read_u32(data, 4),
            receiver_index: read_u32(data, 8),
            ephemeral: [0u8; 32],
            encrypted_nothing: [0u8; 16],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        msg.ephemeral.copy_from_slice(&data[12..44]);
        msg.encrypted_nothing.copy_from_slice(&data[44..60]);
        msg.mac1.copy_from_slice(&data[60..76]);
        msg.mac2.copy_from_slice(&data[76..92]);
        Ok(msg)
    }
}

/// Cookie Reply (64 bytes)
///
/// ```text
/// type(1) reserved(3) receiver(4) nonce(24) encrypted_cookie(32)
/// ```
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 32],
}

impl CookieReply {
    pub const SIZE: usize = 64;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::CookieReply as u8;
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        require_len(data, Self::SIZE)?;
        require_type(data, MessageType::CookieReply)?;

        let mut msg = Self {
            receiver_index: read_u32(data, 4),
            nonce: [0u8; 24],
            encrypted_cookie: [0u8; 32],
        };
        msg.nonce.copy_from_slice(&data[8..32]);
        msg.encrypted_cookie.copy_from_slice(&data[32..64]);
        Ok(msg)
    }
}

/// Data packet header (16 bytes, ciphertext follows)
///
/// ```text
/// type(1) reserved(3) receiver(4) counter(8) ciphertext(n+16)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DataHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl DataHeader {
    pub const SIZE: usize = 16;

    /// Header plus at minimum the Poly1305 tag (a keepalive)
    pub const MIN_PACKET: usize = Self::SIZE + 16;

    /// Assemble a full data packet around sealed ciphertext
    pub fn assemble(receiver_index: u32, counter: u64, ciphertext: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + ciphertext.len());
        buf.push(MessageType::Data as u8);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&receiver_index.to_le_bytes());
        buf.extend_from_slice(&counter.to_le_bytes());
        buf.extend_from_slice(ciphertext);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        require_len(data, Self::SIZE)?;
        require_type(data, MessageType::Data)?;
        Ok(Self {
            receiver_index: read_u32(data, 4),
            counter: read_u64(data, 8),
        })
    }

    /// The ciphertext portion of a data packet
    pub fn ciphertext(data: &[u8]) -> &[u8] {
        &data[Self::SIZE..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiation_roundtrip() {
        let msg = HandshakeInitiation {
            sender_index: 0xDEAD_BEEF,
            ephemeral: [1u8; 32],
            encrypted_static: [2u8; 48],
            encrypted_timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        };

        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..4], &[0, 0, 0]);

        let parsed = HandshakeInitiation::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sender_index, msg.sender_index);
        assert_eq!(parsed.encrypted_timestamp, msg.encrypted_timestamp);
        assert_eq!(parsed.mac2, msg.mac2);
    }

    #[test]
    fn test_response_roundtrip() {
        let msg = HandshakeResponse {
            sender_index: 7,
            receiver_index: 9,
            ephemeral: [6u8; 32],
            encrypted_nothing: [7u8; 16],
            mac1: [8u8; 16],
            mac2: [0u8; 16],
        };

        let parsed = HandshakeResponse::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.sender_index, 7);
        assert_eq!(parsed.receiver_index, 9);
        assert_eq!(parsed.mac1, [8u8; 16]);
    }

    #[test]
    fn test_cookie_reply_roundtrip() {
        let msg = CookieReply {
            receiver_index: 0x0102_0304,
            nonce: [9u8; 24],
            encrypted_cookie: [10u8; 32],
        };
        let parsed = CookieReply::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.receiver_index, 0x0102_0304);
        assert_eq!(parsed.nonce, [9u8; 24]);
    }

    #[test]
    fn test_data_assemble_parse() {
        let packet = DataHeader::assemble(42, 1234, &[0xAA; 32]);
        assert_eq!(packet[0], 4);
        assert_eq!(packet.len(), DataHeader::SIZE + 32);

        let header = DataHeader::from_bytes(&packet).unwrap();
        assert_eq!(header.receiver_index, 42);
        assert_eq!(header.counter, 1234);
        assert_eq!(DataHeader::ciphertext(&packet), &[0xAA; 32]);
    }

    #[test]
    fn test_rejects_short_and_unknown() {
        assert!(message_type(&[]).is_err());
        assert!(message_type(&[9]).is_err());
        assert!(HandshakeInitiation::from_bytes(&[1u8; 100]).is_err());

        let mut bytes = [0u8; HandshakeResponse::SIZE];
        bytes[0] = 1; // wrong type for a response parse
        assert!(HandshakeResponse::from_bytes(&bytes).is_err());
    }
}
