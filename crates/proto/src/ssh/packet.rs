//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length, minimum 4)
//! byte[m]   mac (present only once keys are in use)
//! ```
//!
//! Before key exchange completes packets travel unencrypted and without a
//! MAC; afterwards the payload is encrypted in the negotiated direction and
//! a MAC (or AEAD tag) is appended. Either way the framing is identical in
//! both directions.
//!
//! # Constraints
//!
//! - `packet_length` excludes the MAC and the length field itself
//! - total size of length field + packet is a multiple of the block size
//!   (8 bytes before a cipher is negotiated)
//! - packets above 35000 bytes are rejected outright

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use tether_platform::{TetherError, TetherResult};

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum total packet size in bytes after block alignment.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// A framed SSH packet.
///
/// # Invariants
///
/// - padding length is between 4 and 255 bytes
/// - total packet size (all fields) stays within [`MAX_PACKET_SIZE`]
/// - the unencrypted frame is aligned to the 8-byte default block size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
    mac: Option<Vec<u8>>,
}

impl Packet {
    /// Creates a new packet around `payload`, generating random padding so
    /// the frame meets the alignment and minimum-padding rules.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] if the payload cannot fit inside
    /// the maximum packet size.
    pub fn new(payload: Vec<u8>) -> TetherResult<Self> {
        // packet_length = padding_length field (1) + payload + padding;
        // the frame including the 4-byte length field must align to the
        // block size.
        let header_len = 5;
        let unpadded_len = header_len + payload.len();
        let block_size = 8;

        let mut padding_len = MIN_PADDING_LEN as usize;
        while (unpadded_len + padding_len) % block_size != 0 {
            padding_len += 1;
        }

        let total_size = unpadded_len + padding_len;
        if padding_len > MAX_PADDING_LEN as usize || total_size > MAX_PACKET_SIZE {
            return Err(TetherError::Protocol(format!(
                "Payload of {} bytes does not fit in a packet (max {})",
                payload.len(),
                MAX_PACKET_SIZE
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self {
            payload,
            padding,
            mac: None,
        })
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Returns the MAC of this packet, if present.
    pub fn mac(&self) -> Option<&[u8]> {
        self.mac.as_deref()
    }

    /// Attaches a MAC computed over the framed bytes.
    pub fn set_mac(&mut self, mac: Vec<u8>) {
        self.mac = Some(mac);
    }

    /// Serializes this packet to wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf =
            BytesMut::with_capacity(4 + packet_length + self.mac.as_ref().map_or(0, |m| m.len()));

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        if let Some(mac) = &self.mac {
            buf.put_slice(mac);
        }

        buf.to_vec()
    }

    /// Parses a packet from wire format.
    ///
    /// Any bytes past the declared packet length are taken to be the MAC.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] if the frame is truncated, the
    /// declared length exceeds [`MAX_PACKET_SIZE`], or the padding length
    /// is out of range.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.len() < 5 {
            return Err(TetherError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;

        if packet_length > MAX_PACKET_SIZE {
            return Err(TetherError::Protocol(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, MAX_PACKET_SIZE
            )));
        }

        if packet_length < 5 {
            return Err(TetherError::Protocol(format!(
                "Packet too small: {} bytes",
                packet_length
            )));
        }

        if buf.len() < packet_length {
            return Err(TetherError::Protocol(format!(
                "Incomplete packet: expected {} bytes, got {}",
                packet_length,
                buf.len()
            )));
        }

        let padding_length = buf.get_u8() as usize;

        if padding_length < MIN_PADDING_LEN as usize {
            return Err(TetherError::Protocol(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }

        if packet_length < 1 + padding_length {
            return Err(TetherError::Protocol(format!(
                "Invalid packet: length {} cannot hold {} bytes of padding",
                packet_length, padding_length
            )));
        }

        let payload_length = packet_length - 1 - padding_length;

        if buf.len() < payload_length + padding_length {
            return Err(TetherError::Protocol(format!(
                "Incomplete packet body: expected {} bytes, got {}",
                payload_length + padding_length,
                buf.len()
            )));
        }

        let payload = buf[..payload_length].to_vec();
        buf.advance(payload_length);
        let padding = buf[..padding_length].to_vec();
        buf.advance(padding_length);

        let mac = if !buf.is_empty() {
            Some(buf.to_vec())
        } else {
            None
        };

        Ok(Self {
            payload,
            padding,
            mac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_new() {
        let payload = b"Hello, SSH!".to_vec();
        let packet = Packet::new(payload.clone()).unwrap();

        assert_eq!(packet.payload(), &payload[..]);
        assert!(packet.padding().len() >= MIN_PADDING_LEN as usize);
        assert!(packet.mac().is_none());
    }

    #[test]
    fn test_packet_alignment() {
        let packet = Packet::new(b"test".to_vec()).unwrap();
        let total_size = 4 + 1 + packet.payload().len() + packet.padding().len();
        assert_eq!(total_size % 8, 0, "Packet not aligned to 8-byte boundary");
    }

    #[test]
    fn test_packet_round_trip() {
        let payload = b"Test SSH packet payload".to_vec();
        let packet = Packet::new(payload.clone()).unwrap();

        let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed.payload(), &payload[..]);
        assert_eq!(parsed.padding().len(), packet.padding().len());
    }

    #[test]
    fn test_packet_with_mac() {
        let mut packet = Packet::new(b"payload".to_vec()).unwrap();
        let mac = vec![0xaa; 32];
        packet.set_mac(mac.clone());

        let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed.mac(), Some(&mac[..]));
    }

    #[test]
    fn test_packet_minimum_size() {
        let packet = Packet::new(b"x".to_vec()).unwrap();
        assert!(packet.to_bytes().len() >= MIN_PACKET_SIZE);
    }

    #[test]
    fn test_packet_invalid_too_short() {
        let data = vec![0, 0, 0, 10];
        assert!(matches!(
            Packet::from_bytes(&data),
            Err(TetherError::Protocol(_))
        ));
    }

    #[test]
    fn test_packet_invalid_padding_too_short() {
        let data = vec![
            0, 0, 0, 8, // packet_length = 8
            2, // padding_length = 2 (< 4)
            0x48, 0x65, 0x6c, 0x6c, 0x6f, // payload
            0x00, 0x00, // padding
        ];
        match Packet::from_bytes(&data) {
            Err(TetherError::Protocol(msg)) => assert!(msg.contains("Padding too short")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_packet_invalid_incomplete() {
        let data = vec![0, 0, 0, 20, 4, 0x48, 0x65];
        assert!(Packet::from_bytes(&data).is_err());
    }

    #[test]
    fn test_packet_exceeds_max_size() {
        let payload = vec![0u8; MAX_PACKET_SIZE + 1000];
        assert!(Packet::new(payload).is_err());
    }

    #[test]
    fn test_oversized_declared_length_rejected() {
        let mut data = vec![0u8; 64];
        data[0..4].copy_from_slice(&(40000u32).to_be_bytes());
        assert!(Packet::from_bytes(&data).is_err());
    }
}
