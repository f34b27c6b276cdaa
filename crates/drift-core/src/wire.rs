//! Per-packet wire protocol header.
//!
//! Single-packet protocol messages carry a three-byte header:
//!
//! ```text
//! type (1) | payload_len (2, big-endian) | payload (payload_len)
//! ```
//!
//! Payloads that exceed the link MTU travel as binary fragment envelopes
//! instead (magic `0xF0`, see the fragment module); the first byte
//! disambiguates the two framings.

use crate::error::FrameError;

/// Wire header size.
pub const HEADER_LEN: usize = 3;

/// Single-packet message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Identity exchange announce.
    Identity = 0x01,
    /// Noise handshake blob, opaque to the wrapper.
    Handshake = 0x02,
    /// Encrypted user message (relay envelope).
    UserMessage = 0x03,
    /// Relay delivery acknowledgment.
    RelayAck = 0x04,
    /// Queue synchronization message.
    QueueSync = 0x05,
    /// Keepalive.
    Ping = 0x06,
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Identity),
            0x02 => Ok(Self::Handshake),
            0x03 => Ok(Self::UserMessage),
            0x04 => Ok(Self::RelayAck),
            0x05 => Ok(Self::QueueSync),
            0x06 => Ok(Self::Ping),
            other => Err(FrameError::InvalidPacketType(other)),
        }
    }
}

/// Frame a single-packet message.
///
/// # Errors
///
/// Returns [`FrameError::PayloadOverflow`] when the payload does not fit
/// the 16-bit length field.
pub fn encode_packet(packet_type: PacketType, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::PayloadOverflow)?;
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.push(packet_type as u8);
    packet.extend_from_slice(&len.to_be_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Parse a single-packet message, returning its type and payload.
///
/// # Errors
///
/// - [`FrameError::TooShort`] below the header size.
/// - [`FrameError::InvalidPacketType`] for an unknown type byte.
/// - [`FrameError::PayloadOverflow`] when the declared length exceeds the
///   received bytes.
pub fn decode_packet(bytes: &[u8]) -> Result<(PacketType, &[u8]), FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::TooShort {
            expected: HEADER_LEN,
            actual: bytes.len(),
        });
    }
    let packet_type = PacketType::try_from(bytes[0])?;
    let len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
    if HEADER_LEN + len > bytes.len() {
        return Err(FrameError::PayloadOverflow);
    }
    Ok((packet_type, &bytes[HEADER_LEN..HEADER_LEN + len]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let packet = encode_packet(PacketType::UserMessage, b"payload").unwrap();
        assert_eq!(packet[0], 0x03);
        let (packet_type, payload) = decode_packet(&packet).unwrap();
        assert_eq!(packet_type, PacketType::UserMessage);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_empty_payload() {
        let packet = encode_packet(PacketType::Ping, &[]).unwrap();
        assert_eq!(packet.len(), HEADER_LEN);
        let (packet_type, payload) = decode_packet(&packet).unwrap();
        assert_eq!(packet_type, PacketType::Ping);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_all_type_bytes() {
        for (byte, expected) in [
            (0x01, PacketType::Identity),
            (0x02, PacketType::Handshake),
            (0x03, PacketType::UserMessage),
            (0x04, PacketType::RelayAck),
            (0x05, PacketType::QueueSync),
            (0x06, PacketType::Ping),
        ] {
            assert_eq!(PacketType::try_from(byte).unwrap(), expected);
        }
        assert!(matches!(
            PacketType::try_from(0x07),
            Err(FrameError::InvalidPacketType(0x07))
        ));
        // 0xF0 is the fragment magic, never a packet type.
        assert!(PacketType::try_from(0xF0).is_err());
    }

    #[test]
    fn test_short_and_truncated_packets() {
        assert!(matches!(
            decode_packet(&[0x03]),
            Err(FrameError::TooShort { .. })
        ));

        let mut packet = encode_packet(PacketType::UserMessage, b"payload").unwrap();
        packet.truncate(packet.len() - 2);
        assert_eq!(decode_packet(&packet), Err(FrameError::PayloadOverflow));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut packet = encode_packet(PacketType::Handshake, b"blob").unwrap();
        packet.push(0xEE);
        let (_, payload) = decode_packet(&packet).unwrap();
        assert_eq!(payload, b"blob");
    }
}
