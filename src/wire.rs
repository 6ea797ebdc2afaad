//! Wire-level message types shared by every transport binding.
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Minor protocol version spoken by peers that predate the
/// initiator/responder handshake.
pub const FALLBACK_MINOR_PROTOCOL_VERSION: u32 = 0;

/// Minor protocol version of the initiator/responder handshake.
pub const INITIATOR_RESPONDER_MINOR_PROTOCOL_VERSION: u32 = 1;

/// Stable identifier of a participant.
///
/// A participant keeps its id across service availability changes; only the
/// instance id may change when a peer restarts. The all-zero id is reserved
/// as "unknown" on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(u64);

impl ParticipantId {
    /// Create a participant id from its wire representation.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The wire representation of this id.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Check whether this is a usable id. The zero id means "unknown".
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for ParticipantId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid({})", self.0)
    }
}

/// Header carried by every message between two participants.
///
/// `session_id` is zero only before a session exists; `message_id` zero on a
/// keep-alive is the responder's error signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Sending participant.
    pub participant_id: u64,
    /// Session this message belongs to.
    pub session_id: u64,
    /// Position of this message within the session, starting at 1.
    pub message_id: u64,
}

impl MsgHeader {
    /// Encoded size of the header on the wire.
    pub const SIZE: usize = 24;

    /// Encode the header into its fixed little-endian layout.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.participant_id);
        LittleEndian::write_u64(&mut buf[8..16], self.session_id);
        LittleEndian::write_u64(&mut buf[16..24], self.message_id);
        buf
    }

    /// Decode a header from its wire layout. Fails when the buffer is short.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            participant_id: LittleEndian::read_u64(&buf[0..8]),
            session_id: LittleEndian::read_u64(&buf[8..16]),
            message_id: LittleEndian::read_u64(&buf[16..24]),
        })
    }
}

impl fmt::Display for MsgHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Hdr(pid:{} sid:{} mid:{})",
            self.participant_id, self.session_id, self.message_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_stable() {
        let hdr = MsgHeader {
            participant_id: 0x0102030405060708,
            session_id: 0x1112131415161718,
            message_id: 0x2122232425262728,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(
            &bytes[..8],
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(
            &bytes[8..16],
            &[0x18, 0x17, 0x16, 0x15, 0x14, 0x13, 0x12, 0x11]
        );
        assert_eq!(
            &bytes[16..],
            &[0x28, 0x27, 0x26, 0x25, 0x24, 0x23, 0x22, 0x21]
        );
        assert_eq!(MsgHeader::from_bytes(&bytes), Some(hdr));
    }

    #[test]
    fn header_decode_rejects_short_buffer() {
        assert_eq!(MsgHeader::from_bytes(&[0u8; 23]), None);
    }

    #[test]
    fn zero_participant_id_is_invalid() {
        assert!(!ParticipantId::new(0).is_valid());
        assert!(ParticipantId::new(4).is_valid());
    }
}
