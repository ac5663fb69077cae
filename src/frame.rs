//! WebSocket frame model (RFC 6455 Section 5).
//!
//! A [`Frame`] is the smallest unit of WebSocket communication: a FIN flag,
//! an [`Opcode`], and an opaque payload. Wire-level concerns (length tiers,
//! masking, validation) live in the [`codec`](crate::codec) module; this
//! module defines the decoded representation and the close-body helpers.

use bytes::{BufMut, Bytes, BytesMut};

/// Largest payload a control frame (Close, Ping, Pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcode (4-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
}

impl Opcode {
    /// Returns true for Close, Ping, and Pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Returns true for Continuation, Text, and Binary.
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, Self::Continuation | Self::Text | Self::Binary)
    }

    /// Parse the 4-bit opcode field.
    ///
    /// Reserved values (0x3-0x7, 0xB-0xF) are rejected; RFC 6455 requires
    /// the connection to fail on an unknown opcode.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }
}

/// A decoded WebSocket frame.
///
/// Invariants enforced by the codec: control frames always have `fin` set
/// and a payload of at most [`MAX_CONTROL_PAYLOAD`] bytes; continuation
/// frames only appear while a fragmented message is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag (FIN bit).
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Unmasked payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Single-frame text message.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    /// Single-frame binary message.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    /// Ping frame with an optional payload.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Ping,
            payload: payload.into(),
        }
    }

    /// Pong frame with an optional payload.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            payload: payload.into(),
        }
    }

    /// Close frame, optionally carrying a status code and reason per
    /// RFC 6455 Section 5.5.1.
    #[must_use]
    pub fn close(code: Option<u16>, reason: Option<&str>) -> Self {
        let payload = match (code, reason) {
            (Some(c), Some(r)) => {
                let mut buf = BytesMut::with_capacity(2 + r.len());
                buf.put_u16(c);
                buf.put_slice(r.as_bytes());
                buf.freeze()
            }
            (Some(c), None) => {
                let mut buf = BytesMut::with_capacity(2);
                buf.put_u16(c);
                buf.freeze()
            }
            _ => Bytes::new(),
        };

        Self {
            fin: true,
            opcode: Opcode::Close,
            payload,
        }
    }
}

/// Extract the status code from a close frame body, if one is present.
///
/// A close payload is either empty or starts with a 2-byte big-endian code.
#[must_use]
pub fn close_code(payload: &[u8]) -> Option<u16> {
    let code = payload.get(..2)?;
    Some(u16::from_be_bytes([code[0], code[1]]))
}

/// Close codes sent by this crate. Inbound codes are passed through opaquely.
pub mod close_codes {
    /// Normal closure (1000).
    pub const NORMAL: u16 = 1000;
    /// Protocol error (1002), sent before dropping a misbehaving peer.
    pub const PROTOCOL_ERROR: u16 = 1002;
}

/// Apply the 4-byte XOR mask in place (RFC 6455 Section 5.3).
///
/// The operation is symmetric: applying the same key twice restores the
/// original payload.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_classification() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(Opcode::Text.is_data());
        assert!(Opcode::Binary.is_data());
        assert!(Opcode::Continuation.is_data());
        assert!(!Opcode::Close.is_data());
    }

    #[test]
    fn opcode_parsing_rejects_reserved_values() {
        for value in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(Opcode::from_u8(value).is_none(), "0x{value:X} is reserved");
        }
        assert_eq!(Opcode::from_u8(0x1), Some(Opcode::Text));
        assert_eq!(Opcode::from_u8(0xA), Some(Opcode::Pong));
    }

    #[test]
    fn mask_roundtrip() {
        let key = [0x37, 0xFA, 0x21, 0x3D];
        let original = b"Hello".to_vec();
        let mut masked = original.clone();
        apply_mask(&mut masked, key);
        assert_ne!(masked, original);
        apply_mask(&mut masked, key);
        assert_eq!(masked, original);
    }

    #[test]
    fn close_frame_with_code_and_reason() {
        let frame = Frame::close(Some(1000), Some("goodbye"));
        assert_eq!(frame.opcode, Opcode::Close);
        assert!(frame.fin);
        assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&frame.payload[2..], b"goodbye");
        assert_eq!(close_code(&frame.payload), Some(1000));
    }

    #[test]
    fn close_frame_code_only() {
        let frame = Frame::close(Some(1001), None);
        assert_eq!(frame.payload.len(), 2);
        assert_eq!(close_code(&frame.payload), Some(1001));
    }

    #[test]
    fn close_frame_empty() {
        let frame = Frame::close(None, None);
        assert!(frame.payload.is_empty());
        assert_eq!(close_code(&frame.payload), None);
    }
}
