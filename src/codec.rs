//! Stateful WebSocket frame codec (RFC 6455 Section 5.2).
//!
//! [`FrameCodec`] implements `tokio_util`'s [`Decoder`] and [`Encoder`]
//! traits so a connection can be driven through
//! [`Framed`](tokio_util::codec::Framed). The codec is constructed for a
//! [`Role`]; the role decides both sides of the masking discipline:
//!
//! - a client masks every outbound frame with a fresh random key and
//!   rejects masked inbound frames;
//! - a server never masks outbound frames and rejects unmasked inbound
//!   frames.
//!
//! Decoding is incremental: `decode` returns `Ok(None)` until a whole frame
//! is buffered, consuming nothing in the meantime beyond completed stages.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, MAX_CONTROL_PAYLOAD, Opcode, apply_mask};

/// Default cap on a single frame payload (16 MiB).
///
/// The 64-bit length tier would otherwise let a hostile peer demand an
/// arbitrarily large allocation before any payload byte arrives.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Connection role. Most client/server differences in the base protocol
/// collapse to "do I mask when sending" and "do I expect a mask when
/// receiving".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connection initiator: masks outbound frames.
    Client,
    /// Connection acceptor: sends unmasked frames.
    Server,
}

/// Violations of the framing layer.
///
/// Any of these terminates the connection; the session logs the error and
/// closes the transport (best effort, with close code 1002).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transport-level failure while reading or writing frame bytes.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Opcode outside the RFC 6455 set.
    #[error("unknown opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    /// RSV bits set without a negotiated extension.
    #[error("reserved bits set without negotiated extension")]
    ReservedBitsSet,

    /// A server received an unmasked frame.
    #[error("unmasked frame received by server")]
    UnmaskedFrame,

    /// A client received a masked frame.
    #[error("masked frame received by client")]
    MaskedFrame,

    /// A control frame arrived without FIN set.
    #[error("fragmented control frame")]
    FragmentedControlFrame,

    /// A control frame payload exceeded 125 bytes.
    #[error("control frame payload too large: {0} bytes (max 125)")]
    ControlFrameTooLarge(usize),

    /// The 64-bit length tier had its most significant bit set.
    #[error("most significant bit of 64-bit payload length must be zero")]
    LengthMsbSet,

    /// Declared payload length exceeds the configured cap.
    #[error("payload length {length} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Declared payload length in bytes.
        length: u64,
        /// Configured maximum in bytes.
        max: usize,
    },

    /// A continuation frame arrived with no message in progress.
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    /// A new data message started while another was being reassembled.
    #[error("data frame interleaved within a fragmented message")]
    InterleavedMessage,

    /// Reassembled message exceeded the configured cap.
    #[error("reassembled message exceeds maximum {max} bytes")]
    MessageTooLarge {
        /// Configured maximum in bytes.
        max: usize,
    },
}

impl From<ProtocolError> for std::io::Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(inner) => inner,
            other => Self::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

/// Header fields carried between decode stages.
#[derive(Debug, Clone, Copy)]
struct FrameHead {
    fin: bool,
    opcode: Opcode,
    masked: bool,
}

/// Decode progress for the frame currently being read.
#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Waiting for the first two header bytes.
    Header,
    /// Reading the 2- or 8-byte extended payload length.
    ExtendedLength { head: FrameHead, width: usize },
    /// Reading the 4-byte masking key.
    MaskKey { head: FrameHead, payload_len: usize },
    /// Reading the payload itself.
    Payload {
        head: FrameHead,
        mask: Option<[u8; 4]>,
        payload_len: usize,
    },
}

/// WebSocket frame codec for one connection.
#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    max_payload: usize,
    state: DecodeState,
}

impl FrameCodec {
    /// Create a codec for the given role with the default payload cap.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_payload: DEFAULT_MAX_PAYLOAD,
            state: DecodeState::Header,
        }
    }

    /// Client-role codec.
    #[must_use]
    pub fn client() -> Self { Self::new(Role::Client) }

    /// Server-role codec.
    #[must_use]
    pub fn server() -> Self { Self::new(Role::Server) }

    /// Override the per-frame payload cap.
    #[must_use]
    pub fn max_payload(mut self, max: usize) -> Self {
        self.max_payload = max;
        self
    }

    /// Role this codec was built for.
    #[must_use]
    pub fn role(&self) -> Role { self.role }

    fn check_length(&self, length: u64) -> Result<usize, ProtocolError> {
        if length > self.max_payload as u64 {
            return Err(ProtocolError::PayloadTooLarge {
                length,
                max: self.max_payload,
            });
        }
        Ok(usize::try_from(length).unwrap_or(usize::MAX))
    }

    fn parse_header(&self, byte0: u8, byte1: u8) -> Result<(FrameHead, u8), ProtocolError> {
        let fin = byte0 & 0x80 != 0;
        if byte0 & 0x70 != 0 {
            return Err(ProtocolError::ReservedBitsSet);
        }
        let opcode_raw = byte0 & 0x0F;
        let opcode =
            Opcode::from_u8(opcode_raw).ok_or(ProtocolError::UnknownOpcode(opcode_raw))?;

        let masked = byte1 & 0x80 != 0;
        let len7 = byte1 & 0x7F;

        // Masking is a role property: client-to-server frames MUST be
        // masked, server-to-client frames MUST NOT be.
        match self.role {
            Role::Server if !masked => return Err(ProtocolError::UnmaskedFrame),
            Role::Client if masked => return Err(ProtocolError::MaskedFrame),
            _ => {}
        }

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControlFrame);
            }
            if len7 as usize > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrameTooLarge(len7 as usize));
            }
        }

        Ok((FrameHead { fin, opcode, masked }, len7))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let (head, len7) = self.parse_header(src[0], src[1])?;
                    src.advance(2);

                    self.state = match len7 {
                        126 => DecodeState::ExtendedLength { head, width: 2 },
                        127 => DecodeState::ExtendedLength { head, width: 8 },
                        direct => {
                            let payload_len = self.check_length(u64::from(direct))?;
                            next_after_length(head, payload_len)
                        }
                    };
                }

                DecodeState::ExtendedLength { head, width } => {
                    if src.len() < width {
                        return Ok(None);
                    }
                    let length = if width == 2 {
                        u64::from(src.get_u16())
                    } else {
                        let length = src.get_u64();
                        if length >> 63 != 0 {
                            return Err(ProtocolError::LengthMsbSet);
                        }
                        length
                    };
                    let payload_len = self.check_length(length)?;
                    self.state = next_after_length(head, payload_len);
                }

                DecodeState::MaskKey { head, payload_len } => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let mut key = [0u8; 4];
                    key.copy_from_slice(&src.split_to(4));
                    self.state = DecodeState::Payload {
                        head,
                        mask: Some(key),
                        payload_len,
                    };
                }

                DecodeState::Payload {
                    head,
                    mask,
                    payload_len,
                } => {
                    if src.len() < payload_len {
                        src.reserve(payload_len - src.len());
                        return Ok(None);
                    }
                    let mut payload = src.split_to(payload_len);
                    if let Some(key) = mask {
                        apply_mask(&mut payload, key);
                    }
                    self.state = DecodeState::Header;
                    return Ok(Some(Frame {
                        fin: head.fin,
                        opcode: head.opcode,
                        payload: payload.freeze(),
                    }));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();

        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(ProtocolError::FragmentedControlFrame);
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrameTooLarge(payload_len));
            }
        }

        let masked = self.role == Role::Client;
        let extended = match payload_len {
            0..=125 => 0,
            126..=65535 => 2,
            _ => 8,
        };
        dst.reserve(2 + extended + if masked { 4 } else { 0 } + payload_len);

        let byte0 = (u8::from(frame.fin) << 7) | frame.opcode as u8;
        dst.put_u8(byte0);

        let mask_bit = if masked { 0x80 } else { 0 };
        match extended {
            0 => {
                #[expect(clippy::cast_possible_truncation, reason = "len <= 125 here")]
                dst.put_u8(mask_bit | payload_len as u8);
            }
            2 => {
                dst.put_u8(mask_bit | 126);
                #[expect(clippy::cast_possible_truncation, reason = "len <= 65535 here")]
                dst.put_u16(payload_len as u16);
            }
            _ => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(payload_len as u64);
            }
        }

        if masked {
            let key: [u8; 4] = rand::random();
            dst.put_slice(&key);
            let mut masked_payload = BytesMut::from(frame.payload.as_ref());
            apply_mask(&mut masked_payload, key);
            dst.put_slice(&masked_payload);
        } else {
            dst.put_slice(&frame.payload);
        }

        Ok(())
    }
}

const fn next_after_length(head: FrameHead, payload_len: usize) -> DecodeState {
    if head.masked {
        DecodeState::MaskKey { head, payload_len }
    } else {
        DecodeState::Payload {
            head,
            mask: None,
            payload_len,
        }
    }
}
