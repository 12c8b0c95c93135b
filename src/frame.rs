//! Wire format of a single datagram. All numbers are in network byte order (BE).
//!
//! Data and registration frames (NORMAL, FEC, REGISTER):
//! ```ascii
//! 0: type (u8)
//! 1: sequence number (u32)
//! 5: payload length (u32)
//! 9: payload
//! ```
//!
//! Acknowledgement frames (ACK) have a fixed size of 5 bytes and no length field:
//! ```ascii
//! 0: type (u8)
//! 1: acknowledged sequence number (u32)
//! ```
//!
//! All other frames (PING, PONG, SYN, FIN) consist of the type byte only.
//!
//! The type byte is always at offset 0, so a datagram can be classified before it is decoded.

use std::mem::size_of;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ConnError;

pub const TYPE_LEN: usize = size_of::<u8>();
pub const SEQUENCE_LEN: usize = size_of::<u32>();
pub const LENGTH_LEN: usize = size_of::<u32>();

pub const DATA_HEADER_LEN: usize = TYPE_LEN + SEQUENCE_LEN + LENGTH_LEN;
pub const ACK_FRAME_LEN: usize = TYPE_LEN + SEQUENCE_LEN;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum FrameType {
    Normal = 0x01,
    /// reserved for forward error correction, not acted upon
    Fec = 0x02,
    /// reserved for a connection handshake, not acted upon
    Syn = 0x03,
    /// binds the sender's public key to the connection
    Register = 0x04,
    Ack = 0x80,
    Ping = 0x81,
    Pong = 0x82,
    /// reserved for a connection handshake, not acted upon
    Fin = 0x83,
}

impl FrameType {
    /// minimum number of bytes a frame of this type occupies on the wire
    pub fn header_len(self) -> usize {
        match self {
            FrameType::Normal | FrameType::Fec | FrameType::Register => DATA_HEADER_LEN,
            FrameType::Ack => ACK_FRAME_LEN,
            FrameType::Syn | FrameType::Ping | FrameType::Pong | FrameType::Fin => TYPE_LEN,
        }
    }
}

/// A decoded frame. Frames are plain values, two frames with the same fields are the same frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Normal { sequence: u32, payload: Bytes },
    Fec { sequence: u32, payload: Bytes },
    Syn,
    Register { sequence: u32, payload: Bytes },
    Ack { sequence: u32 },
    Ping,
    Pong,
    Fin,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Normal { .. } => FrameType::Normal,
            Frame::Fec { .. } => FrameType::Fec,
            Frame::Syn => FrameType::Syn,
            Frame::Register { .. } => FrameType::Register,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Ping => FrameType::Ping,
            Frame::Pong => FrameType::Pong,
            Frame::Fin => FrameType::Fin,
        }
    }

    pub fn sequence(&self) -> Option<u32> {
        match self {
            Frame::Normal { sequence, .. }
            | Frame::Fec { sequence, .. }
            | Frame::Register { sequence, .. }
            | Frame::Ack { sequence } => Some(*sequence),
            Frame::Syn | Frame::Ping | Frame::Pong | Frame::Fin => None,
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Frame::Normal { payload, .. }
            | Frame::Fec { payload, .. }
            | Frame::Register { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn serialized_len(&self) -> usize {
        self.frame_type().header_len() + self.payload().map(|p| p.len()).unwrap_or(0)
    }

    /// Writes the frame without checking its size - see [Frame::encode] for the checked variant.
    ///
    /// NB: payloads longer than `u32::MAX` bytes cannot be represented; callers are expected to
    ///      have checked the size against the (much smaller) datagram limit
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.frame_type().into());
        match self {
            Frame::Normal { sequence, payload }
            | Frame::Fec { sequence, payload }
            | Frame::Register { sequence, payload } => {
                buf.put_u32(*sequence);
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            Frame::Ack { sequence } => buf.put_u32(*sequence),
            Frame::Syn | Frame::Ping | Frame::Pong | Frame::Fin => {}
        }
    }

    pub fn encode(&self, max_datagram_size: usize) -> Result<Bytes, ConnError> {
        let len = self.serialized_len();
        if len > max_datagram_size {
            return Err(ConnError::PayloadTooLarge {
                payload_len: self.payload().map(|p| p.len()).unwrap_or(0),
                max_datagram_size,
            });
        }

        let mut buf = BytesMut::with_capacity(len);
        self.ser(&mut buf);
        Ok(buf.freeze())
    }

    /// Decodes a single datagram. Bytes following a data frame's payload are ignored.
    pub fn deser(datagram: &[u8]) -> Result<Frame, ConnError> {
        let Some(&type_byte) = datagram.first() else {
            return Err(ConnError::MalformedFrame("empty datagram"));
        };
        let frame_type = FrameType::try_from_primitive(type_byte)
            .map_err(|_| ConnError::MalformedFrame("unknown frame type"))?;

        if datagram.len() < frame_type.header_len() {
            return Err(ConnError::MalformedFrame("datagram shorter than frame header"));
        }

        let mut buf = &datagram[TYPE_LEN..];
        let frame = match frame_type {
            FrameType::Normal | FrameType::Fec | FrameType::Register => {
                let sequence = buf.get_u32();
                let payload_len = buf.get_u32() as usize;
                if payload_len > buf.remaining() {
                    return Err(ConnError::MalformedFrame("payload length exceeds datagram"));
                }
                let payload = Bytes::copy_from_slice(&buf[..payload_len]);

                match frame_type {
                    FrameType::Normal => Frame::Normal { sequence, payload },
                    FrameType::Fec => Frame::Fec { sequence, payload },
                    _ => Frame::Register { sequence, payload },
                }
            }
            FrameType::Ack => Frame::Ack { sequence: buf.get_u32() },
            FrameType::Syn => Frame::Syn,
            FrameType::Ping => Frame::Ping,
            FrameType::Pong => Frame::Pong,
            FrameType::Fin => Frame::Fin,
        };
        Ok(frame)
    }
}
