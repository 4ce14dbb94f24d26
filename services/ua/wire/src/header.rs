//! Chunk headers.
//!
//! Every chunk starts with an 8-byte message header: a 3-byte ASCII message
//! type, a 1-byte chunk indicator and the total chunk length as a little-endian
//! `u32`. Secured chunks (OPN/CLO/MSG) follow it with the channel id, a
//! security header and the 8-byte sequence header.

use crate::encoding::{BinaryEncodable, DecodeContext};
use crate::error::{CodecError, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Message header size in bytes
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Sequence header size in bytes
pub const SEQUENCE_HEADER_SIZE: usize = 8;

/// Symmetric security header size in bytes
pub const SYMMETRIC_HEADER_SIZE: usize = 4;

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Transport hello
    Hello,
    /// Transport acknowledge
    Acknowledge,
    /// Transport error
    Error,
    /// Open secure channel
    Open,
    /// Close secure channel
    Close,
    /// Service message
    Message,
}

impl MessageType {
    /// Three-letter wire tag
    pub fn tag(self) -> &'static [u8; 3] {
        match self {
            MessageType::Hello => b"HEL",
            MessageType::Acknowledge => b"ACK",
            MessageType::Error => b"ERR",
            MessageType::Open => b"OPN",
            MessageType::Close => b"CLO",
            MessageType::Message => b"MSG",
        }
    }

    /// Whether chunks of this type carry channel, security and sequence headers
    pub fn is_secure(self) -> bool {
        matches!(
            self,
            MessageType::Open | MessageType::Close | MessageType::Message
        )
    }

    /// Smallest well-formed chunk of this type
    pub fn min_chunk_size(self) -> usize {
        match self {
            MessageType::Hello | MessageType::Acknowledge | MessageType::Error => {
                MESSAGE_HEADER_SIZE
            }
            // channel id + three empty length-prefixed strings + sequence header
            MessageType::Open => MESSAGE_HEADER_SIZE + 4 + 12 + SEQUENCE_HEADER_SIZE,
            MessageType::Close | MessageType::Message => {
                MESSAGE_HEADER_SIZE + 4 + SYMMETRIC_HEADER_SIZE + SEQUENCE_HEADER_SIZE
            }
        }
    }
}

impl TryFrom<[u8; 3]> for MessageType {
    type Error = WireError;

    fn try_from(tag: [u8; 3]) -> Result<Self, WireError> {
        match &tag {
            b"HEL" => Ok(MessageType::Hello),
            b"ACK" => Ok(MessageType::Acknowledge),
            b"ERR" => Ok(MessageType::Error),
            b"OPN" => Ok(MessageType::Open),
            b"CLO" => Ok(MessageType::Close),
            b"MSG" => Ok(MessageType::Message),
            _ => Err(WireError::MessageType(tag)),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Tags are ASCII
        let tag = self.tag();
        write!(f, "{}{}{}", tag[0] as char, tag[1] as char, tag[2] as char)
    }
}

/// Chunk indicator
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkType {
    /// More chunks follow
    Intermediate = b'C',
    /// Last chunk of the message
    Final = b'F',
    /// Sender abandoned the message
    Abort = b'A',
}

impl TryFrom<u8> for ChunkType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'C' => Ok(ChunkType::Intermediate),
            b'F' => Ok(ChunkType::Final),
            b'A' => Ok(ChunkType::Abort),
            _ => Err(WireError::ChunkType(value)),
        }
    }
}

/// Message header (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type
    pub message_type: MessageType,
    /// Chunk indicator
    pub chunk_type: ChunkType,
    /// Total chunk length including this header
    pub chunk_length: u32,
}

impl MessageHeader {
    /// Encode the header (little-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.message_type.tag());
        buf.put_u8(self.chunk_type as u8);
        buf.put_u32_le(self.chunk_length);
    }

    /// Decode a header from the front of `buf` without consuming it
    pub fn peek(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(WireError::Incomplete);
        }
        let tag = [buf[0], buf[1], buf[2]];
        let message_type = MessageType::try_from(tag)?;
        let chunk_type = ChunkType::try_from(buf[3])?;
        let chunk_length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Self {
            message_type,
            chunk_type,
            chunk_length,
        })
    }
}

/// Sequence header (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceHeader {
    /// Per-channel chunk counter
    pub sequence_number: u32,
    /// Identifies the message the chunk belongs to
    pub request_id: u32,
}

impl SequenceHeader {
    /// Encode the header
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.sequence_number);
        buf.put_u32_le(self.request_id);
    }

    /// Decode the header from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < SEQUENCE_HEADER_SIZE {
            return Err(WireError::Malformed);
        }
        Ok(Self {
            sequence_number: buf.get_u32_le(),
            request_id: buf.get_u32_le(),
        })
    }
}

/// Security header of OPN chunks
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsymmetricSecurityHeader {
    /// Security policy URI
    pub security_policy_uri: String,
    /// DER encoded sender certificate
    pub sender_certificate: Bytes,
    /// SHA-1 thumbprint of the receiver certificate
    pub receiver_certificate_thumbprint: Bytes,
}

impl BinaryEncodable for AsymmetricSecurityHeader {
    fn byte_len(&self) -> usize {
        self.security_policy_uri.byte_len()
            + self.sender_certificate.byte_len()
            + self.receiver_certificate_thumbprint.byte_len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.security_policy_uri.encode(buf);
        self.sender_certificate.encode(buf);
        self.receiver_certificate_thumbprint.encode(buf);
    }

    fn decode(buf: &mut Bytes, ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            security_policy_uri: String::decode(buf, ctx)?,
            sender_certificate: Bytes::decode(buf, ctx)?,
            receiver_certificate_thumbprint: Bytes::decode(buf, ctx)?,
        })
    }
}

/// Security header of a secured chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityHeader {
    /// Policy and certificates (OPN)
    Asymmetric(AsymmetricSecurityHeader),
    /// Token id (CLO/MSG)
    Symmetric {
        /// Token protecting the chunk
        token_id: u32,
    },
}

impl SecurityHeader {
    /// Encoded length
    pub fn byte_len(&self) -> usize {
        match self {
            SecurityHeader::Asymmetric(header) => header.byte_len(),
            SecurityHeader::Symmetric { .. } => SYMMETRIC_HEADER_SIZE,
        }
    }

    /// Encode the header
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            SecurityHeader::Asymmetric(header) => header.encode(buf),
            SecurityHeader::Symmetric { token_id } => buf.put_u32_le(*token_id),
        }
    }

    /// Token id of a symmetric header
    pub fn token_id(&self) -> Option<u32> {
        match self {
            SecurityHeader::Symmetric { token_id } => Some(*token_id),
            SecurityHeader::Asymmetric(_) => None,
        }
    }
}
