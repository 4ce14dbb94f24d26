//! Chunk encoding and decoding.
//!
//! Secured chunk layout:
//!
//! ```text
//! | message header (8) | channel id (4) | security header | sequence header (8) |
//! | body | padding | signature |
//! ```
//!
//! In mode Sign the signature covers everything before it. In mode
//! SignAndEncrypt body, padding and signature are encrypted as one AEAD
//! payload authenticated together with the clear prefix, and the tag is
//! appended. Transport chunks (HEL/ACK/ERR) carry their body right after the
//! message header.

use crate::crypto::CryptoContext;
use crate::encoding::{BinaryEncodable, DecodeContext, DecodingLimits};
use crate::error::{SecurityError, WireError};
use crate::header::{
    AsymmetricSecurityHeader, ChunkType, MessageHeader, MessageType, SecurityHeader,
    SequenceHeader, MESSAGE_HEADER_SIZE, SEQUENCE_HEADER_SIZE,
};
use crate::registry::standard_registry;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Everything in a secured chunk that precedes the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureChunkHeader {
    /// OPN, CLO or MSG
    pub message_type: MessageType,
    /// Chunk indicator
    pub chunk_type: ChunkType,
    /// Secure channel id
    pub channel_id: u32,
    /// Asymmetric (OPN) or symmetric (CLO/MSG) security header
    pub security_header: SecurityHeader,
    /// Sequence number and request id
    pub sequence_header: SequenceHeader,
}

impl SecureChunkHeader {
    /// Encoded size of the header, which is also the offset of the body
    pub fn encoded_size(&self) -> usize {
        MESSAGE_HEADER_SIZE + 4 + self.security_header.byte_len() + SEQUENCE_HEADER_SIZE
    }
}

/// An unsecured HEL, ACK or ERR chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportChunk {
    /// HEL, ACK or ERR
    pub message_type: MessageType,
    /// Message body
    pub body: Bytes,
}

/// A secured chunk whose body has not been verified yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureChunk {
    /// Parsed clear-text header
    pub header: SecureChunkHeader,
    raw: Bytes,
    body_offset: usize,
}

impl SecureChunk {
    /// Token named in a symmetric security header
    pub fn token_id(&self) -> Option<u32> {
        self.header.security_header.token_id()
    }

    /// Whole chunk as received
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Verify and decrypt with `crypto`, returning the body
    pub fn open(&self, crypto: &CryptoContext) -> Result<Bytes, SecurityError> {
        let len = self.raw.len();
        let protected = len - self.body_offset;

        if crypto.encrypts() {
            let aad = &self.raw[..self.body_offset];
            let plaintext = crypto.decrypt(
                self.header.sequence_header.sequence_number,
                aad,
                &self.raw[self.body_offset..],
            )?;
            let signed_len = plaintext
                .len()
                .checked_sub(crypto.signature_size())
                .ok_or(SecurityError::Truncated(plaintext.len()))?;
            let mut signed = Vec::with_capacity(aad.len() + signed_len);
            signed.extend_from_slice(aad);
            signed.extend_from_slice(&plaintext[..signed_len]);
            crypto.verify(&signed, &plaintext[signed_len..])?;
            let body_len = crypto.unpadded_len(&plaintext[..signed_len])?;
            return Ok(Bytes::from(plaintext).slice(..body_len));
        }

        let signature_size = crypto.signature_size();
        if protected < signature_size {
            return Err(SecurityError::Truncated(protected));
        }
        let signed_end = len - signature_size;
        crypto.verify(&self.raw[..signed_end], &self.raw[signed_end..])?;
        Ok(self.raw.slice(self.body_offset..signed_end))
    }
}

/// Result of decoding one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedChunk {
    /// HEL, ACK or ERR
    Transport(TransportChunk),
    /// OPN, CLO or MSG
    Secure(SecureChunk),
}

/// Encoder and decoder for single chunks
#[derive(Debug, Clone, Default)]
pub struct ChunkCodec {
    limits: DecodingLimits,
}

impl ChunkCodec {
    /// Codec applying `limits` to security header strings
    pub fn new(limits: DecodingLimits) -> Self {
        Self { limits }
    }

    /// Encode a secured chunk, applying `crypto` to the body
    pub fn encode(
        &self,
        header: &SecureChunkHeader,
        body: &[u8],
        crypto: &CryptoContext,
    ) -> Result<Bytes, SecurityError> {
        let prefix_len = header.encoded_size();
        let total = prefix_len + body.len() + crypto.trailer_size(body.len());
        let mut buf = BytesMut::with_capacity(total);

        // Message header with the final length
        MessageHeader {
            message_type: header.message_type,
            chunk_type: header.chunk_type,
            chunk_length: total as u32,
        }
        .encode(&mut buf);
        buf.put_u32_le(header.channel_id);
        header.security_header.encode(&mut buf);
        header.sequence_header.encode(&mut buf);

        if crypto.encrypts() {
            let mut plaintext = Vec::with_capacity(total - prefix_len);
            plaintext.extend_from_slice(body);
            plaintext.extend_from_slice(&crypto.padding(body.len()));

            let mut signed = Vec::with_capacity(prefix_len + plaintext.len());
            signed.extend_from_slice(&buf);
            signed.extend_from_slice(&plaintext);
            plaintext.extend_from_slice(&crypto.sign(&signed)?);

            let ciphertext = crypto.encrypt(
                header.sequence_header.sequence_number,
                &buf,
                &plaintext,
            )?;
            buf.put_slice(&ciphertext);
        } else {
            buf.put_slice(body);
            let signature = crypto.sign(&buf)?;
            buf.put_slice(&signature);
        }

        debug_assert_eq!(buf.len(), total);
        trace!(
            "Encoded {}{} chunk seq={} len={}",
            header.message_type,
            header.chunk_type as u8 as char,
            header.sequence_header.sequence_number,
            total
        );
        Ok(buf.freeze())
    }

    /// Encode an unsecured single-chunk transport message
    pub fn encode_transport(message_type: MessageType, body: &[u8]) -> Bytes {
        let total = MESSAGE_HEADER_SIZE + body.len();
        let mut buf = BytesMut::with_capacity(total);
        MessageHeader {
            message_type,
            chunk_type: ChunkType::Final,
            chunk_length: total as u32,
        }
        .encode(&mut buf);
        buf.put_slice(body);
        buf.freeze()
    }

    /// Decode one chunk; `chunk` must hold exactly the declared length
    pub fn decode(&self, chunk: Bytes) -> Result<DecodedChunk, WireError> {
        if chunk.len() < MESSAGE_HEADER_SIZE {
            return Err(WireError::TooShort {
                actual: chunk.len(),
                minimum: MESSAGE_HEADER_SIZE,
            });
        }
        let header = MessageHeader::peek(&chunk)?;
        let declared = header.chunk_length as usize;
        if declared != chunk.len() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: chunk.len(),
            });
        }
        let minimum = header.message_type.min_chunk_size();
        if chunk.len() < minimum {
            return Err(WireError::TooShort {
                actual: chunk.len(),
                minimum,
            });
        }

        if !header.message_type.is_secure() {
            if header.chunk_type != ChunkType::Final {
                return Err(WireError::NotFinal(match header.message_type {
                    MessageType::Hello => "HEL",
                    MessageType::Acknowledge => "ACK",
                    _ => "ERR",
                }));
            }
            return Ok(DecodedChunk::Transport(TransportChunk {
                message_type: header.message_type,
                body: chunk.slice(MESSAGE_HEADER_SIZE..),
            }));
        }

        let mut cursor = chunk.slice(MESSAGE_HEADER_SIZE..);
        let channel_id = cursor.get_u32_le();
        let security_header = match header.message_type {
            MessageType::Open => {
                let ctx = DecodeContext::new(standard_registry(), self.limits);
                let asymmetric = AsymmetricSecurityHeader::decode(&mut cursor, &ctx)
                    .map_err(|_| WireError::SecurityHeader("unreadable asymmetric header"))?;
                SecurityHeader::Asymmetric(asymmetric)
            }
            _ => SecurityHeader::Symmetric {
                token_id: cursor.get_u32_le(),
            },
        };
        let sequence_header = SequenceHeader::decode(&mut cursor)?;
        let body_offset = chunk.len() - cursor.remaining();

        Ok(DecodedChunk::Secure(SecureChunk {
            header: SecureChunkHeader {
                message_type: header.message_type,
                chunk_type: header.chunk_type,
                channel_id,
                security_header,
                sequence_header,
            },
            raw: chunk,
            body_offset,
        }))
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::encoding::DecodingLimits;
    use crate::registry::standard_registry;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn decode_arbitrary_bytes_never_panics(data in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = ChunkCodec::default().decode(Bytes::from(data));
        }

        #[test]
        fn corrupted_type_id_is_an_error_not_a_panic(
            prefix in proptest::collection::vec(any::<u8>(), 1..8),
        ) {
            // A well-formed chunk whose body starts with arbitrary bytes
            let codec = ChunkCodec::default();
            let header = SecureChunkHeader {
                message_type: MessageType::Message,
                chunk_type: ChunkType::Final,
                channel_id: 1,
                security_header: SecurityHeader::Symmetric { token_id: 1 },
                sequence_header: SequenceHeader { sequence_number: 1, request_id: 1 },
            };
            let bytes = codec.encode(&header, &prefix, &CryptoContext::none()).unwrap();
            let DecodedChunk::Secure(chunk) = codec.decode(bytes).unwrap() else {
                panic!("expected secure chunk");
            };
            let body = chunk.open(&CryptoContext::none()).unwrap();
            prop_assert!(standard_registry()
                .decode_message(body, DecodingLimits::default())
                .is_err());
        }
    }
}
