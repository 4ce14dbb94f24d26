//! Outbound message chunking.
//!
//! A message body is split into as many chunks as the peer's receive buffer
//! requires once headers and crypto overhead are accounted for. Every chunk
//! takes the next sequence number of the channel, OPN chunks included.

use crate::error::ChannelError;
use bytes::{Bytes, BytesMut};
use tracing::debug;
use ua_wire::{
    encode_message, encode_to_bytes, ChunkCodec, ChunkType, CryptoContext, ErrorMessage,
    MessageType, SecureChunkHeader, SecurityHeader, SequenceHeader, StatusCode, TransportLimits,
    UaObject,
};

/// Sequence number following `n`, wrapping back to 1
pub fn next_sequence_number(n: u32) -> u32 {
    if n == u32::MAX {
        1
    } else {
        n + 1
    }
}

/// Splits outbound messages into secured chunks
#[derive(Debug, Clone)]
pub struct MessageChunker {
    codec: ChunkCodec,
    limits: TransportLimits,
    sequence_number: u32,
}

impl MessageChunker {
    /// Chunker honoring `limits`; the first chunk gets sequence number 1
    pub fn new(limits: TransportLimits) -> Self {
        Self {
            codec: ChunkCodec::default(),
            limits,
            sequence_number: 1,
        }
    }

    /// Replace the limits, e.g. after the transport handshake
    pub fn set_limits(&mut self, limits: TransportLimits) {
        self.limits = limits;
    }

    /// Limits in force
    pub fn limits(&self) -> &TransportLimits {
        &self.limits
    }

    /// Sequence number the next chunk will carry
    pub fn peek_sequence_number(&self) -> u32 {
        self.sequence_number
    }

    fn take_sequence_number(&mut self) -> u32 {
        let n = self.sequence_number;
        self.sequence_number = next_sequence_number(n);
        n
    }

    /// Encode `object` with its encoding id and split it into chunks
    pub fn encode_message(
        &mut self,
        message_type: MessageType,
        channel_id: u32,
        security_header: &SecurityHeader,
        request_id: u32,
        object: &dyn UaObject,
        crypto: &CryptoContext,
    ) -> Result<Vec<Bytes>, ChannelError> {
        let body = encode_message(object);
        self.chunk_message(
            message_type,
            channel_id,
            security_header,
            request_id,
            &body,
            crypto,
        )
    }

    /// Split an encoded body into chunks
    pub fn chunk_message(
        &mut self,
        message_type: MessageType,
        channel_id: u32,
        security_header: &SecurityHeader,
        request_id: u32,
        body: &[u8],
        crypto: &CryptoContext,
    ) -> Result<Vec<Bytes>, ChannelError> {
        let max_message_size = self.limits.max_message_size as usize;
        if max_message_size != 0 && body.len() > max_message_size {
            return Err(ChannelError::Limits(format!(
                "message of {} bytes exceeds the limit of {}",
                body.len(),
                max_message_size
            )));
        }

        let mut header = SecureChunkHeader {
            message_type,
            chunk_type: ChunkType::Final,
            channel_id,
            security_header: security_header.clone(),
            sequence_header: SequenceHeader {
                sequence_number: 0,
                request_id,
            },
        };
        let max_body = self.max_body_size(&header, crypto)?;

        let chunk_count = body.len().div_ceil(max_body).max(1);
        let max_chunk_count = self.limits.max_chunk_count as usize;
        if max_chunk_count != 0 && chunk_count > max_chunk_count {
            return Err(ChannelError::Limits(format!(
                "message needs {} chunks, limit is {}",
                chunk_count, max_chunk_count
            )));
        }

        let mut chunks = Vec::with_capacity(chunk_count);
        let mut pieces = body.chunks(max_body).peekable();
        if pieces.peek().is_none() {
            header.sequence_header.sequence_number = self.take_sequence_number();
            chunks.push(self.codec.encode(&header, &[], crypto)?);
        }
        while let Some(piece) = pieces.next() {
            header.chunk_type = if pieces.peek().is_some() {
                ChunkType::Intermediate
            } else {
                ChunkType::Final
            };
            header.sequence_header.sequence_number = self.take_sequence_number();
            chunks.push(self.codec.encode(&header, piece, crypto)?);
        }

        debug!(
            "Chunked {} message for request {} into {} chunk(s)",
            message_type,
            request_id,
            chunks.len()
        );
        Ok(chunks)
    }

    /// Encode an abort chunk telling the peer to drop request `request_id`
    #[allow(clippy::too_many_arguments)]
    pub fn encode_abort(
        &mut self,
        message_type: MessageType,
        channel_id: u32,
        security_header: &SecurityHeader,
        request_id: u32,
        status: StatusCode,
        reason: &str,
        crypto: &CryptoContext,
    ) -> Result<Bytes, ChannelError> {
        let header = SecureChunkHeader {
            message_type,
            chunk_type: ChunkType::Abort,
            channel_id,
            security_header: security_header.clone(),
            sequence_header: SequenceHeader {
                sequence_number: self.take_sequence_number(),
                request_id,
            },
        };
        let body = encode_to_bytes(&ErrorMessage::new(status, reason));
        debug!("Aborting request {} with {}", request_id, status);
        Ok(self.codec.encode(&header, &body, crypto)?)
    }

    fn max_body_size(
        &self,
        header: &SecureChunkHeader,
        crypto: &CryptoContext,
    ) -> Result<usize, ChannelError> {
        let send_buffer = match self.limits.send_buffer_size as usize {
            0 => usize::MAX,
            size => size,
        };
        let space = send_buffer.saturating_sub(header.encoded_size());
        match crypto.max_body_size(space) {
            0 => Err(ChannelError::Limits(format!(
                "send buffer of {} bytes leaves no room for a body",
                send_buffer
            ))),
            size => Ok(size),
        }
    }
}

/// Concatenate encoded chunks for a single transport write
pub fn concat_chunks(chunks: &[Bytes]) -> Bytes {
    if let [single] = chunks {
        return single.clone();
    }
    let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in chunks {
        buf.extend_from_slice(chunk);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ua_wire::{
        ChannelKeys, DecodedChunk, GetEndpointsRequest, MessageSecurityMode, SecurityPolicy,
        MESSAGE_HEADER_SIZE,
    };

    fn symmetric() -> SecurityHeader {
        SecurityHeader::Symmetric { token_id: 1 }
    }

    fn decode(chunk: &Bytes) -> ua_wire::SecureChunk {
        match ChunkCodec::default().decode(chunk.clone()).unwrap() {
            DecodedChunk::Secure(chunk) => chunk,
            other => panic!("expected secure chunk, got {:?}", other),
        }
    }

    #[test]
    fn test_sequence_wraps_to_one() {
        assert_eq!(next_sequence_number(1), 2);
        assert_eq!(next_sequence_number(u32::MAX), 1);
    }

    #[test]
    fn test_single_chunk() {
        let mut chunker = MessageChunker::new(TransportLimits::default());
        let request = GetEndpointsRequest {
            endpoint_url: "opc.tcp://localhost:4840".into(),
            ..Default::default()
        };
        let chunks = chunker
            .encode_message(
                MessageType::Message,
                5,
                &symmetric(),
                1,
                &request,
                &CryptoContext::none(),
            )
            .unwrap();
        assert_eq!(chunks.len(), 1);
        let chunk = decode(&chunks[0]);
        assert_eq!(chunk.header.chunk_type, ChunkType::Final);
        assert_eq!(chunk.header.sequence_header.sequence_number, 1);
        assert_eq!(chunker.peek_sequence_number(), 2);
    }

    #[test]
    fn test_split_respects_send_buffer() {
        let limits = TransportLimits {
            send_buffer_size: 8192,
            ..TransportLimits::default()
        };
        let keys = ChannelKeys::derive(&[1u8; 32], &[2u8; 32]).unwrap();
        let crypto = CryptoContext::new(
            SecurityPolicy::Aes256GcmSha256,
            MessageSecurityMode::SignAndEncrypt,
            Some(keys.client),
        )
        .unwrap();
        let mut chunker = MessageChunker::new(limits);
        let body = vec![7u8; 20_000];
        let chunks = chunker
            .chunk_message(MessageType::Message, 5, &symmetric(), 3, &body, &crypto)
            .unwrap();
        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.len() <= 8192);
            assert!(chunk.len() > MESSAGE_HEADER_SIZE);
            let decoded = decode(chunk);
            let expected = if i == 2 {
                ChunkType::Final
            } else {
                ChunkType::Intermediate
            };
            assert_eq!(decoded.header.chunk_type, expected);
            assert_eq!(decoded.header.sequence_header.sequence_number, i as u32 + 1);
            assert_eq!(decoded.header.sequence_header.request_id, 3);
        }
    }

    #[test]
    fn test_limits_enforced() {
        let mut chunker = MessageChunker::new(TransportLimits {
            send_buffer_size: 8192,
            max_message_size: 100,
            max_chunk_count: 0,
            ..TransportLimits::default()
        });
        let err = chunker
            .chunk_message(
                MessageType::Message,
                5,
                &symmetric(),
                1,
                &[0u8; 101],
                &CryptoContext::none(),
            )
            .unwrap_err();
        assert!(matches!(err, ChannelError::Limits(_)));

        let mut chunker = MessageChunker::new(TransportLimits {
            send_buffer_size: 8192,
            max_message_size: 0,
            max_chunk_count: 2,
            ..TransportLimits::default()
        });
        let err = chunker
            .chunk_message(
                MessageType::Message,
                5,
                &symmetric(),
                1,
                &[0u8; 20_000],
                &CryptoContext::none(),
            )
            .unwrap_err();
        assert!(matches!(err, ChannelError::Limits(_)));
        // Nothing was consumed by the failed attempts
        assert_eq!(chunker.peek_sequence_number(), 1);
    }

    #[test]
    fn test_abort_chunk() {
        let mut chunker = MessageChunker::new(TransportLimits::default());
        let chunk = chunker
            .encode_abort(
                MessageType::Message,
                5,
                &symmetric(),
                9,
                StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
                "too big",
                &CryptoContext::none(),
            )
            .unwrap();
        assert_eq!(&chunk[..4], b"MSGA");
        let decoded = decode(&chunk);
        assert_eq!(decoded.header.sequence_header.request_id, 9);
    }

    #[test]
    fn test_concat() {
        let joined = concat_chunks(&[Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]);
        assert_eq!(&joined[..], b"abcd");
    }
}
