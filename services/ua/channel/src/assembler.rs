//! Inbound message assembly.
//!
//! The assembler accepts the byte stream of one connection in arbitrary
//! fragments and turns it into events:
//!
//! - **Framing**: bytes are buffered until a whole chunk is present, then
//!   chunks are processed strictly in arrival order
//! - **Security**: CLO/MSG chunks are verified with the token they name, which
//!   must be the current or previous token of the channel
//! - **Sequencing**: every chunk must carry the sequence number after the
//!   previous one; gaps are reported
//! - **Reassembly**: intermediate chunks are collected per request id until the
//!   final chunk, then the body is decoded through the type registry
//!
//! Failures drop the affected message and leave the assembler ready for the
//! next one. Only a corrupt message header discards the buffered stream, since
//! chunk boundaries can no longer be found.

use crate::chunker::next_sequence_number;
use crate::config::{ChannelConfig, SequencePolicy};
use crate::error::ChannelError;
use crate::event::{ChannelEvent, DecodedMessage, EventSink};
use crate::token::TokenStore;
use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};
use ua_wire::{
    AcknowledgeMessage, BinaryEncodable, ChunkCodec, ChunkType, CryptoContext, DecodeContext,
    DecodedChunk, DecodingLimits, ErrorMessage, ExpandedNodeId, HelloMessage, MessageHeader,
    MessageType, SecureChunk, SequenceHeader, TransportChunk, TransportLimits, TypeRegistry,
    UaObject, WireError, MESSAGE_HEADER_SIZE,
};

/// What the assembler accepts on the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// HEL/ACK/ERR only, until the transport handshake completes
    Handshake,
    /// Secured OPN/CLO/MSG chunks
    Secure,
}

#[derive(Debug)]
enum AssemblyState {
    Idle,
    Accumulating {
        message_type: MessageType,
        request_id: u32,
        chunks: SmallVec<[Bytes; 4]>,
        size: usize,
    },
}

/// Reassembles chunks from a byte stream into decoded messages
#[derive(Debug)]
pub struct MessageAssembler {
    buffer: BytesMut,
    state: AssemblyState,
    mode: FramingMode,
    last_sequence_number: Option<u32>,
    channel_id: Option<u32>,
    tokens: TokenStore,
    registry: Arc<TypeRegistry>,
    codec: ChunkCodec,
    limits: TransportLimits,
    acknowledge: Option<AcknowledgeMessage>,
    decoding: DecodingLimits,
    sequence_policy: SequencePolicy,
}

impl MessageAssembler {
    /// Assembler for secured chunks verified against `tokens`
    pub fn new(config: &ChannelConfig, tokens: TokenStore) -> Self {
        Self {
            buffer: BytesMut::new(),
            state: AssemblyState::Idle,
            mode: FramingMode::Secure,
            last_sequence_number: None,
            channel_id: None,
            tokens,
            registry: Arc::new(TypeRegistry::standard()),
            codec: ChunkCodec::new(config.decoding),
            limits: config.limits,
            acknowledge: None,
            decoding: config.decoding,
            sequence_policy: config.sequence_policy,
        }
    }

    /// Decode message bodies with `registry` instead of the standard one
    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Start in `mode`
    pub fn with_mode(mut self, mode: FramingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Current framing mode
    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Only accept CLO/MSG chunks addressed to `channel_id`
    pub fn set_channel_id(&mut self, channel_id: u32) {
        self.channel_id = Some(channel_id);
    }

    /// Channel id chunks are checked against
    pub fn channel_id(&self) -> Option<u32> {
        self.channel_id
    }

    /// Limits in force
    pub fn limits(&self) -> &TransportLimits {
        &self.limits
    }

    /// Acknowledge from the transport handshake: the answer to send after a
    /// hello, or the one received from the server
    pub fn acknowledge(&self) -> Option<&AcknowledgeMessage> {
        self.acknowledge.as_ref()
    }

    /// Replace the limits
    pub fn set_limits(&mut self, limits: TransportLimits) {
        self.limits = limits;
    }

    /// Bytes waiting for the rest of their chunk
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a message is partially assembled
    pub fn is_accumulating(&self) -> bool {
        matches!(self.state, AssemblyState::Accumulating { .. })
    }

    /// Discard buffered bytes, partial messages and sequence state
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = AssemblyState::Idle;
        self.last_sequence_number = None;
    }

    /// Consume `data` and emit the events it completes
    pub fn feed(&mut self, data: &[u8], sink: &mut impl EventSink) {
        self.buffer.extend_from_slice(data);

        loop {
            let header = match MessageHeader::peek(&self.buffer) {
                Ok(header) => header,
                Err(WireError::Incomplete) => break,
                Err(err) => {
                    self.lose_framing(err, sink);
                    break;
                }
            };

            let chunk_length = header.chunk_length as usize;
            if chunk_length < MESSAGE_HEADER_SIZE {
                self.lose_framing(
                    WireError::TooShort {
                        actual: chunk_length,
                        minimum: MESSAGE_HEADER_SIZE,
                    },
                    sink,
                );
                break;
            }
            let receive_buffer = self.limits.receive_buffer_size as usize;
            if receive_buffer != 0 && chunk_length > receive_buffer {
                self.lose_framing(WireError::Size(chunk_length), sink);
                break;
            }
            if self.buffer.len() < chunk_length {
                trace!(
                    "Waiting for {} more bytes of {} chunk",
                    chunk_length - self.buffer.len(),
                    header.message_type
                );
                break;
            }

            let chunk = self.buffer.split_to(chunk_length).freeze();
            self.process_chunk(chunk, sink);
        }
    }

    fn lose_framing(&mut self, err: WireError, sink: &mut impl EventSink) {
        warn!(
            "Discarding {} buffered bytes after framing error: {}",
            self.buffer.len(),
            err
        );
        self.buffer.clear();
        self.fail(err.into(), sink);
    }

    fn fail(&mut self, err: ChannelError, sink: &mut impl EventSink) {
        warn!("Dropping message: {}", err);
        self.state = AssemblyState::Idle;
        sink.emit(ChannelEvent::Error(err));
    }

    fn process_chunk(&mut self, chunk: Bytes, sink: &mut impl EventSink) {
        match self.codec.decode(chunk) {
            Ok(DecodedChunk::Transport(chunk)) => self.process_transport(chunk, sink),
            Ok(DecodedChunk::Secure(chunk)) => self.process_secure(chunk, sink),
            Err(err) => self.fail(err.into(), sink),
        }
    }

    fn decode_body<T: BinaryEncodable>(&self, mut body: Bytes) -> Result<T, ChannelError> {
        let ctx = DecodeContext::new(&self.registry, self.decoding);
        let value = T::decode(&mut body, &ctx)?;
        if !body.is_empty() {
            return Err(ChannelError::Decode(ua_wire::CodecError::Decode(format!(
                "{} trailing bytes",
                body.len()
            ))));
        }
        Ok(value)
    }

    fn process_transport(&mut self, chunk: TransportChunk, sink: &mut impl EventSink) {
        let TransportChunk { message_type, body } = chunk;

        if message_type == MessageType::Error {
            let err = match self.decode_body::<ErrorMessage>(body) {
                Ok(remote) => ChannelError::Remote {
                    status: remote.error,
                    reason: remote.reason,
                },
                Err(err) => err,
            };
            self.fail(err, sink);
            return;
        }

        if self.mode != FramingMode::Handshake {
            sink.emit(ChannelEvent::FullMessageBody(body));
            self.fail(ChannelError::UnexpectedMessage(message_type), sink);
            return;
        }

        let decoded: Result<Box<dyn UaObject>, ChannelError> = match message_type {
            MessageType::Hello => match self.decode_body::<HelloMessage>(body.clone()) {
                Ok(hello) => match self.limits.negotiate(&hello) {
                    Ok(ack) => {
                        self.limits = TransportLimits::acknowledged(&ack);
                        self.acknowledge = Some(ack);
                        Ok(Box::new(hello) as Box<dyn UaObject>)
                    }
                    Err(refusal) => Err(ChannelError::Rejected {
                        status: refusal.error,
                        reason: refusal.reason,
                    }),
                },
                Err(err) => Err(err),
            },
            MessageType::Acknowledge => {
                match self.decode_body::<AcknowledgeMessage>(body.clone()) {
                    Ok(ack) => {
                        self.limits = self.limits.accept(&ack);
                        self.acknowledge = Some(ack.clone());
                        Ok(Box::new(ack) as Box<dyn UaObject>)
                    }
                    Err(err) => Err(err),
                }
            }
            other => Err(ChannelError::UnexpectedMessage(other)),
        };

        match decoded {
            Ok(object) => {
                debug!(
                    "Transport handshake {} accepted, switching to secure framing",
                    message_type
                );
                self.mode = FramingMode::Secure;
                sink.emit(ChannelEvent::FullMessageBody(body));
                sink.emit(ChannelEvent::Message(DecodedMessage {
                    message_type,
                    type_id: ExpandedNodeId::null(),
                    body: object,
                    sequence_number: 0,
                    request_id: 0,
                }));
            }
            Err(err) => self.fail(err, sink),
        }
    }

    fn process_secure(&mut self, chunk: SecureChunk, sink: &mut impl EventSink) {
        let header = &chunk.header;
        let message_type = header.message_type;

        if self.mode == FramingMode::Handshake {
            self.fail(ChannelError::UnexpectedMessage(message_type), sink);
            return;
        }

        if let Some(expected) = self.channel_id {
            // A client's first OPN is sent before it has a channel id
            let unassigned_open = message_type == MessageType::Open && header.channel_id == 0;
            if header.channel_id != expected && !unassigned_open {
                self.fail(
                    ChannelError::ChannelId {
                        expected,
                        found: header.channel_id,
                    },
                    sink,
                );
                return;
            }
        }

        let crypto = match header.security_header.token_id() {
            None => CryptoContext::none(),
            Some(token_id) => match self.tokens.snapshot().lookup(token_id, Instant::now()) {
                Some(active) => active.remote.clone(),
                None => {
                    self.fail(ChannelError::TokenExpired(token_id), sink);
                    return;
                }
            },
        };

        let body = match chunk.open(&crypto) {
            Ok(body) => body,
            Err(err) => {
                self.fail(err.into(), sink);
                return;
            }
        };

        let SequenceHeader {
            sequence_number,
            request_id,
        } = header.sequence_header;
        if !self.check_sequence(sequence_number, sink) {
            return;
        }

        trace!(
            "{}{} chunk seq={} request={} body={}",
            message_type,
            header.chunk_type as u8 as char,
            sequence_number,
            request_id,
            body.len()
        );

        match header.chunk_type {
            ChunkType::Abort => self.process_abort(request_id, body, sink),
            ChunkType::Intermediate => {
                self.accumulate(message_type, request_id, body, sink);
            }
            ChunkType::Final => {
                if self.accumulate(message_type, request_id, body, sink) {
                    self.complete(sequence_number, sink);
                }
            }
        }
    }

    /// Returns false when the chunk must be dropped
    fn check_sequence(&mut self, found: u32, sink: &mut impl EventSink) -> bool {
        let expected = self.last_sequence_number.map(next_sequence_number);
        self.last_sequence_number = Some(found);

        match expected {
            Some(expected) if expected != found => {
                warn!(
                    "Invalid sequence number: expected {}, found {}",
                    expected, found
                );
                sink.emit(ChannelEvent::InvalidSequenceNumber { expected, found });
                match self.sequence_policy {
                    SequencePolicy::Report => true,
                    SequencePolicy::Reject => {
                        self.fail(ChannelError::Sequence { expected, found }, sink);
                        false
                    }
                }
            }
            _ => true,
        }
    }

    fn process_abort(&mut self, request_id: u32, body: Bytes, sink: &mut impl EventSink) {
        let discards_active = match &self.state {
            AssemblyState::Accumulating {
                request_id: active,
                chunks,
                ..
            } if *active == request_id => {
                debug!(
                    "Discarding {} chunk(s) of aborted request {}",
                    chunks.len(),
                    request_id
                );
                true
            }
            AssemblyState::Accumulating { .. } => false,
            AssemblyState::Idle => true,
        };
        let err = match self.decode_body::<ErrorMessage>(body) {
            Ok(abort) => ChannelError::Aborted {
                status: abort.error,
                reason: abort.reason,
            },
            Err(err) => err,
        };
        if discards_active {
            self.fail(err, sink);
        } else {
            // Only the aborted request is dropped; the one in progress continues
            warn!("Request {} aborted: {}", request_id, err);
            sink.emit(ChannelEvent::Error(err));
        }
    }

    /// Add a chunk body to the message in progress; false if it was dropped
    fn accumulate(
        &mut self,
        message_type: MessageType,
        request_id: u32,
        body: Bytes,
        sink: &mut impl EventSink,
    ) -> bool {
        if let AssemblyState::Accumulating {
            message_type: active_type,
            request_id: active,
            ..
        } = &self.state
        {
            if *active != request_id || *active_type != message_type {
                let active = *active;
                self.fail(
                    ChannelError::Interleaved {
                        active,
                        found: request_id,
                    },
                    sink,
                );
            }
        }

        let (count, size) = self.push_chunk(message_type, request_id, body);

        let max_chunks = self.limits.max_chunk_count as usize;
        if max_chunks != 0 && count > max_chunks {
            self.fail(
                ChannelError::Limits(format!(
                    "{} chunks exceed the limit of {}",
                    count, max_chunks
                )),
                sink,
            );
            return false;
        }
        let max_size = self.limits.max_message_size as usize;
        if max_size != 0 && size > max_size {
            self.fail(
                ChannelError::Limits(format!(
                    "{} byte message exceeds the limit of {}",
                    size, max_size
                )),
                sink,
            );
            return false;
        }
        true
    }

    fn push_chunk(
        &mut self,
        message_type: MessageType,
        request_id: u32,
        body: Bytes,
    ) -> (usize, usize) {
        if let AssemblyState::Accumulating { chunks, size, .. } = &mut self.state {
            *size += body.len();
            chunks.push(body);
            return (chunks.len(), *size);
        }
        let size = body.len();
        let mut chunks = SmallVec::new();
        chunks.push(body);
        self.state = AssemblyState::Accumulating {
            message_type,
            request_id,
            chunks,
            size,
        };
        (1, size)
    }

    fn complete(&mut self, sequence_number: u32, sink: &mut impl EventSink) {
        let AssemblyState::Accumulating {
            message_type,
            request_id,
            chunks,
            size,
        } = std::mem::replace(&mut self.state, AssemblyState::Idle)
        else {
            return;
        };

        let full = if chunks.len() == 1 {
            chunks.into_iter().next().unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(size);
            for chunk in &chunks {
                buf.extend_from_slice(chunk);
            }
            buf.freeze()
        };
        debug!(
            "Reassembled {} message for request {} ({} bytes)",
            message_type,
            request_id,
            full.len()
        );

        sink.emit(ChannelEvent::FullMessageBody(full.clone()));
        match self.registry.decode_message(full, self.decoding) {
            Ok((type_id, body)) => sink.emit(ChannelEvent::Message(DecodedMessage {
                message_type,
                type_id,
                body,
                sequence_number,
                request_id,
            })),
            Err(err) => self.fail(err.into(), sink),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::MessageChunker;
    use crate::token::tests::plain_token;
    use crate::token::{ActiveToken, SecurityToken};
    use bytes::BufMut;
    use std::time::Duration;
    use ua_wire::{
        encode_message, encode_transport, ChannelKeys, ChunkType, DateTime, EndpointDescription,
        GetEndpointsResponse, MessageSecurityMode, NodeId, SecureChunkHeader, SecurityHeader,
        SecurityPolicy, StatusCode,
    };

    const CHANNEL_ID: u32 = 11;
    const TOKEN_ID: u32 = 1;

    fn plain_store() -> TokenStore {
        let store = TokenStore::new();
        store.install(plain_token(CHANNEL_ID, TOKEN_ID, Duration::from_secs(60)));
        store
    }

    fn assembler(tokens: TokenStore) -> MessageAssembler {
        let mut assembler = MessageAssembler::new(&ChannelConfig::default(), tokens);
        assembler.set_channel_id(CHANNEL_ID);
        assembler
    }

    fn raw_chunk(
        chunk_type: ChunkType,
        sequence_number: u32,
        request_id: u32,
        body: &[u8],
    ) -> Bytes {
        let header = SecureChunkHeader {
            message_type: MessageType::Message,
            chunk_type,
            channel_id: CHANNEL_ID,
            security_header: SecurityHeader::Symmetric { token_id: TOKEN_ID },
            sequence_header: SequenceHeader {
                sequence_number,
                request_id,
            },
        };
        ChunkCodec::default()
            .encode(&header, body, &CryptoContext::none())
            .unwrap()
    }

    fn endpoints_response() -> GetEndpointsResponse {
        GetEndpointsResponse {
            endpoints: vec![EndpointDescription {
                endpoint_url: "opc.tcp://localhost:4840".into(),
                security_mode: MessageSecurityMode::None,
                security_policy_uri: SecurityPolicy::None.uri().into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_intermediate_and_final_yield_body_then_message() {
        let body = encode_message(&endpoints_response());
        let (first, second) = body.split_at(body.len() / 2);

        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        assembler.feed(&raw_chunk(ChunkType::Intermediate, 1, 4, first), &mut events);
        assert!(events.is_empty());
        assert!(assembler.is_accumulating());
        assembler.feed(&raw_chunk(ChunkType::Final, 2, 4, second), &mut events);

        assert_eq!(events.len(), 2, "{:?}", events);
        match &events[0] {
            ChannelEvent::FullMessageBody(full) => assert_eq!(full, &body),
            other => panic!("expected full body, got {:?}", other),
        }
        match &events[1] {
            ChannelEvent::Message(message) => {
                assert_eq!(message.type_name(), "GetEndpointsResponse");
                assert_eq!(message.type_id.node_id, NodeId::numeric(0, 431));
                assert_eq!(message.request_id, 4);
                assert_eq!(message.sequence_number, 2);
                assert_eq!(
                    message.downcast_ref::<GetEndpointsResponse>(),
                    Some(&endpoints_response())
                );
            }
            other => panic!("expected message, got {:?}", other),
        }
        assert!(!assembler.is_accumulating());
    }

    #[test]
    fn test_byte_at_a_time() {
        let body = encode_message(&endpoints_response());
        let chunk = raw_chunk(ChunkType::Final, 1, 1, &body);
        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        for byte in chunk.iter() {
            assembler.feed(&[*byte], &mut events);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ChannelEvent::Message(_)));
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_duplicate_sequence_number_reported() {
        let body = encode_message(&endpoints_response());
        let (first, second) = body.split_at(10);
        let mut stream = BytesMut::new();
        stream.put_slice(&raw_chunk(ChunkType::Intermediate, 5, 2, &first[..5]));
        stream.put_slice(&raw_chunk(ChunkType::Intermediate, 5, 2, &first[5..]));
        stream.put_slice(&raw_chunk(ChunkType::Final, 6, 2, second));

        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        assembler.feed(&stream, &mut events);

        assert!(matches!(
            events[0],
            ChannelEvent::InvalidSequenceNumber {
                expected: 6,
                found: 5
            }
        ));
        assert!(matches!(events[1], ChannelEvent::FullMessageBody(_)));
        assert!(matches!(events[2], ChannelEvent::Message(_)));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_reject_policy_drops_message() {
        let config = ChannelConfig {
            sequence_policy: SequencePolicy::Reject,
            ..ChannelConfig::default()
        };
        let mut assembler = MessageAssembler::new(&config, plain_store());
        let body = encode_message(&endpoints_response());
        let mut events = Vec::new();
        assembler.feed(&raw_chunk(ChunkType::Final, 1, 1, &body), &mut events);
        assembler.feed(&raw_chunk(ChunkType::Final, 3, 2, &body), &mut events);
        assert_eq!(events.len(), 4);
        assert!(matches!(
            events[2],
            ChannelEvent::InvalidSequenceNumber {
                expected: 2,
                found: 3
            }
        ));
        assert!(matches!(
            events[3],
            ChannelEvent::Error(ChannelError::Sequence { .. })
        ));
    }

    #[test]
    fn test_sequence_wraps_to_one() {
        let body = encode_message(&endpoints_response());
        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        assembler.feed(&raw_chunk(ChunkType::Final, u32::MAX, 1, &body), &mut events);
        assembler.feed(&raw_chunk(ChunkType::Final, 1, 2, &body), &mut events);
        assert!(events
            .iter()
            .all(|event| !matches!(event, ChannelEvent::InvalidSequenceNumber { .. })));
    }

    #[test]
    fn test_hello_where_secure_expected_is_an_error() {
        let hello = TransportLimits::default().hello("opc.tcp://localhost:4840");
        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        assembler.feed(&encode_transport(&hello), &mut events);
        assert!(events
            .iter()
            .all(|event| !matches!(event, ChannelEvent::Message(_))));
        assert!(matches!(
            events.last(),
            Some(ChannelEvent::Error(ChannelError::UnexpectedMessage(
                MessageType::Hello
            )))
        ));
    }

    #[test]
    fn test_handshake_mode() {
        let client_limits = TransportLimits {
            receive_buffer_size: 16_384,
            send_buffer_size: 8192,
            ..TransportLimits::default()
        };
        let mut server = MessageAssembler::new(&ChannelConfig::default(), TokenStore::new())
            .with_mode(FramingMode::Handshake);
        let mut events = Vec::new();

        // Secured chunks are refused until the handshake completes
        server.feed(&raw_chunk(ChunkType::Final, 1, 1, b"x"), &mut events);
        assert!(matches!(
            events.pop(),
            Some(ChannelEvent::Error(ChannelError::UnexpectedMessage(
                MessageType::Message
            )))
        ));

        server.feed(
            &encode_transport(&client_limits.hello("opc.tcp://localhost:4840")),
            &mut events,
        );
        assert_eq!(server.mode(), FramingMode::Secure);
        assert_eq!(server.limits().receive_buffer_size, 8192);
        assert_eq!(server.limits().send_buffer_size, 16_384);
        let ack = server.acknowledge().cloned().unwrap();
        assert_eq!(ack.receive_buffer_size, 8192);
        assert_eq!(ack.send_buffer_size, 16_384);
        assert_eq!(TransportLimits::acknowledged(&ack), *server.limits());
        match events.last() {
            Some(ChannelEvent::Message(message)) => {
                assert_eq!(message.type_name(), "HelloMessage");
                assert_eq!(message.message_type, MessageType::Hello);
            }
            other => panic!("expected hello, got {:?}", other),
        }
    }

    #[test]
    fn test_acknowledge_received() {
        let ack = AcknowledgeMessage {
            protocol_version: 0,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
            max_message_size: 0,
            max_chunk_count: 0,
        };
        let mut client = assembler(plain_store()).with_mode(FramingMode::Handshake);
        assert!(client.acknowledge().is_none());

        let mut events = Vec::new();
        client.feed(&encode_transport(&ack), &mut events);
        assert_eq!(client.mode(), FramingMode::Secure);
        assert_eq!(client.acknowledge(), Some(&ack));
        assert!(matches!(events.last(), Some(ChannelEvent::Message(_))));
    }

    #[test]
    fn test_error_message_reported() {
        let mut assembler = assembler(plain_store()).with_mode(FramingMode::Handshake);
        let mut events = Vec::new();
        assembler.feed(
            &encode_transport(&ErrorMessage::new(StatusCode::BAD_TIMEOUT, "gone")),
            &mut events,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChannelEvent::Error(err) => {
                assert_eq!(
                    err,
                    &ChannelError::Remote {
                        status: StatusCode::BAD_TIMEOUT,
                        reason: "gone".into()
                    }
                );
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_abort_discards_partial_message() {
        let body = encode_message(&endpoints_response());
        let mut abort = BytesMut::new();
        StatusCode::BAD_REQUEST_INTERRUPTED.encode(&mut abort);
        "cancelled".to_string().encode(&mut abort);

        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        assembler.feed(&raw_chunk(ChunkType::Intermediate, 1, 7, &body[..8]), &mut events);
        assembler.feed(&raw_chunk(ChunkType::Abort, 2, 7, &abort), &mut events);
        assert!(!assembler.is_accumulating());
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChannelEvent::Error(err) => {
                assert_eq!(err.status_code(), StatusCode::BAD_REQUEST_INTERRUPTED);
                assert!(matches!(err, ChannelError::Aborted { reason, .. } if reason == "cancelled"));
            }
            other => panic!("expected abort error, got {:?}", other),
        }

        // The next message assembles normally
        assembler.feed(&raw_chunk(ChunkType::Final, 3, 8, &body), &mut events);
        assert!(matches!(events.last(), Some(ChannelEvent::Message(_))));
    }

    #[test]
    fn test_abort_of_other_request_keeps_partial_message() {
        let body = encode_message(&endpoints_response());
        let (first, second) = body.split_at(body.len() / 2);
        let mut abort = BytesMut::new();
        StatusCode::BAD_REQUEST_INTERRUPTED.encode(&mut abort);
        "cancelled".to_string().encode(&mut abort);

        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        assembler.feed(&raw_chunk(ChunkType::Intermediate, 1, 7, first), &mut events);
        assembler.feed(&raw_chunk(ChunkType::Abort, 2, 9, &abort), &mut events);
        assert!(assembler.is_accumulating());
        assert!(matches!(
            events.as_slice(),
            [ChannelEvent::Error(ChannelError::Aborted { .. })]
        ));

        assembler.feed(&raw_chunk(ChunkType::Final, 3, 7, second), &mut events);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], ChannelEvent::FullMessageBody(_)));
        match &events[2] {
            ChannelEvent::Message(message) => assert_eq!(message.request_id, 7),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_token_rejected() {
        let body = encode_message(&endpoints_response());
        let mut assembler = assembler(TokenStore::new());
        let mut events = Vec::new();
        assembler.feed(&raw_chunk(ChunkType::Final, 1, 1, &body), &mut events);
        assert!(matches!(
            events.as_slice(),
            [ChannelEvent::Error(ChannelError::TokenExpired(TOKEN_ID))]
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let store = TokenStore::new();
        store.install(plain_token(CHANNEL_ID, TOKEN_ID, Duration::ZERO));
        let body = encode_message(&endpoints_response());
        let mut assembler = assembler(store);
        let mut events = Vec::new();
        assembler.feed(&raw_chunk(ChunkType::Final, 1, 1, &body), &mut events);
        assert!(matches!(
            events.as_slice(),
            [ChannelEvent::Error(ChannelError::TokenExpired(TOKEN_ID))]
        ));
    }

    #[test]
    fn test_wrong_channel_rejected() {
        let body = encode_message(&endpoints_response());
        let mut assembler = assembler(plain_store());
        assembler.set_channel_id(CHANNEL_ID + 1);
        let mut events = Vec::new();
        assembler.feed(&raw_chunk(ChunkType::Final, 1, 1, &body), &mut events);
        assert!(matches!(
            events.as_slice(),
            [ChannelEvent::Error(ChannelError::ChannelId { .. })]
        ));
    }

    #[test]
    fn test_unknown_type_reported_after_body() {
        let mut body = BytesMut::new();
        NodeId::numeric(0, 9999).encode(&mut body);
        body.put_u32_le(1);
        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        assembler.feed(&raw_chunk(ChunkType::Final, 1, 1, &body), &mut events);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChannelEvent::FullMessageBody(_)));
        assert!(matches!(
            &events[1],
            ChannelEvent::Error(ChannelError::UnknownType(id)) if id == "i=9999"
        ));
    }

    #[test]
    fn test_decode_failure_reported() {
        // Known type id, truncated body
        let body = encode_message(&endpoints_response());
        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        assembler.feed(&raw_chunk(ChunkType::Final, 1, 1, &body[..6]), &mut events);
        assert!(matches!(
            events.last(),
            Some(ChannelEvent::Error(ChannelError::Decode(_)))
        ));
    }

    #[test]
    fn test_interleaved_request_abandons_previous() {
        let body = encode_message(&endpoints_response());
        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        assembler.feed(&raw_chunk(ChunkType::Intermediate, 1, 1, &body[..8]), &mut events);
        assembler.feed(&raw_chunk(ChunkType::Final, 2, 2, &body), &mut events);
        assert!(matches!(
            events[0],
            ChannelEvent::Error(ChannelError::Interleaved {
                active: 1,
                found: 2
            })
        ));
        match events.last() {
            Some(ChannelEvent::Message(message)) => assert_eq!(message.request_id, 2),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_chunk_count_limit() {
        let config = ChannelConfig {
            limits: TransportLimits {
                max_chunk_count: 2,
                ..TransportLimits::default()
            },
            ..ChannelConfig::default()
        };
        let mut assembler = MessageAssembler::new(&config, plain_store());
        let mut events = Vec::new();
        for seq in 1..=3 {
            assembler.feed(&raw_chunk(ChunkType::Intermediate, seq, 1, b"part"), &mut events);
        }
        assert!(matches!(
            events.as_slice(),
            [ChannelEvent::Error(ChannelError::Limits(_))]
        ));
        assert!(!assembler.is_accumulating());
    }

    #[test]
    fn test_corrupt_header_discards_stream() {
        let body = encode_message(&endpoints_response());
        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        assembler.feed(b"XYZF\x10\x00\x00\x00garbage!", &mut events);
        assert!(matches!(
            events.as_slice(),
            [ChannelEvent::Error(ChannelError::Frame(WireError::MessageType(_)))]
        ));
        assert_eq!(assembler.buffered(), 0);

        // A fresh stream after the error is read normally
        assembler.feed(&raw_chunk(ChunkType::Final, 1, 1, &body), &mut events);
        assert!(matches!(events.last(), Some(ChannelEvent::Message(_))));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut assembler = assembler(plain_store());
        let mut events = Vec::new();
        assembler.feed(b"MSGF\xff\xff\xff\x00", &mut events);
        assert!(matches!(
            events.as_slice(),
            [ChannelEvent::Error(ChannelError::Frame(WireError::Size(_)))]
        ));
    }

    fn secured_pair(mode: MessageSecurityMode) -> (CryptoContext, TokenStore) {
        let client_nonce = [5u8; 32];
        let server_nonce = [6u8; 32];
        let sender = ChannelKeys::derive(&client_nonce, &server_nonce).unwrap();
        let receiver = ChannelKeys::derive(&client_nonce, &server_nonce).unwrap();
        let policy = SecurityPolicy::ChaCha20Poly1305Sha256;
        let local = CryptoContext::new(policy, mode, Some(sender.server)).unwrap();
        let store = TokenStore::new();
        store.install(ActiveToken {
            token: SecurityToken {
                channel_id: CHANNEL_ID,
                token_id: TOKEN_ID,
                created_at: DateTime::now(),
                revised_lifetime: Duration::from_secs(60),
                installed_at: Instant::now(),
            },
            local: CryptoContext::none(),
            remote: CryptoContext::new(policy, mode, Some(receiver.server)).unwrap(),
        });
        (local, store)
    }

    #[test]
    fn test_encrypted_multi_chunk_roundtrip() {
        let (crypto, store) = secured_pair(MessageSecurityMode::SignAndEncrypt);
        let mut chunker = MessageChunker::new(TransportLimits {
            send_buffer_size: 8192,
            ..TransportLimits::default()
        });
        let response = GetEndpointsResponse {
            endpoints: vec![endpoints_response().endpoints[0].clone(); 200],
            ..Default::default()
        };
        let chunks = chunker
            .encode_message(
                MessageType::Message,
                CHANNEL_ID,
                &SecurityHeader::Symmetric { token_id: TOKEN_ID },
                42,
                &response,
                &crypto,
            )
            .unwrap();
        assert!(chunks.len() > 1);

        let mut assembler = assembler(store);
        let mut events = Vec::new();
        for chunk in &chunks {
            assembler.feed(chunk, &mut events);
        }
        assert_eq!(events.len(), 2, "{:?}", events);
        match &events[1] {
            ChannelEvent::Message(message) => {
                assert_eq!(message.request_id, 42);
                assert_eq!(message.downcast_ref::<GetEndpointsResponse>(), Some(&response));
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_tampered_chunk_dropped() {
        let (crypto, store) = secured_pair(MessageSecurityMode::Sign);
        let mut chunker = MessageChunker::new(TransportLimits::default());
        let chunks = chunker
            .encode_message(
                MessageType::Message,
                CHANNEL_ID,
                &SecurityHeader::Symmetric { token_id: TOKEN_ID },
                1,
                &endpoints_response(),
                &crypto,
            )
            .unwrap();
        let mut tampered = BytesMut::from(&chunks[0][..]);
        tampered[30] ^= 0xFF;

        let mut assembler = assembler(store);
        let mut events = Vec::new();
        assembler.feed(&tampered, &mut events);
        assert!(matches!(
            events.as_slice(),
            [ChannelEvent::Error(ChannelError::Security(_))]
        ));
    }

    #[test]
    fn test_custom_registry() {
        let mut registry = TypeRegistry::new();
        registry.register::<GetEndpointsResponse>().unwrap();
        let mut assembler = assembler(plain_store()).with_registry(Arc::new(registry));
        let mut events = Vec::new();
        let request = ua_wire::GetEndpointsRequest::default();
        assembler.feed(
            &raw_chunk(ChunkType::Final, 1, 1, &encode_message(&request)),
            &mut events,
        );
        assert!(matches!(
            events.last(),
            Some(ChannelEvent::Error(ChannelError::UnknownType(_)))
        ));
    }
}
