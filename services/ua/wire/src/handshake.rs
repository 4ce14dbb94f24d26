//! Transport handshake messages.
//!
//! HEL, ACK and ERR travel as single unsecured chunks. The hello carries the
//! client's buffer limits; the acknowledge answers with the negotiated ones.

use crate::chunk::ChunkCodec;
use crate::encoding::encode_to_bytes;
use crate::endpoint::parse_endpoint_url;
use crate::header::MessageType;
use crate::registry::Structure;
use crate::status::StatusCode;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this stack
pub const PROTOCOL_VERSION: u32 = 0;

/// Smallest buffer size a peer may announce
pub const MIN_BUFFER_SIZE: u32 = 8192;

/// Longest accepted endpoint URL
pub const MAX_ENDPOINT_URL_LENGTH: usize = 4096;

/// Messages exchanged before a secure channel exists
pub trait TransportMessage: Structure {
    /// Message type tag of the carrying chunk
    const MESSAGE_TYPE: MessageType;
}

ua_struct! {
    /// Client hello
    pub struct HelloMessage {
        /// Client protocol version
        pub protocol_version: u32,
        /// Largest chunk the client can receive
        pub receive_buffer_size: u32,
        /// Largest chunk the client will send
        pub send_buffer_size: u32,
        /// Largest message the client accepts, 0 for no limit
        pub max_message_size: u32,
        /// Most chunks per message the client accepts, 0 for no limit
        pub max_chunk_count: u32,
        /// Endpoint the client wants to reach
        pub endpoint_url: String,
    }
}

ua_struct! {
    /// Server acknowledge carrying the negotiated limits
    pub struct AcknowledgeMessage {
        /// Server protocol version
        pub protocol_version: u32,
        /// Largest chunk the server can receive
        pub receive_buffer_size: u32,
        /// Largest chunk the server will send
        pub send_buffer_size: u32,
        /// Largest message the server accepts, 0 for no limit
        pub max_message_size: u32,
        /// Most chunks per message the server accepts, 0 for no limit
        pub max_chunk_count: u32,
    }
}

ua_struct! {
    /// Transport error; the sender closes the connection afterwards
    pub struct ErrorMessage {
        /// Failure status
        pub error: StatusCode,
        /// Human readable reason
        pub reason: String,
    }
}

impl ErrorMessage {
    /// Error with `status` and `reason`
    pub fn new(error: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            error,
            reason: reason.into(),
        }
    }
}

// Transport messages carry no encoding id
impl Structure for HelloMessage {
    const TYPE_NAME: &'static str = "HelloMessage";
    const ENCODING_ID: u32 = 0;
}

impl Structure for AcknowledgeMessage {
    const TYPE_NAME: &'static str = "AcknowledgeMessage";
    const ENCODING_ID: u32 = 0;
}

impl Structure for ErrorMessage {
    const TYPE_NAME: &'static str = "ErrorMessage";
    const ENCODING_ID: u32 = 0;
}

impl TransportMessage for HelloMessage {
    const MESSAGE_TYPE: MessageType = MessageType::Hello;
}

impl TransportMessage for AcknowledgeMessage {
    const MESSAGE_TYPE: MessageType = MessageType::Acknowledge;
}

impl TransportMessage for ErrorMessage {
    const MESSAGE_TYPE: MessageType = MessageType::Error;
}

/// Pack a transport message into a single final chunk
pub fn encode_transport<T: TransportMessage>(message: &T) -> Bytes {
    ChunkCodec::encode_transport(T::MESSAGE_TYPE, &encode_to_bytes(message))
}

/// Local buffer and message limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportLimits {
    /// Largest chunk accepted
    pub receive_buffer_size: u32,
    /// Largest chunk sent
    pub send_buffer_size: u32,
    /// Largest reassembled message, 0 for no limit
    pub max_message_size: u32,
    /// Most chunks per message, 0 for no limit
    pub max_chunk_count: u32,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            receive_buffer_size: 65_536,
            send_buffer_size: 65_536,
            max_message_size: 16 * 1024 * 1024,
            max_chunk_count: 4096,
        }
    }
}

/// Smaller of two limits where 0 means unlimited
fn min_limit(a: u32, b: u32) -> u32 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}

impl TransportLimits {
    /// Hello announcing these limits
    pub fn hello(&self, endpoint_url: impl Into<String>) -> HelloMessage {
        HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: self.receive_buffer_size,
            send_buffer_size: self.send_buffer_size,
            max_message_size: self.max_message_size,
            max_chunk_count: self.max_chunk_count,
            endpoint_url: endpoint_url.into(),
        }
    }

    /// Server side: answer a hello with the negotiated limits, or with the
    /// error to send back
    pub fn negotiate(&self, hello: &HelloMessage) -> Result<AcknowledgeMessage, ErrorMessage> {
        if hello.receive_buffer_size < MIN_BUFFER_SIZE || hello.send_buffer_size < MIN_BUFFER_SIZE
        {
            return Err(ErrorMessage::new(
                StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
                format!("buffer sizes must be at least {}", MIN_BUFFER_SIZE),
            ));
        }
        if hello.endpoint_url.len() > MAX_ENDPOINT_URL_LENGTH
            || parse_endpoint_url(&hello.endpoint_url).is_err()
        {
            return Err(ErrorMessage::new(
                StatusCode::BAD_TCP_ENDPOINT_URL_INVALID,
                format!("invalid endpoint url {:?}", hello.endpoint_url),
            ));
        }
        Ok(AcknowledgeMessage {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: self.receive_buffer_size.min(hello.send_buffer_size),
            send_buffer_size: self.send_buffer_size.min(hello.receive_buffer_size),
            max_message_size: min_limit(self.max_message_size, hello.max_message_size),
            max_chunk_count: min_limit(self.max_chunk_count, hello.max_chunk_count),
        })
    }

    /// Server side: limits in force after sending `ack`
    pub fn acknowledged(ack: &AcknowledgeMessage) -> Self {
        Self {
            receive_buffer_size: ack.receive_buffer_size,
            send_buffer_size: ack.send_buffer_size,
            max_message_size: ack.max_message_size,
            max_chunk_count: ack.max_chunk_count,
        }
    }

    /// Client side: limits in force after receiving `ack`
    pub fn accept(&self, ack: &AcknowledgeMessage) -> Self {
        Self {
            receive_buffer_size: self.receive_buffer_size.min(ack.send_buffer_size),
            send_buffer_size: self.send_buffer_size.min(ack.receive_buffer_size),
            max_message_size: min_limit(self.max_message_size, ack.max_message_size),
            max_chunk_count: min_limit(self.max_chunk_count, ack.max_chunk_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::DecodedChunk;
    use crate::encoding::{BinaryEncodable, DecodeContext, DecodingLimits};
    use crate::registry::standard_registry;

    #[test]
    fn test_hello_wire_format() {
        let hello = HelloMessage {
            protocol_version: 0,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
            max_message_size: 100_000,
            max_chunk_count: 600_000,
            endpoint_url: "opc.tcp://localhost:48010".into(),
        };
        let bytes = encode_transport(&hello);
        assert_eq!(&bytes[..4], b"HELF");
        assert_eq!(bytes.len(), 8 + 20 + 4 + 25);
        assert_eq!(
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize,
            bytes.len()
        );

        let chunk = ChunkCodec::default().decode(bytes).unwrap();
        let DecodedChunk::Transport(chunk) = chunk else {
            panic!("expected transport chunk");
        };
        let ctx = DecodeContext::new(standard_registry(), DecodingLimits::default());
        let mut body = chunk.body;
        assert_eq!(HelloMessage::decode(&mut body, &ctx).unwrap(), hello);
    }

    #[test]
    fn test_negotiate_takes_minimums() {
        let server = TransportLimits::default();
        let client = TransportLimits {
            receive_buffer_size: 16_384,
            send_buffer_size: 8192,
            max_message_size: 0,
            max_chunk_count: 10,
        };
        let ack = server
            .negotiate(&client.hello("opc.tcp://localhost:4840"))
            .unwrap();
        assert_eq!(ack.receive_buffer_size, 8192);
        assert_eq!(ack.send_buffer_size, 16_384);
        assert_eq!(ack.max_message_size, server.max_message_size);
        assert_eq!(ack.max_chunk_count, 10);

        let server_side = TransportLimits::acknowledged(&ack);
        let client_side = client.accept(&ack);
        assert_eq!(client_side.send_buffer_size, server_side.receive_buffer_size);
        assert_eq!(client_side.receive_buffer_size, server_side.send_buffer_size);
    }

    #[test]
    fn test_negotiate_rejects_small_buffers() {
        let client = TransportLimits {
            receive_buffer_size: 1024,
            ..TransportLimits::default()
        };
        let err = TransportLimits::default()
            .negotiate(&client.hello("opc.tcp://localhost:4840"))
            .unwrap_err();
        assert_eq!(err.error, StatusCode::BAD_TCP_MESSAGE_TOO_LARGE);
    }

    #[test]
    fn test_negotiate_rejects_bad_endpoint() {
        let hello = TransportLimits::default().hello("foo@baz.bar://mymachine:4841");
        let err = TransportLimits::default().negotiate(&hello).unwrap_err();
        assert_eq!(err.error, StatusCode::BAD_TCP_ENDPOINT_URL_INVALID);
    }

    #[test]
    fn test_error_message_encoding() {
        let bytes = encode_transport(&ErrorMessage::new(
            StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
            "bad",
        ));
        assert_eq!(&bytes[..4], b"ERRF");
        assert_eq!(&bytes[8..12], &0x807E_0000u32.to_le_bytes());
        assert_eq!(&bytes[12..], b"\x03\x00\x00\x00bad");
    }
}
