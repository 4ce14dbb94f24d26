//! Binary encoding, chunk framing, type registry and message security for the
//! UA secure channel.
//!
//! This crate is the synchronous, I/O-free half of the channel stack: it knows
//! how values, messages and chunks look on the wire and how chunks are signed
//! and encrypted, but it keeps no per-channel state.
//!
//! ## Features
//!
//! - **Binary Encoding**: little-endian primitives, strings, arrays, NodeIds
//!   and self-describing extension objects, decoded under explicit limits
//! - **Type Registry**: encoding id to decoder map, populated once
//! - **Chunk Codec**: byte-exact chunk headers with strict length checks
//! - **Message Security**: HMAC-SHA256 signatures and AEAD encryption with
//!   keys derived from the exchanged nonces
//! - **Zero-Copy I/O**: bodies and byte strings stay `Bytes` slices of the
//!   received chunk
//!
//! ## Wire Format
//!
//! ```text
//! +--------------------------+------------------------------------+
//! | "MSG" / "OPN" / "CLO"    | 3-byte message type                |
//! +--------------------------+------------------------------------+
//! | 'C' / 'F' / 'A'          | chunk indicator                    |
//! +--------------------------+------------------------------------+
//! | u32 chunk_length         | total length including this header |
//! +--------------------------+------------------------------------+
//! | u32 channel_id           | secure channel id                  |
//! +--------------------------+------------------------------------+
//! | security header          | token id, or policy + certificates |
//! +--------------------------+------------------------------------+
//! | u32 sequence_number      |                                    |
//! | u32 request_id           |                                    |
//! +--------------------------+------------------------------------+
//! | body | padding | sig     | encrypted in SignAndEncrypt        |
//! +--------------------------+------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

#[macro_use]
mod macros;

pub mod chunk;
pub mod crypto;
pub mod encoding;
pub mod endpoint;
pub mod error;
pub mod extension_object;
pub mod handshake;
pub mod header;
pub mod messages;
pub mod node_id;
pub mod registry;
pub mod status;
pub mod types;

// Re-export main types
pub use chunk::{ChunkCodec, DecodedChunk, SecureChunk, SecureChunkHeader, TransportChunk};
pub use crypto::{
    generate_nonce, p_sha256, ChannelKeys, CryptoContext, SecurityPolicy, SymmetricKeys,
    SIGNATURE_SIZE, TAG_SIZE,
};
pub use encoding::{encode_to_bytes, BinaryEncodable, DateTime, DecodeContext, DecodingLimits};
pub use endpoint::{parse_endpoint_url, EndpointUrl, DEFAULT_PORT};
pub use error::{CodecError, SecurityError, WireError};
pub use extension_object::ExtensionObject;
pub use handshake::{
    encode_transport, AcknowledgeMessage, ErrorMessage, HelloMessage, TransportLimits,
    TransportMessage, PROTOCOL_VERSION,
};
pub use header::{
    AsymmetricSecurityHeader, ChunkType, MessageHeader, MessageType, SecurityHeader,
    SequenceHeader, MESSAGE_HEADER_SIZE, SEQUENCE_HEADER_SIZE,
};
pub use messages::{
    ChannelSecurityToken, CloseSecureChannelRequest, CloseSecureChannelResponse,
    GetEndpointsRequest, GetEndpointsResponse, OpenSecureChannelRequest,
    OpenSecureChannelResponse, ServiceFault,
};
pub use node_id::{ExpandedNodeId, Identifier, NodeId};
pub use registry::{
    encode_message, standard_registry, Structure, TypeDescriptor, TypeRegistry, UaObject,
};
pub use status::StatusCode;
pub use types::{
    ApplicationDescription, ApplicationType, DiagnosticInfo, EndpointDescription, LocalizedText,
    MessageSecurityMode, RequestHeader, ResponseHeader, SecurityTokenRequestType,
    UserTokenPolicy, UserTokenType,
};
