//! Channel error types.

use thiserror::Error;
use ua_wire::{CodecError, MessageType, SecurityError, StatusCode, WireError};

/// Errors surfaced by the assembler, chunker and channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Malformed chunk header, length mismatch or unknown tag
    #[error("frame error: {0}")]
    Frame(#[from] WireError),

    /// Signature or decryption failure
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// Final body names an unregistered type
    #[error("unknown type {0}")]
    UnknownType(String),

    /// Body of a registered type failed to decode
    #[error("decode error: {0}")]
    Decode(CodecError),

    /// Sequence number did not follow the previous one
    #[error("invalid sequence number: expected {expected}, found {found}")]
    Sequence {
        /// Next number in sequence
        expected: u32,
        /// Number carried by the chunk
        found: u32,
    },

    /// Token id matches neither the current nor the previous token
    #[error("security token {0} expired or unknown")]
    TokenExpired(u32),

    /// A chunk for another request arrived while a message was being assembled
    #[error("request {found} interleaved with request {active}")]
    Interleaved {
        /// Request being assembled
        active: u32,
        /// Request of the arriving chunk
        found: u32,
    },

    /// The sender abandoned a message
    #[error("message aborted: {status} {reason}")]
    Aborted {
        /// Status carried by the abort chunk
        status: StatusCode,
        /// Reason carried by the abort chunk
        reason: String,
    },

    /// The peer sent an ERR message
    #[error("remote error: {status} {reason}")]
    Remote {
        /// Status carried by the ERR message
        status: StatusCode,
        /// Reason carried by the ERR message
        reason: String,
    },

    /// A message type that is not allowed in the current framing mode
    #[error("unexpected {0} message")]
    UnexpectedMessage(MessageType),

    /// Message size or chunk count limit exceeded
    #[error("limits exceeded: {0}")]
    Limits(String),

    /// Chunk addressed to another channel
    #[error("channel id mismatch: expected {expected}, found {found}")]
    ChannelId {
        /// Id of this channel
        expected: u32,
        /// Id carried by the chunk
        found: u32,
    },

    /// The peer refused an open request
    #[error("open rejected: {status} {reason}")]
    Rejected {
        /// Status of the refusal
        status: StatusCode,
        /// Human readable reason
        reason: String,
    },

    /// Operation on a closed channel
    #[error("secure channel closed")]
    Closed,

    /// Open or renew could not complete
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl From<CodecError> for ChannelError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnknownType(id) => ChannelError::UnknownType(id),
            other => ChannelError::Decode(other),
        }
    }
}

impl ChannelError {
    /// Status code reported to the peer for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChannelError::Frame(WireError::MessageType(_)) => {
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID
            }
            ChannelError::Frame(WireError::Size(_)) => StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
            ChannelError::Frame(WireError::EndpointUrl(_)) => {
                StatusCode::BAD_TCP_ENDPOINT_URL_INVALID
            }
            ChannelError::Frame(_) => StatusCode::BAD_DECODING_ERROR,
            ChannelError::Security(SecurityError::UnsupportedPolicy(_)) => {
                StatusCode::BAD_SECURITY_POLICY_REJECTED
            }
            ChannelError::Security(SecurityError::ModeRejected { .. }) => {
                StatusCode::BAD_SECURITY_MODE_REJECTED
            }
            ChannelError::Security(_) => StatusCode::BAD_SECURITY_CHECKS_FAILED,
            ChannelError::UnknownType(_) => StatusCode::BAD_DATA_TYPE_ID_UNKNOWN,
            ChannelError::Decode(CodecError::Limits(_)) => {
                StatusCode::BAD_ENCODING_LIMITS_EXCEEDED
            }
            ChannelError::Decode(_) => StatusCode::BAD_DECODING_ERROR,
            ChannelError::Sequence { .. } | ChannelError::Interleaved { .. } => {
                StatusCode::BAD_SEQUENCE_NUMBER_INVALID
            }
            ChannelError::TokenExpired(_) => StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN,
            ChannelError::Aborted { status, .. }
            | ChannelError::Remote { status, .. }
            | ChannelError::Rejected { status, .. } => *status,
            ChannelError::UnexpectedMessage(_) => StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
            ChannelError::Limits(_) => StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
            ChannelError::ChannelId { .. } => StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN,
            ChannelError::Closed => StatusCode::BAD_SECURE_CHANNEL_CLOSED,
            ChannelError::Handshake(_) => StatusCode::BAD_REQUEST_INTERRUPTED,
        }
    }
}
