//! Wire protocol error types.

use thiserror::Error;

/// Chunk framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete chunk (need more data)
    #[error("incomplete chunk")]
    Incomplete,

    /// Buffer is shorter than the minimum header for its message type
    #[error("chunk too short: {actual} bytes, need at least {minimum}")]
    TooShort {
        /// Bytes available
        actual: usize,
        /// Minimum header size for the message type
        minimum: usize,
    },

    /// Declared chunk length disagrees with the delivered byte count
    #[error("chunk length mismatch: header declares {declared}, buffer holds {actual}")]
    LengthMismatch {
        /// Length declared in the message header
        declared: usize,
        /// Length of the buffer handed to the decoder
        actual: usize,
    },

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown message type tag
    #[error("unknown message type {0:?}")]
    MessageType([u8; 3]),

    /// Unknown chunk indicator
    #[error("unknown chunk indicator 0x{0:02x}")]
    ChunkType(u8),

    /// Transport handshake messages cannot be split into chunks
    #[error("{0} messages must be sent as a single final chunk")]
    NotFinal(&'static str),

    /// Malformed security header
    #[error("malformed security header: {0}")]
    SecurityHeader(&'static str),

    /// Malformed chunk structure
    #[error("malformed chunk")]
    Malformed,

    /// Endpoint URL does not parse
    #[error("invalid endpoint url {0:?}")]
    EndpointUrl(String),
}

/// Object encoding, decoding and registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No type registered under this identifier
    #[error("unknown type id {0}")]
    UnknownType(String),

    /// A second registration for an identifier already in the registry
    #[error("type id {id} already registered for {existing}")]
    DuplicateType {
        /// Identifier of the rejected registration
        id: String,
        /// Name of the type already holding the identifier
        existing: &'static str,
    },

    /// Ran out of bytes while decoding
    #[error("unexpected end of buffer reading {0}")]
    Eof(&'static str),

    /// A decoded value violates its encoding rules
    #[error("decoding error: {0}")]
    Decode(String),

    /// A length, count or depth limit was exceeded
    #[error("encoding limits exceeded: {0}")]
    Limits(String),
}

/// Message security errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Signature did not match the signed bytes
    #[error("signature mismatch")]
    SignatureMismatch,

    /// Authenticated decryption failed
    #[error("decryption failed")]
    DecryptFailed,

    /// Encryption failed
    #[error("encryption failed")]
    EncryptFailed,

    /// Padding bytes are inconsistent
    #[error("invalid padding")]
    InvalidPadding,

    /// Protected payload is too short to carry the expected trailer
    #[error("protected payload too short: {0} bytes")]
    Truncated(usize),

    /// Key material has the wrong length
    #[error("invalid key length: {0}")]
    KeyLength(usize),

    /// Security policy URI not supported
    #[error("unsupported security policy {0}")]
    UnsupportedPolicy(String),

    /// Security mode incompatible with the policy
    #[error("security mode {mode} not allowed with policy {policy}")]
    ModeRejected {
        /// Requested mode
        mode: &'static str,
        /// Policy URI
        policy: &'static str,
    },
}
