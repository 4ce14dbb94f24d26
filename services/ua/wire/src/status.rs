//! Protocol status codes.

use crate::encoding::{ensure, BinaryEncodable, DecodeContext};
use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// 32-bit status code; the top two bits carry severity
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusCode(pub u32);

macro_rules! status_codes {
    ($($name:ident = $value:literal, $text:literal;)*) => {
        impl StatusCode {
            $(
                #[doc = $text]
                pub const $name: StatusCode = StatusCode($value);
            )*

            /// Symbolic name for known codes
            pub fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($value => Some(stringify!($name)),)*
                    _ => None,
                }
            }
        }
    };
}

status_codes! {
    GOOD = 0x0000_0000, "The operation succeeded.";
    BAD_UNEXPECTED_ERROR = 0x8001_0000, "An unexpected error occurred.";
    BAD_INTERNAL_ERROR = 0x8002_0000, "An internal error occurred.";
    BAD_ENCODING_ERROR = 0x8006_0000, "Encoding halted because of invalid data in the objects being serialized.";
    BAD_DECODING_ERROR = 0x8007_0000, "Decoding halted because of invalid data in the stream.";
    BAD_ENCODING_LIMITS_EXCEEDED = 0x8008_0000, "The message encoding/decoding limits imposed by the stack have been exceeded.";
    BAD_TIMEOUT = 0x800A_0000, "The operation timed out.";
    BAD_DATA_TYPE_ID_UNKNOWN = 0x8011_0000, "The extension object cannot be (de)serialized because the data type id is not recognized.";
    BAD_SECURITY_CHECKS_FAILED = 0x8013_0000, "An error occurred verifying security.";
    BAD_NONCE_INVALID = 0x8024_0000, "The nonce does appear to be not a random value or it is not the correct length.";
    BAD_REQUEST_TYPE_INVALID = 0x8053_0000, "The security token request type is not valid.";
    BAD_SECURITY_MODE_REJECTED = 0x8054_0000, "The security mode does not meet the requirements set by the server.";
    BAD_SECURITY_POLICY_REJECTED = 0x8055_0000, "The security policy does not meet the requirements set by the server.";
    BAD_TCP_MESSAGE_TYPE_INVALID = 0x807E_0000, "The type of the message specified in the header invalid.";
    BAD_TCP_SECURE_CHANNEL_UNKNOWN = 0x807F_0000, "The SecureChannelId and/or TokenId are not currently in use.";
    BAD_TCP_MESSAGE_TOO_LARGE = 0x8080_0000, "The size of the message chunk specified in the header is too large.";
    BAD_TCP_ENDPOINT_URL_INVALID = 0x8083_0000, "The server does not recognize the QueryString specified.";
    BAD_REQUEST_INTERRUPTED = 0x8084_0000, "The request could not be sent because of a network interruption.";
    BAD_SECURE_CHANNEL_CLOSED = 0x8086_0000, "The secure channel has been closed.";
    BAD_SECURE_CHANNEL_TOKEN_UNKNOWN = 0x8087_0000, "The token has expired or is not recognized.";
    BAD_SEQUENCE_NUMBER_INVALID = 0x8088_0000, "The sequence number is not valid.";
    BAD_PROTOCOL_VERSION_UNSUPPORTED = 0x80BE_0000, "The applications do not have compatible protocol versions.";
}

impl StatusCode {
    /// Severity bits say good
    pub fn is_good(self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// Severity bits say bad
    pub fn is_bad(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}(0x{:08X})", name, self.0),
            None => write!(f, "StatusCode(0x{:08X})", self.0),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl BinaryEncodable for StatusCode {
    fn byte_len(&self) -> usize {
        4
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.0);
    }

    fn decode(buf: &mut Bytes, _ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        ensure(buf, 4, "StatusCode")?;
        Ok(StatusCode(buf.get_u32_le()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity() {
        assert!(StatusCode::GOOD.is_good());
        assert!(!StatusCode::GOOD.is_bad());
        assert!(StatusCode::BAD_SEQUENCE_NUMBER_INVALID.is_bad());
    }

    #[test]
    fn test_display_names_known_codes() {
        assert_eq!(
            StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID.to_string(),
            "BAD_TCP_MESSAGE_TYPE_INVALID(0x807E0000)"
        );
        assert_eq!(StatusCode(0x8FFF_0000).to_string(), "StatusCode(0x8FFF0000)");
    }
}
