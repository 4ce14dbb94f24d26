//! Binary encoding primitives.
//!
//! Every value on the wire is little-endian. Strings, byte strings and arrays
//! carry an `i32` length prefix where `-1` marks a null value; nulls decode to
//! the empty value of the Rust type.
//!
//! Decoding works on an owned [`Bytes`] cursor per call and never reads past
//! the bytes it was given: every read is preceded by a length check, so
//! truncated or hostile input ends in a [`CodecError`] instead of a panic.

use crate::error::CodecError;
use crate::registry::TypeRegistry;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Ticks (100ns) between 1601-01-01 and the Unix epoch
const UNIX_EPOCH_TICKS: i64 = 116_444_736_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Types with a binary wire representation
pub trait BinaryEncodable: Sized {
    /// Number of bytes `encode` will write
    fn byte_len(&self) -> usize;

    /// Append the encoded value to `buf`
    fn encode(&self, buf: &mut BytesMut);

    /// Decode a value from the front of `buf`
    fn decode(buf: &mut Bytes, ctx: &DecodeContext<'_>) -> Result<Self, CodecError>;
}

/// Upper bounds applied while decoding untrusted input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodingLimits {
    /// Longest accepted string, in bytes
    pub max_string_length: usize,
    /// Longest accepted byte string
    pub max_byte_string_length: usize,
    /// Largest accepted array element count
    pub max_array_length: usize,
    /// Deepest accepted nesting of extension objects and diagnostic infos
    pub max_depth: usize,
}

impl Default for DecodingLimits {
    fn default() -> Self {
        Self {
            max_string_length: 65_535,
            max_byte_string_length: 4 * 1024 * 1024,
            max_array_length: 65_535,
            max_depth: 32,
        }
    }
}

/// Decoding state threaded through nested decodes
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    registry: &'a TypeRegistry,
    limits: DecodingLimits,
    depth: usize,
}

impl<'a> DecodeContext<'a> {
    /// Create a top-level context
    pub fn new(registry: &'a TypeRegistry, limits: DecodingLimits) -> Self {
        Self {
            registry,
            limits,
            depth: 0,
        }
    }

    /// Registry used to resolve embedded extension objects
    pub fn registry(&self) -> &'a TypeRegistry {
        self.registry
    }

    /// Active limits
    pub fn limits(&self) -> &DecodingLimits {
        &self.limits
    }

    /// Context for one level of nesting deeper
    pub fn nested(&self) -> Result<DecodeContext<'a>, CodecError> {
        let depth = self.depth + 1;
        if depth > self.limits.max_depth {
            return Err(CodecError::Limits(format!(
                "nesting depth {} exceeds {}",
                depth, self.limits.max_depth
            )));
        }
        Ok(DecodeContext {
            registry: self.registry,
            limits: self.limits,
            depth,
        })
    }
}

/// Fail with `Eof` unless `buf` holds at least `len` more bytes
pub fn ensure(buf: &Bytes, len: usize, what: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < len {
        Err(CodecError::Eof(what))
    } else {
        Ok(())
    }
}

macro_rules! impl_primitive {
    ($ty:ty, $len:expr, $put:ident, $get:ident, $name:literal) => {
        impl BinaryEncodable for $ty {
            fn byte_len(&self) -> usize {
                $len
            }

            fn encode(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }

            fn decode(buf: &mut Bytes, _ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
                ensure(buf, $len, $name)?;
                Ok(buf.$get())
            }
        }
    };
}

impl_primitive!(u8, 1, put_u8, get_u8, "Byte");
impl_primitive!(i8, 1, put_i8, get_i8, "SByte");
impl_primitive!(u16, 2, put_u16_le, get_u16_le, "UInt16");
impl_primitive!(i16, 2, put_i16_le, get_i16_le, "Int16");
impl_primitive!(u32, 4, put_u32_le, get_u32_le, "UInt32");
impl_primitive!(i32, 4, put_i32_le, get_i32_le, "Int32");
impl_primitive!(u64, 8, put_u64_le, get_u64_le, "UInt64");
impl_primitive!(i64, 8, put_i64_le, get_i64_le, "Int64");
impl_primitive!(f32, 4, put_f32_le, get_f32_le, "Float");
impl_primitive!(f64, 8, put_f64_le, get_f64_le, "Double");

impl BinaryEncodable for bool {
    fn byte_len(&self) -> usize {
        1
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }

    fn decode(buf: &mut Bytes, _ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        ensure(buf, 1, "Boolean")?;
        Ok(buf.get_u8() != 0)
    }
}

/// Read an `i32` length prefix; `None` for the null marker
fn read_length(
    buf: &mut Bytes,
    limit: usize,
    what: &'static str,
) -> Result<Option<usize>, CodecError> {
    ensure(buf, 4, what)?;
    let len = buf.get_i32_le();
    match len {
        -1 => Ok(None),
        n if n < 0 => Err(CodecError::Decode(format!("negative {} length {}", what, n))),
        n => {
            let n = n as usize;
            if n > limit {
                return Err(CodecError::Limits(format!(
                    "{} length {} exceeds {}",
                    what, n, limit
                )));
            }
            Ok(Some(n))
        }
    }
}

impl BinaryEncodable for String {
    fn byte_len(&self) -> usize {
        4 + self.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.len() as i32);
        buf.put_slice(self.as_bytes());
    }

    fn decode(buf: &mut Bytes, ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let Some(len) = read_length(buf, ctx.limits().max_string_length, "String")? else {
            return Ok(String::new());
        };
        ensure(buf, len, "String")?;
        let raw = buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|e| CodecError::Decode(format!("invalid UTF-8 in string: {}", e)))
    }
}

/// Byte strings travel as `Bytes` so certificates and nonces stay zero-copy
impl BinaryEncodable for Bytes {
    fn byte_len(&self) -> usize {
        4 + self.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.len() as i32);
        buf.put_slice(self);
    }

    fn decode(buf: &mut Bytes, ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let Some(len) = read_length(buf, ctx.limits().max_byte_string_length, "ByteString")?
        else {
            return Ok(Bytes::new());
        };
        ensure(buf, len, "ByteString")?;
        Ok(buf.split_to(len))
    }
}

impl<T: BinaryEncodable> BinaryEncodable for Vec<T> {
    fn byte_len(&self) -> usize {
        4 + self.iter().map(BinaryEncodable::byte_len).sum::<usize>()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.len() as i32);
        for item in self {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes, ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let Some(count) = read_length(buf, ctx.limits().max_array_length, "Array")? else {
            return Ok(Vec::new());
        };
        // Each element takes at least one byte, so a count larger than the
        // remaining input is malformed and must not drive the allocation.
        if count > buf.remaining() {
            return Err(CodecError::Eof("Array"));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(buf, ctx)?);
        }
        Ok(items)
    }
}

/// Timestamp as 100ns ticks since 1601-01-01 UTC; zero is the null time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DateTime(i64);

impl DateTime {
    /// The null timestamp
    pub const fn null() -> Self {
        Self(0)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        Self::from_utc(chrono::Utc::now())
    }

    /// Build from raw ticks
    pub const fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Raw ticks
    pub const fn ticks(self) -> i64 {
        self.0
    }

    /// Whether this is the null timestamp
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Convert from a chrono timestamp (sub-tick precision is truncated)
    pub fn from_utc(dt: chrono::DateTime<chrono::Utc>) -> Self {
        let ticks = dt
            .timestamp()
            .saturating_mul(TICKS_PER_SECOND)
            .saturating_add(i64::from(dt.timestamp_subsec_nanos() / 100))
            .saturating_add(UNIX_EPOCH_TICKS);
        Self(ticks)
    }

    /// Convert to a chrono timestamp, `None` if out of chrono's range
    pub fn to_utc(self) -> Option<chrono::DateTime<chrono::Utc>> {
        let since_unix = self.0.checked_sub(UNIX_EPOCH_TICKS)?;
        let secs = since_unix.div_euclid(TICKS_PER_SECOND);
        let nanos = (since_unix.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
        chrono::DateTime::from_timestamp(secs, nanos)
    }
}

impl BinaryEncodable for DateTime {
    fn byte_len(&self) -> usize {
        8
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.0);
    }

    fn decode(buf: &mut Bytes, _ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        ensure(buf, 8, "DateTime")?;
        Ok(Self(buf.get_i64_le()))
    }
}

impl BinaryEncodable for uuid::Uuid {
    fn byte_len(&self) -> usize {
        16
    }

    fn encode(&self, buf: &mut BytesMut) {
        let (d1, d2, d3, d4) = self.as_fields();
        buf.put_u32_le(d1);
        buf.put_u16_le(d2);
        buf.put_u16_le(d3);
        buf.put_slice(d4);
    }

    fn decode(buf: &mut Bytes, _ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        ensure(buf, 16, "Guid")?;
        let d1 = buf.get_u32_le();
        let d2 = buf.get_u16_le();
        let d3 = buf.get_u16_le();
        let mut d4 = [0u8; 8];
        buf.copy_to_slice(&mut d4);
        Ok(uuid::Uuid::from_fields(d1, d2, d3, &d4))
    }
}

/// Encode a value into a fresh buffer
pub fn encode_to_bytes<T: BinaryEncodable>(value: &T) -> Bytes {
    let mut buf = BytesMut::with_capacity(value.byte_len());
    value.encode(&mut buf);
    buf.freeze()
}
