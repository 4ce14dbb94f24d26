//! Node identifiers.
//!
//! Type identifiers on the wire are NodeIds. Numeric ids use the most compact
//! of three encodings; the top two bits of the encoding byte are only legal in
//! an [`ExpandedNodeId`].

use crate::encoding::{ensure, BinaryEncodable, DecodeContext};
use crate::error::CodecError;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

const ENCODING_TWO_BYTE: u8 = 0x00;
const ENCODING_FOUR_BYTE: u8 = 0x01;
const ENCODING_NUMERIC: u8 = 0x02;
const ENCODING_STRING: u8 = 0x03;
const ENCODING_GUID: u8 = 0x04;
const ENCODING_BYTE_STRING: u8 = 0x05;

bitflags! {
    /// Expanded NodeId flags carried in the encoding byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExpandedFlags: u8 {
        /// A namespace URI string follows the identifier
        const NAMESPACE_URI = 0x80;
        /// A server index follows the identifier
        const SERVER_INDEX = 0x40;
    }
}

/// Identifier part of a NodeId
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// Numeric identifier
    Numeric(u32),
    /// String identifier
    String(String),
    /// GUID identifier
    Guid(uuid::Uuid),
    /// Opaque identifier
    Opaque(Bytes),
}

/// Namespace-qualified node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    /// Namespace index
    pub namespace: u16,
    /// Identifier within the namespace
    pub identifier: Identifier,
}

impl NodeId {
    /// Numeric NodeId
    pub const fn numeric(namespace: u16, value: u32) -> Self {
        Self {
            namespace,
            identifier: Identifier::Numeric(value),
        }
    }

    /// The null NodeId (ns=0;i=0)
    pub const fn null() -> Self {
        Self::numeric(0, 0)
    }

    /// Whether this is the null NodeId
    pub fn is_null(&self) -> bool {
        self.namespace == 0 && self.identifier == Identifier::Numeric(0)
    }

    /// Numeric value, if the identifier is numeric
    pub fn as_numeric(&self) -> Option<u32> {
        match self.identifier {
            Identifier::Numeric(v) => Some(v),
            _ => None,
        }
    }

    fn encode_with_flags(&self, flags: ExpandedFlags, buf: &mut BytesMut) {
        let flags = flags.bits();
        match &self.identifier {
            Identifier::Numeric(v) if self.namespace == 0 && *v <= 0xFF => {
                buf.put_u8(ENCODING_TWO_BYTE | flags);
                buf.put_u8(*v as u8);
            }
            Identifier::Numeric(v) if self.namespace <= 0xFF && *v <= 0xFFFF => {
                buf.put_u8(ENCODING_FOUR_BYTE | flags);
                buf.put_u8(self.namespace as u8);
                buf.put_u16_le(*v as u16);
            }
            Identifier::Numeric(v) => {
                buf.put_u8(ENCODING_NUMERIC | flags);
                buf.put_u16_le(self.namespace);
                buf.put_u32_le(*v);
            }
            Identifier::String(s) => {
                buf.put_u8(ENCODING_STRING | flags);
                buf.put_u16_le(self.namespace);
                s.encode(buf);
            }
            Identifier::Guid(g) => {
                buf.put_u8(ENCODING_GUID | flags);
                buf.put_u16_le(self.namespace);
                g.encode(buf);
            }
            Identifier::Opaque(b) => {
                buf.put_u8(ENCODING_BYTE_STRING | flags);
                buf.put_u16_le(self.namespace);
                b.encode(buf);
            }
        }
    }

    fn decode_with_flags(
        buf: &mut Bytes,
        ctx: &DecodeContext<'_>,
    ) -> Result<(Self, ExpandedFlags), CodecError> {
        ensure(buf, 1, "NodeId")?;
        let mask = buf.get_u8();
        let flags = ExpandedFlags::from_bits_truncate(mask);
        let node_id = match mask & 0x3F {
            ENCODING_TWO_BYTE => {
                ensure(buf, 1, "NodeId")?;
                NodeId::numeric(0, u32::from(buf.get_u8()))
            }
            ENCODING_FOUR_BYTE => {
                ensure(buf, 3, "NodeId")?;
                let namespace = u16::from(buf.get_u8());
                NodeId::numeric(namespace, u32::from(buf.get_u16_le()))
            }
            ENCODING_NUMERIC => {
                ensure(buf, 6, "NodeId")?;
                let namespace = buf.get_u16_le();
                NodeId::numeric(namespace, buf.get_u32_le())
            }
            ENCODING_STRING => {
                let namespace = u16::decode(buf, ctx)?;
                NodeId {
                    namespace,
                    identifier: Identifier::String(String::decode(buf, ctx)?),
                }
            }
            ENCODING_GUID => {
                let namespace = u16::decode(buf, ctx)?;
                NodeId {
                    namespace,
                    identifier: Identifier::Guid(uuid::Uuid::decode(buf, ctx)?),
                }
            }
            ENCODING_BYTE_STRING => {
                let namespace = u16::decode(buf, ctx)?;
                NodeId {
                    namespace,
                    identifier: Identifier::Opaque(Bytes::decode(buf, ctx)?),
                }
            }
            other => {
                return Err(CodecError::Decode(format!(
                    "invalid NodeId encoding 0x{:02x}",
                    other
                )))
            }
        };
        Ok((node_id, flags))
    }

    fn body_len(&self) -> usize {
        match &self.identifier {
            Identifier::Numeric(v) if self.namespace == 0 && *v <= 0xFF => 2,
            Identifier::Numeric(v) if self.namespace <= 0xFF && *v <= 0xFFFF => 4,
            Identifier::Numeric(_) => 7,
            Identifier::String(s) => 3 + s.byte_len(),
            Identifier::Guid(_) => 3 + 16,
            Identifier::Opaque(b) => 3 + b.byte_len(),
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};", self.namespace)?;
        }
        match &self.identifier {
            Identifier::Numeric(v) => write!(f, "i={}", v),
            Identifier::String(s) => write!(f, "s={}", s),
            Identifier::Guid(g) => write!(f, "g={}", g),
            Identifier::Opaque(b) => {
                f.write_str("b=")?;
                for byte in b.iter() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl BinaryEncodable for NodeId {
    fn byte_len(&self) -> usize {
        self.body_len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.encode_with_flags(ExpandedFlags::empty(), buf);
    }

    fn decode(buf: &mut Bytes, ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let (node_id, flags) = Self::decode_with_flags(buf, ctx)?;
        if !flags.is_empty() {
            return Err(CodecError::Decode(
                "expanded NodeId flags set on a plain NodeId".to_string(),
            ));
        }
        Ok(node_id)
    }
}

/// NodeId optionally qualified by namespace URI and server index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ExpandedNodeId {
    /// Node identifier
    pub node_id: NodeId,
    /// Namespace URI overriding the namespace index
    pub namespace_uri: Option<String>,
    /// Index of the server holding the node, 0 for local
    pub server_index: u32,
}

impl ExpandedNodeId {
    /// Null expanded id
    pub fn null() -> Self {
        Self::default()
    }

    fn flags(&self) -> ExpandedFlags {
        let mut flags = ExpandedFlags::empty();
        if self.namespace_uri.is_some() {
            flags |= ExpandedFlags::NAMESPACE_URI;
        }
        if self.server_index != 0 {
            flags |= ExpandedFlags::SERVER_INDEX;
        }
        flags
    }
}

impl From<NodeId> for ExpandedNodeId {
    fn from(node_id: NodeId) -> Self {
        Self {
            node_id,
            namespace_uri: None,
            server_index: 0,
        }
    }
}

impl fmt::Display for ExpandedNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.server_index != 0 {
            write!(f, "svr={};", self.server_index)?;
        }
        if let Some(uri) = &self.namespace_uri {
            write!(f, "nsu={};", uri)?;
        }
        write!(f, "{}", self.node_id)
    }
}

impl BinaryEncodable for ExpandedNodeId {
    fn byte_len(&self) -> usize {
        let mut len = self.node_id.body_len();
        if let Some(uri) = &self.namespace_uri {
            len += uri.byte_len();
        }
        if self.server_index != 0 {
            len += 4;
        }
        len
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.node_id.encode_with_flags(self.flags(), buf);
        if let Some(uri) = &self.namespace_uri {
            uri.encode(buf);
        }
        if self.server_index != 0 {
            buf.put_u32_le(self.server_index);
        }
    }

    fn decode(buf: &mut Bytes, ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let (node_id, flags) = NodeId::decode_with_flags(buf, ctx)?;
        let namespace_uri = if flags.contains(ExpandedFlags::NAMESPACE_URI) {
            Some(String::decode(buf, ctx)?)
        } else {
            None
        };
        let server_index = if flags.contains(ExpandedFlags::SERVER_INDEX) {
            u32::decode(buf, ctx)?
        } else {
            0
        };
        Ok(Self {
            node_id,
            namespace_uri,
            server_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{encode_to_bytes, DecodingLimits};
    use crate::registry::standard_registry;

    fn ctx() -> DecodeContext<'static> {
        DecodeContext::new(standard_registry(), DecodingLimits::default())
    }

    #[test]
    fn test_compact_numeric_encodings() {
        assert_eq!(&encode_to_bytes(&NodeId::numeric(0, 72))[..], &[0x00, 72]);
        assert_eq!(
            &encode_to_bytes(&NodeId::numeric(5, 1025))[..],
            &[0x01, 5, 0x01, 0x04]
        );
        assert_eq!(
            &encode_to_bytes(&NodeId::numeric(0, 0x0001_0000))[..],
            &[0x02, 0, 0, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn test_byte_len_matches_encoding() {
        let ids = [
            NodeId::numeric(0, 446),
            NodeId::numeric(300, 7),
            NodeId {
                namespace: 2,
                identifier: Identifier::String("Pump.Speed".into()),
            },
            NodeId {
                namespace: 1,
                identifier: Identifier::Guid(uuid::Uuid::new_v4()),
            },
            NodeId {
                namespace: 1,
                identifier: Identifier::Opaque(Bytes::from_static(b"\x01\x02")),
            },
        ];
        for id in ids {
            let bytes = encode_to_bytes(&id);
            assert_eq!(bytes.len(), id.byte_len(), "{}", id);
            let mut cursor = bytes;
            assert_eq!(NodeId::decode(&mut cursor, &ctx()).unwrap(), id);
        }
    }

    #[test]
    fn test_invalid_encoding_byte() {
        let mut bytes = Bytes::from_static(&[0x3F, 0x00]);
        assert!(matches!(
            NodeId::decode(&mut bytes, &ctx()),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_plain_node_id_rejects_expanded_flags() {
        let mut bytes = Bytes::from_static(&[0x40, 0x01, 0x00, 0x00, 0x00, 0x00]);
        assert!(NodeId::decode(&mut bytes, &ctx()).is_err());
    }

    #[test]
    fn test_expanded_roundtrip() {
        let id = ExpandedNodeId {
            node_id: NodeId::numeric(0, 431),
            namespace_uri: Some("urn:test".into()),
            server_index: 3,
        };
        let bytes = encode_to_bytes(&id);
        assert_eq!(bytes[0], 0xC1);
        assert_eq!(bytes.len(), id.byte_len());
        let mut cursor = bytes;
        assert_eq!(ExpandedNodeId::decode(&mut cursor, &ctx()).unwrap(), id);
        assert_eq!(id.to_string(), "svr=3;nsu=urn:test;i=431");
    }
}
