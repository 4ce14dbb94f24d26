//! Self-describing embedded structures.
//!
//! An extension object is `{encoding id, mask byte, i32 length, body}`. The
//! null object is the null NodeId followed by a zero mask. Bodies whose id is
//! registered decode into a typed object; anything else is carried through as
//! opaque bytes so it can be re-encoded unchanged.

use crate::encoding::{BinaryEncodable, DecodeContext};
use crate::error::CodecError;
use crate::node_id::NodeId;
use crate::registry::{Structure, UaObject};
use bytes::{BufMut, Bytes, BytesMut};

const BODY_NONE: u8 = 0x00;
const BODY_BINARY: u8 = 0x01;
const BODY_XML: u8 = 0x02;

/// Embedded structure of any type
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ExtensionObject {
    /// Explicitly absent value
    #[default]
    Null,
    /// Body of a registered type
    Decoded(Box<dyn UaObject>),
    /// Body of a type this registry does not know
    Opaque {
        /// Encoding id found on the wire
        type_id: NodeId,
        /// Raw body, `None` when the mask byte announced no body
        body: Option<Bytes>,
    },
}

impl ExtensionObject {
    /// Wrap a structure
    pub fn new<T: Structure>(value: T) -> Self {
        ExtensionObject::Decoded(Box::new(value))
    }

    /// Whether this is the null object
    pub fn is_null(&self) -> bool {
        matches!(self, ExtensionObject::Null)
    }

    /// Encoding id, `None` for the null object
    pub fn type_id(&self) -> Option<NodeId> {
        match self {
            ExtensionObject::Null => None,
            ExtensionObject::Decoded(object) => Some(object.encoding_id()),
            ExtensionObject::Opaque { type_id, .. } => Some(type_id.clone()),
        }
    }

    /// Borrow the decoded body as `T`
    pub fn downcast_ref<T: UaObject>(&self) -> Option<&T> {
        match self {
            ExtensionObject::Decoded(object) => object.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl BinaryEncodable for ExtensionObject {
    fn byte_len(&self) -> usize {
        match self {
            ExtensionObject::Null => NodeId::null().byte_len() + 1,
            ExtensionObject::Decoded(object) => {
                object.encoding_id().byte_len() + 1 + 4 + object.body_len()
            }
            ExtensionObject::Opaque { type_id, body } => {
                type_id.byte_len() + 1 + body.as_ref().map_or(0, |body| body.byte_len())
            }
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            ExtensionObject::Null => {
                NodeId::null().encode(buf);
                buf.put_u8(BODY_NONE);
            }
            ExtensionObject::Decoded(object) => {
                object.encoding_id().encode(buf);
                buf.put_u8(BODY_BINARY);
                buf.put_i32_le(object.body_len() as i32);
                object.encode_body(buf);
            }
            ExtensionObject::Opaque { type_id, body } => {
                type_id.encode(buf);
                match body {
                    Some(body) => {
                        buf.put_u8(BODY_BINARY);
                        body.encode(buf);
                    }
                    None => buf.put_u8(BODY_NONE),
                }
            }
        }
    }

    fn decode(buf: &mut Bytes, ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let type_id = NodeId::decode(buf, ctx)?;
        match u8::decode(buf, ctx)? {
            BODY_NONE if type_id.is_null() => Ok(ExtensionObject::Null),
            BODY_NONE => Ok(ExtensionObject::Opaque {
                type_id,
                body: None,
            }),
            BODY_BINARY => {
                let mut body = Bytes::decode(buf, ctx)?;
                let Some(descriptor) = ctx.registry().lookup(&type_id) else {
                    return Ok(ExtensionObject::Opaque {
                        type_id,
                        body: Some(body),
                    });
                };
                let object = descriptor.decode(&mut body, &ctx.nested()?)?;
                if !body.is_empty() {
                    return Err(CodecError::Decode(format!(
                        "{} trailing bytes in {} extension object",
                        body.len(),
                        descriptor.name
                    )));
                }
                Ok(ExtensionObject::Decoded(object))
            }
            BODY_XML => Err(CodecError::Decode(
                "XML extension object bodies are not supported".to_string(),
            )),
            other => Err(CodecError::Decode(format!(
                "invalid extension object encoding 0x{:02x}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{encode_to_bytes, DecodingLimits};
    use crate::registry::{standard_registry, TypeRegistry};

    ua_struct! {
        /// Shape container
        pub struct MetaShape {
            /// Name
            pub name: String,
            /// Embedded shape
            pub shape: ExtensionObject,
            /// Comment
            pub comment: String,
        }
    }

    impl Structure for MetaShape {
        const TYPE_NAME: &'static str = "MetaShape";
        const ENCODING_ID: u32 = 0xF0_0002;
        const NAMESPACE: u16 = 1;
    }

    ua_struct! {
        /// Potato shape
        pub struct Potato {
            /// Length
            pub length: f64,
            /// Radius
            pub radius: f64,
        }
    }

    impl Structure for Potato {
        const TYPE_NAME: &'static str = "Potato";
        const ENCODING_ID: u32 = 0xF0_0001;
        const NAMESPACE: u16 = 1;
    }

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::standard();
        registry.register::<MetaShape>().unwrap();
        registry.register::<Potato>().unwrap();
        registry
    }

    #[test]
    fn test_embedded_object_roundtrip() {
        let registry = registry();
        let ctx = DecodeContext::new(&registry, DecodingLimits::default());
        let shape = MetaShape {
            name: "MyPotato".into(),
            shape: ExtensionObject::new(Potato {
                length: 10.0,
                radius: 5.0,
            }),
            comment: "this is a potato".into(),
        };
        let bytes = encode_to_bytes(&shape);
        assert_eq!(bytes.len(), shape.byte_len());
        let mut cursor = bytes;
        let decoded = MetaShape::decode(&mut cursor, &ctx).unwrap();
        assert_eq!(decoded, shape);
        let potato = decoded.shape.downcast_ref::<Potato>().unwrap();
        assert_eq!(potato.radius, 5.0);
    }

    #[test]
    fn test_null_object_roundtrip() {
        let registry = registry();
        let ctx = DecodeContext::new(&registry, DecodingLimits::default());
        let shape = MetaShape {
            name: "empty".into(),
            shape: ExtensionObject::Null,
            comment: String::new(),
        };
        let mut cursor = encode_to_bytes(&shape);
        let decoded = MetaShape::decode(&mut cursor, &ctx).unwrap();
        assert!(decoded.shape.is_null());
        assert_eq!(&encode_to_bytes(&ExtensionObject::Null)[..], &[0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_unknown_type_kept_opaque() {
        let mut cursor = encode_to_bytes(&ExtensionObject::new(Potato {
            length: 1.0,
            radius: 2.0,
        }));
        let ctx = DecodeContext::new(standard_registry(), DecodingLimits::default());
        let decoded = ExtensionObject::decode(&mut cursor, &ctx).unwrap();
        match &decoded {
            ExtensionObject::Opaque { type_id, body } => {
                assert_eq!(type_id, &NodeId::numeric(1, 0xF0_0001));
                assert_eq!(body.as_ref().map(Bytes::len), Some(16));
            }
            other => panic!("expected opaque object, got {:?}", other),
        }
        // Re-encoding an opaque object reproduces the original bytes
        let original = encode_to_bytes(&ExtensionObject::new(Potato {
            length: 1.0,
            radius: 2.0,
        }));
        assert_eq!(encode_to_bytes(&decoded), original);
    }

    #[test]
    fn test_bodiless_object_reencodes_unchanged() {
        let mut buf = BytesMut::new();
        NodeId::numeric(1, 0xF0_0002).encode(&mut buf);
        buf.put_u8(BODY_NONE);
        let original = buf.freeze();

        let ctx = DecodeContext::new(standard_registry(), DecodingLimits::default());
        let mut cursor = original.clone();
        let decoded = ExtensionObject::decode(&mut cursor, &ctx).unwrap();
        assert_eq!(
            decoded,
            ExtensionObject::Opaque {
                type_id: NodeId::numeric(1, 0xF0_0002),
                body: None,
            }
        );
        assert_eq!(decoded.byte_len(), original.len());
        assert_eq!(encode_to_bytes(&decoded), original);
    }

    #[test]
    fn test_body_length_beyond_buffer() {
        let mut buf = BytesMut::new();
        NodeId::numeric(1, 0xF0_0001).encode(&mut buf);
        buf.put_u8(BODY_BINARY);
        buf.put_i32_le(64);
        buf.put_slice(&[0u8; 8]);
        let registry = registry();
        let ctx = DecodeContext::new(&registry, DecodingLimits::default());
        let mut cursor = buf.freeze();
        assert_eq!(
            ExtensionObject::decode(&mut cursor, &ctx),
            Err(CodecError::Eof("ByteString"))
        );
    }
}
