//! Type registry and object codec.
//!
//! Message bodies and extension objects are self-describing: they start with
//! the binary encoding id of the structure that follows. The registry maps
//! those ids to decoder functions. It is populated once during initialization
//! and only read afterwards, so a shared reference can be handed to any number
//! of assemblers.

use crate::encoding::{BinaryEncodable, DecodeContext, DecodingLimits};
use crate::error::CodecError;
use crate::node_id::{ExpandedNodeId, NodeId};
use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// A decoded structure of any registered type
pub trait UaObject: fmt::Debug + Send + Sync + 'static {
    /// Structure name
    fn type_name(&self) -> &'static str;

    /// Binary encoding id written in front of the body
    fn encoding_id(&self) -> NodeId;

    /// Encoded body length, excluding the encoding id
    fn body_len(&self) -> usize;

    /// Encode the body, excluding the encoding id
    fn encode_body(&self, buf: &mut BytesMut);

    /// Upcast for downcasting to the concrete type
    fn as_any(&self) -> &dyn Any;

    /// Clone behind a box
    fn clone_object(&self) -> Box<dyn UaObject>;

    /// Structural equality against another object
    fn eq_object(&self, other: &dyn UaObject) -> bool;
}

/// Structure types with a fixed binary encoding id
pub trait Structure:
    BinaryEncodable + Clone + PartialEq + fmt::Debug + Send + Sync + 'static
{
    /// Structure name
    const TYPE_NAME: &'static str;
    /// Numeric binary encoding id
    const ENCODING_ID: u32;
    /// Namespace of the encoding id
    const NAMESPACE: u16 = 0;

    /// Encoding id as a NodeId
    fn encoding_node_id() -> NodeId {
        NodeId::numeric(Self::NAMESPACE, Self::ENCODING_ID)
    }
}

impl<T: Structure> UaObject for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn encoding_id(&self) -> NodeId {
        T::encoding_node_id()
    }

    fn body_len(&self) -> usize {
        self.byte_len()
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        self.encode(buf);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_object(&self) -> Box<dyn UaObject> {
        Box::new(self.clone())
    }

    fn eq_object(&self, other: &dyn UaObject) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| other == self)
    }
}

impl dyn UaObject {
    /// Borrow as the concrete type, if it is one
    pub fn downcast_ref<T: UaObject>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Whether the object is of concrete type `T`
    pub fn is<T: UaObject>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl Clone for Box<dyn UaObject> {
    fn clone(&self) -> Self {
        self.clone_object()
    }
}

impl PartialEq for Box<dyn UaObject> {
    fn eq(&self, other: &Self) -> bool {
        self.eq_object(other.as_ref())
    }
}

type DecodeFn = fn(&mut Bytes, &DecodeContext<'_>) -> Result<Box<dyn UaObject>, CodecError>;

fn decode_boxed<T: Structure>(
    buf: &mut Bytes,
    ctx: &DecodeContext<'_>,
) -> Result<Box<dyn UaObject>, CodecError> {
    Ok(Box::new(T::decode(buf, ctx)?))
}

/// Registry entry for one structure type
#[derive(Clone)]
pub struct TypeDescriptor {
    /// Structure name
    pub name: &'static str,
    /// Binary encoding id
    pub encoding_id: NodeId,
    decode: DecodeFn,
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("encoding_id", &self.encoding_id)
            .finish()
    }
}

impl TypeDescriptor {
    /// Descriptor for a structure type
    pub fn of<T: Structure>() -> Self {
        Self {
            name: T::TYPE_NAME,
            encoding_id: T::encoding_node_id(),
            decode: decode_boxed::<T>,
        }
    }

    /// Decode one body of this type from the front of `buf`
    pub fn decode(
        &self,
        buf: &mut Bytes,
        ctx: &DecodeContext<'_>,
    ) -> Result<Box<dyn UaObject>, CodecError> {
        (self.decode)(buf, ctx)
    }
}

/// Map from binary encoding id to decoder
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<NodeId, TypeDescriptor>,
}

impl TypeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the standard channel and discovery messages
    pub fn standard() -> Self {
        let mut registry = Self::new();
        crate::messages::register_standard_types(&mut registry);
        registry
    }

    /// Register a structure type; ids may only be claimed once
    pub fn register<T: Structure>(&mut self) -> Result<(), CodecError> {
        self.register_descriptor(TypeDescriptor::of::<T>())
    }

    /// Register a prepared descriptor
    pub fn register_descriptor(&mut self, descriptor: TypeDescriptor) -> Result<(), CodecError> {
        if let Some(existing) = self.types.get(&descriptor.encoding_id) {
            return Err(CodecError::DuplicateType {
                id: descriptor.encoding_id.to_string(),
                existing: existing.name,
            });
        }
        trace!(
            "Registered {} as {}",
            descriptor.name,
            descriptor.encoding_id
        );
        self.types.insert(descriptor.encoding_id.clone(), descriptor);
        Ok(())
    }

    /// Descriptor registered under `id`
    pub fn lookup(&self, id: &NodeId) -> Option<&TypeDescriptor> {
        self.types.get(id)
    }

    /// Whether `id` is registered
    pub fn contains(&self, id: &NodeId) -> bool {
        self.types.contains_key(id)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no types are registered
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Decode a body of type `id` from the front of `buf`
    pub fn decode(
        &self,
        id: &NodeId,
        buf: &mut Bytes,
        ctx: &DecodeContext<'_>,
    ) -> Result<Box<dyn UaObject>, CodecError> {
        let descriptor = self
            .lookup(id)
            .ok_or_else(|| CodecError::UnknownType(id.to_string()))?;
        descriptor.decode(buf, ctx)
    }

    /// Decode a complete message body: a leading encoding id, then exactly
    /// one structure of that type
    pub fn decode_message(
        &self,
        mut body: Bytes,
        limits: DecodingLimits,
    ) -> Result<(ExpandedNodeId, Box<dyn UaObject>), CodecError> {
        let ctx = DecodeContext::new(self, limits);
        let type_id = ExpandedNodeId::decode(&mut body, &ctx)
            .map_err(|_| CodecError::UnknownType("<malformed>".to_string()))?;
        if type_id.server_index != 0 || type_id.namespace_uri.is_some() {
            return Err(CodecError::UnknownType(type_id.to_string()));
        }
        let object = self.decode(&type_id.node_id, &mut body, &ctx)?;
        if !body.is_empty() {
            return Err(CodecError::Decode(format!(
                "{} trailing bytes after {}",
                body.len(),
                object.type_name()
            )));
        }
        Ok((type_id, object))
    }
}

/// Encode a message body: encoding id followed by the structure
pub fn encode_message(object: &dyn UaObject) -> Bytes {
    let type_id = object.encoding_id();
    let mut buf = BytesMut::with_capacity(type_id.byte_len() + object.body_len());
    type_id.encode(&mut buf);
    object.encode_body(&mut buf);
    buf.freeze()
}

static STANDARD_REGISTRY: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::standard);

/// Process-wide registry of the standard types
pub fn standard_registry() -> &'static TypeRegistry {
    &STANDARD_REGISTRY
}
