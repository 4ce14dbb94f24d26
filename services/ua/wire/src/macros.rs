//! Declarative helpers for structure and enumeration types.

/// Define a structure whose binary form is its fields encoded in order
macro_rules! ua_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                pub $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default)]
        pub struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl $crate::encoding::BinaryEncodable for $name {
            fn byte_len(&self) -> usize {
                0 $(+ $crate::encoding::BinaryEncodable::byte_len(&self.$field))*
            }

            #[allow(unused_variables)]
            fn encode(&self, buf: &mut ::bytes::BytesMut) {
                $($crate::encoding::BinaryEncodable::encode(&self.$field, buf);)*
            }

            #[allow(unused_variables)]
            fn decode(
                buf: &mut ::bytes::Bytes,
                ctx: &$crate::encoding::DecodeContext<'_>,
            ) -> Result<Self, $crate::error::CodecError> {
                Ok(Self {
                    $($field: <$ty as $crate::encoding::BinaryEncodable>::decode(buf, ctx)?,)*
                })
            }
        }
    };
}

/// Define an enumeration carried on the wire as an `Int32`
macro_rules! ua_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident = $value:literal
            ),* $(,)?
        }
        default = $default:ident;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum $name {
            $(
                $(#[$variant_meta])*
                $variant = $value,
            )*
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$default
            }
        }

        impl TryFrom<i32> for $name {
            type Error = $crate::error::CodecError;

            fn try_from(value: i32) -> Result<Self, $crate::error::CodecError> {
                match value {
                    $($value => Ok($name::$variant),)*
                    other => Err($crate::error::CodecError::Decode(format!(
                        "invalid {} value {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl $crate::encoding::BinaryEncodable for $name {
            fn byte_len(&self) -> usize {
                4
            }

            fn encode(&self, buf: &mut ::bytes::BytesMut) {
                ::bytes::BufMut::put_i32_le(buf, *self as i32);
            }

            fn decode(
                buf: &mut ::bytes::Bytes,
                ctx: &$crate::encoding::DecodeContext<'_>,
            ) -> Result<Self, $crate::error::CodecError> {
                let raw = <i32 as $crate::encoding::BinaryEncodable>::decode(buf, ctx)?;
                $name::try_from(raw)
            }
        }
    };
}
