//! Built-in composite types and the structures shared by service messages.

use crate::encoding::{BinaryEncodable, DecodeContext, DateTime};
use crate::error::CodecError;
use crate::extension_object::ExtensionObject;
use crate::node_id::NodeId;
use crate::registry::Structure;
use crate::status::StatusCode;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Human readable text with an optional locale
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalizedText {
    /// Locale identifier such as `en-US`; empty when absent
    pub locale: String,
    /// Text; empty when absent
    pub text: String,
}

impl LocalizedText {
    /// Text without a locale
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            locale: String::new(),
            text: text.into(),
        }
    }

    fn mask(&self) -> u8 {
        let mut mask = 0;
        if !self.locale.is_empty() {
            mask |= 0x01;
        }
        if !self.text.is_empty() {
            mask |= 0x02;
        }
        mask
    }
}

impl BinaryEncodable for LocalizedText {
    fn byte_len(&self) -> usize {
        let mut len = 1;
        if !self.locale.is_empty() {
            len += self.locale.byte_len();
        }
        if !self.text.is_empty() {
            len += self.text.byte_len();
        }
        len
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.mask());
        if !self.locale.is_empty() {
            self.locale.encode(buf);
        }
        if !self.text.is_empty() {
            self.text.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes, ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let mask = u8::decode(buf, ctx)?;
        let locale = if mask & 0x01 != 0 {
            String::decode(buf, ctx)?
        } else {
            String::new()
        };
        let text = if mask & 0x02 != 0 {
            String::decode(buf, ctx)?
        } else {
            String::new()
        };
        Ok(Self { locale, text })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct DiagnosticMask: u8 {
        const SYMBOLIC_ID = 0x01;
        const NAMESPACE_URI = 0x02;
        const LOCALIZED_TEXT = 0x04;
        const LOCALE = 0x08;
        const ADDITIONAL_INFO = 0x10;
        const INNER_STATUS_CODE = 0x20;
        const INNER_DIAGNOSTIC_INFO = 0x40;
    }
}

/// Vendor diagnostics attached to a status; every field is optional
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiagnosticInfo {
    /// Index of the symbolic id in the string table
    pub symbolic_id: Option<i32>,
    /// Index of the namespace URI in the string table
    pub namespace_uri: Option<i32>,
    /// Index of the locale in the string table
    pub locale: Option<i32>,
    /// Index of the localized text in the string table
    pub localized_text: Option<i32>,
    /// Free-form detail
    pub additional_info: Option<String>,
    /// Status of an underlying operation
    pub inner_status_code: Option<StatusCode>,
    /// Diagnostics of an underlying operation
    pub inner_diagnostic_info: Option<Box<DiagnosticInfo>>,
}

impl DiagnosticInfo {
    fn mask(&self) -> DiagnosticMask {
        let mut mask = DiagnosticMask::empty();
        mask.set(DiagnosticMask::SYMBOLIC_ID, self.symbolic_id.is_some());
        mask.set(DiagnosticMask::NAMESPACE_URI, self.namespace_uri.is_some());
        mask.set(DiagnosticMask::LOCALE, self.locale.is_some());
        mask.set(DiagnosticMask::LOCALIZED_TEXT, self.localized_text.is_some());
        mask.set(DiagnosticMask::ADDITIONAL_INFO, self.additional_info.is_some());
        mask.set(
            DiagnosticMask::INNER_STATUS_CODE,
            self.inner_status_code.is_some(),
        );
        mask.set(
            DiagnosticMask::INNER_DIAGNOSTIC_INFO,
            self.inner_diagnostic_info.is_some(),
        );
        mask
    }
}

impl BinaryEncodable for DiagnosticInfo {
    fn byte_len(&self) -> usize {
        1 + [self.symbolic_id, self.namespace_uri, self.locale, self.localized_text]
            .iter()
            .flatten()
            .count()
            * 4
            + self.additional_info.as_ref().map_or(0, |s| s.byte_len())
            + self.inner_status_code.map_or(0, |_| 4)
            + self
                .inner_diagnostic_info
                .as_ref()
                .map_or(0, |inner| inner.byte_len())
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.mask().bits());
        for value in [self.symbolic_id, self.namespace_uri, self.locale, self.localized_text]
            .into_iter()
            .flatten()
        {
            buf.put_i32_le(value);
        }
        if let Some(info) = &self.additional_info {
            info.encode(buf);
        }
        if let Some(status) = self.inner_status_code {
            status.encode(buf);
        }
        if let Some(inner) = &self.inner_diagnostic_info {
            inner.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes, ctx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let mask = DiagnosticMask::from_bits_truncate(u8::decode(buf, ctx)?);
        let read_index = |flag: DiagnosticMask, buf: &mut Bytes| -> Result<Option<i32>, CodecError> {
            if mask.contains(flag) {
                Ok(Some(i32::decode(buf, ctx)?))
            } else {
                Ok(None)
            }
        };
        let symbolic_id = read_index(DiagnosticMask::SYMBOLIC_ID, buf)?;
        let namespace_uri = read_index(DiagnosticMask::NAMESPACE_URI, buf)?;
        let locale = read_index(DiagnosticMask::LOCALE, buf)?;
        let localized_text = read_index(DiagnosticMask::LOCALIZED_TEXT, buf)?;
        let additional_info = if mask.contains(DiagnosticMask::ADDITIONAL_INFO) {
            Some(String::decode(buf, ctx)?)
        } else {
            None
        };
        let inner_status_code = if mask.contains(DiagnosticMask::INNER_STATUS_CODE) {
            Some(StatusCode::decode(buf, ctx)?)
        } else {
            None
        };
        let inner_diagnostic_info = if mask.contains(DiagnosticMask::INNER_DIAGNOSTIC_INFO) {
            Some(Box::new(DiagnosticInfo::decode(buf, &ctx.nested()?)?))
        } else {
            None
        };
        Ok(Self {
            symbolic_id,
            namespace_uri,
            locale,
            localized_text,
            additional_info,
            inner_status_code,
            inner_diagnostic_info,
        })
    }
}

ua_enum! {
    /// Protection applied to messages on a channel
    #[derive(Serialize, Deserialize)]
    pub enum MessageSecurityMode {
        /// Not a valid mode
        Invalid = 0,
        /// No protection
        None = 1,
        /// Signed
        Sign = 2,
        /// Signed and encrypted
        SignAndEncrypt = 3,
    }
    default = None;
}

impl MessageSecurityMode {
    /// Mode name
    pub fn as_str(self) -> &'static str {
        match self {
            MessageSecurityMode::Invalid => "Invalid",
            MessageSecurityMode::None => "None",
            MessageSecurityMode::Sign => "Sign",
            MessageSecurityMode::SignAndEncrypt => "SignAndEncrypt",
        }
    }
}

ua_enum! {
    /// Whether an open request asks for a new channel or a new token
    pub enum SecurityTokenRequestType {
        /// Create a channel
        Issue = 0,
        /// Renew the token of an existing channel
        Renew = 1,
    }
    default = Issue;
}

ua_enum! {
    /// Role of an application
    pub enum ApplicationType {
        /// Server
        Server = 0,
        /// Client
        Client = 1,
        /// Both client and server
        ClientAndServer = 2,
        /// Discovery server
        DiscoveryServer = 3,
    }
    default = Server;
}

ua_enum! {
    /// Kind of user identity token accepted by an endpoint
    pub enum UserTokenType {
        /// No user identity
        Anonymous = 0,
        /// User name and password
        UserName = 1,
        /// X.509 certificate
        Certificate = 2,
        /// Externally issued token
        IssuedToken = 3,
    }
    default = Anonymous;
}

ua_struct! {
    /// Common header of every service request
    pub struct RequestHeader {
        /// Session authentication token
        pub authentication_token: NodeId,
        /// Time the request was sent
        pub timestamp: DateTime,
        /// Client-assigned handle echoed in the response
        pub request_handle: u32,
        /// Diagnostics the client wants back
        pub return_diagnostics: u32,
        /// Audit log entry id
        pub audit_entry_id: String,
        /// Client-side timeout in milliseconds
        pub timeout_hint: u32,
        /// Vendor extension
        pub additional_header: ExtensionObject,
    }
}

impl Structure for RequestHeader {
    const TYPE_NAME: &'static str = "RequestHeader";
    const ENCODING_ID: u32 = 391;
}

ua_struct! {
    /// Common header of every service response
    pub struct ResponseHeader {
        /// Time the response was sent
        pub timestamp: DateTime,
        /// Handle copied from the request
        pub request_handle: u32,
        /// Overall result
        pub service_result: StatusCode,
        /// Diagnostics for the overall result
        pub service_diagnostics: DiagnosticInfo,
        /// Strings referenced by diagnostic infos
        pub string_table: Vec<String>,
        /// Vendor extension
        pub additional_header: ExtensionObject,
    }
}

impl ResponseHeader {
    /// Header answering `request` with `result`
    pub fn for_request(request: &RequestHeader, result: StatusCode) -> Self {
        Self {
            timestamp: DateTime::now(),
            request_handle: request.request_handle,
            service_result: result,
            ..Default::default()
        }
    }
}

impl Structure for ResponseHeader {
    const TYPE_NAME: &'static str = "ResponseHeader";
    const ENCODING_ID: u32 = 394;
}

ua_struct! {
    /// Description of an application
    pub struct ApplicationDescription {
        /// Globally unique application URI
        pub application_uri: String,
        /// Product URI
        pub product_uri: String,
        /// Display name
        pub application_name: LocalizedText,
        /// Role
        pub application_type: ApplicationType,
        /// Gateway server URI
        pub gateway_server_uri: String,
        /// Discovery profile URI
        pub discovery_profile_uri: String,
        /// URLs of the discovery endpoints
        pub discovery_urls: Vec<String>,
    }
}

impl Structure for ApplicationDescription {
    const TYPE_NAME: &'static str = "ApplicationDescription";
    const ENCODING_ID: u32 = 310;
}

ua_struct! {
    /// User identity token accepted by an endpoint
    pub struct UserTokenPolicy {
        /// Policy identifier
        pub policy_id: String,
        /// Token kind
        pub token_type: UserTokenType,
        /// Issued token type URI
        pub issued_token_type: String,
        /// Token issuer URL
        pub issuer_endpoint_url: String,
        /// Security policy protecting the token
        pub security_policy_uri: String,
    }
}

impl Structure for UserTokenPolicy {
    const TYPE_NAME: &'static str = "UserTokenPolicy";
    const ENCODING_ID: u32 = 306;
}

ua_struct! {
    /// Endpoint offered by a server
    pub struct EndpointDescription {
        /// Endpoint URL
        pub endpoint_url: String,
        /// Server description
        pub server: ApplicationDescription,
        /// DER encoded server certificate
        pub server_certificate: Bytes,
        /// Required message security mode
        pub security_mode: MessageSecurityMode,
        /// Security policy URI
        pub security_policy_uri: String,
        /// Accepted user identity tokens
        pub user_identity_tokens: Vec<UserTokenPolicy>,
        /// Transport profile URI
        pub transport_profile_uri: String,
        /// Relative security ranking
        pub security_level: u8,
    }
}

impl Structure for EndpointDescription {
    const TYPE_NAME: &'static str = "EndpointDescription";
    const ENCODING_ID: u32 = 314;
}
