//! Secure channel and discovery service messages.

use crate::encoding::DateTime;
use crate::registry::{Structure, TypeDescriptor, TypeRegistry};
use crate::types::{
    ApplicationDescription, EndpointDescription, MessageSecurityMode, RequestHeader,
    ResponseHeader, SecurityTokenRequestType, UserTokenPolicy,
};
use bytes::Bytes;

ua_struct! {
    /// Security token issued for a channel
    pub struct ChannelSecurityToken {
        /// Channel the token belongs to
        pub channel_id: u32,
        /// Token identifier, unique within the channel
        pub token_id: u32,
        /// Issue time
        pub created_at: DateTime,
        /// Lifetime granted by the server, in milliseconds
        pub revised_lifetime: u32,
    }
}

impl Structure for ChannelSecurityToken {
    const TYPE_NAME: &'static str = "ChannelSecurityToken";
    const ENCODING_ID: u32 = 443;
}

ua_struct! {
    /// Request to issue or renew a channel token
    pub struct OpenSecureChannelRequest {
        /// Request header
        pub request_header: RequestHeader,
        /// Protocol version spoken by the client
        pub client_protocol_version: u32,
        /// Issue or renew
        pub request_type: SecurityTokenRequestType,
        /// Requested message security mode
        pub security_mode: MessageSecurityMode,
        /// Client nonce used for key derivation
        pub client_nonce: Bytes,
        /// Requested token lifetime in milliseconds
        pub requested_lifetime: u32,
    }
}

impl Structure for OpenSecureChannelRequest {
    const TYPE_NAME: &'static str = "OpenSecureChannelRequest";
    const ENCODING_ID: u32 = 446;
}

ua_struct! {
    /// Token issued in answer to an [`OpenSecureChannelRequest`]
    pub struct OpenSecureChannelResponse {
        /// Response header
        pub response_header: ResponseHeader,
        /// Protocol version spoken by the server
        pub server_protocol_version: u32,
        /// New token
        pub security_token: ChannelSecurityToken,
        /// Server nonce used for key derivation
        pub server_nonce: Bytes,
    }
}

impl Structure for OpenSecureChannelResponse {
    const TYPE_NAME: &'static str = "OpenSecureChannelResponse";
    const ENCODING_ID: u32 = 449;
}

ua_struct! {
    /// Request to close a channel
    pub struct CloseSecureChannelRequest {
        /// Request header
        pub request_header: RequestHeader,
    }
}

impl Structure for CloseSecureChannelRequest {
    const TYPE_NAME: &'static str = "CloseSecureChannelRequest";
    const ENCODING_ID: u32 = 452;
}

ua_struct! {
    /// Close acknowledgement
    pub struct CloseSecureChannelResponse {
        /// Response header
        pub response_header: ResponseHeader,
    }
}

impl Structure for CloseSecureChannelResponse {
    const TYPE_NAME: &'static str = "CloseSecureChannelResponse";
    const ENCODING_ID: u32 = 455;
}

ua_struct! {
    /// Discovery request for the endpoints of a server
    pub struct GetEndpointsRequest {
        /// Request header
        pub request_header: RequestHeader,
        /// URL the client used to reach the server
        pub endpoint_url: String,
        /// Preferred locales
        pub locale_ids: Vec<String>,
        /// Transport profiles to filter by
        pub profile_uris: Vec<String>,
    }
}

impl Structure for GetEndpointsRequest {
    const TYPE_NAME: &'static str = "GetEndpointsRequest";
    const ENCODING_ID: u32 = 428;
}

ua_struct! {
    /// Endpoints offered by a server
    pub struct GetEndpointsResponse {
        /// Response header
        pub response_header: ResponseHeader,
        /// Endpoint descriptions
        pub endpoints: Vec<EndpointDescription>,
    }
}

impl Structure for GetEndpointsResponse {
    const TYPE_NAME: &'static str = "GetEndpointsResponse";
    const ENCODING_ID: u32 = 431;
}

ua_struct! {
    /// Response sent instead of the expected one when a service fails
    pub struct ServiceFault {
        /// Header carrying the failure status
        pub response_header: ResponseHeader,
    }
}

impl Structure for ServiceFault {
    const TYPE_NAME: &'static str = "ServiceFault";
    const ENCODING_ID: u32 = 397;
}

pub(crate) fn register_standard_types(registry: &mut TypeRegistry) {
    let descriptors = [
        TypeDescriptor::of::<RequestHeader>(),
        TypeDescriptor::of::<ResponseHeader>(),
        TypeDescriptor::of::<ApplicationDescription>(),
        TypeDescriptor::of::<UserTokenPolicy>(),
        TypeDescriptor::of::<EndpointDescription>(),
        TypeDescriptor::of::<ChannelSecurityToken>(),
        TypeDescriptor::of::<OpenSecureChannelRequest>(),
        TypeDescriptor::of::<OpenSecureChannelResponse>(),
        TypeDescriptor::of::<CloseSecureChannelRequest>(),
        TypeDescriptor::of::<CloseSecureChannelResponse>(),
        TypeDescriptor::of::<GetEndpointsRequest>(),
        TypeDescriptor::of::<GetEndpointsResponse>(),
        TypeDescriptor::of::<ServiceFault>(),
    ];
    for descriptor in descriptors {
        // Standard ids are distinct constants; a clash is a programming error
        if let Err(e) = registry.register_descriptor(descriptor) {
            tracing::error!("Failed to register standard type: {}", e);
        }
    }
}
