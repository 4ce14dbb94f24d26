//! Server-side token issuing.
//!
//! The authority answers OpenSecureChannel requests: an Issue request creates
//! a channel, a Renew request adds a token to an existing one. Each channel
//! keeps a [`TokenStore`] that the server's assembler verifies inbound chunks
//! with.

use crate::channel::SecureChannelService;
use crate::config::AuthorityConfig;
use crate::error::ChannelError;
use crate::token::{ActiveToken, SecurityToken, TokenStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};
use ua_wire::{
    generate_nonce, ChannelKeys, ChannelSecurityToken, CryptoContext, DateTime,
    MessageSecurityMode, OpenSecureChannelRequest, OpenSecureChannelResponse, RequestHeader,
    ResponseHeader, SecurityTokenRequestType, ServiceFault, StatusCode, PROTOCOL_VERSION,
};

#[derive(Debug)]
struct ServerChannel {
    tokens: TokenStore,
    last_token_id: u32,
}

/// Issues channel ids and security tokens
#[derive(Debug)]
pub struct TokenAuthority {
    config: AuthorityConfig,
    channels: DashMap<u32, ServerChannel>,
    next_channel_id: AtomicU32,
}

impl TokenAuthority {
    /// Authority enforcing `config`
    pub fn new(config: AuthorityConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
            next_channel_id: AtomicU32::new(1),
        }
    }

    /// Configuration in force
    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Answer an open request received on `channel_id` (0 before a channel
    /// exists)
    pub fn open(
        &self,
        channel_id: u32,
        request: &OpenSecureChannelRequest,
    ) -> Result<OpenSecureChannelResponse, ChannelError> {
        self.check_request(request)?;

        let server_nonce = generate_nonce(self.config.security_policy);
        let (local, remote) = self.contexts(&request.client_nonce, &server_nonce)?;
        let revised_lifetime = self.config.revise_lifetime(request.requested_lifetime);

        let security_token = match request.request_type {
            SecurityTokenRequestType::Issue => {
                let channel_id = self.allocate_channel_id();
                let mut channel = ServerChannel {
                    tokens: TokenStore::new(),
                    last_token_id: 0,
                };
                let token = issue(&mut channel, channel_id, revised_lifetime, local, remote);
                self.channels.insert(channel_id, channel);
                info!(
                    "Issued channel {} with token {} ({} ms)",
                    channel_id, token.token_id, revised_lifetime
                );
                token
            }
            SecurityTokenRequestType::Renew => {
                let mut channel = self.channels.get_mut(&channel_id).ok_or_else(|| {
                    ChannelError::Rejected {
                        status: StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN,
                        reason: format!("channel {} is not open", channel_id),
                    }
                })?;
                let token = issue(&mut channel, channel_id, revised_lifetime, local, remote);
                debug!(
                    "Renewed channel {} with token {} ({} ms)",
                    channel_id, token.token_id, revised_lifetime
                );
                token
            }
        };

        Ok(OpenSecureChannelResponse {
            response_header: ResponseHeader::for_request(&request.request_header, StatusCode::GOOD),
            server_protocol_version: PROTOCOL_VERSION,
            security_token,
            server_nonce,
        })
    }

    /// Tokens of `channel_id`, for the assembler serving that channel
    pub fn token_store(&self, channel_id: u32) -> Option<TokenStore> {
        self.channels
            .get(&channel_id)
            .map(|channel| channel.tokens.clone())
    }

    /// Forget `channel_id`; false if it was not open
    pub fn close_channel(&self, channel_id: u32) -> bool {
        match self.channels.remove(&channel_id) {
            Some((_, channel)) => {
                channel.tokens.clear();
                info!("Closed channel {}", channel_id);
                true
            }
            None => false,
        }
    }

    /// Number of open channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Fault answering `request` with the status of `err`
    pub fn fault(request: &RequestHeader, err: &ChannelError) -> ServiceFault {
        ServiceFault {
            response_header: ResponseHeader::for_request(request, err.status_code()),
        }
    }

    fn allocate_channel_id(&self) -> u32 {
        loop {
            let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    fn check_request(&self, request: &OpenSecureChannelRequest) -> Result<(), ChannelError> {
        let policy = self.config.security_policy;
        if request.security_mode != self.config.security_mode {
            warn!(
                "Rejecting security mode {} (expected {})",
                request.security_mode.as_str(),
                self.config.security_mode.as_str()
            );
            return Err(ChannelError::Rejected {
                status: StatusCode::BAD_SECURITY_MODE_REJECTED,
                reason: format!(
                    "security mode {} not offered",
                    request.security_mode.as_str()
                ),
            });
        }
        policy
            .validate_mode(request.security_mode)
            .map_err(|err| ChannelError::Rejected {
                status: StatusCode::BAD_SECURITY_POLICY_REJECTED,
                reason: err.to_string(),
            })?;
        let nonce_size = policy.nonce_size();
        if nonce_size > 0 && request.client_nonce.len() != nonce_size {
            return Err(ChannelError::Rejected {
                status: StatusCode::BAD_NONCE_INVALID,
                reason: format!(
                    "client nonce has {} bytes, expected {}",
                    request.client_nonce.len(),
                    nonce_size
                ),
            });
        }
        Ok(())
    }

    fn contexts(
        &self,
        client_nonce: &[u8],
        server_nonce: &[u8],
    ) -> Result<(CryptoContext, CryptoContext), ChannelError> {
        let policy = self.config.security_policy;
        let mode = self.config.security_mode;
        if mode == MessageSecurityMode::None {
            return Ok((CryptoContext::none(), CryptoContext::none()));
        }
        let keys = ChannelKeys::derive(client_nonce, server_nonce)?;
        Ok((
            CryptoContext::new(policy, mode, Some(keys.server))?,
            CryptoContext::new(policy, mode, Some(keys.client))?,
        ))
    }
}

fn issue(
    channel: &mut ServerChannel,
    channel_id: u32,
    revised_lifetime: u32,
    local: CryptoContext,
    remote: CryptoContext,
) -> ChannelSecurityToken {
    channel.last_token_id = channel.last_token_id.wrapping_add(1).max(1);
    let token = ChannelSecurityToken {
        channel_id,
        token_id: channel.last_token_id,
        created_at: DateTime::now(),
        revised_lifetime,
    };
    channel.tokens.install(ActiveToken {
        token: SecurityToken::from_wire(&token),
        local,
        remote,
    });
    token
}

#[async_trait]
impl SecureChannelService for TokenAuthority {
    async fn open_secure_channel(
        &self,
        channel_id: u32,
        request: OpenSecureChannelRequest,
    ) -> Result<OpenSecureChannelResponse, ChannelError> {
        self.open(channel_id, &request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use ua_wire::SecurityPolicy;

    fn request(request_type: SecurityTokenRequestType) -> OpenSecureChannelRequest {
        OpenSecureChannelRequest {
            request_header: RequestHeader {
                request_handle: 77,
                ..Default::default()
            },
            request_type,
            security_mode: MessageSecurityMode::None,
            requested_lifetime: 60_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_issue_allocates_channels() {
        let authority = TokenAuthority::new(AuthorityConfig::default());
        let first = authority
            .open(0, &request(SecurityTokenRequestType::Issue))
            .unwrap();
        let second = authority
            .open(0, &request(SecurityTokenRequestType::Issue))
            .unwrap();
        assert_ne!(
            first.security_token.channel_id,
            second.security_token.channel_id
        );
        assert_eq!(first.security_token.token_id, 1);
        assert_eq!(first.response_header.request_handle, 77);
        assert!(first.response_header.service_result.is_good());
        assert_eq!(authority.channel_count(), 2);
    }

    #[test]
    fn test_renew_increments_token_id() {
        let authority = TokenAuthority::new(AuthorityConfig::default());
        let issued = authority
            .open(0, &request(SecurityTokenRequestType::Issue))
            .unwrap();
        let channel_id = issued.security_token.channel_id;
        let renewed = authority
            .open(channel_id, &request(SecurityTokenRequestType::Renew))
            .unwrap();
        assert_eq!(renewed.security_token.channel_id, channel_id);
        assert_eq!(renewed.security_token.token_id, 2);

        let pair = authority.token_store(channel_id).unwrap().snapshot();
        assert_eq!(pair.current.as_ref().map(ActiveToken::token_id), Some(2));
        assert_eq!(pair.previous.as_ref().map(ActiveToken::token_id), Some(1));
    }

    #[test]
    fn test_renew_unknown_channel() {
        let authority = TokenAuthority::new(AuthorityConfig::default());
        let err = authority
            .open(42, &request(SecurityTokenRequestType::Renew))
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN);
    }

    #[test]
    fn test_lifetime_clamped() {
        let authority = TokenAuthority::new(AuthorityConfig {
            min_lifetime: Duration::from_millis(500),
            max_lifetime: Duration::from_secs(10),
            ..AuthorityConfig::default()
        });
        let mut short = request(SecurityTokenRequestType::Issue);
        short.requested_lifetime = 1;
        let response = authority.open(0, &short).unwrap();
        assert_eq!(response.security_token.revised_lifetime, 500);

        let mut long = request(SecurityTokenRequestType::Issue);
        long.requested_lifetime = u32::MAX;
        let response = authority.open(0, &long).unwrap();
        assert_eq!(response.security_token.revised_lifetime, 10_000);
    }

    #[test]
    fn test_mode_and_nonce_checked() {
        let authority = TokenAuthority::new(AuthorityConfig {
            security_policy: SecurityPolicy::Aes256GcmSha256,
            security_mode: MessageSecurityMode::Sign,
            ..AuthorityConfig::default()
        });
        let err = authority
            .open(0, &request(SecurityTokenRequestType::Issue))
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_SECURITY_MODE_REJECTED);

        let mut signed = request(SecurityTokenRequestType::Issue);
        signed.security_mode = MessageSecurityMode::Sign;
        signed.client_nonce = Bytes::from_static(&[1, 2, 3]);
        let err = authority.open(0, &signed).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_NONCE_INVALID);

        signed.client_nonce = Bytes::from(vec![9u8; 32]);
        let response = authority.open(0, &signed).unwrap();
        assert_eq!(response.server_nonce.len(), 32);
        let store = authority
            .token_store(response.security_token.channel_id)
            .unwrap();
        let current = store.current().unwrap();
        assert_eq!(current.local.mode(), MessageSecurityMode::Sign);
    }

    #[test]
    fn test_close_channel() {
        let authority = TokenAuthority::new(AuthorityConfig::default());
        let issued = authority
            .open(0, &request(SecurityTokenRequestType::Issue))
            .unwrap();
        let channel_id = issued.security_token.channel_id;
        let store = authority.token_store(channel_id).unwrap();
        assert!(authority.close_channel(channel_id));
        assert!(!authority.close_channel(channel_id));
        assert!(store.current().is_none());
        assert!(authority.token_store(channel_id).is_none());
    }

    #[test]
    fn test_fault() {
        let header = RequestHeader {
            request_handle: 5,
            ..Default::default()
        };
        let fault = TokenAuthority::fault(&header, &ChannelError::TokenExpired(3));
        assert_eq!(fault.response_header.request_handle, 5);
        assert_eq!(
            fault.response_header.service_result,
            StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN
        );
    }
}
