//! Client side secure channel.
//!
//! A [`SecureChannel`] owns the channel id, the token pair, the inbound
//! assembler and the outbound chunker. Opening and renewing go through a
//! [`SecureChannelService`], which carries an OpenSecureChannel request to the
//! server and returns its response. While the channel is open a background
//! task renews the current token once the configured fraction of its lifetime
//! has passed.

use crate::assembler::MessageAssembler;
use crate::chunker::{concat_chunks, MessageChunker};
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::event::ChannelEvent;
use crate::token::{ActiveToken, SecurityToken, TokenStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use ua_wire::{
    generate_nonce, AcknowledgeMessage, ChannelKeys, CloseSecureChannelRequest, CryptoContext,
    DateTime, MessageSecurityMode, MessageType, OpenSecureChannelRequest,
    OpenSecureChannelResponse, RequestHeader, SecurityHeader, SecurityTokenRequestType,
    StatusCode, TypeRegistry, UaObject, PROTOCOL_VERSION,
};

/// Carries OpenSecureChannel requests to the server
#[async_trait]
pub trait SecureChannelService: Send + Sync {
    /// Send `request` on `channel_id` (0 when issuing) and wait for the answer
    async fn open_secure_channel(
        &self,
        channel_id: u32,
        request: OpenSecureChannelRequest,
    ) -> Result<OpenSecureChannelResponse, ChannelError>;
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No token
    Closed,
    /// First token requested
    Opening,
    /// Token installed, renewal scheduled
    Open,
}

/// Chunks of one outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Request id carried by every chunk
    pub request_id: u32,
    /// Encoded chunks in sending order
    pub chunks: Vec<Bytes>,
}

impl OutboundMessage {
    /// All chunks as one buffer
    pub fn to_bytes(&self) -> Bytes {
        concat_chunks(&self.chunks)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    config: ChannelConfig,
    service: Arc<dyn SecureChannelService>,
    state: Mutex<ChannelState>,
    channel_id: AtomicU32,
    request_ids: AtomicU32,
    tokens: TokenStore,
    assembler: Mutex<MessageAssembler>,
    chunker: Mutex<MessageChunker>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    renewal: Mutex<Option<JoinHandle<()>>>,
    token_installed: Arc<Notify>,
}

impl Inner {
    fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }

    fn next_request_id(&self) -> u32 {
        loop {
            let id = self.request_ids.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Run one OpenSecureChannel exchange and install the resulting token
    async fn request_token(
        &self,
        request_type: SecurityTokenRequestType,
    ) -> Result<u32, ChannelError> {
        let policy = self.config.security_policy;
        let mode = self.config.security_mode;
        policy.validate_mode(mode)?;

        let client_nonce = generate_nonce(policy);
        let channel_id = self.channel_id.load(Ordering::Acquire);
        let request = OpenSecureChannelRequest {
            request_header: RequestHeader {
                timestamp: DateTime::now(),
                request_handle: self.next_request_id(),
                ..Default::default()
            },
            client_protocol_version: PROTOCOL_VERSION,
            request_type,
            security_mode: mode,
            client_nonce: client_nonce.clone(),
            requested_lifetime: self.config.requested_lifetime_ms(),
        };

        let response = self
            .service
            .open_secure_channel(channel_id, request)
            .await?;

        let status = response.response_header.service_result;
        if status.is_bad() {
            return Err(ChannelError::Rejected {
                status,
                reason: "open secure channel refused".to_string(),
            });
        }
        let token = &response.security_token;
        if token.channel_id == 0 {
            return Err(ChannelError::Handshake(
                "server assigned channel id 0".to_string(),
            ));
        }
        if request_type == SecurityTokenRequestType::Renew && token.channel_id != channel_id {
            return Err(ChannelError::ChannelId {
                expected: channel_id,
                found: token.channel_id,
            });
        }
        let nonce_size = policy.nonce_size();
        if nonce_size > 0 && response.server_nonce.len() != nonce_size {
            return Err(ChannelError::Rejected {
                status: StatusCode::BAD_NONCE_INVALID,
                reason: format!(
                    "server nonce has {} bytes, expected {}",
                    response.server_nonce.len(),
                    nonce_size
                ),
            });
        }

        let (local, remote) = if mode == MessageSecurityMode::None {
            (CryptoContext::none(), CryptoContext::none())
        } else {
            let keys = ChannelKeys::derive(&client_nonce, &response.server_nonce)?;
            (
                CryptoContext::new(policy, mode, Some(keys.client))?,
                CryptoContext::new(policy, mode, Some(keys.server))?,
            )
        };

        // A close that ran during the exchange wins; the token is dropped
        let mut state = lock(&self.state);
        let expected = match request_type {
            SecurityTokenRequestType::Issue => ChannelState::Opening,
            SecurityTokenRequestType::Renew => ChannelState::Open,
        };
        if *state != expected {
            debug!(
                "Discarding token {} of channel {}: channel is {:?}",
                token.token_id, token.channel_id, *state
            );
            return Err(ChannelError::Closed);
        }
        self.channel_id.store(token.channel_id, Ordering::Release);
        lock(&self.assembler).set_channel_id(token.channel_id);
        self.tokens.install(ActiveToken {
            token: SecurityToken::from_wire(token),
            local,
            remote,
        });
        match request_type {
            SecurityTokenRequestType::Issue => *state = ChannelState::Open,
            SecurityTokenRequestType::Renew => {
                self.emit(ChannelEvent::SecurityTokenRenewed {
                    token_id: token.token_id,
                });
            }
        }
        self.token_installed.notify_one();
        Ok(token.token_id)
    }

    async fn renew(&self) -> Result<u32, ChannelError> {
        if self.state() != ChannelState::Open {
            return Err(ChannelError::Closed);
        }
        let token_id = self
            .request_token(SecurityTokenRequestType::Renew)
            .await?;
        info!(
            "Renewed security token of channel {}: token {}",
            self.channel_id.load(Ordering::Acquire),
            token_id
        );
        Ok(token_id)
    }

    /// Renew after the renewal point was reached; false once the channel is
    /// closed
    async fn renew_until_expired(&self) -> bool {
        let Some(current) = self.tokens.current() else {
            return false;
        };
        self.emit(ChannelEvent::Lifetime75 {
            token_id: current.token_id(),
        });

        loop {
            let expires_at = self
                .tokens
                .snapshot()
                .valid_current(Instant::now())
                .map(|active| active.token.expires_at());
            let Some(expires_at) = expires_at else {
                self.shut_down("security token expired before it could be renewed");
                return false;
            };

            // An attempt may not outlive the token it replaces
            let err = match tokio::time::timeout_at(expires_at.into(), self.renew()).await {
                Ok(Ok(_)) => return true,
                Ok(Err(ChannelError::Closed)) => return false,
                Ok(Err(err)) => err,
                Err(_) => ChannelError::Rejected {
                    status: StatusCode::BAD_TIMEOUT,
                    reason: "no answer to the renew request".to_string(),
                },
            };
            warn!("Security token renewal failed: {}", err);
            let retry_at = Instant::now() + self.config.renewal_retry_interval;
            tokio::time::sleep_until(retry_at.min(expires_at).into()).await;
        }
    }

    fn shut_down(&self, reason: &str) {
        {
            let mut state = lock(&self.state);
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        self.tokens.clear();
        lock(&self.assembler).reset();
        // Dropping the handle detaches the task; it ends on its own
        drop(lock(&self.renewal).take());
        info!(
            "Secure channel {} closed: {}",
            self.channel_id.load(Ordering::Acquire),
            reason
        );
        self.emit(ChannelEvent::Closed {
            reason: reason.to_string(),
        });
    }
}

async fn renewal_loop(inner: Weak<Inner>, token_installed: Arc<Notify>) {
    loop {
        let deadline = {
            let Some(channel) = inner.upgrade() else {
                return;
            };
            let Some(current) = channel.tokens.current() else {
                return;
            };
            current.token.installed_at + channel.config.renewal_delay(current.token.revised_lifetime)
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline.into()) => {}
            // A newer token moves the renewal point
            _ = token_installed.notified() => continue,
        }

        let Some(channel) = inner.upgrade() else {
            return;
        };
        if !channel.renew_until_expired().await {
            return;
        }
    }
}

/// Client end of a secure channel
pub struct SecureChannel {
    inner: Arc<Inner>,
}

impl SecureChannel {
    /// Channel that opens through `service`; events arrive on the returned
    /// receiver
    pub fn new(
        config: ChannelConfig,
        service: Arc<dyn SecureChannelService>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        Self::with_registry(config, service, Arc::new(TypeRegistry::standard()))
    }

    /// Channel decoding inbound messages with `registry`
    pub fn with_registry(
        config: ChannelConfig,
        service: Arc<dyn SecureChannelService>,
        registry: Arc<TypeRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let tokens = TokenStore::new();
        let assembler = MessageAssembler::new(&config, tokens.clone()).with_registry(registry);
        let chunker = MessageChunker::new(config.limits);
        let inner = Inner {
            config,
            service,
            state: Mutex::new(ChannelState::Closed),
            channel_id: AtomicU32::new(0),
            request_ids: AtomicU32::new(1),
            tokens,
            assembler: Mutex::new(assembler),
            chunker: Mutex::new(chunker),
            events,
            renewal: Mutex::new(None),
            token_installed: Arc::new(Notify::new()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Lifecycle state
    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Channel id assigned by the server, 0 before the first open
    pub fn channel_id(&self) -> u32 {
        self.inner.channel_id.load(Ordering::Acquire)
    }

    /// Id of the current token
    pub fn current_token_id(&self) -> Option<u32> {
        self.inner.tokens.current().map(|active| active.token_id())
    }

    /// Token pair shared with the assembler
    pub fn tokens(&self) -> &TokenStore {
        &self.inner.tokens
    }

    /// Open the channel and start the renewal timer
    pub async fn open(&self) -> Result<(), ChannelError> {
        {
            let mut state = lock(&self.inner.state);
            if *state != ChannelState::Closed {
                return Err(ChannelError::Handshake(format!(
                    "channel is {:?}, not closed",
                    *state
                )));
            }
            *state = ChannelState::Opening;
        }
        info!(
            "Opening secure channel ({}, {})",
            self.inner.config.security_policy.uri(),
            self.inner.config.security_mode.as_str()
        );

        match self
            .inner
            .request_token(SecurityTokenRequestType::Issue)
            .await
        {
            Ok(token_id) => {
                self.start_renewal();
                info!(
                    "Secure channel {} open with token {}",
                    self.channel_id(),
                    token_id
                );
                Ok(())
            }
            Err(err) => {
                let mut state = lock(&self.inner.state);
                if *state == ChannelState::Opening {
                    *state = ChannelState::Closed;
                }
                drop(state);
                warn!("Failed to open secure channel: {}", err);
                Err(err)
            }
        }
    }

    /// Request a new token now; the current one stays valid until it expires
    pub async fn renew(&self) -> Result<(), ChannelError> {
        self.inner.renew().await.map(|_| ())
    }

    fn start_renewal(&self) {
        let handle = tokio::spawn(renewal_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.token_installed),
        ));
        if let Some(previous) = lock(&self.inner.renewal).replace(handle) {
            previous.abort();
        }
    }

    /// Apply the limits acknowledged by the server
    pub fn apply_acknowledge(&self, ack: &AcknowledgeMessage) {
        let limits = self.inner.config.limits.accept(ack);
        debug!(
            "Transport limits: receive {} send {} max message {} max chunks {}",
            limits.receive_buffer_size,
            limits.send_buffer_size,
            limits.max_message_size,
            limits.max_chunk_count
        );
        lock(&self.inner.assembler).set_limits(limits);
        lock(&self.inner.chunker).set_limits(limits);
    }

    /// Feed received bytes; resulting events go to the event receiver
    pub fn feed(&self, data: &[u8]) {
        let mut sink = self.inner.events.clone();
        lock(&self.inner.assembler).feed(data, &mut sink);
    }

    fn sending_token(&self) -> Result<ActiveToken, ChannelError> {
        if self.state() != ChannelState::Open {
            return Err(ChannelError::Closed);
        }
        let pair = self.inner.tokens.snapshot();
        match pair.valid_current(Instant::now()) {
            Some(active) => Ok(active.clone()),
            None => Err(ChannelError::TokenExpired(
                pair.current.as_ref().map(ActiveToken::token_id).unwrap_or(0),
            )),
        }
    }

    /// Encode `object` as a MSG under the current token
    pub fn encode(&self, object: &dyn UaObject) -> Result<OutboundMessage, ChannelError> {
        let token = self.sending_token()?;
        let request_id = self.inner.next_request_id();
        let chunks = lock(&self.inner.chunker).encode_message(
            MessageType::Message,
            self.channel_id(),
            &SecurityHeader::Symmetric {
                token_id: token.token_id(),
            },
            request_id,
            object,
            &token.local,
        )?;
        Ok(OutboundMessage { request_id, chunks })
    }

    /// Encode an abort for a request whose chunks were partly sent
    pub fn encode_abort(
        &self,
        request_id: u32,
        status: StatusCode,
        reason: &str,
    ) -> Result<Bytes, ChannelError> {
        let token = self.sending_token()?;
        lock(&self.inner.chunker).encode_abort(
            MessageType::Message,
            self.channel_id(),
            &SecurityHeader::Symmetric {
                token_id: token.token_id(),
            },
            request_id,
            status,
            reason,
            &token.local,
        )
    }

    /// Close the channel; returns the CLO chunk to send if a valid token
    /// remained
    pub fn close(&self) -> Option<Bytes> {
        if let Some(handle) = lock(&self.inner.renewal).take() {
            handle.abort();
        }
        let request = self.sending_token().ok().and_then(|token| {
            let request = CloseSecureChannelRequest {
                request_header: RequestHeader {
                    timestamp: DateTime::now(),
                    request_handle: self.inner.next_request_id(),
                    ..Default::default()
                },
            };
            let encoded = lock(&self.inner.chunker).encode_message(
                MessageType::Close,
                self.channel_id(),
                &SecurityHeader::Symmetric {
                    token_id: token.token_id(),
                },
                request.request_header.request_handle,
                &request,
                &token.local,
            );
            match encoded {
                Ok(chunks) => Some(concat_chunks(&chunks)),
                Err(err) => {
                    warn!("Could not encode close request: {}", err);
                    None
                }
            }
        });

        self.inner.shut_down("closed by client");
        request
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.inner.renewal).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("channel_id", &self.channel_id())
            .field("state", &self.state())
            .field("token_id", &self.current_token_id())
            .finish()
    }
}
