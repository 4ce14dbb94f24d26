//! Secure channel transport core for UA binary messaging.
//!
//! This crate ties the stack together: it re-exports the wire layer
//! ([`ua_wire`]) and the channel layer ([`ua_channel`]) and adds the
//! configuration file and log output shared by programs embedding them.
//!
//! ## Features
//!
//! - **Wire Layer**: encoding, type registry, chunk codec and message security
//! - **Channel Layer**: message assembly, token renewal and the token authority
//! - **Configuration**: YAML file with `UA_CHANNEL_*` environment overrides
//! - **Logging**: `[timestamp] [component] [level] message` log lines
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ua_securechannel::{init_logging, SecureChannel, StackConfig, TokenAuthority};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = StackConfig::load_from_file("ua.yaml")?;
//! init_logging(&config.logging)?;
//!
//! let authority = Arc::new(TokenAuthority::new(config.authority.clone()));
//! let (channel, _events) = SecureChannel::new(config.channel.clone(), authority);
//! channel.open().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod logging;

pub use ua_channel;
pub use ua_wire;

// Re-export main types
pub use config::{LoggingConfig, StackConfig, ENV_PREFIX};
pub use logging::{env_filter, init_logging, ChannelLogFormatter};
pub use ua_channel::{
    AuthorityConfig, ChannelConfig, ChannelError, ChannelEvent, ChannelState, DecodedMessage,
    MessageAssembler, MessageChunker, SecureChannel, SecureChannelService, SequencePolicy,
    TokenAuthority,
};
pub use ua_wire::{
    ChunkCodec, CryptoContext, MessageSecurityMode, SecurityPolicy, StatusCode, TypeRegistry,
};
