//! Message assembly, outbound chunking and token lifecycle for the UA secure
//! channel.
//!
//! This crate keeps the per-channel state that `ua-wire` leaves out: the
//! sequence number counters, the partially received message, the current and
//! previous security tokens and the timer that renews them.
//!
//! ## Features
//!
//! - **Message Assembly**: chunks are framed from an arbitrary byte stream,
//!   checked, decrypted and concatenated into complete messages
//! - **Sequence Tracking**: gaps and duplicates are reported, or rejected
//!   when so configured
//! - **Token Renewal**: the current token is renewed at 75% of its lifetime,
//!   the previous one stays valid until it expires
//! - **Outbound Chunking**: messages are split to the negotiated send buffer
//! - **Token Authority**: server side issue and renew of channel tokens
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ua_channel::{ChannelConfig, ChannelEvent, SecureChannel, TokenAuthority};
//!
//! # async fn example() -> Result<(), ua_channel::ChannelError> {
//! let authority = Arc::new(TokenAuthority::new(Default::default()));
//! let (channel, mut events) = SecureChannel::new(ChannelConfig::default(), authority);
//! channel.open().await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ChannelEvent::Message(message) => {
//!             println!("{} for request {}", message.type_name(), message.request_id);
//!         }
//!         ChannelEvent::SecurityTokenRenewed { token_id } => {
//!             println!("Now using token {}", token_id);
//!         }
//!         ChannelEvent::Closed { reason } => {
//!             println!("Channel closed: {}", reason);
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assembler;
pub mod authority;
pub mod channel;
pub mod chunker;
pub mod config;
pub mod error;
pub mod event;
pub mod token;

// Re-export main types
pub use assembler::{FramingMode, MessageAssembler};
pub use authority::TokenAuthority;
pub use channel::{ChannelState, OutboundMessage, SecureChannel, SecureChannelService};
pub use chunker::{concat_chunks, next_sequence_number, MessageChunker};
pub use config::{AuthorityConfig, ChannelConfig, SequencePolicy};
pub use error::ChannelError;
pub use event::{ChannelEvent, DecodedMessage, EventSink};
pub use token::{ActiveToken, SecurityToken, TokenPair, TokenStore};
