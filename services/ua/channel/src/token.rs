//! Security tokens and the current/previous token pair.
//!
//! A channel keeps at most two tokens: the `current` one used for sending and
//! the `previous` one, still accepted for inbound chunks until it expires. The
//! pair is swapped as a whole so that a reader never sees a half-installed
//! renewal.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;
use ua_wire::{ChannelSecurityToken, CryptoContext, DateTime};

/// A token as seen by one side of the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityToken {
    /// Channel the token belongs to
    pub channel_id: u32,
    /// Token id
    pub token_id: u32,
    /// Issue time reported by the server
    pub created_at: DateTime,
    /// Lifetime granted by the server
    pub revised_lifetime: Duration,
    /// Local time the token was installed
    pub installed_at: Instant,
}

impl SecurityToken {
    /// Token described by `token`, installed now
    pub fn from_wire(token: &ChannelSecurityToken) -> Self {
        Self {
            channel_id: token.channel_id,
            token_id: token.token_id,
            created_at: token.created_at,
            revised_lifetime: Duration::from_millis(u64::from(token.revised_lifetime)),
            installed_at: Instant::now(),
        }
    }

    /// Local instant after which the token is no longer accepted
    pub fn expires_at(&self) -> Instant {
        self.installed_at + self.revised_lifetime
    }

    /// Whether the token has expired at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }
}

/// A token with the crypto contexts derived for it
#[derive(Debug, Clone)]
pub struct ActiveToken {
    /// Token metadata
    pub token: SecurityToken,
    /// Protects chunks we send
    pub local: CryptoContext,
    /// Verifies chunks we receive
    pub remote: CryptoContext,
}

impl ActiveToken {
    /// Token id
    pub fn token_id(&self) -> u32 {
        self.token.token_id
    }
}

/// The tokens of a channel
#[derive(Debug, Clone, Default)]
pub struct TokenPair {
    /// Token used for sending
    pub current: Option<ActiveToken>,
    /// Superseded token, accepted until it expires
    pub previous: Option<ActiveToken>,
}

impl TokenPair {
    /// Unexpired token named `token_id`
    pub fn lookup(&self, token_id: u32, now: Instant) -> Option<&ActiveToken> {
        [self.current.as_ref(), self.previous.as_ref()]
            .into_iter()
            .flatten()
            .find(|active| active.token_id() == token_id && !active.token.is_expired(now))
    }

    /// Current token if it has not expired
    pub fn valid_current(&self, now: Instant) -> Option<&ActiveToken> {
        self.current
            .as_ref()
            .filter(|active| !active.token.is_expired(now))
    }

    /// Whether any token is still accepted
    pub fn has_valid(&self, now: Instant) -> bool {
        [self.current.as_ref(), self.previous.as_ref()]
            .into_iter()
            .flatten()
            .any(|active| !active.token.is_expired(now))
    }

    fn rotated(&self, next: ActiveToken) -> Self {
        Self {
            previous: self.current.clone(),
            current: Some(next),
        }
    }
}

/// Shared, atomically swapped token pair
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    inner: Arc<RwLock<Arc<TokenPair>>>,
}

impl TokenStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent view of both tokens
    pub fn snapshot(&self) -> Arc<TokenPair> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }

    /// Make `token` current; the old current becomes previous
    pub fn install(&self, token: ActiveToken) {
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(
            "Installing token {} on channel {}",
            token.token_id(),
            token.token.channel_id
        );
        let next = guard.rotated(token);
        *guard = Arc::new(next);
    }

    /// Drop both tokens
    pub fn clear(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(TokenPair::default());
    }

    /// Current token, expired or not
    pub fn current(&self) -> Option<ActiveToken> {
        self.snapshot().current.clone()
    }
}
