//! Channel and token authority configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use ua_wire::{DecodingLimits, MessageSecurityMode, SecurityPolicy, TransportLimits};

/// Handling of chunks whose sequence number does not follow the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequencePolicy {
    /// Emit a notification and keep processing the chunk
    #[default]
    Report,
    /// Emit a notification and drop the message being assembled
    Reject,
}

/// Client channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Security policy to request
    pub security_policy: SecurityPolicy,
    /// Message security mode to request
    pub security_mode: MessageSecurityMode,
    /// Token lifetime asked of the server
    #[serde(with = "duration_serde")]
    pub requested_lifetime: Duration,
    /// Fraction of the revised lifetime after which the token is renewed
    pub renewal_fraction: f64,
    /// Delay between attempts after a failed renewal
    #[serde(with = "duration_serde")]
    pub renewal_retry_interval: Duration,
    /// Sequence number strictness
    pub sequence_policy: SequencePolicy,
    /// Buffer and message limits
    pub limits: TransportLimits,
    /// Limits applied while decoding message bodies
    pub decoding: DecodingLimits,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            security_policy: SecurityPolicy::None,
            security_mode: MessageSecurityMode::None,
            requested_lifetime: Duration::from_secs(3600),
            renewal_fraction: 0.75,
            renewal_retry_interval: Duration::from_secs(1),
            sequence_policy: SequencePolicy::Report,
            limits: TransportLimits::default(),
            decoding: DecodingLimits::default(),
        }
    }
}

impl ChannelConfig {
    /// Delay before renewing a token granted for `lifetime`
    pub fn renewal_delay(&self, lifetime: Duration) -> Duration {
        let fraction = if self.renewal_fraction.is_finite() {
            self.renewal_fraction.clamp(0.0, 1.0)
        } else {
            0.75
        };
        lifetime.mul_f64(fraction)
    }

    /// Requested lifetime in milliseconds, saturating at `u32::MAX`
    pub fn requested_lifetime_ms(&self) -> u32 {
        u32::try_from(self.requested_lifetime.as_millis()).unwrap_or(u32::MAX)
    }
}

/// Server-side token issuing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Security policy the server accepts
    pub security_policy: SecurityPolicy,
    /// Message security mode the server accepts
    pub security_mode: MessageSecurityMode,
    /// Shortest lifetime granted
    #[serde(with = "duration_serde")]
    pub min_lifetime: Duration,
    /// Longest lifetime granted
    #[serde(with = "duration_serde")]
    pub max_lifetime: Duration,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            security_policy: SecurityPolicy::None,
            security_mode: MessageSecurityMode::None,
            min_lifetime: Duration::from_secs(1),
            max_lifetime: Duration::from_secs(3600),
        }
    }
}

impl AuthorityConfig {
    /// Clamp a requested lifetime in milliseconds to the configured bounds
    pub fn revise_lifetime(&self, requested_ms: u32) -> u32 {
        let min = u32::try_from(self.min_lifetime.as_millis()).unwrap_or(u32::MAX);
        let max = u32::try_from(self.max_lifetime.as_millis()).unwrap_or(u32::MAX);
        requested_ms.clamp(min, max.max(min))
    }
}

// Durations as human readable strings ("1h", "750ms")
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.requested_lifetime_ms(), 3_600_000);
        assert_eq!(config.sequence_policy, SequencePolicy::Report);
        assert_eq!(
            config.renewal_delay(Duration::from_millis(100)),
            Duration::from_millis(75)
        );
    }

    #[test]
    fn test_renewal_fraction_clamped() {
        let config = ChannelConfig {
            renewal_fraction: 3.0,
            ..ChannelConfig::default()
        };
        assert_eq!(
            config.renewal_delay(Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_revise_lifetime() {
        let config = AuthorityConfig::default();
        assert_eq!(config.revise_lifetime(10), 1000);
        assert_eq!(config.revise_lifetime(60_000), 60_000);
        assert_eq!(config.revise_lifetime(u32::MAX), 3_600_000);
    }
}
