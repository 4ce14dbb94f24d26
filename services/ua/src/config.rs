//! Configuration handling for the secure channel stack.
//!
//! Settings are read from a YAML file and then overridden by `UA_CHANNEL_*`
//! environment variables, giving one configuration for both the client
//! channel and the token authority.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use ua_channel::{AuthorityConfig, ChannelConfig, SequencePolicy};
use ua_wire::{MessageSecurityMode, SecurityPolicy};

/// Prefix of the environment overrides
pub const ENV_PREFIX: &str = "UA_CHANNEL_";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the channel crates
    pub level: String,
    /// Name shown for events outside the channel crates
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "ua".to_string(),
        }
    }
}

/// Stack configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Client channel settings
    pub channel: ChannelConfig,
    /// Server token issuing settings
    pub authority: AuthorityConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl StackConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_yaml(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                crate::component_info!("config", "Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                crate::component_warn!("config", "Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();

        info!(
            "Final channel configuration: policy={}, mode={}, lifetime={}, renewal_fraction={}",
            config.channel.security_policy.uri(),
            config.channel.security_mode.as_str(),
            humantime::format_duration(config.channel.requested_lifetime),
            config.channel.renewal_fraction
        );
        Ok(config)
    }

    /// Parse a YAML document; missing keys keep their defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides looked up by full variable name
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = var("SECURITY_POLICY") {
            match SecurityPolicy::from_uri(&value).ok().or_else(|| parse_policy(&value)) {
                Some(policy) => {
                    self.channel.security_policy = policy;
                    self.authority.security_policy = policy;
                    info!("Security policy overridden by environment: {}", policy.uri());
                }
                None => warn!("Ignoring {}: unknown policy {:?}", key, value),
            }
        }

        if let Some((key, value)) = var("SECURITY_MODE") {
            match parse_mode(&value) {
                Some(mode) => {
                    self.channel.security_mode = mode;
                    self.authority.security_mode = mode;
                    info!("Security mode overridden by environment: {}", mode.as_str());
                }
                None => warn!("Ignoring {}: unknown mode {:?}", key, value),
            }
        }

        if let Some((key, value)) = var("REQUESTED_LIFETIME") {
            if let Some(lifetime) = parse_duration(&key, &value) {
                self.channel.requested_lifetime = lifetime;
                info!("Requested lifetime overridden by environment: {}", value);
            }
        }

        if let Some((key, value)) = var("RENEWAL_FRACTION") {
            match value.parse::<f64>() {
                Ok(fraction) if fraction > 0.0 && fraction < 1.0 => {
                    self.channel.renewal_fraction = fraction;
                    info!("Renewal fraction overridden by environment: {}", fraction);
                }
                _ => warn!("Ignoring {}: {:?} is not a fraction", key, value),
            }
        }

        if let Some((key, value)) = var("RENEWAL_RETRY_INTERVAL") {
            if let Some(interval) = parse_duration(&key, &value) {
                self.channel.renewal_retry_interval = interval;
            }
        }

        if let Some((key, value)) = var("SEQUENCE_POLICY") {
            match value.to_lowercase().as_str() {
                "report" => self.channel.sequence_policy = SequencePolicy::Report,
                "reject" => self.channel.sequence_policy = SequencePolicy::Reject,
                _ => warn!("Ignoring {}: unknown sequence policy {:?}", key, value),
            }
        }

        if let Some((key, value)) = var("MAX_LIFETIME") {
            if let Some(lifetime) = parse_duration(&key, &value) {
                self.authority.max_lifetime = lifetime;
            }
        }

        if let Some((_, value)) = var("LOG_LEVEL") {
            self.logging.level = value;
        }
    }
}

fn parse_duration(key: &str, value: &str) -> Option<Duration> {
    match humantime::parse_duration(value) {
        Ok(duration) => Some(duration),
        Err(err) => {
            warn!("Ignoring {}: {}", key, err);
            None
        }
    }
}

fn parse_policy(value: &str) -> Option<SecurityPolicy> {
    match value.to_lowercase().as_str() {
        "none" => Some(SecurityPolicy::None),
        "aes256gcm_sha256" | "aes256gcmsha256" => Some(SecurityPolicy::Aes256GcmSha256),
        "chacha20poly1305_sha256" | "chacha20poly1305sha256" => {
            Some(SecurityPolicy::ChaCha20Poly1305Sha256)
        }
        _ => None,
    }
}

fn parse_mode(value: &str) -> Option<MessageSecurityMode> {
    match value.to_lowercase().as_str() {
        "none" => Some(MessageSecurityMode::None),
        "sign" => Some(MessageSecurityMode::Sign),
        "signandencrypt" | "sign_and_encrypt" => Some(MessageSecurityMode::SignAndEncrypt),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = StackConfig::default();
        assert_eq!(config.channel.requested_lifetime, Duration::from_secs(3600));
        assert_eq!(config.channel.renewal_fraction, 0.75);
        assert_eq!(config.channel.sequence_policy, SequencePolicy::Report);
        assert_eq!(config.authority.max_lifetime, Duration::from_secs(3600));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
channel:
  security_policy: "urn:ua-channel:SecurityPolicy#ChaCha20Poly1305_Sha256"
  security_mode: SignAndEncrypt
  requested_lifetime: 10m
  renewal_retry_interval: 250ms
  sequence_policy: reject
  limits:
    send_buffer_size: 8192
  decoding:
    max_string_length: 1024
authority:
  min_lifetime: 5s
logging:
  level: debug
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = StackConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(
            config.channel.security_policy,
            SecurityPolicy::ChaCha20Poly1305Sha256
        );
        assert_eq!(
            config.channel.security_mode,
            MessageSecurityMode::SignAndEncrypt
        );
        assert_eq!(config.channel.requested_lifetime, Duration::from_secs(600));
        assert_eq!(
            config.channel.renewal_retry_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.channel.sequence_policy, SequencePolicy::Reject);
        assert_eq!(config.channel.limits.send_buffer_size, 8192);
        assert_eq!(config.channel.limits.receive_buffer_size, 65_536);
        assert_eq!(config.channel.decoding.max_string_length, 1024);
        assert_eq!(config.authority.min_lifetime, Duration::from_secs(5));
        assert_eq!(config.authority.max_lifetime, Duration::from_secs(3600));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StackConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.channel, ChannelConfig::default());
    }

    #[test]
    fn test_invalid_file_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"channel:\n  security_policy: \"urn:unknown\"\n")
            .unwrap();
        assert!(StackConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("UA_CHANNEL_SECURITY_POLICY", "aes256gcm_sha256"),
            ("UA_CHANNEL_SECURITY_MODE", "Sign"),
            ("UA_CHANNEL_REQUESTED_LIFETIME", "90s"),
            ("UA_CHANNEL_RENEWAL_FRACTION", "0.5"),
            ("UA_CHANNEL_SEQUENCE_POLICY", "REJECT"),
            ("UA_CHANNEL_MAX_LIFETIME", "not a duration"),
        ]
        .into_iter()
        .collect();

        let mut config = StackConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|value| value.to_string()));

        assert_eq!(config.channel.security_policy, SecurityPolicy::Aes256GcmSha256);
        assert_eq!(config.authority.security_policy, SecurityPolicy::Aes256GcmSha256);
        assert_eq!(config.channel.security_mode, MessageSecurityMode::Sign);
        assert_eq!(config.channel.requested_lifetime, Duration::from_secs(90));
        assert_eq!(config.channel.renewal_fraction, 0.5);
        assert_eq!(config.channel.sequence_policy, SequencePolicy::Reject);
        // Unparsable values leave the setting alone
        assert_eq!(config.authority.max_lifetime, Duration::from_secs(3600));
    }

    #[test]
    fn test_bad_fraction_ignored() {
        let mut config = StackConfig::default();
        config.apply_overrides(|key| {
            (key == "UA_CHANNEL_RENEWAL_FRACTION").then(|| "1.5".to_string())
        });
        assert_eq!(config.channel.renewal_fraction, 0.75);
    }
}
