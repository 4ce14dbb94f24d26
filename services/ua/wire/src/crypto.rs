//! Message security.
//!
//! A [`CryptoContext`] binds a security policy, a message security mode and
//! one direction's symmetric keys. Signatures are HMAC-SHA256. Encryption is
//! AEAD (AES-256-GCM or ChaCha20-Poly1305 depending on the policy) with a
//! per-chunk nonce built from the key set's IV and the chunk's sequence
//! number.
//!
//! Keys are derived from the nonces exchanged while opening or renewing the
//! channel with the P_SHA256 pseudo-random function.

use crate::error::SecurityError;
use crate::types::MessageSecurityMode;
use aes_gcm::Aes256Gcm;
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signature size
pub const SIGNATURE_SIZE: usize = 32;

/// AEAD authentication tag size
pub const TAG_SIZE: usize = 16;

/// Padded plaintext is a multiple of this size
pub const BLOCK_SIZE: usize = 16;

const KEY_SIZE: usize = 32;
const IV_SIZE: usize = 12;

/// Supported security policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SecurityPolicy {
    /// No security
    #[default]
    None,
    /// HMAC-SHA256 signatures, AES-256-GCM encryption
    Aes256GcmSha256,
    /// HMAC-SHA256 signatures, ChaCha20-Poly1305 encryption
    ChaCha20Poly1305Sha256,
}

impl SecurityPolicy {
    /// Policy URI carried in the asymmetric security header
    pub fn uri(self) -> &'static str {
        match self {
            SecurityPolicy::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            SecurityPolicy::Aes256GcmSha256 => "urn:ua-channel:SecurityPolicy#Aes256Gcm_Sha256",
            SecurityPolicy::ChaCha20Poly1305Sha256 => {
                "urn:ua-channel:SecurityPolicy#ChaCha20Poly1305_Sha256"
            }
        }
    }

    /// Policy named by `uri`
    pub fn from_uri(uri: &str) -> Result<Self, SecurityError> {
        [
            SecurityPolicy::None,
            SecurityPolicy::Aes256GcmSha256,
            SecurityPolicy::ChaCha20Poly1305Sha256,
        ]
        .into_iter()
        .find(|policy| policy.uri() == uri)
        .ok_or_else(|| SecurityError::UnsupportedPolicy(uri.to_string()))
    }

    /// Length of the nonces exchanged to derive keys
    pub fn nonce_size(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            _ => 32,
        }
    }

    /// Check that `mode` may be used with this policy
    pub fn validate_mode(self, mode: MessageSecurityMode) -> Result<(), SecurityError> {
        let ok = match (self, mode) {
            (_, MessageSecurityMode::Invalid) => false,
            (SecurityPolicy::None, MessageSecurityMode::None) => true,
            (SecurityPolicy::None, _) => false,
            (_, MessageSecurityMode::None) => false,
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(SecurityError::ModeRejected {
                mode: mode.as_str(),
                policy: self.uri(),
            })
        }
    }
}

impl TryFrom<String> for SecurityPolicy {
    type Error = SecurityError;

    fn try_from(uri: String) -> Result<Self, Self::Error> {
        SecurityPolicy::from_uri(&uri)
    }
}

impl From<SecurityPolicy> for String {
    fn from(policy: SecurityPolicy) -> Self {
        policy.uri().to_string()
    }
}

/// Random nonce of the size the policy requires
pub fn generate_nonce(policy: SecurityPolicy) -> Bytes {
    let mut nonce = vec![0u8; policy.nonce_size()];
    OsRng.fill_bytes(&mut nonce);
    Bytes::from(nonce)
}

/// P_SHA256 pseudo-random function: `HMAC(secret, A(i) + seed)` blocks
/// where `A(0) = seed` and `A(i) = HMAC(secret, A(i-1))`
pub fn p_sha256(secret: &[u8], seed: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>, SecurityError> {
    let mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|_| SecurityError::KeyLength(secret.len()))?;
    let mut output = Zeroizing::new(Vec::with_capacity(len + SIGNATURE_SIZE));
    let mut a = {
        let mut m = mac.clone();
        m.update(seed);
        m.finalize().into_bytes()
    };
    while output.len() < len {
        let mut m = mac.clone();
        m.update(&a);
        m.update(seed);
        output.extend_from_slice(&m.finalize().into_bytes());

        let mut m = mac.clone();
        m.update(&a);
        a = m.finalize().into_bytes();
    }
    output.truncate(len);
    Ok(output)
}

/// Signing key, encryption key and IV for one direction
pub struct SymmetricKeys {
    signing_key: Zeroizing<[u8; KEY_SIZE]>,
    encrypting_key: Zeroizing<[u8; KEY_SIZE]>,
    iv: [u8; IV_SIZE],
}

impl SymmetricKeys {
    /// Derive a key set from `P_SHA256(secret, seed)`
    pub fn derive(secret: &[u8], seed: &[u8]) -> Result<Self, SecurityError> {
        let material = p_sha256(secret, seed, KEY_SIZE * 2 + IV_SIZE)?;
        let mut signing_key = Zeroizing::new([0u8; KEY_SIZE]);
        let mut encrypting_key = Zeroizing::new([0u8; KEY_SIZE]);
        let mut iv = [0u8; IV_SIZE];
        signing_key.copy_from_slice(&material[..KEY_SIZE]);
        encrypting_key.copy_from_slice(&material[KEY_SIZE..KEY_SIZE * 2]);
        iv.copy_from_slice(&material[KEY_SIZE * 2..]);
        Ok(Self {
            signing_key,
            encrypting_key,
            iv,
        })
    }

    fn nonce(&self, sequence_number: u32) -> [u8; IV_SIZE] {
        let mut nonce = self.iv;
        for (n, s) in nonce.iter_mut().zip(sequence_number.to_le_bytes()) {
            *n ^= s;
        }
        nonce
    }
}

impl fmt::Debug for SymmetricKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKeys(<redacted>)")
    }
}

/// Key sets of both channel directions
#[derive(Debug)]
pub struct ChannelKeys {
    /// Keys protecting client-to-server chunks
    pub client: SymmetricKeys,
    /// Keys protecting server-to-client chunks
    pub server: SymmetricKeys,
}

impl ChannelKeys {
    /// Derive both key sets from the exchanged nonces
    pub fn derive(client_nonce: &[u8], server_nonce: &[u8]) -> Result<Self, SecurityError> {
        if client_nonce.is_empty() || server_nonce.is_empty() {
            return Err(SecurityError::KeyLength(0));
        }
        Ok(Self {
            client: SymmetricKeys::derive(server_nonce, client_nonce)?,
            server: SymmetricKeys::derive(client_nonce, server_nonce)?,
        })
    }
}

/// Security applied to chunks in one direction
#[derive(Debug, Clone)]
pub struct CryptoContext {
    policy: SecurityPolicy,
    mode: MessageSecurityMode,
    keys: Option<Arc<SymmetricKeys>>,
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self::none()
    }
}

impl CryptoContext {
    /// Context that passes bytes through unchanged
    pub fn none() -> Self {
        Self {
            policy: SecurityPolicy::None,
            mode: MessageSecurityMode::None,
            keys: None,
        }
    }

    /// Context for `mode` under `policy`; keys are ignored in mode None
    pub fn new(
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
        keys: Option<SymmetricKeys>,
    ) -> Result<Self, SecurityError> {
        policy.validate_mode(mode)?;
        if mode == MessageSecurityMode::None {
            return Ok(Self::none());
        }
        let keys = keys.ok_or(SecurityError::KeyLength(0))?;
        Ok(Self {
            policy,
            mode,
            keys: Some(Arc::new(keys)),
        })
    }

    /// Security policy
    pub fn policy(&self) -> SecurityPolicy {
        self.policy
    }

    /// Message security mode
    pub fn mode(&self) -> MessageSecurityMode {
        self.mode
    }

    /// Bytes appended by `sign`
    pub fn signature_size(&self) -> usize {
        match self.mode {
            MessageSecurityMode::Sign | MessageSecurityMode::SignAndEncrypt => SIGNATURE_SIZE,
            _ => 0,
        }
    }

    /// Bytes appended by `encrypt`
    pub fn tag_size(&self) -> usize {
        if self.encrypts() {
            TAG_SIZE
        } else {
            0
        }
    }

    /// Whether chunk bodies are encrypted
    pub fn encrypts(&self) -> bool {
        self.mode == MessageSecurityMode::SignAndEncrypt
    }

    /// Padding bytes following a body of `body_len` bytes
    pub fn padding_size(&self, body_len: usize) -> usize {
        if !self.encrypts() {
            return 0;
        }
        let unpadded = body_len + 1 + SIGNATURE_SIZE;
        1 + (BLOCK_SIZE - unpadded % BLOCK_SIZE) % BLOCK_SIZE
    }

    /// Padding, signature and tag bytes following a body of `body_len` bytes
    pub fn trailer_size(&self, body_len: usize) -> usize {
        self.padding_size(body_len) + self.signature_size() + self.tag_size()
    }

    /// Largest body whose protected form fits in `space` bytes
    pub fn max_body_size(&self, space: usize) -> usize {
        if !self.encrypts() {
            return space.saturating_sub(self.signature_size());
        }
        let plaintext = space.saturating_sub(TAG_SIZE);
        let plaintext = plaintext - plaintext % BLOCK_SIZE;
        plaintext.saturating_sub(SIGNATURE_SIZE + 1)
    }

    /// Padding for a body of `body_len` bytes: `n + 1` bytes of value `n`
    pub fn padding(&self, body_len: usize) -> Vec<u8> {
        let len = self.padding_size(body_len);
        if len == 0 {
            return Vec::new();
        }
        vec![(len - 1) as u8; len]
    }

    /// Length of `plaintext` (body + padding) once the padding is removed
    pub fn unpadded_len(&self, plaintext: &[u8]) -> Result<usize, SecurityError> {
        if !self.encrypts() {
            return Ok(plaintext.len());
        }
        let n = *plaintext.last().ok_or(SecurityError::InvalidPadding)? as usize;
        if n + 1 > plaintext.len() || n >= BLOCK_SIZE {
            return Err(SecurityError::InvalidPadding);
        }
        let body_len = plaintext.len() - n - 1;
        if plaintext[body_len..].iter().any(|&b| b as usize != n) {
            return Err(SecurityError::InvalidPadding);
        }
        Ok(body_len)
    }

    fn keys(&self) -> Result<&SymmetricKeys, SecurityError> {
        self.keys.as_deref().ok_or(SecurityError::KeyLength(0))
    }

    fn mac(&self) -> Result<HmacSha256, SecurityError> {
        let keys = self.keys()?;
        <HmacSha256 as Mac>::new_from_slice(&keys.signing_key[..])
            .map_err(|_| SecurityError::KeyLength(KEY_SIZE))
    }

    /// Signature over `data`; empty in mode None
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if self.signature_size() == 0 {
            return Ok(Vec::new());
        }
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Check `signature` over `data` in constant time
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), SecurityError> {
        if self.signature_size() == 0 {
            return if signature.is_empty() {
                Ok(())
            } else {
                Err(SecurityError::SignatureMismatch)
            };
        }
        let mut mac = self.mac()?;
        mac.update(data);
        mac.verify_slice(signature)
            .map_err(|_| SecurityError::SignatureMismatch)
    }

    /// Encrypt `plaintext`, authenticating `aad`; returns ciphertext and tag.
    /// Modes without encryption return the plaintext unchanged.
    pub fn encrypt(
        &self,
        sequence_number: u32,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, SecurityError> {
        if !self.encrypts() {
            return Ok(plaintext.to_vec());
        }
        let keys = self.keys()?;
        let nonce = keys.nonce(sequence_number);
        let nonce = Nonce::from_slice(&nonce);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let key = &keys.encrypting_key[..];
        let result = match self.policy {
            SecurityPolicy::Aes256GcmSha256 => <Aes256Gcm as KeyInit>::new_from_slice(key)
                .map_err(|_| SecurityError::KeyLength(key.len()))?
                .encrypt(nonce, payload),
            SecurityPolicy::ChaCha20Poly1305Sha256 => {
                <ChaCha20Poly1305 as KeyInit>::new_from_slice(key)
                    .map_err(|_| SecurityError::KeyLength(key.len()))?
                    .encrypt(nonce, payload)
            }
            SecurityPolicy::None => {
                return Err(SecurityError::UnsupportedPolicy(self.policy.uri().to_string()))
            }
        };
        result.map_err(|_| SecurityError::EncryptFailed)
    }

    /// Decrypt and authenticate `ciphertext` (including its tag) and `aad`.
    /// Modes without encryption return the input unchanged.
    pub fn decrypt(
        &self,
        sequence_number: u32,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SecurityError> {
        if !self.encrypts() {
            return Ok(ciphertext.to_vec());
        }
        if ciphertext.len() < TAG_SIZE {
            return Err(SecurityError::Truncated(ciphertext.len()));
        }
        let keys = self.keys()?;
        let nonce = keys.nonce(sequence_number);
        let nonce = Nonce::from_slice(&nonce);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let key = &keys.encrypting_key[..];
        let result = match self.policy {
            SecurityPolicy::Aes256GcmSha256 => <Aes256Gcm as KeyInit>::new_from_slice(key)
                .map_err(|_| SecurityError::KeyLength(key.len()))?
                .decrypt(nonce, payload),
            SecurityPolicy::ChaCha20Poly1305Sha256 => {
                <ChaCha20Poly1305 as KeyInit>::new_from_slice(key)
                    .map_err(|_| SecurityError::KeyLength(key.len()))?
                    .decrypt(nonce, payload)
            }
            SecurityPolicy::None => {
                return Err(SecurityError::UnsupportedPolicy(self.policy.uri().to_string()))
            }
        };
        result.map_err(|_| SecurityError::DecryptFailed)
    }
}
