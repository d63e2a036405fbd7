//! Encryption Service
//!
//! Authenticated symmetric encryption of token payloads at rest.
//!
//! AES-256-GCM with a fresh 128-bit random nonce on every call and a
//! 128-bit authentication tag. Decryption fails closed: a wrong key, a
//! modified tag or a truncated payload always yields an error.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ConfigurationError, CryptoError, MarketplaceError};

/// Algorithm identifier stamped on every blob.
pub const ALGORITHM_ID: &str = "aes-256-gcm-n128";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;

type Aes256Gcm128 = AesGcm<Aes256, U16>;

/// Encrypted payload. Byte fields serialize as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(rename = "authTag", alias = "auth_tag", with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
    #[serde(rename = "algorithmId", alias = "algorithm_id")]
    pub algorithm_id: String,
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// 256-bit symmetric key.
pub struct EncryptionKey(Secret<[u8; KEY_LEN]>);

impl EncryptionKey {
    /// Build from raw key material of at least 256 bits.
    ///
    /// Exactly 32 bytes are used as-is; longer material is condensed with SHA-256.
    pub fn from_bytes(material: &[u8]) -> Result<Self, MarketplaceError> {
        if material.len() < KEY_LEN {
            return Err(ConfigurationError::InvalidKey {
                message: format!(
                    "key must be at least 256 bits, got {} bits",
                    material.len() * 8
                ),
            }
            .into());
        }

        let mut key = [0u8; KEY_LEN];
        if material.len() == KEY_LEN {
            key.copy_from_slice(material);
        } else {
            key.copy_from_slice(&Sha256::digest(material));
        }
        Ok(Self(Secret::new(key)))
    }

    /// Parse a configured key: 64 hex characters, base64, or raw text.
    pub fn parse(value: &str) -> Result<Self, MarketplaceError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ConfigurationError::MissingRequired {
                field: "encryption_key".to_string(),
            }
            .into());
        }

        if value.len() == KEY_LEN * 2 {
            if let Ok(bytes) = hex::decode(value) {
                return Self::from_bytes(&bytes);
            }
        }
        if let Ok(bytes) = BASE64.decode(value) {
            if bytes.len() >= KEY_LEN {
                return Self::from_bytes(&bytes);
            }
        }
        Self::from_bytes(value.as_bytes())
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(Secret::new(key))
    }

    fn bytes(&self) -> &[u8; KEY_LEN] {
        self.0.expose_secret()
    }
}

impl Clone for EncryptionKey {
    fn clone(&self) -> Self {
        Self(Secret::new(*self.bytes()))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Encrypt `plaintext` under `key`.
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> Result<EncryptedBlob, CryptoError> {
    let cipher = Aes256Gcm128::new_from_slice(key.bytes()).map_err(|e| {
        CryptoError::EncryptionFailed {
            message: e.to_string(),
        }
    })?;

    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut sealed = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed {
            message: e.to_string(),
        })?;

    let auth_tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedBlob {
        ciphertext: sealed,
        iv: iv.to_vec(),
        auth_tag,
        algorithm_id: ALGORITHM_ID.to_string(),
    })
}

/// Decrypt `blob` under `key`.
pub fn decrypt(blob: &EncryptedBlob, key: &EncryptionKey) -> Result<String, CryptoError> {
    if blob.algorithm_id != ALGORITHM_ID {
        return Err(CryptoError::UnsupportedAlgorithm {
            algorithm: blob.algorithm_id.clone(),
        });
    }
    if blob.iv.len() != NONCE_LEN {
        return Err(CryptoError::MalformedBlob {
            message: format!("iv must be {} bytes, got {}", NONCE_LEN, blob.iv.len()),
        });
    }
    if blob.auth_tag.len() != TAG_LEN {
        return Err(CryptoError::MalformedBlob {
            message: format!("tag must be {} bytes, got {}", TAG_LEN, blob.auth_tag.len()),
        });
    }

    let cipher = Aes256Gcm128::new_from_slice(key.bytes()).map_err(|e| {
        CryptoError::DecryptionFailed {
            message: e.to_string(),
        }
    })?;

    let mut sealed = Vec::with_capacity(blob.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&blob.ciphertext);
    sealed.extend_from_slice(&blob.auth_tag);

    let plaintext = cipher
        .decrypt(Nonce::<U16>::from_slice(&blob.iv), sealed.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed {
            message: "authentication tag mismatch".to_string(),
        })?;

    String::from_utf8(plaintext).map_err(|e| CryptoError::DecryptionFailed {
        message: e.to_string(),
    })
}

/// Encryption service bound to one key.
#[derive(Clone)]
pub struct EncryptionService {
    key: EncryptionKey,
}

impl EncryptionService {
    /// Create service from a validated key.
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    /// Create service from configured key text, failing fast when absent or short.
    pub fn from_config(value: Option<&str>) -> Result<Self, MarketplaceError> {
        let value = value.ok_or_else(|| ConfigurationError::MissingRequired {
            field: "encryption_key".to_string(),
        })?;
        Ok(Self::new(EncryptionKey::parse(value)?))
    }

    /// Encrypt a string.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedBlob, CryptoError> {
        encrypt(plaintext, &self.key)
    }

    /// Decrypt a blob.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<String, CryptoError> {
        decrypt(blob, &self.key)
    }

    /// Encrypt and encode as a JSON blob document.
    pub fn encrypt_to_string(&self, plaintext: &str) -> Result<String, CryptoError> {
        let blob = self.encrypt(plaintext)?;
        serde_json::to_string(&blob).map_err(|e| CryptoError::EncryptionFailed {
            message: e.to_string(),
        })
    }

    /// Decode a JSON blob document and decrypt it.
    pub fn decrypt_from_string(&self, document: &str) -> Result<String, CryptoError> {
        let blob: EncryptedBlob =
            serde_json::from_str(document).map_err(|e| CryptoError::MalformedBlob {
                message: e.to_string(),
            })?;
        self.decrypt(&blob)
    }
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("key", &"[REDACTED]")
            .field("algorithm", &ALGORITHM_ID)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let key = EncryptionKey::generate();
        for text in ["a", "v^1.1#i^1#r^0#p^3", "токен 🔑", &"x".repeat(4096)] {
            let blob = encrypt(text, &key).unwrap();
            assert_eq!(decrypt(&blob, &key).unwrap(), text);
        }
    }

    #[test]
    fn test_fresh_nonce_each_call() {
        let key = EncryptionKey::generate();
        let first = encrypt("same", &key).unwrap();
        let second = encrypt("same", &key).unwrap();
        assert_eq!(first.iv.len(), 16);
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = EncryptionKey::generate();
        let mut blob = encrypt("secret", &key).unwrap();
        for i in 0..blob.auth_tag.len() {
            let mut tampered = blob.clone();
            tampered.auth_tag[i] ^= 0x01;
            assert!(matches!(
                decrypt(&tampered, &key),
                Err(CryptoError::DecryptionFailed { .. })
            ));
        }
        blob.ciphertext[0] ^= 0xff;
        assert!(decrypt(&blob, &key).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = encrypt("secret", &EncryptionKey::generate()).unwrap();
        assert!(decrypt(&blob, &EncryptionKey::generate()).is_err());
    }

    #[test]
    fn test_malformed_blob_rejected() {
        let key = EncryptionKey::generate();
        let mut blob = encrypt("secret", &key).unwrap();
        blob.iv.truncate(12);
        assert!(matches!(
            decrypt(&blob, &key),
            Err(CryptoError::MalformedBlob { .. })
        ));
    }

    #[test]
    fn test_short_key_rejected() {
        let result = EncryptionKey::parse("too-short");
        assert!(matches!(
            result,
            Err(MarketplaceError::Configuration(ConfigurationError::InvalidKey { .. }))
        ));
        assert!(EncryptionService::from_config(None).is_err());
    }

    #[test]
    fn test_key_formats() {
        let hex_key = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let from_hex = EncryptionKey::parse(hex_key).unwrap();
        let blob = encrypt("payload", &from_hex).unwrap();

        let raw = hex::decode(hex_key).unwrap();
        let from_b64 = EncryptionKey::parse(&BASE64.encode(&raw)).unwrap();
        assert_eq!(decrypt(&blob, &from_b64).unwrap(), "payload");

        assert!(EncryptionKey::parse("a passphrase that is comfortably over 32 bytes").is_ok());
    }

    #[test]
    fn test_string_document_round_trip() {
        let service = EncryptionService::new(EncryptionKey::generate());
        let document = service.encrypt_to_string("{\"a\":1}").unwrap();
        assert!(document.contains("authTag"));
        assert_eq!(service.decrypt_from_string(&document).unwrap(), "{\"a\":1}");
        assert!(service.decrypt_from_string("not json").is_err());
    }
}
