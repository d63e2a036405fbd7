//! Storage Tiers
//!
//! The five token storage tiers, in priority order:
//!
//! 1. Encrypted entry on durable storage
//! 2. Process-scoped memory
//! 3. Structured encrypted document on durable storage
//! 4. Legacy plaintext fields
//! 5. Remote encrypted backup (optional)

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::backend::KeyValueStore;
use crate::core::{Clock, HttpMethod, HttpRequest, HttpTransport};
use crate::crypto::{EncryptedBlob, EncryptionService};
use crate::error::{ConfigurationError, MarketplaceError, StorageError};
use crate::types::TokenRecord;

/// Key probed by health checks.
pub const HEALTH_CHECK_KEY: &str = "__health_check__";

pub const ENCRYPTED_TOKEN_KEY: &str = "marketplace_token";
pub const TOKEN_DOCUMENT_KEY: &str = "marketplace_token_document";
pub const LEGACY_ACCESS_TOKEN_KEY: &str = "access_token";
pub const LEGACY_REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const LEGACY_EXPIRY_KEY: &str = "expiry";

/// Older key names still wiped on clear.
pub const LEGACY_KEY_ALIASES: &[&str] = &[
    "token",
    "oauth_token",
    "marketplace_access_token",
    "marketplace_refresh_token",
    "marketplace_token_expiry",
];

const DOCUMENT_VERSION: u32 = 1;
/// Backup owner used when none is configured.
pub const DEFAULT_BACKUP_OWNER: &str = "default";

/// How long a tier keeps data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Session,
    Durable,
    Remote,
}

/// Whether tier data is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidentiality {
    Plaintext,
    Encrypted,
}

/// Static description of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierDescriptor {
    pub priority: u8,
    pub name: &'static str,
    pub durability: Durability,
    pub confidentiality: Confidentiality,
}

/// Storage tier interface.
#[async_trait]
pub trait StorageTier: Send + Sync {
    /// Tier description.
    fn descriptor(&self) -> TierDescriptor;

    /// Persist a record.
    async fn write(&self, record: &TokenRecord, owner_id: Option<&str>) -> Result<(), MarketplaceError>;

    /// Read the stored record, if any.
    async fn read(&self) -> Result<Option<TokenRecord>, MarketplaceError>;

    /// Remove stored data.
    async fn clear(&self) -> Result<(), MarketplaceError>;

    /// Write then read back a canary value.
    async fn probe(&self) -> Result<(), MarketplaceError>;
}

fn corrupted(tier: &str, message: impl std::fmt::Display) -> MarketplaceError {
    StorageError::CorruptedData {
        tier: tier.to_string(),
        message: message.to_string(),
    }
    .into()
}

fn encode_record(tier: &str, record: &TokenRecord) -> Result<String, MarketplaceError> {
    serde_json::to_string(record).map_err(|e| {
        StorageError::WriteFailed {
            tier: tier.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

fn decode_record(tier: &str, json: &str) -> Result<TokenRecord, MarketplaceError> {
    serde_json::from_str(json).map_err(|e| corrupted(tier, e))
}

async fn probe_store(store: &dyn KeyValueStore, tier: &str, canary: &str) -> Result<(), MarketplaceError> {
    store.set(HEALTH_CHECK_KEY, canary).await?;
    let read_back = store.get(HEALTH_CHECK_KEY).await?;
    store.remove(HEALTH_CHECK_KEY).await?;
    if read_back.as_deref() != Some(canary) {
        return Err(corrupted(tier, "canary mismatch"));
    }
    Ok(())
}

fn canary(clock: &dyn Clock) -> String {
    format!("canary-{}", clock.now().timestamp_millis())
}

/// Tier 1: encrypted record on a durable store.
pub struct EncryptedStoreTier {
    store: Arc<dyn KeyValueStore>,
    crypto: Arc<EncryptionService>,
    clock: Arc<dyn Clock>,
}

impl EncryptedStoreTier {
    const DESCRIPTOR: TierDescriptor = TierDescriptor {
        priority: 1,
        name: "encrypted-store",
        durability: Durability::Durable,
        confidentiality: Confidentiality::Encrypted,
    };

    /// Create new encrypted tier.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        crypto: Arc<EncryptionService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, crypto, clock }
    }
}

#[async_trait]
impl StorageTier for EncryptedStoreTier {
    fn descriptor(&self) -> TierDescriptor {
        Self::DESCRIPTOR
    }

    async fn write(&self, record: &TokenRecord, _owner_id: Option<&str>) -> Result<(), MarketplaceError> {
        let json = encode_record(Self::DESCRIPTOR.name, record)?;
        let document = self.crypto.encrypt_to_string(&json)?;
        self.store.set(ENCRYPTED_TOKEN_KEY, &document).await?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<TokenRecord>, MarketplaceError> {
        let Some(document) = self.store.get(ENCRYPTED_TOKEN_KEY).await? else {
            return Ok(None);
        };
        let json = self.crypto.decrypt_from_string(&document)?;
        decode_record(Self::DESCRIPTOR.name, &json).map(Some)
    }

    async fn clear(&self) -> Result<(), MarketplaceError> {
        self.store.remove(ENCRYPTED_TOKEN_KEY).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), MarketplaceError> {
        let canary = canary(self.clock.as_ref());
        let sealed = self.crypto.encrypt_to_string(&canary)?;
        probe_store(self.store.as_ref(), Self::DESCRIPTOR.name, &sealed).await
    }
}

/// Tier 2: plaintext record held for the life of the process.
#[derive(Default)]
pub struct SessionTier {
    slot: Mutex<Option<String>>,
    scratch: Mutex<Option<String>>,
    probes: AtomicU64,
}

impl SessionTier {
    const DESCRIPTOR: TierDescriptor = TierDescriptor {
        priority: 2,
        name: "session",
        durability: Durability::Session,
        confidentiality: Confidentiality::Plaintext,
    };

    /// Create new session tier.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageTier for SessionTier {
    fn descriptor(&self) -> TierDescriptor {
        Self::DESCRIPTOR
    }

    async fn write(&self, record: &TokenRecord, _owner_id: Option<&str>) -> Result<(), MarketplaceError> {
        let json = encode_record(Self::DESCRIPTOR.name, record)?;
        *self.slot.lock() = Some(json);
        Ok(())
    }

    async fn read(&self) -> Result<Option<TokenRecord>, MarketplaceError> {
        let json = self.slot.lock().clone();
        json.map(|j| decode_record(Self::DESCRIPTOR.name, &j)).transpose()
    }

    async fn clear(&self) -> Result<(), MarketplaceError> {
        *self.slot.lock() = None;
        Ok(())
    }

    async fn probe(&self) -> Result<(), MarketplaceError> {
        let canary = format!("canary-{}", self.probes.fetch_add(1, Ordering::Relaxed));
        *self.scratch.lock() = Some(canary.clone());
        let read_back = self.scratch.lock().take();
        if read_back.as_deref() != Some(canary.as_str()) {
            return Err(corrupted(Self::DESCRIPTOR.name, "canary mismatch"));
        }
        Ok(())
    }
}

/// Versioned envelope written by the structured tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDocument {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub saved_at: DateTime<Utc>,
    pub blob: EncryptedBlob,
}

/// Tier 3: structured encrypted document on a durable store.
pub struct StructuredDocumentTier {
    store: Arc<dyn KeyValueStore>,
    crypto: Arc<EncryptionService>,
    clock: Arc<dyn Clock>,
}

impl StructuredDocumentTier {
    const DESCRIPTOR: TierDescriptor = TierDescriptor {
        priority: 3,
        name: "structured-document",
        durability: Durability::Durable,
        confidentiality: Confidentiality::Encrypted,
    };

    /// Create new structured document tier.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        crypto: Arc<EncryptionService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, crypto, clock }
    }
}

#[async_trait]
impl StorageTier for StructuredDocumentTier {
    fn descriptor(&self) -> TierDescriptor {
        Self::DESCRIPTOR
    }

    async fn write(&self, record: &TokenRecord, owner_id: Option<&str>) -> Result<(), MarketplaceError> {
        let json = encode_record(Self::DESCRIPTOR.name, record)?;
        let document = TokenDocument {
            version: DOCUMENT_VERSION,
            owner_id: owner_id.map(String::from),
            saved_at: self.clock.now(),
            blob: self.crypto.encrypt(&json)?,
        };
        let encoded = serde_json::to_string(&document).map_err(|e| StorageError::WriteFailed {
            tier: Self::DESCRIPTOR.name.to_string(),
            message: e.to_string(),
        })?;
        self.store.set(TOKEN_DOCUMENT_KEY, &encoded).await?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<TokenRecord>, MarketplaceError> {
        let Some(encoded) = self.store.get(TOKEN_DOCUMENT_KEY).await? else {
            return Ok(None);
        };
        let document: TokenDocument =
            serde_json::from_str(&encoded).map_err(|e| corrupted(Self::DESCRIPTOR.name, e))?;
        if document.version != DOCUMENT_VERSION {
            return Err(corrupted(
                Self::DESCRIPTOR.name,
                format!("unsupported document version {}", document.version),
            ));
        }
        let json = self.crypto.decrypt(&document.blob)?;
        decode_record(Self::DESCRIPTOR.name, &json).map(Some)
    }

    async fn clear(&self) -> Result<(), MarketplaceError> {
        self.store.remove(TOKEN_DOCUMENT_KEY).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), MarketplaceError> {
        let canary = canary(self.clock.as_ref());
        probe_store(self.store.as_ref(), Self::DESCRIPTOR.name, &canary).await
    }
}

/// Tier 4: plaintext fields under the legacy key names.
///
/// Only the access token, refresh token and hard expiry (epoch ms) are kept,
/// so reads rebuild the record as a bearer token issued now.
pub struct LegacyFieldsTier {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl LegacyFieldsTier {
    const DESCRIPTOR: TierDescriptor = TierDescriptor {
        priority: 4,
        name: "legacy-fields",
        durability: Durability::Durable,
        confidentiality: Confidentiality::Plaintext,
    };

    /// Create new legacy tier.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn write_fields(
        &self,
        record: &TokenRecord,
        expires_at: DateTime<Utc>,
    ) -> Result<(), MarketplaceError> {
        self.store
            .set(LEGACY_EXPIRY_KEY, &expires_at.timestamp_millis().to_string())
            .await?;
        match record.refresh_token.as_deref() {
            Some(refresh) => self.store.set(LEGACY_REFRESH_TOKEN_KEY, refresh).await?,
            None => self.store.remove(LEGACY_REFRESH_TOKEN_KEY).await?,
        }
        self.store
            .set(LEGACY_ACCESS_TOKEN_KEY, &record.access_token)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageTier for LegacyFieldsTier {
    fn descriptor(&self) -> TierDescriptor {
        Self::DESCRIPTOR
    }

    async fn write(&self, record: &TokenRecord, _owner_id: Option<&str>) -> Result<(), MarketplaceError> {
        let expires_at = record.expires_at().ok_or_else(|| StorageError::WriteFailed {
            tier: Self::DESCRIPTOR.name.to_string(),
            message: "expiry out of range".to_string(),
        })?;

        // The access token goes last; reads treat its absence as no token.
        let result = self.write_fields(record, expires_at).await;
        if result.is_err() {
            if let Err(e) = self.store.remove(LEGACY_ACCESS_TOKEN_KEY).await {
                debug!(error = %e, "Could not drop access token after partial write");
            }
        }
        result
    }

    async fn read(&self) -> Result<Option<TokenRecord>, MarketplaceError> {
        let Some(access_token) = self.store.get(LEGACY_ACCESS_TOKEN_KEY).await? else {
            return Ok(None);
        };
        let Some(expiry) = self.store.get(LEGACY_EXPIRY_KEY).await? else {
            return Err(corrupted(Self::DESCRIPTOR.name, "expiry missing"));
        };
        let expiry_ms: i64 = expiry
            .trim()
            .parse()
            .map_err(|_| corrupted(Self::DESCRIPTOR.name, "expiry is not a timestamp"))?;
        let expires_at = Utc
            .timestamp_millis_opt(expiry_ms)
            .single()
            .ok_or_else(|| corrupted(Self::DESCRIPTOR.name, "expiry out of range"))?;

        let now = self.clock.now();
        let remaining = (expires_at - now).num_seconds().max(0) as u64;
        let refresh_token = self
            .store
            .get(LEGACY_REFRESH_TOKEN_KEY)
            .await?
            .filter(|t| !t.is_empty());

        Ok(Some(TokenRecord {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            issued_at: now,
            expires_in_seconds: remaining,
            refresh_expires_in_seconds: None,
        }))
    }

    async fn clear(&self) -> Result<(), MarketplaceError> {
        let mut first_error = None;
        for key in [LEGACY_ACCESS_TOKEN_KEY, LEGACY_REFRESH_TOKEN_KEY, LEGACY_EXPIRY_KEY]
            .into_iter()
            .chain(LEGACY_KEY_ALIASES.iter().copied())
        {
            if let Err(e) = self.store.remove(key).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn probe(&self) -> Result<(), MarketplaceError> {
        let canary = canary(self.clock.as_ref());
        probe_store(self.store.as_ref(), Self::DESCRIPTOR.name, &canary).await
    }
}

/// Tier 5: encrypted backup on a remote HTTP service.
///
/// `PUT`/`GET`/`DELETE {base_url}/tokens/{owner}` with an `EncryptedBlob` body.
/// The owner is fixed at construction so a restarted process reads the
/// same entry it wrote.
pub struct RemoteBackupTier {
    transport: Arc<dyn HttpTransport>,
    base_url: Url,
    owner: String,
    crypto: Arc<EncryptionService>,
    clock: Arc<dyn Clock>,
}

impl RemoteBackupTier {
    const DESCRIPTOR: TierDescriptor = TierDescriptor {
        priority: 5,
        name: "remote-backup",
        durability: Durability::Remote,
        confidentiality: Confidentiality::Encrypted,
    };

    /// Create new remote backup tier for `owner`.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: &str,
        owner: impl Into<String>,
        crypto: Arc<EncryptionService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MarketplaceError> {
        let invalid = || ConfigurationError::InvalidEndpoint {
            url: base_url.to_string(),
        };
        let base_url = Url::parse(base_url).map_err(|_| invalid())?;
        if base_url.cannot_be_a_base() {
            return Err(invalid().into());
        }

        let owner = owner.into();
        let owner = if owner.trim().is_empty() {
            DEFAULT_BACKUP_OWNER.to_string()
        } else {
            owner
        };

        Ok(Self {
            transport,
            base_url,
            owner,
            crypto,
            clock,
        })
    }

    /// Owner the backup entry is kept under.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn url_for(&self, owner: &str) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("tokens").push(owner);
        }
        url.to_string()
    }

    fn request(method: HttpMethod, url: String, body: Option<String>) -> HttpRequest {
        let mut headers = HashMap::new();
        headers.insert("accept".to_string(), "application/json".to_string());
        if body.is_some() {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }
        HttpRequest {
            method,
            url,
            headers,
            body,
            timeout: None,
        }
    }

    fn failed(status: u16, write: bool) -> MarketplaceError {
        let tier = Self::DESCRIPTOR.name.to_string();
        let message = format!("backup service returned HTTP {}", status);
        if write {
            StorageError::WriteFailed { tier, message }.into()
        } else {
            StorageError::ReadFailed { tier, message }.into()
        }
    }

    async fn put_blob(&self, owner: &str, plaintext: &str) -> Result<(), MarketplaceError> {
        let blob = self.crypto.encrypt(plaintext)?;
        let body = serde_json::to_string(&blob).map_err(|e| StorageError::WriteFailed {
            tier: Self::DESCRIPTOR.name.to_string(),
            message: e.to_string(),
        })?;
        let response = self
            .transport
            .send(Self::request(HttpMethod::Put, self.url_for(owner), Some(body)))
            .await?;
        if !response.is_success() {
            return Err(Self::failed(response.status, true));
        }
        Ok(())
    }

    async fn get_blob(&self, owner: &str) -> Result<Option<String>, MarketplaceError> {
        let response = self
            .transport
            .send(Self::request(HttpMethod::Get, self.url_for(owner), None))
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(Self::failed(response.status, false));
        }
        let blob: EncryptedBlob = serde_json::from_str(&response.body)
            .map_err(|e| corrupted(Self::DESCRIPTOR.name, e))?;
        Ok(Some(self.crypto.decrypt(&blob)?))
    }

    async fn delete_blob(&self, owner: &str) -> Result<(), MarketplaceError> {
        let response = self
            .transport
            .send(Self::request(HttpMethod::Delete, self.url_for(owner), None))
            .await?;
        if !response.is_success() && response.status != 404 {
            return Err(StorageError::DeleteFailed {
                tier: Self::DESCRIPTOR.name.to_string(),
                message: format!("backup service returned HTTP {}", response.status),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl StorageTier for RemoteBackupTier {
    fn descriptor(&self) -> TierDescriptor {
        Self::DESCRIPTOR
    }

    async fn write(&self, record: &TokenRecord, owner_id: Option<&str>) -> Result<(), MarketplaceError> {
        if let Some(requested) = owner_id.filter(|o| *o != self.owner) {
            debug!(requested, owner = %self.owner, "Backup kept under configured owner");
        }
        let json = encode_record(Self::DESCRIPTOR.name, record)?;
        self.put_blob(&self.owner, &json).await
    }

    async fn read(&self) -> Result<Option<TokenRecord>, MarketplaceError> {
        match self.get_blob(&self.owner).await? {
            Some(json) => decode_record(Self::DESCRIPTOR.name, &json).map(Some),
            None => Ok(None),
        }
    }

    async fn clear(&self) -> Result<(), MarketplaceError> {
        self.delete_blob(&self.owner).await
    }

    async fn probe(&self) -> Result<(), MarketplaceError> {
        let canary = canary(self.clock.as_ref());
        self.put_blob(HEALTH_CHECK_KEY, &canary).await?;
        let read_back = self.get_blob(HEALTH_CHECK_KEY).await?;
        self.delete_blob(HEALTH_CHECK_KEY).await?;
        if read_back.as_deref() != Some(canary.as_str()) {
            return Err(corrupted(Self::DESCRIPTOR.name, "canary mismatch"));
        }
        Ok(())
    }
}
