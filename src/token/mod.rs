//! Token Management
//!
//! Token lifecycle and redundant storage.
//!
//! - **Key-value backends**: file-system and in-memory stores under the durable tiers
//! - **Storage tiers**: five ordered tiers with declared durability and confidentiality
//! - **Token store**: writes every tier, reads by priority and heals the rest
//! - **Token manager**: code exchange, single-flight refresh and scheduled renewal

pub mod backend;
pub mod manager;
pub mod store;
pub mod tiers;

// Key-value backends
pub use backend::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, MockKeyValueStore};

// Storage tiers
pub use tiers::{
    Confidentiality, Durability, EncryptedStoreTier, LegacyFieldsTier, RemoteBackupTier,
    SessionTier, StorageTier, StructuredDocumentTier, TierDescriptor, TokenDocument,
    DEFAULT_BACKUP_OWNER, HEALTH_CHECK_KEY,
};

// Token store
pub use store::TokenStore;

// Token manager
pub use manager::{
    create_mock_token_manager, AuthState, MockTokenManager, RefreshCallback, SubscriptionId,
    TokenLifecycleManager, TokenManager, TokenManagerConfig,
};
