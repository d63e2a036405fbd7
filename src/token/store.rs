//! Token Store
//!
//! Redundant persistence of the token record across ordered storage tiers.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::tiers::{StorageTier, TierDescriptor};
use crate::core::Clock;
use crate::error::{MarketplaceResult, StorageError};
use crate::telemetry::{ClientMetrics, NoOpMetrics};
use crate::types::TokenRecord;

/// Ordered set of storage tiers written together and read by priority.
pub struct TokenStore {
    tiers: Vec<Arc<dyn StorageTier>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ClientMetrics>,
    owner: Mutex<Option<String>>,
}

impl TokenStore {
    /// Create new token store. Tiers are sorted by priority.
    pub fn new(mut tiers: Vec<Arc<dyn StorageTier>>, clock: Arc<dyn Clock>) -> Self {
        tiers.sort_by_key(|t| t.descriptor().priority);
        Self {
            tiers,
            clock,
            metrics: Arc::new(NoOpMetrics),
            owner: Mutex::new(None),
        }
    }

    /// Set metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<dyn ClientMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Descriptors of the configured tiers, highest priority first.
    pub fn tiers(&self) -> Vec<TierDescriptor> {
        self.tiers.iter().map(|t| t.descriptor()).collect()
    }

    /// Write the record to every tier.
    ///
    /// Succeeds when at least one tier accepted the write.
    pub async fn save(&self, record: &TokenRecord, owner_id: Option<&str>) -> MarketplaceResult<()> {
        if let Some(owner) = owner_id {
            *self.owner.lock() = Some(owner.to_string());
        }
        let owner = self.owner.lock().clone();

        let failures = self.write_tiers(record, owner.as_deref(), None).await;
        if failures.len() == self.tiers.len() {
            return Err(StorageError::Exhausted { failures }.into());
        }

        debug!(
            written = self.tiers.len() - failures.len(),
            total = self.tiers.len(),
            "Token saved"
        );
        Ok(())
    }

    /// Load the highest-priority valid record.
    ///
    /// Tiers that fail or hold corrupt, incomplete or expired data are
    /// skipped. The winning record is written back to every other tier.
    pub async fn load(&self) -> Option<TokenRecord> {
        let now = self.clock.now();
        let (index, record) = self.find(|r| r.is_valid_at(now)).await?;

        let name = self.tiers[index].descriptor().name;
        debug!(tier = name, "Token loaded");

        let owner = self.owner.lock().clone();
        let failures = self.write_tiers(&record, owner.as_deref(), Some(index)).await;
        let healed = self.tiers.len() - 1 - failures.len();
        if healed > 0 {
            debug!(source = name, healed, "Other tiers rewritten from loaded token");
        }
        Some(record)
    }

    /// Load the highest-priority record whose refresh token is still usable,
    /// even when its access token has expired.
    pub async fn load_refreshable(&self) -> Option<TokenRecord> {
        let now = self.clock.now();
        self.find(|r| r.is_structurally_valid() && r.can_refresh_at(now))
            .await
            .map(|(_, record)| record)
    }

    /// Wipe every tier. Failures are logged and never returned.
    pub async fn clear(&self) {
        for tier in &self.tiers {
            let descriptor = tier.descriptor();
            if let Err(e) = tier.clear().await {
                warn!(tier = descriptor.name, error = %e, "Failed to clear tier");
                self.metrics.record_storage_failure(descriptor.name, "clear");
            }
        }
        *self.owner.lock() = None;
        info!("Token storage cleared");
    }

    /// Probe every tier with a canary write and read.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let mut report = BTreeMap::new();
        for tier in &self.tiers {
            let descriptor = tier.descriptor();
            let healthy = match tier.probe().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(tier = descriptor.name, error = %e, "Tier health check failed");
                    self.metrics.record_storage_failure(descriptor.name, "probe");
                    false
                }
            };
            report.insert(descriptor.name.to_string(), healthy);
        }
        report
    }

    async fn find<P>(&self, accept: P) -> Option<(usize, TokenRecord)>
    where
        P: Fn(&TokenRecord) -> bool,
    {
        for (index, tier) in self.tiers.iter().enumerate() {
            let name = tier.descriptor().name;
            match tier.read().await {
                Ok(Some(record)) if accept(&record) => return Some((index, record)),
                Ok(Some(_)) => debug!(tier = name, "Skipping unusable token"),
                Ok(None) => {}
                Err(e) => {
                    debug!(tier = name, error = %e, "Skipping unreadable tier");
                    self.metrics.record_storage_failure(name, "read");
                }
            }
        }
        None
    }

    /// Write to every tier except `skip`, returning one entry per failed tier.
    async fn write_tiers(
        &self,
        record: &TokenRecord,
        owner: Option<&str>,
        skip: Option<usize>,
    ) -> Vec<String> {
        let mut failures = Vec::new();
        for (index, tier) in self.tiers.iter().enumerate() {
            if Some(index) == skip {
                continue;
            }
            let name = tier.descriptor().name;
            if let Err(e) = tier.write(record, owner).await {
                warn!(tier = name, error = %e, "Failed to write token to tier");
                self.metrics.record_storage_failure(name, "write");
                failures.push(format!("{}: {}", name, e));
            }
        }
        failures
    }
}
