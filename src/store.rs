//! Unified store: the single entry point for writing collected records.
//!
//! Validates every candidate, folds duplicates within the batch, fills in
//! missing countries and hands an ip-ordered batch to the storage backend,
//! which applies it in one transaction.

use crate::clock::Clock;
use crate::geoip::GeoIpService;
use crate::models::{BlacklistEntry, EntryFilter, MergeResult, NormalizedRecord, RawRecord};
use crate::storage::{Storage, StorageResult};
use crate::validator;
use anyhow::Result;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// What a source contributes to a merge besides its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTtl {
    pub source: String,
    pub ttl_days: i64,
}

#[derive(Clone)]
pub struct UnifiedStore {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    geoip: Option<GeoIpService>,
}

impl UnifiedStore {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            geoip: None,
        }
    }

    pub fn with_geoip(mut self, geoip: GeoIpService) -> Self {
        if geoip.is_enabled() {
            self.geoip = Some(geoip);
        }
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Merge `records` reported by `source`.
    ///
    /// Invalid candidates are counted in `rejected`; only a storage failure
    /// fails the call, in which case nothing from the batch is written.
    pub async fn merge(&self, records: Vec<RawRecord>, source: &SourceTtl) -> StorageResult<MergeResult> {
        let now = self.clock.timestamp();
        let mut rejected = 0u64;
        let mut batch: BTreeMap<String, NormalizedRecord> = BTreeMap::new();

        for record in records {
            let ip = match validator::validate(&record.ip) {
                Ok(ip) => ip,
                Err(reason) => {
                    debug!(source = %source.source, candidate = %record.ip, %reason, "Rejected record");
                    rejected += 1;
                    continue;
                }
            };

            let normalized = NormalizedRecord {
                ip: ip.to_string(),
                attack_type: non_empty(record.attack_type),
                country: non_empty(record.country)
                    .map(|c| c.to_uppercase())
                    .or_else(|| self.lookup_country(IpAddr::V4(ip.addr()))),
                detection_date: record.detected_at.map_or(now, |at| at.timestamp()),
            };

            batch
                .entry(normalized.ip.clone())
                .and_modify(|existing| fold(existing, &normalized))
                .or_insert(normalized);
        }

        let records: Vec<NormalizedRecord> = batch.into_values().collect();
        let counts = self
            .storage
            .merge_batch(&source.source, source.ttl_days, &records, now)
            .await?;

        Ok(MergeResult {
            inserted: counts.inserted,
            updated: counts.updated,
            rejected,
            touched: records.into_iter().map(|r| r.ip).collect(),
        })
    }

    pub async fn get_entry(&self, ip: &str) -> Result<Option<BlacklistEntry>> {
        let ip = validator::validate(ip)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| ip.trim().to_string());
        self.storage.get_entry(&ip).await
    }

    pub async fn list_entries(
        &self,
        filter: EntryFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BlacklistEntry>> {
        self.storage.list_entries(filter, limit, offset).await
    }

    fn lookup_country(&self, ip: IpAddr) -> Option<String> {
        self.geoip.as_ref().and_then(|geoip| geoip.country_code(ip))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Combine two observations of the same IP within one batch.
fn fold(existing: &mut NormalizedRecord, incoming: &NormalizedRecord) {
    existing.detection_date = existing.detection_date.min(incoming.detection_date);
    if incoming.attack_type.is_some() {
        existing.attack_type = incoming.attack_type.clone();
    }
    if incoming.country.is_some() {
        existing.country = incoming.country.clone();
    }
}
