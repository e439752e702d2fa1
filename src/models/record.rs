use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record as extracted from a source payload, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    /// IP candidate exactly as the source reported it.
    pub ip: String,
    pub attack_type: Option<String>,
    pub country: Option<String>,
    /// Source-reported detection time; `None` means "now" at merge time.
    pub detected_at: Option<DateTime<Utc>>,
}

impl RawRecord {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Default::default()
        }
    }

    pub fn with_attack_type(mut self, attack_type: impl Into<String>) -> Self {
        self.attack_type = Some(attack_type.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn detected_at(mut self, at: DateTime<Utc>) -> Self {
        self.detected_at = Some(at);
        self
    }
}

/// A validated record ready for the storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    /// Canonical dotted-quad form.
    pub ip: String,
    /// Non-empty or `None`.
    pub attack_type: Option<String>,
    /// Upper-case ISO code or `None`.
    pub country: Option<String>,
    pub detection_date: i64,
}

/// Row counts reported by a storage backend for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeCounts {
    pub inserted: u64,
    pub updated: u64,
}

/// Outcome of merging a batch into the unified store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MergeResult {
    pub inserted: u64,
    pub updated: u64,
    pub rejected: u64,
    /// IPs written by this batch, ascending.
    #[serde(skip)]
    pub touched: Vec<String>,
}

impl MergeResult {
    pub fn merged(&self) -> u64 {
        self.inserted + self.updated
    }
}
