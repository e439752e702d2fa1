use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row per unique IP address in the unified blacklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub ip: String,
    /// Every source that ever reported this IP, sorted.
    pub sources: Vec<String>,
    pub attack_type: Option<String>,
    pub country: Option<String>,
    /// Earliest detection reported by any source (Unix seconds).
    pub detection_date: i64,
    /// Largest TTL among the contributing sources.
    pub ttl_days: i64,
    pub expires_at: i64,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl BlacklistEntry {
    /// Whether the entry should be active at `now`, regardless of the stored flag.
    pub fn active_at(&self, now: i64) -> bool {
        now < self.expires_at
    }
}

/// Database shape of an entry; `sources` arrives as a comma separated aggregate.
#[derive(Debug, Clone, FromRow)]
pub struct EntryRow {
    pub ip: String,
    pub attack_type: Option<String>,
    pub country: Option<String>,
    pub detection_date: i64,
    pub ttl_days: i64,
    pub expires_at: i64,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub sources: Option<String>,
}

impl From<EntryRow> for BlacklistEntry {
    fn from(row: EntryRow) -> Self {
        let mut sources: Vec<String> = row
            .sources
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        sources.sort();
        sources.dedup();

        Self {
            ip: row.ip,
            sources,
            attack_type: row.attack_type,
            country: row.country,
            detection_date: row.detection_date,
            ttl_days: row.ttl_days,
            expires_at: row.expires_at,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryFilter {
    #[default]
    All,
    Active,
    Expired,
}

/// Per-source scheduling state. Never deleted, only disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SourceIntervalConfig {
    pub source: String,
    pub interval_days: i64,
    pub enabled: bool,
    pub last_success_at: Option<i64>,
    pub updated_at: i64,
}
