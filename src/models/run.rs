use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(anyhow::anyhow!("unknown run status '{other}'")),
        }
    }
}

/// One row per collection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub id: i64,
    pub source: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub status: RunStatus,
    pub record_count: i64,
    pub inserted: i64,
    pub updated: i64,
    pub rejected: i64,
    pub error_summary: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CollectionRunRow {
    pub id: i64,
    pub source: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub status: String,
    pub record_count: i64,
    pub inserted: i64,
    pub updated: i64,
    pub rejected: i64,
    pub error_summary: Option<String>,
}

impl TryFrom<CollectionRunRow> for CollectionRun {
    type Error = anyhow::Error;

    fn try_from(row: CollectionRunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            source: row.source,
            started_at: row.started_at,
            finished_at: row.finished_at,
            status: row.status.parse()?,
            record_count: row.record_count,
            inserted: row.inserted,
            updated: row.updated,
            rejected: row.rejected,
            error_summary: row.error_summary,
        })
    }
}

/// A run to be appended to the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewCollectionRun {
    pub source: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub status: RunStatus,
    pub record_count: i64,
    pub inserted: i64,
    pub updated: i64,
    pub rejected: i64,
    pub error_summary: Option<String>,
}
