mod entry;
mod record;
mod run;

pub use entry::{BlacklistEntry, EntryFilter, EntryRow, SourceIntervalConfig};
pub use record::{MergeCounts, MergeResult, NormalizedRecord, RawRecord};
pub use run::{CollectionRun, CollectionRunRow, NewCollectionRun, RunStatus};

/// Seconds in one day, used for every TTL and interval computation.
pub const SECS_PER_DAY: i64 = 86_400;
