//! Crash recovery by replaying the persisted log.
//!
//! The persisted log is one Parquet file per entry under
//! `sys/delta_log/data/`. Recovery lists that directory, decodes every file,
//! and hands the entries to [`DeltaLog::restore_from_entries`]; the log
//! sorts per table, so listing order does not matter. A store with no
//! persisted log directory is simply a fresh store.
//!
//! Individual files that fail to read or decode are skipped with a warning
//! rather than aborting recovery: one torn file (a crash mid-write) should
//! not make every table unreadable.
//!
//! [`DeltaLog::restore_from_entries`]: crate::log::DeltaLog::restore_from_entries

use std::path::Path;

use bytes::Bytes;
use snafu::prelude::*;

use crate::codec;
use crate::log::{LogEntry, record};
use crate::storage::{self, StorageError, StoreLocation};

/// Directory under the store root holding one Parquet file per log entry.
pub const LOG_DATA_DIR: &str = "sys/delta_log/data";

/// Errors that abort recovery entirely.
///
/// Per-file decode failures do not appear here; they are skipped with a
/// warning. Only a failure to enumerate the log directory itself is fatal.
#[derive(Debug, Snafu)]
pub enum RecoveryError {
    /// The persisted log directory could not be listed.
    #[snafu(display("Failed to list persisted log: {source}"))]
    ListLog {
        /// Underlying storage error.
        source: StorageError,
        /// Backtrace for debugging.
        backtrace: snafu::Backtrace,
    },
}

/// Replay all persisted log entries from `store`.
///
/// Returns the decoded entries in no particular order; an absent log
/// directory yields an empty list.
pub async fn recover(store: &StoreLocation) -> Result<Vec<LogEntry>, RecoveryError> {
    let dir = Path::new(LOG_DATA_DIR);
    let listing = match storage::list_dir(store, dir).await {
        Ok(listing) => listing,
        Err(StorageError::NotFound { .. }) => return Ok(Vec::new()),
        Err(e) => return Err(e).context(ListLogSnafu),
    };

    let mut entries = Vec::new();
    for item in listing {
        if item.is_dir || !item.name.ends_with(".parquet") {
            continue;
        }
        let path = dir.join(&item.name);

        let bytes = match storage::get_bytes(store, &path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                log::warn!("skipping unreadable log file {}: {e}", item.name);
                continue;
            }
        };

        let batch = match codec::decode_batch(bytes, &[]) {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("skipping corrupt log file {}: {e}", item.name);
                continue;
            }
        };

        match record::from_record_batch(&batch) {
            Ok(decoded) => entries.extend(decoded),
            Err(e) => {
                log::warn!("skipping undecodable log file {}: {e}", item.name);
            }
        }
    }

    Ok(entries)
}
