//! Snapshot checkpoints for fast log recovery.
//!
//! A checkpoint is a disposable cache of one table's live file list at a
//! version, written as a small Parquet file next to the persisted log:
//!
//! ```text
//! sys/delta_log/checkpoints/
//!   _checkpoint.<db>.<table>.<version, zero-padded>.parquet
//!   _last_checkpoint.<db>.<table>      # decimal text, latest version
//! ```
//!
//! The marker file is tiny and rewritten atomically, so readers either see
//! the previous checkpoint or the new one, never a torn marker. Checkpoints
//! carry file identity only (path, size, row count, add version, delta
//! flags); per-column statistics and the schema are rebuilt from the log,
//! which keeps the checkpoint format stable as stats evolve.
//!
//! Every failure on the read path degrades to "no checkpoint" with a
//! warning; the log itself is always sufficient to recover.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, SchemaRef};
use bytes::Bytes;
use snafu::{Backtrace, prelude::*};

use crate::codec::{self, CodecError};
use crate::log::{DeltaType, FileInfo, Snapshot, TableId};
use crate::storage::{self, StorageError, StoreLocation};

/// Directory under the store root where checkpoints and markers live.
pub const CHECKPOINT_DIR: &str = "sys/delta_log/checkpoints";

/// Errors raised while writing a checkpoint.
#[derive(Debug, Snafu)]
pub enum CheckpointError {
    /// The checkpoint file could not be stored.
    #[snafu(display("Checkpoint storage failed: {source}"))]
    Store {
        /// Underlying storage error.
        source: StorageError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The checkpoint record batch could not be encoded.
    #[snafu(display("Checkpoint encoding failed: {source}"))]
    Encode {
        /// Underlying codec error.
        source: CodecError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The checkpoint record batch could not be assembled.
    #[snafu(display("Checkpoint batch invalid: {msg}"))]
    Batch {
        /// What went wrong.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

fn checkpoint_schema() -> SchemaRef {
    Arc::new(ArrowSchema::new(vec![
        Field::new("file_path", DataType::Utf8, false),
        Field::new("size", DataType::Int64, false),
        Field::new("row_count", DataType::Int64, false),
        Field::new("added_at", DataType::Int64, false),
        Field::new("is_delta", DataType::Boolean, false),
        Field::new("delta_type", DataType::Utf8, true),
    ]))
}

fn checkpoint_file_name(table: &TableId, version: u64) -> String {
    format!("_checkpoint.{table}.{version:020}.parquet")
}

fn marker_file_name(table: &TableId) -> String {
    format!("_last_checkpoint.{table}")
}

/// Writes and reads per-table snapshot checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    store: StoreLocation,
}

impl CheckpointManager {
    /// A manager rooted at `store`.
    pub fn new(store: StoreLocation) -> Self {
        Self { store }
    }

    fn dir(&self) -> &Path {
        Path::new(CHECKPOINT_DIR)
    }

    /// Write a checkpoint of `snapshot` and advance the marker.
    ///
    /// The checkpoint file itself must land; a marker update failure is
    /// logged and ignored because the previous marker still points at a
    /// valid (merely older) checkpoint.
    pub async fn create(&self, snapshot: &Snapshot) -> Result<(), CheckpointError> {
        let batch = snapshot_to_batch(snapshot)?;
        let (bytes, _) = codec::encode_batch(&batch).context(EncodeSnafu)?;

        let file: PathBuf = self
            .dir()
            .join(checkpoint_file_name(&snapshot.table_id, snapshot.version));
        storage::put(&self.store, &file, &bytes)
            .await
            .context(StoreSnafu)?;

        let marker = self.dir().join(marker_file_name(&snapshot.table_id));
        let marker_write = async {
            storage::put_atomic(&self.store, &marker, snapshot.version.to_string().as_bytes())
                .await?;
            storage::sync_dir(&self.store, self.dir()).await
        };
        if let Err(e) = marker_write.await {
            log::warn!(
                "checkpoint marker update failed for {} v{}: {e}",
                snapshot.table_id,
                snapshot.version
            );
        }
        Ok(())
    }

    /// Load the latest checkpointed snapshot of `table`, if any.
    ///
    /// Returns `None` when no marker exists or when anything on the read
    /// path fails; the caller falls back to full log replay either way.
    pub async fn load_latest(&self, table: &TableId) -> Option<Snapshot> {
        let marker = self.dir().join(marker_file_name(table));
        let text = match storage::get_string(&self.store, &marker).await {
            Ok(text) => text,
            Err(StorageError::NotFound { .. }) => return None,
            Err(e) => {
                log::warn!("checkpoint marker unreadable for {table}: {e}");
                return None;
            }
        };

        let version: u64 = match text.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("checkpoint marker for {table} holds invalid version {text:?}");
                return None;
            }
        };

        let file = self.dir().join(checkpoint_file_name(table, version));
        let bytes = match storage::get_bytes(&self.store, &file).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                log::warn!("checkpoint file unreadable for {table} v{version}: {e}");
                return None;
            }
        };

        let batch = match codec::decode_batch(bytes, &[]) {
            Ok(batch) => batch,
            Err(e) => {
                log::warn!("checkpoint file corrupt for {table} v{version}: {e}");
                return None;
            }
        };

        match batch_to_files(&batch) {
            Ok(files) => Some(Snapshot {
                version,
                table_id: table.clone(),
                schema: None,
                files,
            }),
            Err(e) => {
                log::warn!("checkpoint record invalid for {table} v{version}: {e}");
                None
            }
        }
    }
}

fn snapshot_to_batch(snapshot: &Snapshot) -> Result<RecordBatch, CheckpointError> {
    let mut file_path = Vec::with_capacity(snapshot.files.len());
    let mut size = Vec::with_capacity(snapshot.files.len());
    let mut row_count = Vec::with_capacity(snapshot.files.len());
    let mut added_at = Vec::with_capacity(snapshot.files.len());
    let mut is_delta = Vec::with_capacity(snapshot.files.len());
    let mut delta_type: Vec<Option<&str>> = Vec::with_capacity(snapshot.files.len());

    for file in &snapshot.files {
        file_path.push(file.path.clone());
        size.push(file.size as i64);
        row_count.push(file.row_count as i64);
        added_at.push(file.added_at as i64);
        is_delta.push(file.is_delta);
        delta_type.push(file.delta_type.map(|t| t.as_str()));
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(file_path)),
        Arc::new(Int64Array::from(size)),
        Arc::new(Int64Array::from(row_count)),
        Arc::new(Int64Array::from(added_at)),
        Arc::new(BooleanArray::from(is_delta)),
        Arc::new(StringArray::from(delta_type)),
    ];

    RecordBatch::try_new(checkpoint_schema(), columns).map_err(|e| {
        BatchSnafu {
            msg: e.to_string(),
        }
        .build()
    })
}

fn batch_to_files(batch: &RecordBatch) -> Result<Vec<FileInfo>, String> {
    fn col<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, String> {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<T>())
            .ok_or_else(|| format!("missing column {name}"))
    }

    let file_path: &StringArray = col(batch, "file_path")?;
    let size: &Int64Array = col(batch, "size")?;
    let row_count: &Int64Array = col(batch, "row_count")?;
    let added_at: &Int64Array = col(batch, "added_at")?;
    let is_delta: &BooleanArray = col(batch, "is_delta")?;
    let delta_type: &StringArray = col(batch, "delta_type")?;

    let mut files = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let delta = is_delta.value(row);
        let kind = if delta_type.is_null(row) {
            None
        } else {
            let s = delta_type.value(row);
            Some(DeltaType::parse(s).ok_or_else(|| format!("unknown delta type {s:?}"))?)
        };
        if delta && kind.is_none() {
            return Err(format!(
                "delta file {} has no delta type",
                file_path.value(row)
            ));
        }

        files.push(FileInfo {
            path: file_path.value(row).to_string(),
            size: size.value(row) as u64,
            row_count: row_count.value(row) as u64,
            min_values: Default::default(),
            max_values: Default::default(),
            null_counts: Default::default(),
            added_at: added_at.value(row) as u64,
            is_delta: delta,
            delta_type: kind,
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn sample_snapshot(version: u64) -> Snapshot {
        Snapshot {
            version,
            table_id: TableId::new("testdb", "users"),
            schema: None,
            files: vec![
                FileInfo {
                    path: "testdb/users/data/part-0001.parquet".to_string(),
                    size: 1024,
                    row_count: 3,
                    min_values: Default::default(),
                    max_values: Default::default(),
                    null_counts: Default::default(),
                    added_at: 2,
                    is_delta: false,
                    delta_type: None,
                },
                FileInfo {
                    path: "testdb/users/deltas/delete-000003.json".to_string(),
                    size: 64,
                    row_count: 0,
                    min_values: Default::default(),
                    max_values: Default::default(),
                    null_counts: Default::default(),
                    added_at: 3,
                    is_delta: true,
                    delta_type: Some(DeltaType::Delete),
                },
            ],
        }
    }

    #[tokio::test]
    async fn checkpoint_roundtrip() -> TestResult {
        let dir = TempDir::new()?;
        let manager = CheckpointManager::new(StoreLocation::local(dir.path()));

        let snapshot = sample_snapshot(3);
        manager.create(&snapshot).await?;

        let loaded = manager
            .load_latest(&snapshot.table_id)
            .await
            .expect("checkpoint present");
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.schema, None);
        assert_eq!(loaded.files, snapshot.files);
        Ok(())
    }

    #[tokio::test]
    async fn marker_tracks_the_newest_checkpoint() -> TestResult {
        let dir = TempDir::new()?;
        let manager = CheckpointManager::new(StoreLocation::local(dir.path()));

        manager.create(&sample_snapshot(3)).await?;
        let mut newer = sample_snapshot(7);
        newer.files.pop();
        manager.create(&newer).await?;

        let loaded = manager
            .load_latest(&newer.table_id)
            .await
            .expect("checkpoint present");
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.files.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_marker_yields_none() -> TestResult {
        let dir = TempDir::new()?;
        let manager = CheckpointManager::new(StoreLocation::local(dir.path()));
        assert!(
            manager
                .load_latest(&TableId::new("testdb", "users"))
                .await
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_marker_degrades_to_none() -> TestResult {
        let dir = TempDir::new()?;
        let store = StoreLocation::local(dir.path());
        let manager = CheckpointManager::new(store.clone());

        let table = TableId::new("testdb", "users");
        let marker = Path::new(CHECKPOINT_DIR).join(marker_file_name(&table));
        storage::put(&store, &marker, b"not-a-version").await?;

        assert!(manager.load_latest(&table).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn empty_snapshot_checkpoints_cleanly() -> TestResult {
        let dir = TempDir::new()?;
        let manager = CheckpointManager::new(StoreLocation::local(dir.path()));

        let snapshot = Snapshot {
            version: 5,
            table_id: TableId::new("testdb", "empty"),
            schema: None,
            files: Vec::new(),
        };
        manager.create(&snapshot).await?;

        let loaded = manager
            .load_latest(&snapshot.table_id)
            .await
            .expect("checkpoint present");
        assert_eq!(loaded.version, 5);
        assert!(loaded.files.is_empty());
        Ok(())
    }
}
