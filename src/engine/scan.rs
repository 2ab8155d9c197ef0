//! Snapshot-consistent table scans.
//!
//! A [`ScanIterator`] walks the base files of one [`Snapshot`] and yields
//! one record batch per file. Because the snapshot's file list is immutable
//! and base files are never rewritten in place, a scan never observes a
//! concurrent writer: it reads exactly the version it was created at.
//!
//! File skipping uses the per-file zone maps recorded in the log, and is
//! disabled entirely while merge-on-read deltas are live: an update intent
//! can change a column's values away from the file's recorded range, so the
//! stats cannot be trusted until the deltas are materialized.

use std::collections::VecDeque;
use std::path::Path;

use arrow::array::RecordBatch;
use bytes::Bytes;
use snafu::prelude::*;

use crate::codec;
use crate::engine::mutate::DeltaIntent;
use crate::engine::{CodecSnafu, EngineResult, InvalidDeltaSnafu, StorageSnafu};
use crate::filter::Filter;
use crate::log::{FileInfo, Snapshot};
use crate::storage::{self, StoreLocation};

/// Streaming reader over one table snapshot.
pub struct ScanIterator {
    store: StoreLocation,
    /// Base files still to read, in add order.
    pending: VecDeque<FileInfo>,
    /// Live delta files, in add order.
    delta_files: Vec<FileInfo>,
    /// Decoded intents, loaded on first use. Parallel to `delta_files`.
    intents: Option<Vec<(u64, DeltaIntent)>>,
    filters: Vec<Filter>,
    /// The snapshot version this scan reads.
    version: u64,
}

impl ScanIterator {
    pub(crate) fn new(store: StoreLocation, snapshot: Snapshot, filters: Vec<Filter>) -> Self {
        let delta_files: Vec<FileInfo> = snapshot.delta_files().cloned().collect();

        let pending: VecDeque<FileInfo> = if delta_files.is_empty() {
            snapshot
                .base_files()
                .filter(|file| {
                    !filters
                        .iter()
                        .any(|f| f.prunes_file(&file.min_values, &file.max_values))
                })
                .cloned()
                .collect()
        } else {
            snapshot.base_files().cloned().collect()
        };

        Self {
            store,
            pending,
            delta_files,
            intents: None,
            filters,
            version: snapshot.version,
        }
    }

    /// The log version this scan observes.
    pub fn version(&self) -> u64 {
        self.version
    }

    async fn intents(&mut self) -> EngineResult<&[(u64, DeltaIntent)]> {
        if self.intents.is_none() {
            let mut loaded = Vec::with_capacity(self.delta_files.len());
            for file in &self.delta_files {
                let text = storage::get_string(&self.store, Path::new(&file.path))
                    .await
                    .context(StorageSnafu)?;
                let intent: DeltaIntent =
                    serde_json::from_str(&text).map_err(|e| {
                        InvalidDeltaSnafu {
                            path: file.path.clone(),
                            msg: e.to_string(),
                        }
                        .build()
                    })?;
                loaded.push((file.added_at, intent));
            }
            self.intents = Some(loaded);
        }
        Ok(self.intents.as_deref().unwrap_or(&[]))
    }

    /// Read the next non-empty batch, or `None` when the scan is done.
    pub async fn try_next(&mut self) -> EngineResult<Option<RecordBatch>> {
        while let Some(file) = self.pending.pop_front() {
            let batch = self.read_file(&file).await?;
            if batch.num_rows() > 0 {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    async fn read_file(&mut self, file: &FileInfo) -> EngineResult<RecordBatch> {
        let applicable = !self.delta_files.is_empty()
            && self
                .delta_files
                .iter()
                .any(|d| d.added_at > file.added_at);

        let bytes = Bytes::from(
            storage::get_bytes(&self.store, Path::new(&file.path))
                .await
                .context(StorageSnafu)?,
        );

        if !applicable {
            // No intents touch this file: push filters into the decode.
            return codec::decode_batch(bytes, &self.filters).context(CodecSnafu);
        }

        let added_at = file.added_at;
        let mut batch = codec::decode_batch(bytes, &[]).context(CodecSnafu)?;
        let intents = self.intents().await?;
        for (intent_version, intent) in intents {
            if *intent_version > added_at {
                batch = intent.apply(&batch).context(CodecSnafu)?;
            }
        }
        codec::apply_filters(&batch, &self.filters).context(CodecSnafu)
    }

    /// Drain the scan into a vector of batches.
    pub async fn collect(mut self) -> EngineResult<Vec<RecordBatch>> {
        let mut batches = Vec::new();
        while let Some(batch) = self.try_next().await? {
            batches.push(batch);
        }
        Ok(batches)
    }

    /// Drain the scan and count the surviving rows.
    pub async fn count_rows(self) -> EngineResult<u64> {
        let mut total = 0u64;
        let mut scan = self;
        while let Some(batch) = scan.try_next().await? {
            total += batch.num_rows() as u64;
        }
        Ok(total)
    }
}

impl std::fmt::Debug for ScanIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanIterator")
            .field("version", &self.version)
            .field("pending", &self.pending.len())
            .field("delta_files", &self.delta_files.len())
            .finish()
    }
}
