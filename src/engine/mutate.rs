//! Row mutations: copy-on-write rewrites and merge-on-read intents.
//!
//! Copy-on-write (`update`/`delete`) rewrites every base file containing a
//! matching row: the new file is ADDed, the old one REMOVEd, and the data
//! files themselves stay immutable. Any live merge-on-read intents are
//! folded into the rewrite, so a copy-on-write mutation doubles as delta
//! compaction.
//!
//! Merge-on-read (`update_merge_on_read`/`delete_merge_on_read`) defers the
//! rewrite: the mutation *intent* (predicate and assignments) is stored as
//! a small JSON file and ADDed to the log like any other file. Scans replay
//! intents against every base file older than the intent, newest-readable
//! data without touching a single Parquet file.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::codec::{self, CodecResult};
use crate::engine::{
    CodecSnafu, EngineResult, InvalidDeltaSnafu, ParquetEngine, StorageSnafu, map_log_err,
};
use crate::filter::{Assignment, Filter};
use crate::log::{DeltaType, FileInfo, LogPayload, TableId};
use crate::storage;

/// A deferred mutation stored in a merge-on-read delta file.
///
/// The JSON form is the on-disk format of `deltas/*.json` files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeltaIntent {
    /// Overwrite columns on matching rows.
    Update {
        /// Rows to touch (implicit AND).
        filters: Vec<Filter>,
        /// Columns to overwrite.
        assignments: Vec<Assignment>,
    },
    /// Remove matching rows.
    Delete {
        /// Rows to remove (implicit AND).
        filters: Vec<Filter>,
    },
}

impl DeltaIntent {
    /// The delta file kind this intent is stored as.
    pub fn delta_type(&self) -> DeltaType {
        match self {
            DeltaIntent::Update { .. } => DeltaType::Update,
            DeltaIntent::Delete { .. } => DeltaType::Delete,
        }
    }

    /// Replay this intent against a decoded batch.
    pub fn apply(&self, batch: &arrow::array::RecordBatch) -> CodecResult<arrow::array::RecordBatch> {
        match self {
            DeltaIntent::Update {
                filters,
                assignments,
            } => {
                let mask = codec::filter_mask(batch, filters)?;
                codec::apply_assignments(batch, &mask, assignments)
            }
            DeltaIntent::Delete { filters } => {
                let mask = codec::filter_mask(batch, filters)?;
                codec::drop_matching_rows(batch, &mask)
            }
        }
    }
}

enum Rewrite<'a> {
    Update(&'a [Assignment]),
    Delete,
}

impl ParquetEngine {
    /// Copy-on-write UPDATE. Returns the number of rows that matched.
    pub async fn update(
        &self,
        database: &str,
        table: &str,
        filters: &[Filter],
        assignments: &[Assignment],
    ) -> EngineResult<u64> {
        self.rewrite(database, table, filters, Rewrite::Update(assignments))
            .await
    }

    /// Copy-on-write DELETE. Returns the number of rows removed.
    pub async fn delete(
        &self,
        database: &str,
        table: &str,
        filters: &[Filter],
    ) -> EngineResult<u64> {
        self.rewrite(database, table, filters, Rewrite::Delete).await
    }

    async fn rewrite(
        &self,
        database: &str,
        table: &str,
        filters: &[Filter],
        rewrite: Rewrite<'_>,
    ) -> EngineResult<u64> {
        let id = self.resolve(database, table)?;

        // Held from snapshot read to commit: a second rewrite starting in
        // between would base itself on files this one is superseding.
        let lock = self.mutation_lock(&id);
        let _commit = lock.lock().await;

        let snapshot = self
            .log()
            .get_snapshot(&id, None)
            .await
            .map_err(map_log_err)?;

        // Live intents are folded into the rewrite and retired afterwards.
        let mut intents = Vec::new();
        for file in snapshot.delta_files() {
            let text = storage::get_string(self.store(), Path::new(&file.path))
                .await
                .context(StorageSnafu)?;
            let intent: DeltaIntent = serde_json::from_str(&text).map_err(|e| {
                InvalidDeltaSnafu {
                    path: file.path.clone(),
                    msg: e.to_string(),
                }
                .build()
            })?;
            intents.push((file.added_at, intent));
        }

        let mut matched_total = 0u64;
        let mut adds: Vec<FileInfo> = Vec::new();
        let mut removes: Vec<String> = Vec::new();

        for file in snapshot.base_files() {
            let bytes = bytes::Bytes::from(
                storage::get_bytes(self.store(), Path::new(&file.path))
                    .await
                    .context(StorageSnafu)?,
            );
            let mut batch = codec::decode_batch(bytes, &[]).context(CodecSnafu)?;

            let mut materialized = false;
            for (added_at, intent) in &intents {
                if *added_at > file.added_at {
                    batch = intent.apply(&batch).context(CodecSnafu)?;
                    materialized = true;
                }
            }

            let mask = codec::filter_mask(&batch, filters).context(CodecSnafu)?;
            let matched = mask.true_count() as u64;
            if matched == 0 && !materialized {
                continue;
            }
            matched_total += matched;

            let new_batch = match &rewrite {
                Rewrite::Update(assignments) => {
                    codec::apply_assignments(&batch, &mask, assignments).context(CodecSnafu)?
                }
                Rewrite::Delete => {
                    codec::drop_matching_rows(&batch, &mask).context(CodecSnafu)?
                }
            };

            // An empty rewrite output gets no file: the REMOVE alone
            // expresses "all rows gone".
            if new_batch.num_rows() > 0 {
                let (encoded, stats) = codec::encode_batch(&new_batch).context(CodecSnafu)?;
                let path = self.data_file_path(&id);
                storage::put(self.store(), Path::new(&path), &encoded)
                    .await
                    .context(StorageSnafu)?;
                adds.push(FileInfo::base(path, stats));
            }
            removes.push(file.path.clone());
        }

        // Every base file an intent covered was rewritten above, so all
        // intents are now materialized and their files can be retired.
        removes.extend(snapshot.delta_files().map(|f| f.path.clone()));

        // Commit as one atomic log suffix. A concurrent snapshot folds
        // either none of it or all of it, never a rewritten file alongside
        // its superseded original.
        let removed_at = Utc::now();
        let mut payloads: Vec<LogPayload> = Vec::with_capacity(adds.len() + removes.len());
        payloads.extend(adds.into_iter().map(|file| LogPayload::Add {
            file,
            data_change: true,
        }));
        payloads.extend(removes.into_iter().map(|file_path| LogPayload::Remove {
            file_path,
            deletion_timestamp: removed_at,
        }));
        let last_version = self.log().append_all(&id, payloads).await;
        self.maybe_checkpoint(&id, last_version).await;

        Ok(matched_total)
    }

    /// Merge-on-read UPDATE: record the intent, defer the rewrite.
    ///
    /// Returns the log version of the intent's ADD entry.
    pub async fn update_merge_on_read(
        &self,
        database: &str,
        table: &str,
        filters: &[Filter],
        assignments: &[Assignment],
    ) -> EngineResult<u64> {
        let intent = DeltaIntent::Update {
            filters: filters.to_vec(),
            assignments: assignments.to_vec(),
        };
        self.write_intent(database, table, intent).await
    }

    /// Merge-on-read DELETE: record the intent, defer the rewrite.
    ///
    /// Returns the log version of the intent's ADD entry.
    pub async fn delete_merge_on_read(
        &self,
        database: &str,
        table: &str,
        filters: &[Filter],
    ) -> EngineResult<u64> {
        let intent = DeltaIntent::Delete {
            filters: filters.to_vec(),
        };
        self.write_intent(database, table, intent).await
    }

    async fn write_intent(
        &self,
        database: &str,
        table: &str,
        intent: DeltaIntent,
    ) -> EngineResult<u64> {
        let id = self.resolve(database, table)?;
        let kind = intent.delta_type();
        let path = self.delta_file_path(&id, kind);

        let json = serde_json::to_string(&intent).map_err(|e| {
            InvalidDeltaSnafu {
                path: path.clone(),
                msg: e.to_string(),
            }
            .build()
        })?;
        storage::put(self.store(), Path::new(&path), json.as_bytes())
            .await
            .context(StorageSnafu)?;

        let file = FileInfo::delta(path, json.len() as u64, kind);
        let version = self.log().append_add(&id, file, true).await;
        self.maybe_checkpoint(&id, version).await;
        Ok(version)
    }

    fn delta_file_path(&self, id: &TableId, kind: DeltaType) -> String {
        format!(
            "{}/{}/deltas/{}-{}-{:05}.json",
            id.database(),
            id.table(),
            kind.as_str(),
            Utc::now().timestamp_millis(),
            self.next_file_seq()
        )
    }
}
