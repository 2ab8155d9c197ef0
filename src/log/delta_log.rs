//! In-memory authority for the metadata log.
//!
//! [`DeltaLog`] owns every table's entry list and is the only place where
//! version numbers are assigned. Appends take a per-table async mutex, so a
//! version is always `last + 1` and two writers can never observe the same
//! version. Reads fold the entry list into a [`Snapshot`] without taking the
//! append lock for longer than a clone.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::log::entry::{
    FileInfo, IndexDef, IndexOperation, LogEntry, LogPayload, Snapshot, TableId,
};
use crate::log::{LogError, LogSink, TableNotFoundSnafu};
use crate::schema::TableSchema;

#[derive(Debug, Default)]
struct TableLog {
    entries: Vec<LogEntry>,
}

impl TableLog {
    fn next_version(&self) -> u64 {
        self.entries.last().map(|e| e.version + 1).unwrap_or(1)
    }
}

/// The append-only metadata log, shared by all tables of one engine.
///
/// Cloning is cheap and all clones share state. The outer map lock is a
/// blocking `RwLock` held only for map lookups, never across an await; the
/// per-table `tokio::sync::Mutex` is held across the sink call so persisted
/// entries hit the sink in version order.
#[derive(Clone)]
pub struct DeltaLog {
    tables: Arc<RwLock<HashMap<TableId, Arc<Mutex<TableLog>>>>>,
    sink: Option<Arc<dyn LogSink>>,
}

impl std::fmt::Debug for DeltaLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaLog")
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl DeltaLog {
    /// A log with no persistence sink. Entries live only in memory.
    pub fn in_memory() -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            sink: None,
        }
    }

    /// A log that forwards every non-system append to `sink`.
    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            sink: Some(sink),
        }
    }

    fn table_log(&self, table: &TableId) -> Arc<Mutex<TableLog>> {
        if let Some(existing) = self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
        {
            return Arc::clone(existing);
        }
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(tables.entry(table.clone()).or_default())
    }

    fn existing_table_log(&self, table: &TableId) -> Option<Arc<Mutex<TableLog>>> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .cloned()
    }

    /// Append a batch of entries as one contiguous suffix of the table's
    /// log, and return the last assigned version.
    ///
    /// Versions are assigned and every entry is pushed under a single
    /// acquisition of the per-table lock, so a concurrent snapshot either
    /// folds none of the batch or all of it. This is what lets a
    /// copy-on-write commit install its REMOVE+ADD set without a reader
    /// ever seeing a rewritten file next to its superseded original.
    ///
    /// `added_at` of ADD payloads is overwritten with the assigned version.
    /// An empty batch appends nothing and returns the current latest
    /// version.
    pub async fn append_all(&self, table: &TableId, payloads: Vec<LogPayload>) -> u64 {
        let table_log = self.table_log(table);
        let mut guard = table_log.lock().await;

        let first_new = guard.entries.len();
        let mut version = guard.next_version() - 1;
        for mut payload in payloads {
            version += 1;
            if let LogPayload::Add { file, .. } = &mut payload {
                file.added_at = version;
            }
            guard.entries.push(LogEntry {
                version,
                timestamp: Utc::now(),
                table_id: table.clone(),
                payload,
            });
        }

        // Best-effort durability: the in-memory append above is
        // authoritative. System-table entries never reach the sink, which is
        // what keeps the self-hosted log from persisting its own persistence.
        if table.as_system().is_none() {
            if let Some(sink) = &self.sink {
                for entry in &guard.entries[first_new..] {
                    if let Err(e) = sink.persist(entry).await {
                        log::warn!(
                            "failed to persist log entry v{} for {table}: {e}",
                            entry.version
                        );
                    }
                }
            }
        }

        version
    }

    /// Append an ADD entry and return its version.
    ///
    /// `file.added_at` is overwritten with the assigned version.
    pub async fn append_add(&self, table: &TableId, file: FileInfo, data_change: bool) -> u64 {
        self.append_all(table, vec![LogPayload::Add { file, data_change }])
            .await
    }

    /// Append a REMOVE entry tombstoning `file_path`, and return its version.
    pub async fn append_remove(&self, table: &TableId, file_path: &str) -> u64 {
        self.append_all(
            table,
            vec![LogPayload::Remove {
                file_path: file_path.to_string(),
                deletion_timestamp: Utc::now(),
            }],
        )
        .await
    }

    /// Append a METADATA entry carrying a full replacement schema, and
    /// return its version.
    pub async fn append_metadata(
        &self,
        table: &TableId,
        schema: TableSchema,
        index: Option<(IndexDef, IndexOperation)>,
    ) -> u64 {
        let (index, index_op) = match index {
            Some((def, op)) => (Some(def), Some(op)),
            None => (None, None),
        };
        self.append_all(
            table,
            vec![LogPayload::Metadata {
                schema,
                index,
                index_op,
            }],
        )
        .await
    }

    /// Compute the snapshot of `table` at `version` (latest when `None`).
    ///
    /// Folds all entries at or before the target: the live file set is the
    /// ADDs not superseded by a later REMOVE, the schema is the most recent
    /// METADATA. A table with no METADATA at or before the target does not
    /// exist at that version.
    pub async fn get_snapshot(
        &self,
        table: &TableId,
        version: Option<u64>,
    ) -> Result<Snapshot, LogError> {
        let entries = match self.existing_table_log(table) {
            Some(table_log) => table_log.lock().await.entries.clone(),
            None => Vec::new(),
        };

        let target = version.unwrap_or_else(|| entries.last().map(|e| e.version).unwrap_or(0));

        let mut live: BTreeMap<String, FileInfo> = BTreeMap::new();
        let mut schema: Option<TableSchema> = None;
        for entry in entries.iter().filter(|e| e.version <= target) {
            match &entry.payload {
                LogPayload::Add { file, .. } => {
                    live.insert(file.path.clone(), file.clone());
                }
                LogPayload::Remove { file_path, .. } => {
                    live.remove(file_path);
                }
                LogPayload::Metadata { schema: s, .. } => {
                    schema = Some(s.clone());
                }
            }
        }

        let Some(schema) = schema else {
            return TableNotFoundSnafu {
                table: table.to_string(),
            }
            .fail();
        };

        let mut files: Vec<FileInfo> = live.into_values().collect();
        files.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.path.cmp(&b.path)));

        Ok(Snapshot {
            version: target,
            table_id: table.clone(),
            schema: Some(schema),
            files,
        })
    }

    /// The latest version of `table`, or 0 if the log has no entries for it.
    pub async fn latest_version(&self, table: &TableId) -> u64 {
        match self.existing_table_log(table) {
            Some(table_log) => table_log
                .lock()
                .await
                .entries
                .last()
                .map(|e| e.version)
                .unwrap_or(0),
            None => 0,
        }
    }

    /// All entries of `table` at or before `version`, in version order.
    pub async fn entries_up_to(&self, table: &TableId, version: u64) -> Vec<LogEntry> {
        match self.existing_table_log(table) {
            Some(table_log) => table_log
                .lock()
                .await
                .entries
                .iter()
                .filter(|e| e.version <= version)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// All tables with at least one log entry, sorted by identifier.
    pub fn list_tables(&self) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        tables.sort();
        tables
    }

    /// Rebuild the in-memory state from replayed entries.
    ///
    /// Entries may arrive in any order (recovery reads one persisted file
    /// per entry, and directory listings are not version-ordered); they are
    /// grouped by table and sorted by version. Any existing in-memory state
    /// is replaced.
    pub fn restore_from_entries(&self, mut entries: Vec<LogEntry>) {
        entries.sort_by(|a, b| {
            a.table_id
                .cmp(&b.table_id)
                .then_with(|| a.version.cmp(&b.version))
        });

        let mut grouped: HashMap<TableId, Vec<LogEntry>> = HashMap::new();
        for entry in entries {
            grouped.entry(entry.table_id.clone()).or_default().push(entry);
        }

        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.clear();
        for (table, entries) in grouped {
            tables.insert(table, Arc::new(Mutex::new(TableLog { entries })));
        }
    }
}
