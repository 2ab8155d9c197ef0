//! Log entry and snapshot data model.
//!
//! The types here are pure data: [`LogEntry`] is one append-only fact about
//! a table, [`FileInfo`] is the materialized view of one live file, and
//! [`Snapshot`] is the derived queryable state at a version. All IO, both
//! persisting entries and folding them back into snapshots, lives in the
//! sibling modules.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::codec::FileStats;
use crate::filter::ScalarValue;
use crate::log::{CorruptSnafu, LogError};
use crate::schema::TableSchema;

/// Fully qualified table identifier, rendered as `"<database>.<table>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId {
    database: String,
    table: String,
}

impl TableId {
    /// Build an identifier from database and table names.
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }

    /// The database component.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The table component.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Return the reserved system table this id names, if any.
    ///
    /// The metadata log uses this, not a string comparison at the call
    /// site, to decide whether an entry may be routed to the persistence
    /// sink.
    pub fn as_system(&self) -> Option<SystemTable> {
        SystemTable::of(self)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

impl FromStr for TableId {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() => {
                Ok(TableId::new(db, table))
            }
            _ => CorruptSnafu {
                msg: format!("invalid table id {s:?} (expected \"<database>.<table>\")"),
            }
            .fail(),
        }
    }
}

/// Reserved tables owned by the engine itself.
///
/// System tables share the on-disk layout of user tables but are invisible
/// to the catalog surface, and the metadata log never routes their entries
/// to the persistence sink (the log would otherwise persist its own
/// persistence, recursively).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemTable {
    /// The metadata log's own storage table (`sys.delta_log`).
    DeltaLog,
}

impl SystemTable {
    /// Database name under which all system tables live.
    pub const DATABASE: &'static str = "sys";

    /// The identifier of this system table.
    pub fn table_id(&self) -> TableId {
        match self {
            SystemTable::DeltaLog => TableId::new(Self::DATABASE, "delta_log"),
        }
    }

    /// Classify a table id as a system table.
    pub fn of(id: &TableId) -> Option<SystemTable> {
        if id.database != Self::DATABASE {
            return None;
        }
        match id.table.as_str() {
            "delta_log" => Some(SystemTable::DeltaLog),
            _ => None,
        }
    }
}

/// Kind of merge-on-read delta file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaType {
    /// The delta holds an update intent (predicate + assignments).
    Update,
    /// The delta holds a delete intent (predicate only).
    Delete,
}

impl DeltaType {
    /// Stable string form used in file names and checkpoint records.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaType::Update => "update",
            DeltaType::Delete => "delete",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<DeltaType> {
        match s {
            "update" => Some(DeltaType::Update),
            "delete" => Some(DeltaType::Delete),
            _ => None,
        }
    }
}

/// Materialized view of one live file in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    /// Store-relative path of the file. Immutable once ADDed.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Number of rows (0 for delta intents).
    pub row_count: u64,
    /// Per-column minimum values, for zone-map pruning.
    pub min_values: HashMap<String, ScalarValue>,
    /// Per-column maximum values.
    pub max_values: HashMap<String, ScalarValue>,
    /// Per-column null counts.
    pub null_counts: HashMap<String, u64>,
    /// The log version at which this file was added (set by the log).
    pub added_at: u64,
    /// Whether this is a merge-on-read delta file rather than a base file.
    pub is_delta: bool,
    /// Delta kind, present iff `is_delta`.
    pub delta_type: Option<DeltaType>,
}

impl FileInfo {
    /// Describe a base data file from its encoded stats.
    pub fn base(path: impl Into<String>, stats: FileStats) -> Self {
        Self {
            path: path.into(),
            size: stats.byte_size,
            row_count: stats.row_count,
            min_values: stats.min_values,
            max_values: stats.max_values,
            null_counts: stats.null_counts,
            added_at: 0,
            is_delta: false,
            delta_type: None,
        }
    }

    /// Describe a merge-on-read delta intent file.
    pub fn delta(path: impl Into<String>, size: u64, delta_type: DeltaType) -> Self {
        Self {
            path: path.into(),
            size,
            row_count: 0,
            min_values: HashMap::new(),
            max_values: HashMap::new(),
            null_counts: HashMap::new(),
            added_at: 0,
            is_delta: true,
            delta_type: Some(delta_type),
        }
    }

    /// Recover the delta flags from a persisted path.
    ///
    /// The log-entry record layout does not carry `is_delta`/`delta_type`
    /// columns; the layout convention does: delta files live under a
    /// `deltas/` directory and are named `<delta-type>-…`. Replay uses this
    /// to rebuild the flags.
    pub fn infer_delta_flags(&mut self) {
        let mut components = self.path.rsplit('/');
        let name = components.next().unwrap_or("");
        let dir = components.next().unwrap_or("");
        if dir == "deltas" {
            self.is_delta = true;
            self.delta_type = name.split('-').next().and_then(DeltaType::parse);
        }
    }
}

/// Secondary index definition carried by METADATA entries.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexDef {
    /// Index name, unique within the table.
    pub name: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
}

/// What a METADATA entry does with its index definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IndexOperation {
    /// Create the index.
    Create,
    /// Drop the index.
    Drop,
}

impl IndexOperation {
    /// Stable string form used in the persisted record layout.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexOperation::Create => "CREATE",
            IndexOperation::Drop => "DROP",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<IndexOperation> {
        match s {
            "CREATE" => Some(IndexOperation::Create),
            "DROP" => Some(IndexOperation::Drop),
            _ => None,
        }
    }
}

/// The operation-specific payload of a log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum LogPayload {
    /// A file became part of the table's live set.
    Add {
        /// The file being added.
        file: FileInfo,
        /// Whether the file carries new logical data (false for compaction
        /// artifacts that only reorganize existing rows).
        data_change: bool,
    },
    /// A file was tombstoned out of the live set.
    Remove {
        /// Path of the removed file.
        file_path: String,
        /// Tombstone time, used by eventual physical garbage collection.
        deletion_timestamp: DateTime<Utc>,
    },
    /// The table's schema (and optionally an index) changed.
    Metadata {
        /// Complete replacement schema.
        schema: TableSchema,
        /// Optional index definition.
        index: Option<IndexDef>,
        /// What to do with the index definition.
        index_op: Option<IndexOperation>,
    },
}

impl LogPayload {
    /// The operation tag persisted in the record layout.
    pub fn operation(&self) -> &'static str {
        match self {
            LogPayload::Add { .. } => "ADD",
            LogPayload::Remove { .. } => "REMOVE",
            LogPayload::Metadata { .. } => "METADATA",
        }
    }
}

/// One append-only fact about a table at a specific version.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Per-table version, strictly increasing from 1.
    pub version: u64,
    /// Creation instant.
    pub timestamp: DateTime<Utc>,
    /// The table this entry belongs to.
    pub table_id: TableId,
    /// Operation-specific payload.
    pub payload: LogPayload,
}

/// The derived, queryable state of a table at a version.
///
/// Computed by folding log entries; never stored directly (the checkpoint
/// file is a disposable cache of the file list only).
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// The version this snapshot reflects.
    pub version: u64,
    /// The table the snapshot describes.
    pub table_id: TableId,
    /// Schema from the most recent METADATA entry at or before `version`.
    /// `None` only for checkpoint-restored snapshots, which carry file
    /// identity but rebuild the schema from the log.
    pub schema: Option<TableSchema>,
    /// Live files, ordered by the version at which they were added.
    pub files: Vec<FileInfo>,
}

impl Snapshot {
    /// Live base (non-delta) files, in add order.
    pub fn base_files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.iter().filter(|f| !f.is_delta)
    }

    /// Live merge-on-read delta files, in add order.
    pub fn delta_files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.iter().filter(|f| f.is_delta)
    }

    /// Total row count across base files.
    pub fn row_count(&self) -> u64 {
        self.base_files().map(|f| f.row_count).sum()
    }

    /// Total byte size across all live files.
    pub fn byte_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_id_display_and_parse() {
        let id = TableId::new("testdb", "users");
        assert_eq!(id.to_string(), "testdb.users");

        let parsed: TableId = "testdb.users".parse().expect("parse");
        assert_eq!(parsed, id);

        let err = "no-dot".parse::<TableId>().expect_err("expected error");
        assert!(matches!(err, LogError::Corrupt { .. }));
    }

    #[test]
    fn system_table_classification() {
        let log_id = SystemTable::DeltaLog.table_id();
        assert_eq!(log_id.to_string(), "sys.delta_log");
        assert_eq!(log_id.as_system(), Some(SystemTable::DeltaLog));

        assert_eq!(TableId::new("testdb", "delta_log").as_system(), None);
        assert_eq!(TableId::new("sys", "unknown").as_system(), None);
    }

    #[test]
    fn infer_delta_flags_from_path() {
        let mut f = FileInfo::base("testdb/t/deltas/update-000123.json", FileStats::default());
        f.infer_delta_flags();
        assert!(f.is_delta);
        assert_eq!(f.delta_type, Some(DeltaType::Update));

        let mut f = FileInfo::base("testdb/t/deltas/delete-000124.json", FileStats::default());
        f.infer_delta_flags();
        assert_eq!(f.delta_type, Some(DeltaType::Delete));

        let mut f = FileInfo::base("testdb/t/data/part-0001.parquet", FileStats::default());
        f.infer_delta_flags();
        assert!(!f.is_delta);
        assert_eq!(f.delta_type, None);
    }

    #[test]
    fn snapshot_partitions_base_and_delta_files() {
        let snapshot = Snapshot {
            version: 3,
            table_id: TableId::new("testdb", "t"),
            schema: None,
            files: vec![
                FileInfo {
                    row_count: 10,
                    size: 100,
                    ..FileInfo::base("a", FileStats::default())
                },
                FileInfo::delta("b", 20, DeltaType::Delete),
            ],
        };
        assert_eq!(snapshot.base_files().count(), 1);
        assert_eq!(snapshot.delta_files().count(), 1);
        assert_eq!(snapshot.row_count(), 10);
        assert_eq!(snapshot.byte_size(), 120);
    }
}
