//! The storage engine facade.
//!
//! [`ParquetEngine`] is the single entry point the query layer talks to:
//! catalog DDL, appends, copy-on-write and merge-on-read mutations, scans
//! with optional time travel, and table statistics. It wires together the
//! metadata log, the Parquet codec, the checkpoint manager, and the storage
//! backend, and owns the schema cache that makes table lookups synchronous.
//!
//! Opening an engine replays the persisted log from the store, so a process
//! restart (or crash) resumes from the last durably persisted entry.

pub mod mutate;
pub mod scan;

pub use mutate::DeltaIntent;
pub use scan::ScanIterator;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use arrow::array::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::{Backtrace, IntoError, prelude::*};

use crate::checkpoint::CheckpointManager;
use crate::codec::{self, CodecError};
use crate::filter::Filter;
use crate::log::{
    DeltaLog, FileInfo, LogEntry, LogError, LogPayload, LogSink, SinkError, SystemTable, TableId,
    record,
};
use crate::recovery::{self, RecoveryError};
use crate::schema::TableSchema;
use crate::storage::{self, StorageError, StoreLocation};

/// Errors surfaced by engine operations.
#[derive(Debug, Snafu)]
pub enum EngineError {
    /// The table does not exist (or did not exist at the requested version).
    #[snafu(display("Table not found: {table}"))]
    TableNotFound {
        /// The table that was requested.
        table: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The database does not exist.
    #[snafu(display("Database not found: {database}"))]
    DatabaseNotFound {
        /// The database that was requested.
        database: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The database name is reserved for engine internals.
    #[snafu(display("Database name is reserved: {database}"))]
    ReservedDatabase {
        /// The reserved name.
        database: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A batch does not match the table's declared schema.
    #[snafu(display("Schema mismatch for {table}: {msg}"))]
    SchemaMismatch {
        /// The table being written.
        table: String,
        /// What differed.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A merge-on-read delta intent file could not be decoded.
    #[snafu(display("Invalid delta intent {path}: {msg}"))]
    InvalidDelta {
        /// Path of the delta file.
        path: String,
        /// What failed to decode.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A storage operation failed.
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Encoding or decoding columnar data failed.
    #[snafu(display("Codec error: {source}"))]
    Codec {
        /// Underlying codec error.
        source: CodecError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A metadata log read failed.
    #[snafu(display("Metadata log error: {source}"))]
    Log {
        /// Underlying log error.
        source: LogError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Replaying the persisted log at startup failed.
    #[snafu(display("Recovery error: {source}"))]
    Recovery {
        /// Underlying recovery error.
        source: RecoveryError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

fn map_log_err(err: LogError) -> EngineError {
    match err {
        LogError::TableNotFound { table, .. } => TableNotFoundSnafu { table }.build(),
        other => LogSnafu.into_error(other),
    }
}

/// Cross-check a table's latest checkpoint against the replayed log.
///
/// Checkpoints are derived caches, so a disagreement means the checkpoint is
/// stale or damaged; replay stays authoritative and the mismatch is only
/// logged.
async fn verify_checkpoint(log: &DeltaLog, checkpoints: &CheckpointManager, table: &TableId) {
    let Some(checkpoint) = checkpoints.load_latest(table).await else {
        return;
    };
    match log.get_snapshot(table, Some(checkpoint.version)).await {
        Ok(replayed) => {
            let recorded: Vec<(&str, u64, u64, u64)> = checkpoint
                .files
                .iter()
                .map(|f| (f.path.as_str(), f.size, f.row_count, f.added_at))
                .collect();
            let folded: Vec<(&str, u64, u64, u64)> = replayed
                .files
                .iter()
                .map(|f| (f.path.as_str(), f.size, f.row_count, f.added_at))
                .collect();
            if recorded != folded {
                log::warn!(
                    "checkpoint v{} for {table} disagrees with the replayed log; \
                     replay is authoritative",
                    checkpoint.version
                );
            }
        }
        Err(e) => log::warn!(
            "checkpoint v{} for {table} references an unreplayable version: {e}",
            checkpoint.version
        ),
    }
}

/// Persists each log entry as one Parquet file under the system table.
///
/// The file name embeds the table id and zero-padded version, so a directory
/// listing is also a complete inventory of persisted entries.
#[derive(Debug)]
pub struct ParquetLogSink {
    store: StoreLocation,
}

impl ParquetLogSink {
    /// A sink writing into `store`.
    pub fn new(store: StoreLocation) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LogSink for ParquetLogSink {
    async fn persist(&self, entry: &LogEntry) -> Result<(), SinkError> {
        let batch = record::to_record_batch(std::slice::from_ref(entry))?;
        let (bytes, _) = codec::encode_batch(&batch)?;
        let name = format!("{}.{:020}.parquet", entry.table_id, entry.version);
        let path = Path::new(recovery::LOG_DATA_DIR).join(name);
        storage::put(&self.store, &path, &bytes).await?;
        Ok(())
    }
}

/// Configuration for opening a [`ParquetEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Root of the storage backend.
    pub root: StoreLocation,
    /// A table is checkpointed whenever its version is a multiple of this.
    pub checkpoint_interval: u64,
}

impl EngineOptions {
    /// Options with default tuning, rooted at `root`.
    pub fn new(root: StoreLocation) -> Self {
        Self {
            root,
            checkpoint_interval: 10,
        }
    }
}

/// Point-in-time statistics for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableStats {
    /// Total rows across live base files.
    pub row_count: u64,
    /// Number of live files, delta intents included.
    pub file_count: usize,
    /// Total live bytes, in gigabytes.
    pub size_gb: f64,
    /// Timestamp of the table's most recent log entry.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Handle for a client transaction.
///
/// Single-statement operations are internally atomic through the log, so
/// commit and rollback currently only close the handle. The id is stable for
/// the lifetime of the engine and can be logged by callers.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    version: u64,
}

impl Transaction {
    /// The transaction's engine-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The snapshot version this transaction would pin. Reserved for
    /// multi-statement reads; the stub always reports 0.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Commit the transaction.
    pub fn commit(self) {}

    /// Roll back the transaction.
    pub fn rollback(self) {}
}

/// Transactional columnar storage over Parquet files.
pub struct ParquetEngine {
    store: StoreLocation,
    options: EngineOptions,
    log: DeltaLog,
    checkpoints: CheckpointManager,
    schemas: RwLock<HashMap<TableId, TableSchema>>,
    /// Serializes read-snapshot-then-commit mutations per table, so two
    /// copy-on-write rewrites cannot both rewrite the same base file.
    mutation_locks: std::sync::Mutex<HashMap<TableId, Arc<tokio::sync::Mutex<()>>>>,
    file_seq: AtomicU64,
    txn_seq: AtomicU64,
}

impl std::fmt::Debug for ParquetEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParquetEngine")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ParquetEngine {
    /// Open an engine over `options.root`, replaying any persisted log.
    ///
    /// Tables whose persisted entries contain no METADATA (for example when
    /// the schema entry was lost to a partial sink failure) are left out of
    /// the catalog with a warning; their data files remain on disk.
    pub async fn open(options: EngineOptions) -> EngineResult<Self> {
        let store = options.root.clone();

        let entries = recovery::recover(&store).await.context(RecoverySnafu)?;
        let sink = Arc::new(ParquetLogSink::new(store.clone()));
        let log = DeltaLog::with_sink(sink);
        log.restore_from_entries(entries);

        let checkpoints = CheckpointManager::new(store.clone());

        let mut schemas = HashMap::new();
        for table in log.list_tables() {
            match log.get_snapshot(&table, None).await {
                Ok(snapshot) => {
                    if let Some(schema) = snapshot.schema {
                        schemas.insert(table.clone(), schema);
                    }
                    verify_checkpoint(&log, &checkpoints, &table).await;
                }
                Err(LogError::TableNotFound { .. }) => {
                    log::warn!("recovered entries for {table} carry no schema; table orphaned");
                }
                Err(e) => return Err(map_log_err(e)),
            }
        }

        Ok(Self {
            checkpoints,
            store,
            options,
            log,
            schemas: RwLock::new(schemas),
            mutation_locks: std::sync::Mutex::new(HashMap::new()),
            file_seq: AtomicU64::new(0),
            txn_seq: AtomicU64::new(0),
        })
    }

    pub(crate) fn store(&self) -> &StoreLocation {
        &self.store
    }

    pub(crate) fn log(&self) -> &DeltaLog {
        &self.log
    }

    pub(crate) fn next_file_seq(&self) -> u64 {
        self.file_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// The lock a mutation must hold from snapshot read to commit.
    ///
    /// Returned by value so the map lock is released before the caller
    /// awaits.
    pub(crate) fn mutation_lock(&self, id: &TableId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.mutation_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    fn reject_reserved(database: &str) -> EngineResult<()> {
        if database == SystemTable::DATABASE {
            return ReservedDatabaseSnafu { database }.fail();
        }
        Ok(())
    }

    /// Create a database. Creating an existing database is a no-op.
    pub async fn create_database(&self, database: &str) -> EngineResult<()> {
        Self::reject_reserved(database)?;
        storage::create_dir(&self.store, Path::new(database))
            .await
            .context(StorageSnafu)
    }

    /// Drop a database and everything under it.
    pub async fn drop_database(&self, database: &str) -> EngineResult<()> {
        Self::reject_reserved(database)?;
        match storage::remove_dir_all(&self.store, Path::new(database)).await {
            Ok(()) => {}
            Err(StorageError::NotFound { .. }) => {
                return DatabaseNotFoundSnafu { database }.fail();
            }
            Err(e) => return Err(e).context(StorageSnafu),
        }

        let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());
        schemas.retain(|table, _| table.database() != database);
        Ok(())
    }

    /// List user databases, sorted by name.
    pub async fn list_databases(&self) -> EngineResult<Vec<String>> {
        let listing = match storage::list_dir(&self.store, Path::new("")).await {
            Ok(listing) => listing,
            Err(StorageError::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e).context(StorageSnafu),
        };
        Ok(listing
            .into_iter()
            .filter(|e| e.is_dir && e.name != SystemTable::DATABASE)
            .map(|e| e.name)
            .collect())
    }

    /// Whether a user database exists.
    pub async fn database_exists(&self, database: &str) -> EngineResult<bool> {
        if database == SystemTable::DATABASE {
            return Ok(false);
        }
        storage::exists(&self.store, Path::new(database))
            .await
            .context(StorageSnafu)
    }

    /// Create a table with the given schema.
    ///
    /// Not idempotent: creating an existing table appends another METADATA
    /// entry, and the later schema wins. The caller's catalog layer is the
    /// place to reject duplicates if it wants to.
    pub async fn create_table(
        &self,
        database: &str,
        table: &str,
        schema: TableSchema,
    ) -> EngineResult<()> {
        Self::reject_reserved(database)?;
        if !self.database_exists(database).await? {
            return DatabaseNotFoundSnafu { database }.fail();
        }

        let id = TableId::new(database, table);
        {
            let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());
            schemas.insert(id.clone(), schema.clone());
        }

        let version = self.log.append_metadata(&id, schema, None).await;
        self.maybe_checkpoint(&id, version).await;
        Ok(())
    }

    /// Drop a table: tombstone every live file and forget the schema.
    ///
    /// The tombstones land as one atomic log suffix, so a concurrent scan
    /// sees the table fully live or fully dropped, never in between.
    pub async fn drop_table(&self, database: &str, table: &str) -> EngineResult<()> {
        let id = self.resolve(database, table)?;
        let lock = self.mutation_lock(&id);
        let _commit = lock.lock().await;

        let snapshot = self.log.get_snapshot(&id, None).await.map_err(map_log_err)?;
        let dropped_at = Utc::now();
        let removes: Vec<LogPayload> = snapshot
            .files
            .iter()
            .map(|file| LogPayload::Remove {
                file_path: file.path.clone(),
                deletion_timestamp: dropped_at,
            })
            .collect();
        self.log.append_all(&id, removes).await;

        let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());
        schemas.remove(&id);
        Ok(())
    }

    /// Whether a table exists in the catalog.
    pub fn table_exists(&self, database: &str, table: &str) -> bool {
        let schemas = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        schemas.contains_key(&TableId::new(database, table))
    }

    /// List tables of a database, sorted by name.
    pub fn list_tables(&self, database: &str) -> Vec<String> {
        let schemas = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        let mut tables: Vec<String> = schemas
            .keys()
            .filter(|id| id.database() == database)
            .map(|id| id.table().to_string())
            .collect();
        tables.sort();
        tables
    }

    /// The declared schema of a table.
    pub fn get_schema(&self, database: &str, table: &str) -> EngineResult<TableSchema> {
        let id = self.resolve(database, table)?;
        let schemas = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        schemas
            .get(&id)
            .cloned()
            .context(TableNotFoundSnafu {
                table: id.to_string(),
            })
    }

    pub(crate) fn resolve(&self, database: &str, table: &str) -> EngineResult<TableId> {
        let id = TableId::new(database, table);
        let schemas = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        if schemas.contains_key(&id) {
            Ok(id)
        } else {
            TableNotFoundSnafu {
                table: id.to_string(),
            }
            .fail()
        }
    }

    /// Append a batch of rows to a table; returns the new log version.
    ///
    /// The file lands in storage before its ADD entry is appended, so a
    /// crash between the two leaves an unreferenced file, never a dangling
    /// reference.
    pub async fn write(&self, database: &str, table: &str, batch: &RecordBatch) -> EngineResult<u64> {
        let id = self.resolve(database, table)?;
        let schema = self.get_schema(database, table)?;
        if !schema.matches_arrow(&batch.schema()) {
            return SchemaMismatchSnafu {
                table: id.to_string(),
                msg: format!(
                    "batch schema {:?} does not match declared schema",
                    batch
                        .schema()
                        .fields()
                        .iter()
                        .map(|f| f.name().clone())
                        .collect::<Vec<_>>()
                ),
            }
            .fail();
        }

        let (bytes, stats) = codec::encode_batch(batch).context(CodecSnafu)?;
        let path = self.data_file_path(&id);
        storage::put(&self.store, Path::new(&path), &bytes)
            .await
            .context(StorageSnafu)?;

        let version = self
            .log
            .append_add(&id, FileInfo::base(path, stats), true)
            .await;
        self.maybe_checkpoint(&id, version).await;
        Ok(version)
    }

    pub(crate) fn data_file_path(&self, id: &TableId) -> String {
        format!(
            "{}/{}/data/part-{}-{:05}.parquet",
            id.database(),
            id.table(),
            Utc::now().timestamp_millis(),
            self.next_file_seq()
        )
    }

    /// Scan the latest version of a table.
    pub async fn scan(
        &self,
        database: &str,
        table: &str,
        filters: &[Filter],
    ) -> EngineResult<ScanIterator> {
        self.scan_version(database, table, filters, None).await
    }

    /// Scan a table as of a specific log version (time travel).
    pub async fn scan_version(
        &self,
        database: &str,
        table: &str,
        filters: &[Filter],
        version: Option<u64>,
    ) -> EngineResult<ScanIterator> {
        let id = TableId::new(database, table);
        let snapshot = self
            .log
            .get_snapshot(&id, version)
            .await
            .map_err(map_log_err)?;
        Ok(ScanIterator::new(
            self.store.clone(),
            snapshot,
            filters.to_vec(),
        ))
    }

    /// The latest log version of a table (0 for an unknown table).
    pub async fn latest_version(&self, database: &str, table: &str) -> u64 {
        self.log
            .latest_version(&TableId::new(database, table))
            .await
    }

    /// Current statistics for a table.
    pub async fn get_table_stats(&self, database: &str, table: &str) -> EngineResult<TableStats> {
        let id = self.resolve(database, table)?;
        let snapshot = self.log.get_snapshot(&id, None).await.map_err(map_log_err)?;
        let last_modified = self
            .log
            .entries_up_to(&id, u64::MAX)
            .await
            .last()
            .map(|e| e.timestamp);

        Ok(TableStats {
            row_count: snapshot.row_count(),
            file_count: snapshot.files.len(),
            size_gb: snapshot.byte_size() as f64 / (1024.0 * 1024.0 * 1024.0),
            last_modified,
        })
    }

    /// Open a transaction handle.
    pub fn begin_transaction(&self) -> Transaction {
        Transaction {
            id: self.txn_seq.fetch_add(1, Ordering::Relaxed) + 1,
            version: 0,
        }
    }

    /// Close the engine.
    ///
    /// Every operation flushes synchronously, so this only consumes the
    /// handle; it exists so the boundary reads open/close symmetric.
    pub fn close(self) {}

    /// Force a checkpoint of the table's current snapshot.
    pub async fn checkpoint_table(&self, database: &str, table: &str) -> EngineResult<()> {
        let id = self.resolve(database, table)?;
        let snapshot = self.log.get_snapshot(&id, None).await.map_err(map_log_err)?;
        if let Err(e) = self.checkpoints.create(&snapshot).await {
            log::warn!("checkpoint failed for {id} v{}: {e}", snapshot.version);
        }
        Ok(())
    }

    /// Checkpoint the table when its version crosses the interval.
    ///
    /// Checkpoints are an optimization, so every failure here is logged and
    /// swallowed.
    pub(crate) async fn maybe_checkpoint(&self, id: &TableId, version: u64) {
        let interval = self.options.checkpoint_interval;
        if interval == 0 || version % interval != 0 {
            return;
        }
        match self.log.get_snapshot(id, None).await {
            Ok(snapshot) => {
                if let Err(e) = self.checkpoints.create(&snapshot).await {
                    log::warn!("checkpoint failed for {id} v{}: {e}", snapshot.version);
                }
            }
            Err(e) => log::warn!("checkpoint snapshot failed for {id}: {e}"),
        }
    }

    /// The checkpoint manager, for callers that restore snapshots directly.
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }
}
