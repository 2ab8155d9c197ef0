//! Append-only, version-numbered metadata log.
//!
//! This module implements the multi-version metadata layer of `parquet-lake`.
//! Every fact about a table (a data file becoming visible, a file being
//! tombstoned, a schema change) is an immutable [`LogEntry`] with a
//! per-table, strictly increasing version number. Table state is never
//! stored directly; a [`Snapshot`] is *computed* by folding a table's
//! entries in version order, which is what makes point-in-time (time-travel)
//! reads a one-parameter variation of the latest read.
//!
//! The log is designed to be:
//!
//! - **Append-only**: entries are created, never mutated or deleted; a file
//!   is superseded by a REMOVE entry, not erased.
//! - **Monotonically versioned**: versions are `u64` values assigned under a
//!   per-table lock, so two writers can never share a version.
//! - **Self-hosted**: entries are persisted as Parquet files under the
//!   reserved [`SystemTable::DeltaLog`] table, using the same layout as any
//!   user table. The persistence sink is injected at construction and is
//!   never invoked for system-table entries, which breaks the recursion by
//!   type rather than by string comparison.
//!
//! ## On-disk layout (high level)
//!
//! ```text
//! <root>/
//!   <db>/<table>/data/*.parquet          # base files
//!   <db>/<table>/deltas/*.json           # merge-on-read intents
//!   sys/delta_log/data/*.parquet         # one persisted file per log entry
//!   sys/delta_log/checkpoints/           # snapshot checkpoints + markers
//! ```
//!
//! Durability note: the in-memory append is authoritative. A sink failure is
//! logged and swallowed; the entry survives until the process exits and is
//! lost on restart. Callers that need stronger guarantees must treat the
//! warning log as an operational signal; see `DESIGN.md`.

pub mod delta_log;
pub mod entry;
pub mod record;

pub use delta_log::DeltaLog;
pub use entry::{
    DeltaType, FileInfo, IndexDef, IndexOperation, LogEntry, LogPayload, Snapshot, SystemTable,
    TableId,
};

use async_trait::async_trait;
use snafu::{Backtrace, prelude::*};

/// Errors raised by log reads and replay.
#[derive(Debug, Snafu)]
pub enum LogError {
    /// The table has no METADATA entry at or before the requested version.
    #[snafu(display("Table not found in metadata log: {table}"))]
    TableNotFound {
        /// The table that was requested.
        table: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A persisted log record could not be decoded.
    #[snafu(display("Corrupt log record: {msg}"))]
    Corrupt {
        /// A description of what failed to decode.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// Error type returned by a [`LogSink`].
///
/// Sink failures are logged and swallowed by the log (best-effort
/// durability), so the type is deliberately loose.
pub type SinkError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Destination for durable copies of appended log entries.
///
/// Injected into [`DeltaLog`] at construction so there is no window in which
/// appends can happen without a wired sink. Implementations must be safe to
/// call concurrently from different tables' append paths.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Persist one entry. Called while the owning table's append lock is
    /// held, after the in-memory append has already succeeded.
    async fn persist(&self, entry: &LogEntry) -> Result<(), SinkError>;
}
