//! Transactional columnar storage over Parquet files.
//!
//! `parquet-lake` is the storage layer of a single-node SQL engine. All
//! table data lives in immutable Parquet files; all table *state* lives in
//! an append-only, version-numbered metadata log. A reader resolves a
//! snapshot (the set of files live at a version) and reads it without
//! ever racing a writer, which is what makes snapshot isolation, time
//! travel, and crash recovery all fall out of the same mechanism.
//!
//! The crate is organized bottom-up:
//!
//! - [`storage`]: filesystem-backed object store primitives.
//! - [`schema`]: the engine's column types and their Arrow mapping.
//! - [`filter`]: predicates, scalar values, and update assignments.
//! - [`codec`]: Parquet encode/decode and Arrow mask kernels.
//! - [`log`]: the append-only metadata log and snapshot folding.
//! - [`checkpoint`]: snapshot checkpoints for fast recovery.
//! - [`recovery`]: persisted-log replay at startup.
//! - [`engine`]: the [`engine::ParquetEngine`] facade tying it together.
//!
//! # Example
//!
//! ```no_run
//! use parquet_lake::engine::{EngineOptions, ParquetEngine};
//! use parquet_lake::schema::{ColumnDef, ColumnType, TableSchema};
//! use parquet_lake::storage::StoreLocation;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = ParquetEngine::open(EngineOptions::new(StoreLocation::local("/data"))).await?;
//! engine.create_database("app").await?;
//! let schema = TableSchema::new(vec![
//!     ColumnDef::new("id", ColumnType::Int64, false),
//!     ColumnDef::new("name", ColumnType::Utf8, true),
//! ])?;
//! engine.create_table("app", "users", schema).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod checkpoint;
pub mod codec;
pub mod engine;
pub mod filter;
pub mod log;
pub mod recovery;
pub mod schema;
pub mod storage;
