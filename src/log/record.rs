//! Flat record layout for persisted log entries.
//!
//! Persisted log files are Parquet with a fixed 15-column layout; every
//! operation uses the same layout with operation-specific columns left null.
//! Map- and schema-valued fields are stored as JSON strings so the layout
//! stays flat. Delta-file flags are not persisted; they are re-derived from
//! the path convention (`deltas/<delta-type>-…`) during replay.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, SchemaRef};
use chrono::{DateTime, Utc};
use snafu::prelude::*;

use crate::filter::ScalarValue;
use crate::log::entry::{FileInfo, IndexDef, IndexOperation, LogEntry, LogPayload, TableId};
use crate::log::{CorruptSnafu, LogError};

/// Arrow schema of the persisted log-entry record.
pub fn record_schema() -> SchemaRef {
    Arc::new(ArrowSchema::new(vec![
        Field::new("version", DataType::Int64, false),
        Field::new("timestamp", DataType::Int64, false),
        Field::new("table_id", DataType::Utf8, false),
        Field::new("operation", DataType::Utf8, false),
        Field::new("file_path", DataType::Utf8, true),
        Field::new("file_size", DataType::Int64, true),
        Field::new("row_count", DataType::Int64, true),
        Field::new("min_values", DataType::Utf8, true),
        Field::new("max_values", DataType::Utf8, true),
        Field::new("null_counts", DataType::Utf8, true),
        Field::new("data_change", DataType::Boolean, true),
        Field::new("deletion_timestamp", DataType::Int64, true),
        Field::new("schema_json", DataType::Utf8, true),
        Field::new("index_json", DataType::Utf8, true),
        Field::new("index_operation", DataType::Utf8, true),
    ]))
}

fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<String, LogError> {
    serde_json::to_string(value).map_err(|e| {
        CorruptSnafu {
            msg: format!("failed to serialize {what}: {e}"),
        }
        .build()
    })
}

fn from_json<T: serde::de::DeserializeOwned>(what: &str, json: &str) -> Result<T, LogError> {
    serde_json::from_str(json).map_err(|e| {
        CorruptSnafu {
            msg: format!("failed to parse {what}: {e}"),
        }
        .build()
    })
}

/// Encode entries into one record batch in the persisted layout.
pub fn to_record_batch(entries: &[LogEntry]) -> Result<RecordBatch, LogError> {
    let mut version = Vec::with_capacity(entries.len());
    let mut timestamp = Vec::with_capacity(entries.len());
    let mut table_id = Vec::with_capacity(entries.len());
    let mut operation = Vec::with_capacity(entries.len());
    let mut file_path: Vec<Option<String>> = Vec::with_capacity(entries.len());
    let mut file_size: Vec<Option<i64>> = Vec::with_capacity(entries.len());
    let mut row_count: Vec<Option<i64>> = Vec::with_capacity(entries.len());
    let mut min_values: Vec<Option<String>> = Vec::with_capacity(entries.len());
    let mut max_values: Vec<Option<String>> = Vec::with_capacity(entries.len());
    let mut null_counts: Vec<Option<String>> = Vec::with_capacity(entries.len());
    let mut data_change: Vec<Option<bool>> = Vec::with_capacity(entries.len());
    let mut deletion_ts: Vec<Option<i64>> = Vec::with_capacity(entries.len());
    let mut schema_json: Vec<Option<String>> = Vec::with_capacity(entries.len());
    let mut index_json: Vec<Option<String>> = Vec::with_capacity(entries.len());
    let mut index_operation: Vec<Option<String>> = Vec::with_capacity(entries.len());

    for entry in entries {
        version.push(entry.version as i64);
        timestamp.push(entry.timestamp.timestamp_millis());
        table_id.push(entry.table_id.to_string());
        operation.push(entry.payload.operation().to_string());

        let mut row = RecordRow::default();
        match &entry.payload {
            LogPayload::Add {
                file,
                data_change: dc,
            } => {
                row.file_path = Some(file.path.clone());
                row.file_size = Some(file.size as i64);
                row.row_count = Some(file.row_count as i64);
                row.min_values = Some(to_json("min_values", &file.min_values)?);
                row.max_values = Some(to_json("max_values", &file.max_values)?);
                row.null_counts = Some(to_json("null_counts", &file.null_counts)?);
                row.data_change = Some(*dc);
            }
            LogPayload::Remove {
                file_path: path,
                deletion_timestamp,
            } => {
                row.file_path = Some(path.clone());
                row.deletion_ts = Some(deletion_timestamp.timestamp_millis());
            }
            LogPayload::Metadata {
                schema,
                index,
                index_op,
            } => {
                row.schema_json = Some(to_json("schema", schema)?);
                row.index_json = match index {
                    Some(def) => Some(to_json("index", def)?),
                    None => None,
                };
                row.index_operation = index_op.map(|op| op.as_str().to_string());
            }
        }

        file_path.push(row.file_path);
        file_size.push(row.file_size);
        row_count.push(row.row_count);
        min_values.push(row.min_values);
        max_values.push(row.max_values);
        null_counts.push(row.null_counts);
        data_change.push(row.data_change);
        deletion_ts.push(row.deletion_ts);
        schema_json.push(row.schema_json);
        index_json.push(row.index_json);
        index_operation.push(row.index_operation);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(version)),
        Arc::new(Int64Array::from(timestamp)),
        Arc::new(StringArray::from(table_id)),
        Arc::new(StringArray::from(operation)),
        Arc::new(StringArray::from(file_path)),
        Arc::new(Int64Array::from(file_size)),
        Arc::new(Int64Array::from(row_count)),
        Arc::new(StringArray::from(min_values)),
        Arc::new(StringArray::from(max_values)),
        Arc::new(StringArray::from(null_counts)),
        Arc::new(BooleanArray::from(data_change)),
        Arc::new(Int64Array::from(deletion_ts)),
        Arc::new(StringArray::from(schema_json)),
        Arc::new(StringArray::from(index_json)),
        Arc::new(StringArray::from(index_operation)),
    ];

    RecordBatch::try_new(record_schema(), columns).map_err(|e| {
        CorruptSnafu {
            msg: format!("failed to build log record batch: {e}"),
        }
        .build()
    })
}

#[derive(Default)]
struct RecordRow {
    file_path: Option<String>,
    file_size: Option<i64>,
    row_count: Option<i64>,
    min_values: Option<String>,
    max_values: Option<String>,
    null_counts: Option<String>,
    data_change: Option<bool>,
    deletion_ts: Option<i64>,
    schema_json: Option<String>,
    index_json: Option<String>,
    index_operation: Option<String>,
}

fn int64_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array, LogError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .context(CorruptSnafu {
            msg: format!("log record missing int64 column {name}"),
        })
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, LogError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .context(CorruptSnafu {
            msg: format!("log record missing string column {name}"),
        })
}

fn bool_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a BooleanArray, LogError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<BooleanArray>())
        .context(CorruptSnafu {
            msg: format!("log record missing bool column {name}"),
        })
}

fn millis_to_datetime(what: &str, millis: i64) -> Result<DateTime<Utc>, LogError> {
    DateTime::from_timestamp_millis(millis).context(CorruptSnafu {
        msg: format!("{what} out of range: {millis}"),
    })
}

fn opt_string(array: &StringArray, row: usize) -> Option<String> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row).to_string())
    }
}

/// Decode one persisted record batch back into log entries.
pub fn from_record_batch(batch: &RecordBatch) -> Result<Vec<LogEntry>, LogError> {
    let version = int64_column(batch, "version")?;
    let timestamp = int64_column(batch, "timestamp")?;
    let table_id = string_column(batch, "table_id")?;
    let operation = string_column(batch, "operation")?;
    let file_path = string_column(batch, "file_path")?;
    let file_size = int64_column(batch, "file_size")?;
    let row_count = int64_column(batch, "row_count")?;
    let min_values = string_column(batch, "min_values")?;
    let max_values = string_column(batch, "max_values")?;
    let null_counts = string_column(batch, "null_counts")?;
    let data_change = bool_column(batch, "data_change")?;
    let deletion_ts = int64_column(batch, "deletion_timestamp")?;
    let schema_json = string_column(batch, "schema_json")?;
    let index_json = string_column(batch, "index_json")?;
    let index_operation = string_column(batch, "index_operation")?;

    let mut entries = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let op = operation.value(row);
        let path_at = |what: &str| -> Result<String, LogError> {
            opt_string(file_path, row).context(CorruptSnafu {
                msg: format!("{what} entry without file_path at row {row}"),
            })
        };

        let payload = match op {
            "ADD" => {
                let mins: HashMap<String, ScalarValue> = match opt_string(min_values, row) {
                    Some(json) => from_json("min_values", &json)?,
                    None => HashMap::new(),
                };
                let maxs: HashMap<String, ScalarValue> = match opt_string(max_values, row) {
                    Some(json) => from_json("max_values", &json)?,
                    None => HashMap::new(),
                };
                let nulls: HashMap<String, u64> = match opt_string(null_counts, row) {
                    Some(json) => from_json("null_counts", &json)?,
                    None => HashMap::new(),
                };

                let mut file = FileInfo {
                    path: path_at("ADD")?,
                    size: if file_size.is_null(row) {
                        0
                    } else {
                        file_size.value(row) as u64
                    },
                    row_count: if row_count.is_null(row) {
                        0
                    } else {
                        row_count.value(row) as u64
                    },
                    min_values: mins,
                    max_values: maxs,
                    null_counts: nulls,
                    added_at: version.value(row) as u64,
                    is_delta: false,
                    delta_type: None,
                };
                file.infer_delta_flags();

                LogPayload::Add {
                    file,
                    data_change: !data_change.is_null(row) && data_change.value(row),
                }
            }
            "REMOVE" => {
                let millis = if deletion_ts.is_null(row) {
                    timestamp.value(row)
                } else {
                    deletion_ts.value(row)
                };
                LogPayload::Remove {
                    file_path: path_at("REMOVE")?,
                    deletion_timestamp: millis_to_datetime("deletion_timestamp", millis)?,
                }
            }
            "METADATA" => {
                let schema = opt_string(schema_json, row).context(CorruptSnafu {
                    msg: format!("METADATA entry without schema_json at row {row}"),
                })?;
                let index: Option<IndexDef> = match opt_string(index_json, row) {
                    Some(json) => Some(from_json("index", &json)?),
                    None => None,
                };
                let index_op = match opt_string(index_operation, row) {
                    Some(s) => Some(IndexOperation::parse(&s).context(CorruptSnafu {
                        msg: format!("unknown index operation {s:?} at row {row}"),
                    })?),
                    None => None,
                };
                LogPayload::Metadata {
                    schema: from_json("schema", &schema)?,
                    index,
                    index_op,
                }
            }
            other => {
                return CorruptSnafu {
                    msg: format!("unknown log operation {other:?} at row {row}"),
                }
                .fail();
            }
        };

        entries.push(LogEntry {
            version: version.value(row) as u64,
            timestamp: millis_to_datetime("timestamp", timestamp.value(row))?,
            table_id: TableId::from_str(table_id.value(row))?,
            payload,
        });
    }

    Ok(entries)
}
