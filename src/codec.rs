//! Columnar codec boundary.
//!
//! Everything that touches Arrow arrays or Parquet bytes lives here:
//!
//! - [`encode_batch`] serializes a `RecordBatch` to Parquet and computes the
//!   per-file statistics (row count, byte size, per-column min/max and null
//!   counts) that the metadata log records for zone-map pruning.
//! - [`decode_batch`] reads a whole Parquet file back into a single
//!   `RecordBatch`, optionally pushing row-level filters into the decode.
//! - [`filter_mask`] evaluates a filter list into a boolean mask, and
//!   [`apply_assignments`] rewrites matched rows, the building blocks of the
//!   copy-on-write and merge-on-read mutation paths.
//!
//! Comparisons use Arrow's `Datum`-based kernels with 1-element `Scalar`
//! operands, so a bound value is broadcast across a batch without allocating
//! full-length constant arrays. Null comparison results are treated as
//! "drop row" by `filter_record_batch`.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, Scalar, StringArray,
};
use arrow::compute::kernels::{boolean as boolean_kernels, cmp as cmp_kernels};
use arrow::compute::{concat_batches, filter_record_batch, kernels::zip::zip};
use arrow::datatypes::DataType;
use arrow::error::ArrowError;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use snafu::{Backtrace, prelude::*};

use crate::filter::{Assignment, Filter, Predicate, ScalarValue};

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding or decoding columnar data.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// A Parquet read or write failed.
    #[snafu(display("Parquet codec error: {source}"))]
    Parquet {
        /// Underlying Parquet error.
        source: parquet::errors::ParquetError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// An Arrow kernel or batch construction failed.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A filter or assignment referenced a column the batch does not have.
    #[snafu(display("Column not found in batch: {column}"))]
    ColumnMissing {
        /// The missing column name.
        column: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A filter or assignment value cannot be coerced to the column's type.
    #[snafu(display("Value for column {column} is not coercible to {expected}"))]
    TypeMismatch {
        /// The column with the incompatible value.
        column: String,
        /// The column's Arrow type.
        expected: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// Statistics describing one encoded file, recorded in its ADD log entry.
#[derive(Debug, Clone, Default)]
pub struct FileStats {
    /// Number of rows in the file.
    pub row_count: u64,
    /// Encoded size in bytes.
    pub byte_size: u64,
    /// Per-column minimum values (absent for columns without stats).
    pub min_values: HashMap<String, ScalarValue>,
    /// Per-column maximum values.
    pub max_values: HashMap<String, ScalarValue>,
    /// Per-column null counts.
    pub null_counts: HashMap<String, u64>,
}

fn column_min_max(column: &ArrayRef) -> (Option<ScalarValue>, Option<ScalarValue>) {
    match column.data_type() {
        DataType::Int64 => {
            let arr = column.as_any().downcast_ref::<Int64Array>();
            match arr {
                Some(a) => (
                    arrow::compute::min(a).map(ScalarValue::Int64),
                    arrow::compute::max(a).map(ScalarValue::Int64),
                ),
                None => (None, None),
            }
        }
        DataType::Float64 => {
            let arr = column.as_any().downcast_ref::<Float64Array>();
            match arr {
                Some(a) => (
                    arrow::compute::min(a).map(ScalarValue::Float64),
                    arrow::compute::max(a).map(ScalarValue::Float64),
                ),
                None => (None, None),
            }
        }
        DataType::Utf8 => {
            let arr = column.as_any().downcast_ref::<StringArray>();
            match arr {
                Some(a) => (
                    arrow::compute::min_string(a).map(|s| ScalarValue::Utf8(s.to_string())),
                    arrow::compute::max_string(a).map(|s| ScalarValue::Utf8(s.to_string())),
                ),
                None => (None, None),
            }
        }
        // Boolean min/max carries no pruning value; only null counts are kept.
        _ => (None, None),
    }
}

/// Compute the zone-map statistics for a batch.
pub fn batch_stats(batch: &RecordBatch, byte_size: u64) -> FileStats {
    let mut stats = FileStats {
        row_count: batch.num_rows() as u64,
        byte_size,
        ..FileStats::default()
    };

    for (field, column) in batch.schema().fields().iter().zip(batch.columns()) {
        let name = field.name();
        stats
            .null_counts
            .insert(name.clone(), column.null_count() as u64);
        let (min, max) = column_min_max(column);
        if let (Some(min), Some(max)) = (min, max) {
            stats.min_values.insert(name.clone(), min);
            stats.max_values.insert(name.clone(), max);
        }
    }
    stats
}

/// Encode a batch to Parquet bytes, returning the bytes and their stats.
pub fn encode_batch(batch: &RecordBatch) -> CodecResult<(Bytes, FileStats)> {
    let mut buf: Vec<u8> = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, batch.schema(), None).context(ParquetSnafu)?;
    writer.write(batch).context(ParquetSnafu)?;
    writer.close().context(ParquetSnafu)?;

    let stats = batch_stats(batch, buf.len() as u64);
    Ok((Bytes::from(buf), stats))
}

/// Decode a whole Parquet file into one `RecordBatch`, applying row-level
/// `filters` during the read.
///
/// The result may have zero rows; the schema is always preserved.
pub fn decode_batch(data: Bytes, filters: &[Filter]) -> CodecResult<RecordBatch> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data).context(ParquetSnafu)?;
    let schema = builder.schema().clone();
    let reader = builder.build().context(ParquetSnafu)?;

    let mut batches = Vec::new();
    for batch_res in reader {
        batches.push(batch_res.context(ArrowSnafu)?);
    }

    let combined = concat_batches(&schema, &batches).context(ArrowSnafu)?;
    if filters.is_empty() {
        return Ok(combined);
    }

    let mask = filter_mask(&combined, filters)?;
    filter_record_batch(&combined, &mask).context(ArrowSnafu)
}

/// Build a 1-element array of the column's type holding `value`.
///
/// Int64 values coerce to Float64 columns; everything else must match the
/// column type exactly. `ScalarValue::Null` becomes a typed null, which makes
/// every comparison against it null (row dropped), standard SQL semantics.
fn scalar_array(column: &str, dt: &DataType, value: &ScalarValue) -> CodecResult<ArrayRef> {
    let arr: ArrayRef = match (dt, value) {
        (DataType::Int64, ScalarValue::Int64(v)) => Arc::new(Int64Array::from(vec![*v])),
        (DataType::Int64, ScalarValue::Null) => Arc::new(Int64Array::from(vec![None::<i64>])),
        (DataType::Float64, ScalarValue::Float64(v)) => Arc::new(Float64Array::from(vec![*v])),
        (DataType::Float64, ScalarValue::Int64(v)) => {
            Arc::new(Float64Array::from(vec![*v as f64]))
        }
        (DataType::Float64, ScalarValue::Null) => Arc::new(Float64Array::from(vec![None::<f64>])),
        (DataType::Utf8, ScalarValue::Utf8(v)) => Arc::new(StringArray::from(vec![v.as_str()])),
        (DataType::Utf8, ScalarValue::Null) => Arc::new(StringArray::from(vec![None::<&str>])),
        (DataType::Boolean, ScalarValue::Bool(v)) => Arc::new(BooleanArray::from(vec![*v])),
        (DataType::Boolean, ScalarValue::Null) => {
            Arc::new(BooleanArray::from(vec![None::<bool>]))
        }
        _ => {
            return TypeMismatchSnafu {
                column,
                expected: format!("{dt:?}"),
            }
            .fail();
        }
    };
    Ok(arr)
}

fn compare(
    column: &str,
    col: &ArrayRef,
    value: &ScalarValue,
    op: fn(&dyn arrow::array::Datum, &dyn arrow::array::Datum) -> Result<BooleanArray, ArrowError>,
) -> CodecResult<BooleanArray> {
    let bound = scalar_array(column, col.data_type(), value)?;
    op(col, &Scalar::new(bound)).context(ArrowSnafu)
}

/// Match `text` against a SQL LIKE pattern (`%` = any run, `_` = any char).
///
/// Classic two-pointer wildcard matching: on a mismatch after a `%`, restart
/// from one position past the last `%` anchor.
fn like_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_t = 0usize;

    while t < txt.len() {
        if p < pat.len() && (pat[p] == '_' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '%' {
            star = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '%' {
        p += 1;
    }
    p == pat.len()
}

fn like_mask(column: &str, col: &ArrayRef, pattern: &str) -> CodecResult<BooleanArray> {
    let arr = col
        .as_any()
        .downcast_ref::<StringArray>()
        .context(TypeMismatchSnafu {
            column,
            expected: "Utf8".to_string(),
        })?;

    Ok(arr
        .iter()
        .map(|opt| opt.map(|s| like_match(pattern, s)))
        .collect())
}

fn single_filter_mask(batch: &RecordBatch, filter: &Filter) -> CodecResult<BooleanArray> {
    let col = batch
        .column_by_name(&filter.column)
        .context(ColumnMissingSnafu {
            column: filter.column.clone(),
        })?;

    match &filter.predicate {
        Predicate::Eq(v) => compare(&filter.column, col, v, cmp_kernels::eq),
        Predicate::NotEq(v) => compare(&filter.column, col, v, cmp_kernels::neq),
        Predicate::Gt(v) => compare(&filter.column, col, v, cmp_kernels::gt),
        Predicate::GtEq(v) => compare(&filter.column, col, v, cmp_kernels::gt_eq),
        Predicate::Lt(v) => compare(&filter.column, col, v, cmp_kernels::lt),
        Predicate::LtEq(v) => compare(&filter.column, col, v, cmp_kernels::lt_eq),
        Predicate::Like(pattern) => like_mask(&filter.column, col, pattern),
        Predicate::In(values) => {
            // OR of equality masks; an empty list matches nothing.
            let mut acc = BooleanArray::from(vec![false; batch.num_rows()]);
            for v in values {
                let m = compare(&filter.column, col, v, cmp_kernels::eq)?;
                acc = boolean_kernels::or(&acc, &m).context(ArrowSnafu)?;
            }
            Ok(acc)
        }
        Predicate::Between(lo, hi) => {
            let ge = compare(&filter.column, col, lo, cmp_kernels::gt_eq)?;
            let le = compare(&filter.column, col, hi, cmp_kernels::lt_eq)?;
            boolean_kernels::and(&ge, &le).context(ArrowSnafu)
        }
    }
}

/// Evaluate a filter list (implicit AND) into a boolean mask over `batch`.
///
/// An empty filter list selects every row. Null comparison results stay null
/// in the mask; `filter_record_batch` then excludes those rows.
pub fn filter_mask(batch: &RecordBatch, filters: &[Filter]) -> CodecResult<BooleanArray> {
    let mut mask = BooleanArray::from(vec![true; batch.num_rows()]);
    for filter in filters {
        let m = single_filter_mask(batch, filter)?;
        mask = boolean_kernels::and(&mask, &m).context(ArrowSnafu)?;
    }
    Ok(mask)
}

/// Rewrite `batch` so rows selected by `mask` take the assigned values and
/// all other rows pass through unchanged.
///
/// Uses the Arrow `zip` kernel with a broadcast scalar per assignment; the
/// batch itself is never mutated.
pub fn apply_assignments(
    batch: &RecordBatch,
    mask: &BooleanArray,
    assignments: &[Assignment],
) -> CodecResult<RecordBatch> {
    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();

    for assignment in assignments {
        let idx = batch
            .schema()
            .index_of(&assignment.column)
            .map_err(|_| CodecError::ColumnMissing {
                column: assignment.column.clone(),
                backtrace: Backtrace::capture(),
            })?;

        let replacement = scalar_array(
            &assignment.column,
            columns[idx].data_type(),
            &assignment.value,
        )?;
        columns[idx] =
            zip(mask, &Scalar::new(replacement), &columns[idx]).context(ArrowSnafu)?;
    }

    RecordBatch::try_new(batch.schema(), columns).context(ArrowSnafu)
}

/// Keep only the rows of `batch` matching every filter.
pub fn apply_filters(batch: &RecordBatch, filters: &[Filter]) -> CodecResult<RecordBatch> {
    if filters.is_empty() {
        return Ok(batch.clone());
    }
    let mask = filter_mask(batch, filters)?;
    filter_record_batch(batch, &mask).context(ArrowSnafu)
}

/// Drop the rows selected by `mask` from `batch` (keep the complement).
///
/// Rows whose mask value is null are *kept*: a null predicate result means
/// the row did not match the deletion filter.
pub fn drop_matching_rows(batch: &RecordBatch, mask: &BooleanArray) -> CodecResult<RecordBatch> {
    // Keep rows where the match mask is false or null.
    let keep: BooleanArray = mask
        .iter()
        .map(|opt| Some(!opt.unwrap_or(false)))
        .collect();
    filter_record_batch(batch, &keep).context(ArrowSnafu)
}
