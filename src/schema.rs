//! Table schema model.
//!
//! A [`TableSchema`] is the logical column list recorded in METADATA log
//! entries and cached by the engine. It is deliberately small: four scalar
//! column types cover the engine's storage model, and the schema serializes
//! to JSON for the log's `schema_json` record column. Schema evolution is
//! append-only: a new METADATA entry carries a complete replacement schema,
//! there is no column-level diff.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, SchemaRef};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

/// Errors produced while constructing or converting a schema.
#[derive(Debug, Snafu)]
pub enum SchemaError {
    /// Two columns share the same name.
    #[snafu(display("Duplicate column in schema: {column}"))]
    DuplicateColumn {
        /// The offending column name.
        column: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// An Arrow data type has no equivalent in the logical model.
    #[snafu(display("Unsupported Arrow data type for column {column}: {datatype}"))]
    UnsupportedArrowType {
        /// The column with the unsupported type.
        column: String,
        /// Debug rendering of the Arrow type.
        datatype: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// Logical type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit IEEE float.
    Float64,
    /// UTF-8 string.
    Utf8,
}

impl ColumnType {
    /// The Arrow data type backing this logical type.
    pub fn arrow_type(&self) -> DataType {
        match self {
            ColumnType::Bool => DataType::Boolean,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
        }
    }

    fn from_arrow(column: &str, dt: &DataType) -> Result<Self, SchemaError> {
        match dt {
            DataType::Boolean => Ok(ColumnType::Bool),
            DataType::Int64 => Ok(ColumnType::Int64),
            DataType::Float64 => Ok(ColumnType::Float64),
            DataType::Utf8 => Ok(ColumnType::Utf8),
            other => UnsupportedArrowTypeSnafu {
                column,
                datatype: format!("{other:?}"),
            }
            .fail(),
        }
    }
}

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name, unique within its table.
    pub name: String,
    /// Logical data type.
    pub column_type: ColumnType,
    /// Whether null values are allowed.
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnDef {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
        }
    }
}

/// An ordered list of column definitions with unique names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Build a schema, rejecting duplicate column names.
    pub fn new(columns: Vec<ColumnDef>) -> Result<Self, SchemaError> {
        let mut seen = std::collections::HashSet::new();
        for col in &columns {
            if !seen.insert(col.name.as_str()) {
                return DuplicateColumnSnafu {
                    column: col.name.clone(),
                }
                .fail();
            }
        }
        Ok(Self { columns })
    }

    /// The column definitions, in declaration order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Build the equivalent Arrow schema.
    pub fn to_arrow(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| Field::new(&c.name, c.column_type.arrow_type(), c.nullable))
            .collect();
        Arc::new(ArrowSchema::new(fields))
    }

    /// Derive a logical schema from an Arrow schema.
    pub fn from_arrow(schema: &ArrowSchema) -> Result<Self, SchemaError> {
        let columns = schema
            .fields()
            .iter()
            .map(|f| {
                Ok(ColumnDef {
                    name: f.name().clone(),
                    column_type: ColumnType::from_arrow(f.name(), f.data_type())?,
                    nullable: f.is_nullable(),
                })
            })
            .collect::<Result<Vec<_>, SchemaError>>()?;
        TableSchema::new(columns)
    }

    /// Check that an Arrow schema matches this schema exactly (names, order,
    /// and logical types; nullability of the batch may be stricter).
    pub fn matches_arrow(&self, other: &ArrowSchema) -> bool {
        if self.columns.len() != other.fields().len() {
            return false;
        }
        self.columns.iter().zip(other.fields()).all(|(col, field)| {
            col.name == *field.name()
                && col.column_type.arrow_type() == *field.data_type()
                && (col.nullable || !field.is_nullable())
        })
    }
}
