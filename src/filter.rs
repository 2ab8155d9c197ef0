//! Row predicates, scalar values, and update assignments.
//!
//! The executor hands the engine a list of [`Filter`]s (implicitly ANDed)
//! and, for updates, a list of [`Assignment`]s. These are plain data: the
//! codec layer turns them into Arrow boolean masks, and the scan path uses
//! the zone-map rule in [`Filter::prunes_file`] to skip files whose recorded
//! min/max statistics cannot contain a matching row.
//!
//! Filters and assignments also serialize to JSON: merge-on-read delta files
//! store the mutation *intent* (predicate plus assignments) rather than
//! rewritten data, and replay it at scan time.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A typed scalar constant used in predicates, assignments, and file
/// statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    /// Boolean constant.
    Bool(bool),
    /// 64-bit integer constant.
    Int64(i64),
    /// 64-bit float constant.
    Float64(f64),
    /// UTF-8 string constant.
    Utf8(String),
    /// SQL NULL.
    Null,
}

impl ScalarValue {
    /// Compare two scalars, coercing Int64 and Float64 against each other.
    ///
    /// Returns `None` for nulls, booleans compared with non-booleans, or any
    /// other cross-type pair; callers treat incomparable pairs
    /// conservatively (a file is never pruned on an incomparable stat).
    pub fn partial_cmp_coerced(&self, other: &ScalarValue) -> Option<Ordering> {
        use ScalarValue::*;
        match (self, other) {
            (Int64(a), Int64(b)) => Some(a.cmp(b)),
            (Float64(a), Float64(b)) => a.partial_cmp(b),
            (Int64(a), Float64(b)) => (*a as f64).partial_cmp(b),
            (Float64(a), Int64(b)) => a.partial_cmp(&(*b as f64)),
            (Utf8(a), Utf8(b)) => Some(a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Comparison applied to a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Column equals the value.
    Eq(ScalarValue),
    /// Column differs from the value.
    NotEq(ScalarValue),
    /// Column is strictly greater than the value.
    Gt(ScalarValue),
    /// Column is greater than or equal to the value.
    GtEq(ScalarValue),
    /// Column is strictly less than the value.
    Lt(ScalarValue),
    /// Column is less than or equal to the value.
    LtEq(ScalarValue),
    /// Column matches a SQL LIKE pattern (`%` and `_` wildcards).
    Like(String),
    /// Column equals one of the listed values.
    In(Vec<ScalarValue>),
    /// Column lies in the closed range `[low, high]`.
    Between(ScalarValue, ScalarValue),
}

/// A single-column predicate; a filter list is an implicit AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// The column the predicate applies to.
    pub column: String,
    /// The comparison to evaluate.
    pub predicate: Predicate,
}

impl Filter {
    /// Equality filter shorthand.
    pub fn eq(column: impl Into<String>, value: ScalarValue) -> Self {
        Self {
            column: column.into(),
            predicate: Predicate::Eq(value),
        }
    }

    /// Decide whether a file can be skipped given its recorded per-column
    /// `[min, max]` statistics.
    ///
    /// Only equality predicates prune: the file is skipped when its range for
    /// the filtered column provably excludes the value. Any missing stat,
    /// incomparable type, or non-equality operator keeps the file: pruning
    /// must never be the reason a matching row goes unread.
    pub fn prunes_file(
        &self,
        min_values: &HashMap<String, ScalarValue>,
        max_values: &HashMap<String, ScalarValue>,
    ) -> bool {
        let Predicate::Eq(value) = &self.predicate else {
            return false;
        };
        let (Some(min), Some(max)) = (min_values.get(&self.column), max_values.get(&self.column))
        else {
            return false;
        };

        let below = matches!(value.partial_cmp_coerced(min), Some(Ordering::Less));
        let above = matches!(value.partial_cmp_coerced(max), Some(Ordering::Greater));
        below || above
    }
}

/// A column assignment applied by UPDATE operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// The column to overwrite on matching rows.
    pub column: String,
    /// The new value.
    pub value: ScalarValue,
}

impl Assignment {
    /// Convenience constructor.
    pub fn new(column: impl Into<String>, value: ScalarValue) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(
        pairs: &[(&str, ScalarValue, ScalarValue)],
    ) -> (HashMap<String, ScalarValue>, HashMap<String, ScalarValue>) {
        let mut min = HashMap::new();
        let mut max = HashMap::new();
        for (col, lo, hi) in pairs {
            min.insert(col.to_string(), lo.clone());
            max.insert(col.to_string(), hi.clone());
        }
        (min, max)
    }

    #[test]
    fn eq_filter_prunes_out_of_range_value() {
        let (min, max) = stats(&[("id", ScalarValue::Int64(10), ScalarValue::Int64(20))]);

        assert!(Filter::eq("id", ScalarValue::Int64(5)).prunes_file(&min, &max));
        assert!(Filter::eq("id", ScalarValue::Int64(25)).prunes_file(&min, &max));
        assert!(!Filter::eq("id", ScalarValue::Int64(10)).prunes_file(&min, &max));
        assert!(!Filter::eq("id", ScalarValue::Int64(15)).prunes_file(&min, &max));
        assert!(!Filter::eq("id", ScalarValue::Int64(20)).prunes_file(&min, &max));
    }

    #[test]
    fn filter_without_stats_never_prunes() {
        let (min, max) = stats(&[("id", ScalarValue::Int64(10), ScalarValue::Int64(20))]);
        // "name" has no recorded stats: conservatively kept.
        assert!(!Filter::eq("name", ScalarValue::Utf8("x".into())).prunes_file(&min, &max));
    }

    #[test]
    fn non_equality_predicates_never_prune() {
        let (min, max) = stats(&[("id", ScalarValue::Int64(10), ScalarValue::Int64(20))]);
        let f = Filter {
            column: "id".into(),
            predicate: Predicate::Gt(ScalarValue::Int64(100)),
        };
        assert!(!f.prunes_file(&min, &max));
    }

    #[test]
    fn incomparable_types_never_prune() {
        let (min, max) = stats(&[("id", ScalarValue::Int64(10), ScalarValue::Int64(20))]);
        assert!(!Filter::eq("id", ScalarValue::Utf8("9".into())).prunes_file(&min, &max));
    }

    #[test]
    fn numeric_coercion_prunes_across_int_and_float() {
        let (min, max) = stats(&[("score", ScalarValue::Float64(1.5), ScalarValue::Float64(2.5))]);
        assert!(Filter::eq("score", ScalarValue::Int64(3)).prunes_file(&min, &max));
        assert!(!Filter::eq("score", ScalarValue::Int64(2)).prunes_file(&min, &max));
    }

    #[test]
    fn string_range_pruning() {
        let (min, max) = stats(&[(
            "name",
            ScalarValue::Utf8("alice".into()),
            ScalarValue::Utf8("carol".into()),
        )]);
        assert!(Filter::eq("name", ScalarValue::Utf8("zed".into())).prunes_file(&min, &max));
        assert!(!Filter::eq("name", ScalarValue::Utf8("bob".into())).prunes_file(&min, &max));
    }

    #[test]
    fn filter_json_roundtrip() {
        let f = Filter {
            column: "id".into(),
            predicate: Predicate::Between(ScalarValue::Int64(1), ScalarValue::Int64(9)),
        };
        let json = serde_json::to_string(&f).expect("serialize");
        let back: Filter = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(f, back);
    }
}
