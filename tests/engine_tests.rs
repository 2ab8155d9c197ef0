//! End-to-end engine behavior: catalog DDL, writes, scans, and both
//! mutation strategies.

use std::sync::Arc;

use arrow::array::{Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use tempfile::TempDir;

use parquet_lake::engine::{EngineError, EngineOptions, ParquetEngine};
use parquet_lake::filter::{Assignment, Filter, Predicate, ScalarValue};
use parquet_lake::schema::{ColumnDef, ColumnType, TableSchema};
use parquet_lake::storage::StoreLocation;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn users_schema() -> TableSchema {
    TableSchema::new(vec![
        ColumnDef::new("id", ColumnType::Int64, false),
        ColumnDef::new("name", ColumnType::Utf8, true),
        ColumnDef::new("score", ColumnType::Float64, true),
    ])
    .expect("valid schema")
}

fn users_batch(rows: &[(i64, Option<&str>, Option<f64>)]) -> RecordBatch {
    let schema = Arc::new(ArrowSchema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("score", DataType::Float64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                rows.iter().map(|(id, _, _)| *id).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, name, _)| *name).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|(_, _, score)| *score).collect::<Vec<_>>(),
            )),
        ],
    )
    .expect("valid batch")
}

async fn engine_with_table(dir: &TempDir) -> ParquetEngine {
    let engine = ParquetEngine::open(EngineOptions::new(StoreLocation::local(dir.path())))
        .await
        .expect("open engine");
    engine.create_database("testdb").await.expect("create db");
    engine
        .create_table("testdb", "users", users_schema())
        .await
        .expect("create table");
    engine
}

/// Collect the id column across all scan batches, sorted.
async fn scan_ids(
    engine: &ParquetEngine,
    filters: &[Filter],
    version: Option<u64>,
) -> Result<Vec<i64>, EngineError> {
    let scan = engine
        .scan_version("testdb", "users", filters, version)
        .await?;
    let mut ids = Vec::new();
    for batch in scan.collect().await? {
        let col = batch
            .column_by_name("id")
            .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
            .expect("id column");
        ids.extend(col.iter().flatten());
    }
    ids.sort_unstable();
    Ok(ids)
}

async fn name_of(engine: &ParquetEngine, id: i64) -> Option<String> {
    let scan = engine
        .scan("testdb", "users", &[Filter::eq("id", ScalarValue::Int64(id))])
        .await
        .expect("scan");
    for batch in scan.collect().await.expect("collect") {
        let names = batch
            .column_by_name("name")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .expect("name column");
        if batch.num_rows() > 0 {
            return if names.is_null(0) {
                None
            } else {
                Some(names.value(0).to_string())
            };
        }
    }
    None
}

#[tokio::test]
async fn write_then_scan_roundtrip() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;

    engine
        .write(
            "testdb",
            "users",
            &users_batch(&[
                (1, Some("alice"), Some(9.5)),
                (2, Some("bob"), None),
                (3, None, Some(4.0)),
            ]),
        )
        .await?;

    assert_eq!(scan_ids(&engine, &[], None).await?, vec![1, 2, 3]);
    assert_eq!(name_of(&engine, 2).await, Some("bob".to_string()));
    Ok(())
}

#[tokio::test]
async fn filtered_scan_returns_matching_rows_only() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;

    engine
        .write(
            "testdb",
            "users",
            &users_batch(&[(1, Some("a"), None), (2, Some("b"), None)]),
        )
        .await?;
    engine
        .write(
            "testdb",
            "users",
            &users_batch(&[(10, Some("c"), None), (20, Some("d"), None)]),
        )
        .await?;

    // Equality filter prunes the first file (ids 1..2) via its zone map and
    // still finds the row in the second.
    assert_eq!(
        scan_ids(&engine, &[Filter::eq("id", ScalarValue::Int64(20))], None).await?,
        vec![20]
    );

    // Range filter spans both files.
    let gt = Filter {
        column: "id".into(),
        predicate: Predicate::Gt(ScalarValue::Int64(1)),
    };
    assert_eq!(scan_ids(&engine, &[gt], None).await?, vec![2, 10, 20]);
    Ok(())
}

#[tokio::test]
async fn scan_of_empty_table_is_empty() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;
    assert!(scan_ids(&engine, &[], None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn copy_on_write_update_rewrites_matching_file() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;

    engine
        .write(
            "testdb",
            "users",
            &users_batch(&[
                (1, Some("alice"), None),
                (2, Some("bob"), None),
                (3, Some("carol"), None),
            ]),
        )
        .await?;
    let before = engine.latest_version("testdb", "users").await;

    let affected = engine
        .update(
            "testdb",
            "users",
            &[Filter::eq("id", ScalarValue::Int64(2))],
            &[Assignment::new("name", ScalarValue::Utf8("bobby".into()))],
        )
        .await?;
    assert_eq!(affected, 1);

    // The rewrite appended an ADD and a REMOVE.
    assert_eq!(engine.latest_version("testdb", "users").await, before + 2);

    assert_eq!(name_of(&engine, 2).await, Some("bobby".to_string()));
    assert_eq!(name_of(&engine, 1).await, Some("alice".to_string()));
    assert_eq!(scan_ids(&engine, &[], None).await?, vec![1, 2, 3]);

    // Time travel still sees the pre-update value.
    let old = engine
        .scan_version(
            "testdb",
            "users",
            &[Filter::eq("id", ScalarValue::Int64(2))],
            Some(before),
        )
        .await?
        .collect()
        .await?;
    let names = old[0]
        .column_by_name("name")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .expect("name column");
    assert_eq!(names.value(0), "bob");
    Ok(())
}

#[tokio::test]
async fn update_matching_nothing_touches_nothing() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;
    engine
        .write("testdb", "users", &users_batch(&[(1, Some("a"), None)]))
        .await?;
    let before = engine.latest_version("testdb", "users").await;

    let affected = engine
        .update(
            "testdb",
            "users",
            &[Filter::eq("id", ScalarValue::Int64(99))],
            &[Assignment::new("name", ScalarValue::Utf8("x".into()))],
        )
        .await?;
    assert_eq!(affected, 0);
    assert_eq!(engine.latest_version("testdb", "users").await, before);
    Ok(())
}

#[tokio::test]
async fn copy_on_write_delete_removes_rows() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;
    engine
        .write(
            "testdb",
            "users",
            &users_batch(&[(1, Some("a"), None), (2, Some("b"), None), (3, Some("c"), None)]),
        )
        .await?;

    let removed = engine
        .delete(
            "testdb",
            "users",
            &[Filter {
                column: "id".into(),
                predicate: Predicate::LtEq(ScalarValue::Int64(2)),
            }],
        )
        .await?;
    assert_eq!(removed, 2);
    assert_eq!(scan_ids(&engine, &[], None).await?, vec![3]);
    Ok(())
}

#[tokio::test]
async fn delete_of_every_row_leaves_no_data_file() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;
    engine
        .write("testdb", "users", &users_batch(&[(1, Some("a"), None)]))
        .await?;

    let removed = engine.delete("testdb", "users", &[]).await?;
    assert_eq!(removed, 1);

    assert!(scan_ids(&engine, &[], None).await?.is_empty());
    let stats = engine.get_table_stats("testdb", "users").await?;
    assert_eq!(stats.file_count, 0);
    assert_eq!(stats.row_count, 0);
    Ok(())
}

#[tokio::test]
async fn merge_on_read_update_is_visible_without_rewrite() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;
    engine
        .write(
            "testdb",
            "users",
            &users_batch(&[(1, Some("alice"), None), (2, Some("bob"), None)]),
        )
        .await?;

    engine
        .update_merge_on_read(
            "testdb",
            "users",
            &[Filter::eq("id", ScalarValue::Int64(1))],
            &[Assignment::new("name", ScalarValue::Utf8("ally".into()))],
        )
        .await?;

    assert_eq!(name_of(&engine, 1).await, Some("ally".to_string()));
    assert_eq!(name_of(&engine, 2).await, Some("bob".to_string()));

    // One base file plus one delta intent.
    let stats = engine.get_table_stats("testdb", "users").await?;
    assert_eq!(stats.file_count, 2);
    Ok(())
}

#[tokio::test]
async fn merge_on_read_delete_hides_rows_at_scan_time() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;
    engine
        .write(
            "testdb",
            "users",
            &users_batch(&[(1, Some("a"), None), (2, Some("b"), None), (3, Some("c"), None)]),
        )
        .await?;

    engine
        .delete_merge_on_read(
            "testdb",
            "users",
            &[Filter::eq("id", ScalarValue::Int64(2))],
        )
        .await?;

    assert_eq!(scan_ids(&engine, &[], None).await?, vec![1, 3]);
    Ok(())
}

#[tokio::test]
async fn intents_only_apply_to_older_files() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;
    engine
        .write("testdb", "users", &users_batch(&[(1, Some("old"), None)]))
        .await?;

    engine
        .update_merge_on_read(
            "testdb",
            "users",
            &[],
            &[Assignment::new("name", ScalarValue::Utf8("patched".into()))],
        )
        .await?;

    // Written after the intent: must not be patched.
    engine
        .write("testdb", "users", &users_batch(&[(2, Some("new"), None)]))
        .await?;

    assert_eq!(name_of(&engine, 1).await, Some("patched".to_string()));
    assert_eq!(name_of(&engine, 2).await, Some("new".to_string()));
    Ok(())
}

#[tokio::test]
async fn copy_on_write_materializes_live_intents() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;
    engine
        .write(
            "testdb",
            "users",
            &users_batch(&[(1, Some("a"), None), (2, Some("b"), None)]),
        )
        .await?;
    engine
        .delete_merge_on_read(
            "testdb",
            "users",
            &[Filter::eq("id", ScalarValue::Int64(1))],
        )
        .await?;

    // A copy-on-write pass matching nothing still folds the intent in.
    let affected = engine
        .update(
            "testdb",
            "users",
            &[Filter::eq("id", ScalarValue::Int64(999))],
            &[Assignment::new("name", ScalarValue::Utf8("x".into()))],
        )
        .await?;
    assert_eq!(affected, 0);

    let stats = engine.get_table_stats("testdb", "users").await?;
    assert_eq!(stats.file_count, 1);
    assert_eq!(stats.row_count, 1);
    assert_eq!(scan_ids(&engine, &[], None).await?, vec![2]);
    Ok(())
}

#[tokio::test]
async fn schema_mismatch_is_rejected() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;

    let wrong = RecordBatch::try_new(
        Arc::new(ArrowSchema::new(vec![Field::new(
            "id",
            DataType::Int64,
            false,
        )])),
        vec![Arc::new(Int64Array::from(vec![1]))],
    )?;

    let err = engine
        .write("testdb", "users", &wrong)
        .await
        .expect_err("expected mismatch");
    assert!(matches!(err, EngineError::SchemaMismatch { .. }));
    Ok(())
}

#[tokio::test]
async fn catalog_errors() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;

    let err = engine
        .create_database("sys")
        .await
        .expect_err("reserved name");
    assert!(matches!(err, EngineError::ReservedDatabase { .. }));

    let err = engine
        .create_table("nodb", "t", users_schema())
        .await
        .expect_err("missing database");
    assert!(matches!(err, EngineError::DatabaseNotFound { .. }));

    let err = engine
        .scan("testdb", "ghost", &[])
        .await
        .expect_err("missing table");
    assert!(matches!(err, EngineError::TableNotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn recreating_a_table_replaces_its_schema() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;

    let narrower =
        TableSchema::new(vec![ColumnDef::new("id", ColumnType::Int64, false)]).expect("valid");
    engine
        .create_table("testdb", "users", narrower.clone())
        .await?;

    // The later METADATA entry wins.
    assert_eq!(engine.get_schema("testdb", "users")?, narrower);
    assert_eq!(engine.latest_version("testdb", "users").await, 2);
    Ok(())
}

#[tokio::test]
async fn catalog_listings() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;
    engine.create_database("analytics").await?;
    engine
        .create_table("testdb", "orders", users_schema())
        .await?;

    assert_eq!(
        engine.list_databases().await?,
        vec!["analytics".to_string(), "testdb".to_string()]
    );
    assert_eq!(
        engine.list_tables("testdb"),
        vec!["orders".to_string(), "users".to_string()]
    );
    assert!(engine.list_tables("analytics").is_empty());
    assert!(engine.table_exists("testdb", "users"));
    assert!(!engine.table_exists("analytics", "users"));
    assert_eq!(engine.get_schema("testdb", "users")?, users_schema());
    Ok(())
}

#[tokio::test]
async fn drop_table_hides_it_from_scans() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;
    engine
        .write("testdb", "users", &users_batch(&[(1, Some("a"), None)]))
        .await?;

    engine.drop_table("testdb", "users").await?;
    assert!(engine.list_tables("testdb").is_empty());

    let err = engine
        .get_schema("testdb", "users")
        .expect_err("dropped table");
    assert!(matches!(err, EngineError::TableNotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn table_stats_reflect_live_files() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;
    engine
        .write(
            "testdb",
            "users",
            &users_batch(&[(1, Some("a"), None), (2, Some("b"), None)]),
        )
        .await?;
    engine
        .write("testdb", "users", &users_batch(&[(3, Some("c"), None)]))
        .await?;

    let stats = engine.get_table_stats("testdb", "users").await?;
    assert_eq!(stats.row_count, 3);
    assert_eq!(stats.file_count, 2);
    assert!(stats.size_gb > 0.0);
    assert!(stats.last_modified.is_some());
    Ok(())
}

#[tokio::test]
async fn transactions_hand_out_unique_ids() -> TestResult {
    let dir = TempDir::new()?;
    let engine = engine_with_table(&dir).await;

    let t1 = engine.begin_transaction();
    let t2 = engine.begin_transaction();
    assert_ne!(t1.id(), t2.id());
    t1.commit();
    t2.rollback();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scans_never_observe_a_half_committed_rewrite() -> TestResult {
    let dir = TempDir::new()?;
    let engine = Arc::new(engine_with_table(&dir).await);
    engine
        .write(
            "testdb",
            "users",
            &users_batch(&[
                (1, Some("alice"), None),
                (2, Some("bob"), None),
                (3, Some("carol"), None),
            ]),
        )
        .await?;

    // One task keeps rewriting the same row while another keeps scanning.
    // An update never changes the row count, so any other observation means
    // a scan folded a rewritten file next to its superseded original.
    let writer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for round in 0..16 {
                engine
                    .update(
                        "testdb",
                        "users",
                        &[Filter::eq("id", ScalarValue::Int64(2))],
                        &[Assignment::new(
                            "name",
                            ScalarValue::Utf8(format!("round-{round}")),
                        )],
                    )
                    .await?;
            }
            Ok::<_, EngineError>(())
        })
    };
    let reader = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for _ in 0..16 {
                let rows = engine
                    .scan("testdb", "users", &[])
                    .await?
                    .count_rows()
                    .await?;
                assert_eq!(rows, 3, "scan observed a half-committed rewrite");
            }
            Ok::<_, EngineError>(())
        })
    };
    writer.await??;
    reader.await??;

    assert_eq!(scan_ids(&engine, &[], None).await?, vec![1, 2, 3]);
    assert_eq!(name_of(&engine, 2).await, Some("round-15".to_string()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rewrites_of_one_table_serialize() -> TestResult {
    let dir = TempDir::new()?;
    let engine = Arc::new(engine_with_table(&dir).await);
    engine
        .write(
            "testdb",
            "users",
            &users_batch(&[
                (1, Some("alice"), None),
                (2, Some("bob"), None),
                (3, Some("carol"), None),
            ]),
        )
        .await?;

    // Both updates hit the single base file. Run unserialized, each would
    // rewrite it from the same snapshot and the live set would end up with
    // two copies of every row.
    let left = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .update(
                    "testdb",
                    "users",
                    &[Filter::eq("id", ScalarValue::Int64(1))],
                    &[Assignment::new("name", ScalarValue::Utf8("left".into()))],
                )
                .await
        })
    };
    let right = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .update(
                    "testdb",
                    "users",
                    &[Filter::eq("id", ScalarValue::Int64(3))],
                    &[Assignment::new("name", ScalarValue::Utf8("right".into()))],
                )
                .await
        })
    };
    assert_eq!(left.await??, 1);
    assert_eq!(right.await??, 1);

    // Both effects survive, no row is duplicated or lost.
    assert_eq!(scan_ids(&engine, &[], None).await?, vec![1, 2, 3]);
    assert_eq!(name_of(&engine, 1).await, Some("left".to_string()));
    assert_eq!(name_of(&engine, 3).await, Some("right".to_string()));

    let stats = engine.get_table_stats("testdb", "users").await?;
    assert_eq!(stats.row_count, 3);
    assert_eq!(stats.file_count, 1);
    Ok(())
}
