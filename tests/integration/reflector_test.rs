//! Schema reflector integration tests.
//!
//! Tests the shadow-table rebuild, invalidation, single-flight refresh and
//! recovery from failed rebuilds.

use pretty_assertions::assert_eq;
use sqlite_session::db::{ExecuteOptions, ExecuteRequest, FailingSession, Row, Session, Value};
use sqlite_session::error::SessionError;
use sqlite_session::meta::{ConstraintType, DataTypeMean, MetaTable, SchemaReflector};
use std::sync::Arc;
use tokio_test::assert_ok;

use super::{memory_session, run_all};

const AIRPORT_SCHEMA: [&str; 2] = [
    "CREATE TABLE REGIONS (ID INTEGER PRIMARY KEY, NAME VARCHAR(40) NOT NULL)",
    "CREATE TABLE AIRPORTS (CODE CHAR(3) PRIMARY KEY, REGION INTEGER REFERENCES REGIONS(ID), \
     OPENED DATETIME, ELEVATION DOUBLE)",
];

#[tokio::test]
async fn test_query_columns_for_new_table() {
    let session = memory_session().await;
    run_all(&session, &["CREATE TABLE T (A INTEGER PRIMARY KEY, B TEXT)"]).await;
    let reflector = SchemaReflector::new(session);

    let columns = reflector.query_columns(None).await.unwrap();
    assert_eq!(columns.len(), 2);

    assert_eq!(columns[0].column_name, "A");
    assert!(columns[0].pk);
    assert_eq!(columns[0].column_number, 1);
    assert_eq!(columns[0].data_type_mean, DataTypeMean::Integer);

    assert_eq!(columns[1].column_name, "B");
    assert!(!columns[1].pk);
    assert_eq!(columns[1].data_type_mean, DataTypeMean::Varchar);

    assert!(!reflector.needs_refresh());
    assert_eq!(reflector.refresh_count(), 1);
}

#[tokio::test]
async fn test_foreign_key_mapping() {
    let session = memory_session().await;
    run_all(&session, &AIRPORT_SCHEMA).await;
    let reflector = SchemaReflector::new(session);

    let fks = reflector.query_foreign_keys(None).await.unwrap();
    assert_eq!(fks.len(), 1);
    assert_eq!(fks[0].table_name, "AIRPORTS");
    assert_eq!(fks[0].constraint_type, ConstraintType::ForeignKey);
    assert_eq!(fks[0].column_name, "REGION");
    assert_eq!(fks[0].foreign_table_name.as_deref(), Some("REGIONS"));
    assert_eq!(fks[0].foreign_column_name.as_deref(), Some("ID"));

    let pks = reflector.query_primary_keys(None).await.unwrap();
    let names: Vec<(&str, &str)> = pks
        .iter()
        .map(|p| (p.constraint_name.as_str(), p.column_name.as_str()))
        .collect();
    assert_eq!(names, vec![("PK_AIRPORTS", "CODE"), ("PK_REGIONS", "ID")]);
}

#[tokio::test]
async fn test_type_classification_in_shadow_rows() {
    let session = memory_session().await;
    run_all(&session, &AIRPORT_SCHEMA).await;
    let reflector = SchemaReflector::new(session);

    let columns = reflector.query_columns(Some("airports")).await.unwrap();
    let summary: Vec<(&str, DataTypeMean, Option<i64>)> = columns
        .iter()
        .map(|c| (c.column_name.as_str(), c.data_type_mean, c.char_length))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("CODE", DataTypeMean::Varchar, Some(3)),
            ("REGION", DataTypeMean::Integer, None),
            ("OPENED", DataTypeMean::Timestamp, None),
            ("ELEVATION", DataTypeMean::Number, None),
        ]
    );

    let regions = reflector.query_columns(Some("REGIONS")).await.unwrap();
    assert_eq!(regions[1].char_length, Some(40));
    assert!(regions[1].is_notnull);
}

#[tokio::test]
async fn test_filters_are_case_insensitive() {
    let session = memory_session().await;
    run_all(&session, &AIRPORT_SCHEMA).await;
    let reflector = SchemaReflector::new(session);

    let tables = reflector.query_tables(Some("regions")).await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].table_name, "REGIONS");
    assert_eq!(tables[0].column_count, 2);

    assert!(reflector
        .query_primary_keys(Some("missing"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_invalidate_then_read_sees_new_table() {
    let session = memory_session().await;
    run_all(&session, &["CREATE TABLE first (id INTEGER)"]).await;
    let reflector = SchemaReflector::new(session.clone());

    assert_eq!(reflector.query_tables(None).await.unwrap().len(), 1);

    run_all(&session, &["CREATE TABLE second (id INTEGER)"]).await;
    // Served from the cache until invalidated
    assert_eq!(reflector.query_tables(None).await.unwrap().len(), 1);
    assert_eq!(reflector.refresh_count(), 1);

    reflector.invalidate();
    assert!(reflector.needs_refresh());

    let tables = reflector.query_tables(None).await.unwrap();
    let names: Vec<&str> = tables.iter().map(|t| t.table_name.as_str()).collect();
    assert_eq!(names, vec!["first", "second"]);
    assert_eq!(reflector.refresh_count(), 2);
}

#[tokio::test]
async fn test_concurrent_reads_share_one_rebuild() {
    let session = memory_session().await;
    run_all(&session, &AIRPORT_SCHEMA).await;
    let reflector = SchemaReflector::new(session);
    assert!(reflector.needs_refresh());

    let (tables, columns, keys) = tokio::join!(
        reflector.query_tables(None),
        reflector.query_columns(None),
        reflector.query_foreign_keys(None),
    );

    assert_eq!(reflector.refresh_count(), 1);
    let tables = tables.unwrap();
    let columns = columns.unwrap();
    assert_eq!(tables.len(), 2);
    assert_eq!(
        tables.iter().map(|t| t.column_count).sum::<i64>() as usize,
        columns.len()
    );
    assert_eq!(keys.unwrap().len(), 1);

    let mut column_tables: Vec<&str> = columns.iter().map(|c| c.table_name.as_str()).collect();
    column_tables.dedup();
    let table_names: Vec<&str> = tables.iter().map(|t| t.table_name.as_str()).collect();
    assert_eq!(column_tables, table_names);
}

#[tokio::test]
async fn test_concurrent_reads_across_tasks() {
    let session = memory_session().await;
    run_all(&session, &AIRPORT_SCHEMA).await;
    let reflector = Arc::new(SchemaReflector::new(session));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let reflector = reflector.clone();
            tokio::spawn(async move { reflector.query_columns(None).await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().len(), 6);
    }
    assert_eq!(reflector.refresh_count(), 1);
}

#[tokio::test]
async fn test_failed_refresh_stays_stale_and_retries() {
    let session = memory_session().await;
    run_all(&session, &AIRPORT_SCHEMA).await;
    let failing = Arc::new(FailingSession::new(session.clone()));
    let reflector = SchemaReflector::new(failing.clone());

    failing.fail_on("pragma_foreign_key_list");
    let err = reflector.query_columns(None).await.unwrap_err();
    assert!(matches!(err, SessionError::Refresh(_)), "{err:?}");
    assert!(reflector.needs_refresh());
    assert_eq!(reflector.refresh_count(), 0);

    // The partial rebuild was rolled back
    assert!(!session.in_transaction().await.unwrap());

    failing.disarm();
    let columns = reflector.query_columns(None).await.unwrap();
    assert_eq!(columns.len(), 6);
    assert_eq!(reflector.refresh_count(), 1);
}

#[tokio::test]
async fn test_generic_query_honors_options() {
    let session = memory_session().await;
    run_all(&session, &AIRPORT_SCHEMA).await;
    let reflector = SchemaReflector::new(session);

    let mut cursor = reflector
        .query(
            MetaTable::Columns,
            Some("AIRPORTS"),
            ExecuteOptions::default().with_cursor(true),
        )
        .await
        .unwrap()
        .into_cursor()
        .unwrap();

    let rows = cursor.fetch(2).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[0].get(cursor.fields(), "column_name"),
        Some(&Value::from("CODE"))
    );
    assert!(cursor.is_closed());
}

#[tokio::test]
async fn test_query_schemas_lists_main() {
    let session = memory_session().await;
    let reflector = SchemaReflector::new(session);

    let schemas = reflector.query_schemas().await.unwrap();
    let names: Vec<&str> = schemas.iter().map(|s| s.schema_name.as_str()).collect();
    assert_eq!(names, vec!["main"]);

    // Listing schemas does not need the shadow tables
    assert_eq!(reflector.refresh_count(), 0);
}

#[tokio::test]
async fn test_shadow_tables_live_in_temp_schema() {
    let session = memory_session().await;
    run_all(&session, &AIRPORT_SCHEMA).await;
    let reflector = SchemaReflector::new(session.clone());
    assert_ok!(reflector.ensure_fresh().await);

    let rows = session
        .execute(ExecuteRequest::new(
            "SELECT name FROM sqlite_temp_master WHERE type = 'table' ORDER BY name",
        ))
        .await
        .unwrap()
        .into_rows()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            Row::Array(vec![Value::from("meta$all_columns")]),
            Row::Array(vec![Value::from("meta$all_constraints")]),
        ]
    );

    // The catalog scan skips the shadows themselves
    assert_eq!(reflector.query_tables(None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_forced_refresh_rebuilds() {
    let session = memory_session().await;
    let reflector = SchemaReflector::new(session);

    reflector.refresh().await.unwrap();
    reflector.refresh().await.unwrap();
    assert_eq!(reflector.refresh_count(), 2);
    assert!(reflector.query_tables(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dropped_table_disappears_after_invalidate() {
    let session = memory_session().await;
    run_all(&session, &AIRPORT_SCHEMA).await;
    let reflector = SchemaReflector::new(session.clone());

    assert_eq!(reflector.query_foreign_keys(None).await.unwrap().len(), 1);
    assert_eq!(reflector.query_primary_keys(Some("AIRPORTS")).await.unwrap().len(), 1);

    run_all(&session, &["DROP TABLE AIRPORTS"]).await;
    reflector.invalidate();

    let tables = reflector.query_tables(None).await.unwrap();
    let names: Vec<&str> = tables.iter().map(|t| t.table_name.as_str()).collect();
    assert_eq!(names, vec!["REGIONS"]);

    let columns = reflector.query_columns(None).await.unwrap();
    assert!(columns.iter().all(|c| c.table_name == "REGIONS"));
    assert_eq!(columns.len(), 2);

    assert!(reflector.query_foreign_keys(None).await.unwrap().is_empty());
    assert!(reflector
        .query_primary_keys(Some("AIRPORTS"))
        .await
        .unwrap()
        .is_empty());
}

async fn ledger_count(session: &Session) -> Option<i64> {
    let rows = session
        .execute(ExecuteRequest::new("SELECT COUNT(*) FROM ledger"))
        .await
        .unwrap()
        .into_rows()
        .unwrap();
    rows[0].get_index(&[], 0).and_then(Value::as_i64)
}

async fn pending_insert(session: &Session) {
    run_all(session, &["CREATE TABLE ledger (amount INTEGER)"]).await;
    session
        .execute(
            ExecuteRequest::new("INSERT INTO ledger VALUES (1)")
                .with_options(ExecuteOptions::default().with_auto_commit(false)),
        )
        .await
        .unwrap();
    assert!(session.in_transaction().await.unwrap());
}

#[tokio::test]
async fn test_refresh_leaves_caller_transaction_uncommitted() {
    let session = memory_session().await;
    pending_insert(&session).await;
    let reflector = SchemaReflector::new(session.clone());

    let columns = reflector.query_columns(Some("ledger")).await.unwrap();
    assert_eq!(columns.len(), 1);
    assert!(session.in_transaction().await.unwrap());

    // The caller still decides: rolling back discards the pending row
    session.rollback().await.unwrap();
    assert_eq!(ledger_count(&session).await, Some(0));

    // Shadows built inside the rolled-back transaction are rebuilt
    assert!(reflector.needs_refresh());
    assert_eq!(reflector.query_columns(Some("ledger")).await.unwrap().len(), 1);
    assert!(!reflector.needs_refresh());
}

#[tokio::test]
async fn test_failed_refresh_keeps_caller_transaction() {
    let session = memory_session().await;
    pending_insert(&session).await;
    let failing = Arc::new(FailingSession::new(session.clone()));
    let reflector = SchemaReflector::new(failing.clone());

    failing.fail_on("pragma_foreign_key_list");
    let err = reflector.query_columns(None).await.unwrap_err();
    assert!(matches!(err, SessionError::Refresh(_)), "{err:?}");

    assert!(session.in_transaction().await.unwrap());
    session.commit().await.unwrap();
    assert_eq!(ledger_count(&session).await, Some(1));

    failing.disarm();
    assert_eq!(reflector.query_columns(None).await.unwrap().len(), 1);
}
