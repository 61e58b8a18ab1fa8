//! Row cursor integration tests.
//!
//! Tests lazy fetching, fetch limits and the release of the session on close.

use pretty_assertions::assert_eq;
use sqlite_session::db::{ExecuteOptions, ExecuteRequest, Row, RowMode, Session, Value};
use std::time::Duration;
use tokio_test::assert_ok;

use super::{memory_session, run_all};

const NUMBERS_SQL: &str = "WITH RECURSIVE n(x) AS \
     (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 25) \
     SELECT x, 'row ' || x AS label FROM n";

async fn seeded_session() -> std::sync::Arc<Session> {
    let session = memory_session().await;
    run_all(
        &session,
        &[
            "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)",
            "INSERT INTO items (label) VALUES ('a'), ('b'), ('c'), ('d'), ('e')",
        ],
    )
    .await;
    session
}

fn cursor_options() -> ExecuteOptions {
    ExecuteOptions::default().with_cursor(true)
}

#[tokio::test]
async fn test_fetch_returns_at_most_n_rows() {
    let session = memory_session().await;

    for limit in [1usize, 3, 25, 40] {
        let mut cursor = session
            .execute(ExecuteRequest::new(NUMBERS_SQL).with_options(cursor_options()))
            .await
            .unwrap()
            .into_cursor()
            .unwrap();

        let rows = cursor.fetch(limit).await.unwrap();
        assert_eq!(rows.len(), limit.min(25), "limit {limit}");
        assert!(cursor.is_closed());
    }
}

#[tokio::test]
async fn test_cursor_rows_match_materialized_rows() {
    let session = seeded_session().await;
    let sql = "SELECT id, label FROM items ORDER BY id";

    let materialized = session
        .execute(ExecuteRequest::new(sql))
        .await
        .unwrap();
    let expected_fields = materialized.fields().to_vec();
    let expected = materialized.into_rows().unwrap();

    let mut cursor = session
        .execute(ExecuteRequest::new(sql).with_options(cursor_options()))
        .await
        .unwrap()
        .into_cursor()
        .unwrap();

    let mut streamed = Vec::new();
    while let Some(row) = cursor.next_row().await.unwrap() {
        streamed.push(row);
    }

    assert_eq!(streamed, expected);
    assert_eq!(cursor.fields(), expected_fields.as_slice());
    assert!(cursor.is_closed());
}

#[tokio::test]
async fn test_fields_known_after_first_row() {
    let session = seeded_session().await;
    let mut cursor = session
        .execute(
            ExecuteRequest::new("SELECT id, label FROM items")
                .with_options(cursor_options().with_row_mode(RowMode::Object)),
        )
        .await
        .unwrap()
        .into_cursor()
        .unwrap();
    assert!(cursor.fields().is_empty());

    let first = cursor.next_row().await.unwrap().unwrap();
    let names: Vec<&str> = cursor.fields().iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["id", "label"]);
    assert_eq!(first.get(cursor.fields(), "label"), Some(&Value::from("a")));

    cursor.close().await.unwrap();
}

#[tokio::test]
async fn test_fetch_in_batches() {
    let session = seeded_session().await;
    let mut cursor = session
        .execute(
            ExecuteRequest::new("SELECT label FROM items ORDER BY id").with_options(cursor_options()),
        )
        .await
        .unwrap()
        .into_cursor()
        .unwrap();

    let first = cursor.next_row().await.unwrap();
    assert_eq!(first, Some(Row::Array(vec![Value::from("a")])));

    let rest = cursor.fetch(0).await.unwrap();
    assert_eq!(rest.len(), 4);
    assert!(cursor.is_closed());

    // Fetching from a closed cursor yields nothing
    assert!(cursor.fetch(10).await.unwrap().is_empty());
    assert_eq!(cursor.next_row().await.unwrap(), None);
}

#[tokio::test]
async fn test_close_is_idempotent_and_releases_session() {
    let session = seeded_session().await;
    let mut cursor = session
        .execute(ExecuteRequest::new("SELECT * FROM items").with_options(cursor_options()))
        .await
        .unwrap()
        .into_cursor()
        .unwrap();
    cursor.next_row().await.unwrap();

    assert_ok!(cursor.close().await);
    assert_ok!(cursor.close().await);

    let released = tokio::time::timeout(Duration::from_secs(5), session.test()).await;
    assert!(released.is_ok(), "session still held by closed cursor");
}

#[tokio::test]
async fn test_dropped_cursor_releases_session() {
    let session = seeded_session().await;
    {
        let mut cursor = session
            .execute(ExecuteRequest::new(NUMBERS_SQL).with_options(cursor_options()))
            .await
            .unwrap()
            .into_cursor()
            .unwrap();
        cursor.next_row().await.unwrap();
    }

    let released = tokio::time::timeout(Duration::from_secs(5), session.test()).await;
    assert!(released.is_ok(), "session still held by dropped cursor");
}

#[tokio::test]
async fn test_open_cursor_blocks_other_statements() {
    let session = seeded_session().await;
    let mut cursor = session
        .execute(ExecuteRequest::new("SELECT * FROM items").with_options(cursor_options()))
        .await
        .unwrap()
        .into_cursor()
        .unwrap();
    cursor.next_row().await.unwrap();

    let waiting = tokio::time::timeout(Duration::from_millis(50), session.test()).await;
    assert!(waiting.is_err(), "statement ran while a cursor was open");

    cursor.close().await.unwrap();
    assert_ok!(session.test().await);
}

#[tokio::test]
async fn test_decode_failure_closes_cursor() {
    let session = memory_session().await;
    let mut cursor = session
        .execute(
            ExecuteRequest::new("SELECT 'ok' AS v UNION ALL SELECT CAST(x'ff41' AS TEXT)")
                .with_options(cursor_options()),
        )
        .await
        .unwrap()
        .into_cursor()
        .unwrap();

    assert_eq!(
        cursor.next_row().await.unwrap(),
        Some(Row::Array(vec![Value::from("ok")]))
    );
    assert!(cursor.next_row().await.is_err());
    assert!(cursor.is_closed());
    assert_ok!(session.test().await);
}
