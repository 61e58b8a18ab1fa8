//! Transaction integration tests.
//!
//! Tests idempotent transaction control and statement bracketing.

use pretty_assertions::assert_eq;
use sqlite_session::db::{ExecuteOptions, ExecuteRequest, Row, Session, Value};
use tokio_test::assert_ok;

use super::{memory_session, run_all};

async fn count(session: &Session) -> i64 {
    let rows = session
        .execute(ExecuteRequest::new("SELECT COUNT(*) FROM ledger"))
        .await
        .unwrap()
        .into_rows()
        .unwrap();
    match &rows[0] {
        Row::Array(values) => values[0].as_i64().unwrap(),
        other => panic!("unexpected row {other:?}"),
    }
}

fn manual() -> ExecuteOptions {
    ExecuteOptions::default().with_auto_commit(false)
}

#[tokio::test]
async fn test_transaction_calls_are_idempotent() {
    let session = memory_session().await;

    assert_ok!(session.start_transaction().await);
    assert_ok!(session.start_transaction().await);
    assert!(session.in_transaction().await.unwrap());

    assert_ok!(session.commit().await);
    assert_ok!(session.commit().await);
    assert!(!session.in_transaction().await.unwrap());

    assert_ok!(session.rollback().await);
    assert_ok!(session.start_transaction().await);
    assert_ok!(session.rollback().await);
    assert_ok!(session.rollback().await);
    assert!(!session.in_transaction().await.unwrap());
}

#[tokio::test]
async fn test_manual_statements_share_one_transaction() {
    let session = memory_session().await;
    run_all(&session, &["CREATE TABLE ledger (amount INTEGER)"]).await;

    for amount in [10, 20, 30] {
        session
            .execute(
                ExecuteRequest::new("INSERT INTO ledger VALUES (?)")
                    .with_values(vec![Value::from(amount)])
                    .with_options(manual()),
            )
            .await
            .unwrap();
    }
    assert!(session.in_transaction().await.unwrap());

    session.rollback().await.unwrap();
    assert_eq!(count(&session).await, 0);
}

#[tokio::test]
async fn test_auto_commit_statement_commits_pending_work() {
    let session = memory_session().await;
    run_all(&session, &["CREATE TABLE ledger (amount INTEGER)"]).await;

    session
        .execute(ExecuteRequest::new("INSERT INTO ledger VALUES (1)").with_options(manual()))
        .await
        .unwrap();
    session
        .execute(ExecuteRequest::new("INSERT INTO ledger VALUES (2)"))
        .await
        .unwrap();
    assert!(!session.in_transaction().await.unwrap());

    // Already committed; nothing to undo
    session.rollback().await.unwrap();
    assert_eq!(count(&session).await, 2);
}

#[tokio::test]
async fn test_failed_auto_commit_statement_leaves_transaction_open() {
    let session = memory_session().await;
    run_all(
        &session,
        &["CREATE TABLE ledger (amount INTEGER NOT NULL)"],
    )
    .await;

    session
        .execute(ExecuteRequest::new("INSERT INTO ledger VALUES (5)").with_options(manual()))
        .await
        .unwrap();

    let failed = session
        .execute(ExecuteRequest::new("INSERT INTO ledger VALUES (NULL)"))
        .await;
    assert!(failed.is_err());

    // The failed statement did not commit the earlier insert
    assert!(session.in_transaction().await.unwrap());
    session.rollback().await.unwrap();
    assert_eq!(count(&session).await, 0);
}

#[tokio::test]
async fn test_explicit_commit_persists() {
    let session = memory_session().await;
    run_all(&session, &["CREATE TABLE ledger (amount INTEGER)"]).await;

    session.start_transaction().await.unwrap();
    session
        .execute(ExecuteRequest::new("INSERT INTO ledger VALUES (7)").with_options(manual()))
        .await
        .unwrap();
    session.commit().await.unwrap();

    session.rollback().await.unwrap();
    assert_eq!(count(&session).await, 1);
}
