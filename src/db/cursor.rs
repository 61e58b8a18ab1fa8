//! Lazily materialized row cursor over one executing statement.
//!
//! A statement runs in its own task which holds the session's connection for as
//! long as the statement is alive and hands rows over a single-slot channel, so
//! every `step` is one row. Finalizing cancels that task and waits for it.

use futures::StreamExt;
use sqlx::sqlite::{SqliteArguments, SqliteColumn, SqliteConnection, SqliteRow};
use sqlx::{Column, Row as SqlxRow, Sqlite, TypeInfo, ValueRef};
use std::fmt;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::session::commit_active;
use super::types::{FieldDescriptor, KeyedRow, Row, RowMode, Value};
use crate::error::{Result, SessionError};

/// Exclusive access to a session's native handle.
pub(crate) type ConnectionGuard = OwnedMutexGuard<Option<SqliteConnection>>;

/// Native statement handle: a running statement task and the receiving end of its rows.
pub(crate) struct Statement {
    rows: mpsc::Receiver<Result<KeyedRow>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl Statement {
    /// Starts stepping `sql` on the guarded connection.
    ///
    /// The caller must have prepared the statement already so syntax errors surface
    /// before a cursor exists. With `auto_commit`, an open transaction is committed
    /// once the statement is finalized, unless stepping failed.
    pub(crate) fn spawn(
        mut guard: ConnectionGuard,
        sql: String,
        values: Vec<Value>,
        auto_commit: bool,
        session_id: u64,
    ) -> Self {
        let (tx, rows) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let Some(conn) = guard.as_mut() else {
                return Err(SessionError::ConnectionClosed);
            };

            let mut failed = false;
            {
                let query = values
                    .into_iter()
                    .fold(sqlx::query(&sql), bind_value);
                let mut stream = query.fetch(&mut *conn);

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(row)) => match decode_row(&row) {
                            Ok(keyed) => {
                                if tx.send(Ok(keyed)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                failed = true;
                                let _ = tx.send(Err(e)).await;
                                break;
                            }
                        },
                        Some(Err(e)) => {
                            failed = true;
                            let _ = tx.send(Err(e.into())).await;
                            break;
                        }
                        None => break,
                    }
                }
            }

            if auto_commit && !failed {
                commit_active(conn).await?;
                debug!(session_id, "Auto-committed after statement");
            }
            Ok(())
        });

        Self {
            rows,
            cancel,
            task: Some(task),
        }
    }

    /// Pulls the next row, or None once the statement is exhausted.
    async fn step(&mut self) -> Result<Option<KeyedRow>> {
        self.rows.recv().await.transpose()
    }

    /// Stops the statement and releases the connection. Returns a deferred commit failure.
    async fn finalize(mut self) -> Result<()> {
        self.rows.close();
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| SessionError::internal(format!("Statement task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A live handle over a partially consumed result set.
pub struct RowCursor {
    statement: Option<Statement>,
    fields: Vec<FieldDescriptor>,
    row_mode: RowMode,
    session_id: u64,
}

impl RowCursor {
    pub(crate) fn new(statement: Statement, row_mode: RowMode, session_id: u64) -> Self {
        Self {
            statement: Some(statement),
            fields: Vec::new(),
            row_mode,
            session_id,
        }
    }

    /// Fields of the result, empty until the first row has been pulled.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Row shape produced by this cursor.
    pub fn row_mode(&self) -> RowMode {
        self.row_mode
    }

    /// True once the statement has been finalized.
    pub fn is_closed(&self) -> bool {
        self.statement.is_none()
    }

    /// Fetches up to `max_rows` rows (0 = until exhausted).
    ///
    /// Reaching `max_rows` or the end of the result closes the cursor. Fetching from
    /// a closed cursor returns no rows. Control is yielded to the scheduler between
    /// rows so long fetches do not starve other tasks.
    pub async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::new();

        while let Some(row) = self.next_row().await? {
            rows.push(row);
            if max_rows > 0 && rows.len() >= max_rows {
                self.close().await?;
                break;
            }
            tokio::task::yield_now().await;
        }

        Ok(rows)
    }

    /// Pulls a single row; None when the cursor is closed or exhausted.
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        let Some(statement) = self.statement.as_mut() else {
            return Ok(None);
        };

        match statement.step().await {
            Ok(Some(keyed)) => {
                if self.fields.is_empty() {
                    self.fields = keyed
                        .iter()
                        .map(|(name, _)| FieldDescriptor::new(name.as_str()))
                        .collect();
                }
                Ok(Some(Row::from_keyed(keyed, self.row_mode)))
            }
            Ok(None) => {
                self.close().await?;
                Ok(None)
            }
            Err(e) => {
                if let Err(close_err) = self.close().await {
                    warn!(session_id = self.session_id, "Closing failed cursor: {close_err}");
                }
                Err(e)
            }
        }
    }

    /// Finalizes the statement. Closing an already closed cursor is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        match self.statement.take() {
            Some(statement) => {
                debug!(session_id = self.session_id, "Finalizing statement");
                statement.finalize().await
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowCursor")
            .field("session_id", &self.session_id)
            .field("fields", &self.fields)
            .field("row_mode", &self.row_mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Binds one positional value.
pub(crate) fn bind_value(query: SqliteQuery<'_>, value: Value) -> SqliteQuery<'_> {
    match value {
        Value::Null => query.bind(None::<i64>),
        Value::Integer(i) => query.bind(i),
        Value::Real(f) => query.bind(f),
        Value::Text(s) => query.bind(s),
        Value::Blob(b) => query.bind(b),
    }
}

/// Converts an engine row to name/value pairs in column order.
fn decode_row(row: &SqliteRow) -> Result<KeyedRow> {
    row.columns()
        .iter()
        .map(|col| Ok((col.name().to_string(), decode_value(row, col)?)))
        .collect()
}

/// Decodes a column according to the storage class of the value actually stored.
fn decode_value(row: &SqliteRow, col: &SqliteColumn) -> Result<Value> {
    let index = col.ordinal();
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_uppercase();

    let decoded = match type_name.as_str() {
        "INTEGER" | "BIGINT" | "INT4" | "BOOLEAN" => {
            row.try_get_unchecked::<i64, _>(index).map(Value::Integer)
        }
        "REAL" | "NUMERIC" => row.try_get_unchecked::<f64, _>(index).map(Value::Real),
        "BLOB" => row.try_get_unchecked::<Vec<u8>, _>(index).map(Value::Blob),
        _ => row.try_get_unchecked::<String, _>(index).map(Value::Text),
    };

    decoded.map_err(|e| {
        SessionError::native(format!("Cannot decode column '{}': {e}", col.name()))
    })
}
