//! Session over one native SQLite connection.
//!
//! Provides the `Session` struct: statement execution with transaction
//! bracketing, idempotent transaction control and idempotent close.

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Executor};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cursor::{RowCursor, Statement};
use super::types::{ExecuteRequest, ExecuteResult};
use crate::config::{OpenMode, SessionConfig};
use crate::error::{Result, SessionError};

/// Process-wide session id source.
static SESSION_ID_GEN: AtomicU64 = AtomicU64::new(0);

/// One native connection and the operations allowed on it.
///
/// All operations take `&self` and serialize on the connection, so statements
/// issued one after another on the same session run in program order. A cursor
/// returned by [`Session::execute`] holds the connection until it is closed or
/// exhausted; other operations wait for it.
pub struct Session {
    conn: Arc<Mutex<Option<SqliteConnection>>>,
    session_id: u64,
    closed: AtomicBool,
}

impl Session {
    /// Opens a new connection as described by `config`.
    pub async fn open(config: &SessionConfig) -> Result<Self> {
        config.validate()?;

        let options = connect_options(config)?;
        let conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| SessionError::native(format!("Cannot open {}: {e}", config.database)))?;

        let session = Self::from_connection(conn);
        info!(
            session_id = session.session_id,
            "Opened session on {}",
            config.display_string()
        );
        Ok(session)
    }

    /// Wraps an already connected handle.
    pub fn from_connection(conn: SqliteConnection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            session_id: SESSION_ID_GEN.fetch_add(1, Ordering::Relaxed) + 1,
            closed: AtomicBool::new(false),
        }
    }

    /// Monotonic id used to correlate log lines.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// True once the native handle has been released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Executes one statement with positional bind values.
    ///
    /// Without `auto_commit` a transaction is started first (if none is active)
    /// and left open. With `auto_commit` any active transaction is committed once
    /// the statement has been finalized; a failed statement is not committed and
    /// nothing is rolled back here.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult> {
        let ExecuteRequest {
            sql,
            values,
            options,
        } = request;

        let mut guard = self.conn.clone().lock_owned().await;
        let conn = guard.as_mut().ok_or(SessionError::ConnectionClosed)?;

        debug!(
            session_id = self.session_id,
            params = values.len(),
            cursor = options.cursor,
            auto_commit = options.auto_commit,
            "Executing: {sql}"
        );

        if !options.auto_commit {
            begin_if_idle(conn).await?;
        }

        conn.prepare(sql.as_str()).await?;

        let statement = Statement::spawn(guard, sql, values, options.auto_commit, self.session_id);
        let mut cursor = RowCursor::new(statement, options.row_mode, self.session_id);

        if options.cursor {
            return Ok(ExecuteResult::Cursor(cursor));
        }

        let fetched = cursor.fetch(options.fetch_rows).await;
        let closed = cursor.close().await;
        let rows = fetched?;
        closed?;

        Ok(ExecuteResult::Rows {
            fields: cursor.fields().to_vec(),
            rows,
        })
    }

    /// Starts a transaction. Succeeds without effect if one is already active.
    pub async fn start_transaction(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SessionError::ConnectionClosed)?;

        if begin_if_idle(conn).await? {
            debug!(session_id = self.session_id, "Transaction started");
        } else {
            debug!(session_id = self.session_id, "Transaction already active");
        }
        Ok(())
    }

    /// Commits the active transaction. Succeeds without effect if none is active.
    pub async fn commit(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SessionError::ConnectionClosed)?;

        if commit_active(conn).await? {
            debug!(session_id = self.session_id, "Transaction committed");
        }
        Ok(())
    }

    /// Rolls back the active transaction. Succeeds without effect if none is active.
    pub async fn rollback(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SessionError::ConnectionClosed)?;

        if rollback_active(conn).await? {
            debug!(session_id = self.session_id, "Transaction rolled back");
        }
        Ok(())
    }

    /// Returns true if a transaction is open on this session.
    pub async fn in_transaction(&self) -> Result<bool> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SessionError::ConnectionClosed)?;
        in_transaction(conn).await
    }

    /// Checks that the connection is alive.
    pub async fn test(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SessionError::ConnectionClosed)?;
        conn.execute("SELECT 1").await?;
        Ok(())
    }

    /// Releases the native handle.
    ///
    /// A failure reported while closing is returned once; the handle is cleared
    /// either way and later calls succeed immediately.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.take() else {
            return Ok(());
        };
        self.closed.store(true, Ordering::Release);
        drop(guard);

        match conn.close().await {
            Ok(()) => {
                info!(session_id = self.session_id, "Session closed");
                Ok(())
            }
            Err(e) => {
                warn!(session_id = self.session_id, "Error while closing session: {e}");
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builds engine connect options from a session config.
fn connect_options(config: &SessionConfig) -> Result<SqliteConnectOptions> {
    let options = if config.is_in_memory() {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| SessionError::config(format!("Invalid database path: {e}")))?
    } else {
        SqliteConnectOptions::new().filename(&config.database)
    };

    let options = match config.mode {
        OpenMode::ReadOnly => options.read_only(true),
        OpenMode::ReadWrite => options.create_if_missing(false),
        OpenMode::ReadWriteCreate => options.create_if_missing(true),
    };

    let options = match config.busy_timeout_ms {
        Some(ms) => options.busy_timeout(Duration::from_millis(ms)),
        None => options,
    };

    Ok(options.disable_statement_logging())
}

/// Reads the engine's autocommit flag: false while a transaction is open.
async fn in_transaction(conn: &mut SqliteConnection) -> Result<bool> {
    let mut handle = conn.lock_handle().await?;
    let raw = handle.as_raw_handle();
    // SAFETY: the handle stays locked for the call and sqlite3_get_autocommit only
    // reads connection state.
    let autocommit = unsafe { libsqlite3_sys::sqlite3_get_autocommit(raw.as_ptr()) };
    Ok(autocommit == 0)
}

/// Issues BEGIN unless a transaction is already open. Returns whether it began one.
pub(crate) async fn begin_if_idle(conn: &mut SqliteConnection) -> Result<bool> {
    if in_transaction(conn).await? {
        return Ok(false);
    }
    conn.execute("BEGIN").await?;
    Ok(true)
}

/// Issues COMMIT if a transaction is open. Returns whether it committed one.
pub(crate) async fn commit_active(conn: &mut SqliteConnection) -> Result<bool> {
    if !in_transaction(conn).await? {
        return Ok(false);
    }
    conn.execute("COMMIT").await?;
    Ok(true)
}

/// Issues ROLLBACK if a transaction is open. Returns whether it rolled one back.
pub(crate) async fn rollback_active(conn: &mut SqliteConnection) -> Result<bool> {
    if !in_transaction(conn).await? {
        return Ok(false);
    }
    conn.execute("ROLLBACK").await?;
    Ok(true)
}
