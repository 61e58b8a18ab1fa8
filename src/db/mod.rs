//! Session execution layer.
//!
//! Provides sessions over a native SQLite connection, lazily materialized row
//! cursors, and the trait through which higher layers issue statements.

mod cursor;
mod mock;
mod session;
mod types;

pub use cursor::RowCursor;
pub use mock::FailingSession;
pub use session::Session;
pub use types::{
    ExecuteOptions, ExecuteRequest, ExecuteResult, FieldDescriptor, KeyedRow, Row, RowMode, Value,
};

use crate::error::Result;
use async_trait::async_trait;

/// Statement execution and transaction control as seen by clients of a session.
///
/// The schema reflector is written against this trait rather than `Session`
/// directly, so a session can be wrapped (see [`FailingSession`]).
#[async_trait]
pub trait DatabaseSession: Send + Sync {
    /// Executes one statement; see [`Session::execute`].
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult>;

    /// Starts a transaction if none is active.
    async fn start_transaction(&self) -> Result<()>;

    /// Commits the active transaction, if any.
    async fn commit(&self) -> Result<()>;

    /// Rolls back the active transaction, if any.
    async fn rollback(&self) -> Result<()>;

    /// Returns true if a transaction is open.
    async fn in_transaction(&self) -> Result<bool>;

    /// Session id for log correlation.
    fn session_id(&self) -> u64;
}

#[async_trait]
impl DatabaseSession for Session {
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult> {
        Session::execute(self, request).await
    }

    async fn start_transaction(&self) -> Result<()> {
        Session::start_transaction(self).await
    }

    async fn commit(&self) -> Result<()> {
        Session::commit(self).await
    }

    async fn rollback(&self) -> Result<()> {
        Session::rollback(self).await
    }

    async fn in_transaction(&self) -> Result<bool> {
        Session::in_transaction(self).await
    }

    fn session_id(&self) -> u64 {
        Session::session_id(self)
    }
}
