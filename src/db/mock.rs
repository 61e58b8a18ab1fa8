//! Fault-injecting session wrapper for testing.
//!
//! Wraps a real session and fails statements matching a pattern, so callers'
//! error paths can be exercised against a live engine.

use super::{DatabaseSession, ExecuteRequest, ExecuteResult, Session};
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A session wrapper that fails every statement containing the armed pattern.
pub struct FailingSession<S = Session> {
    inner: Arc<S>,
    fail_pattern: Mutex<Option<String>>,
    executed: AtomicUsize,
}

impl<S: DatabaseSession> FailingSession<S> {
    /// Wraps `inner` with no failure armed.
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            fail_pattern: Mutex::new(None),
            executed: AtomicUsize::new(0),
        }
    }

    /// Fails every following statement whose SQL contains `pattern` (case-insensitive).
    pub fn fail_on(&self, pattern: impl Into<String>) {
        let pattern = pattern.into().to_lowercase();
        if let Ok(mut slot) = self.fail_pattern.lock() {
            *slot = Some(pattern);
        }
    }

    /// Stops injecting failures.
    pub fn disarm(&self) {
        if let Ok(mut slot) = self.fail_pattern.lock() {
            *slot = None;
        }
    }

    /// Number of statements passed through to the inner session.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Returns the wrapped session.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn should_fail(&self, sql: &str) -> bool {
        let sql = sql.to_lowercase();
        self.fail_pattern
            .lock()
            .map(|slot| slot.as_deref().is_some_and(|p| sql.contains(p)))
            .unwrap_or(false)
    }
}

#[async_trait]
impl<S: DatabaseSession> DatabaseSession for FailingSession<S> {
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult> {
        if self.should_fail(&request.sql) {
            return Err(SessionError::native(format!(
                "Injected failure for: {}",
                request.sql.trim()
            )));
        }
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(request).await
    }

    async fn start_transaction(&self) -> Result<()> {
        self.inner.start_transaction().await
    }

    async fn commit(&self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        self.inner.rollback().await
    }

    async fn in_transaction(&self) -> Result<bool> {
        self.inner.in_transaction().await
    }

    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }
}
