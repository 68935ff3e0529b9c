pub mod config;
pub mod pool;
pub mod postgres;

use crate::core::{CoordError, Result};
use crate::result::QueryResult;
use async_trait::async_trait;
use config::ConnectionConfig;

/// A physical connection to one database server process.
///
/// Implementations run statements with the simple-query protocol; a string
/// may contain several `;`-separated statements and the result of the last
/// one is returned.
#[async_trait]
pub trait SessionHandle: Send {
    async fn simple_query(&mut self, sql: &str) -> Result<QueryResult>;

    /// Server process id backing this session.
    fn backend_pid(&self) -> i32;

    async fn close(&mut self) -> Result<()>;
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn SessionHandle>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Active,
    InTransaction { statements: usize, failed: bool },
    Closed,
}

/// One logical database session owned by a pool slot.
pub struct Session {
    slot: usize,
    database: String,
    handle: Box<dyn SessionHandle>,
    state: SessionState,
}

impl Session {
    pub(crate) fn new(slot: usize, database: &str, handle: Box<dyn SessionHandle>) -> Self {
        Self {
            slot,
            database: database.to_string(),
            handle,
            state: SessionState::Active,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn backend_pid(&self) -> i32 {
        self.handle.backend_pid()
    }

    /// Execute a SQL statement on this session.
    ///
    /// Inside a transaction every statement, successful or not, counts
    /// towards `statements_in_transaction`; a failure leaves the transaction
    /// in the aborted state until it is rolled back.
    pub async fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        if self.state == SessionState::Closed {
            return Err(CoordError::ExecutionError(format!(
                "Session {} is closed",
                self.slot
            )));
        }

        let result = self.handle.simple_query(sql).await;

        if let SessionState::InTransaction { statements, failed } = self.state {
            self.state = SessionState::InTransaction {
                statements: statements + 1,
                failed: failed || result.is_err(),
            };
        }

        result
    }

    /// Begin a repeatable-read transaction.
    pub async fn begin(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => {
                return Err(CoordError::ExecutionError(format!(
                    "Session {} is closed",
                    self.slot
                )));
            }
            SessionState::InTransaction { .. } => {
                return Err(CoordError::ExecutionError(format!(
                    "Transaction already active on session {}",
                    self.slot
                )));
            }
            SessionState::Active => {}
        }

        self.handle
            .simple_query("BEGIN ISOLATION LEVEL REPEATABLE READ")
            .await?;
        self.state = SessionState::InTransaction {
            statements: 0,
            failed: false,
        };
        Ok(())
    }

    /// Begin a transaction unless one is already open.
    pub async fn ensure_transaction(&mut self) -> Result<()> {
        if self.is_in_transaction() {
            return Ok(());
        }
        self.begin().await
    }

    /// Commit the current transaction
    pub async fn commit(&mut self) -> Result<()> {
        if !self.is_in_transaction() {
            return Err(CoordError::ExecutionError(format!(
                "No active transaction on session {}",
                self.slot
            )));
        }

        // The transaction is over whether or not COMMIT succeeds.
        let result = self.handle.simple_query("COMMIT").await;
        self.state = SessionState::Active;
        result.map(|_| ())
    }

    /// Rollback the current transaction
    pub async fn rollback(&mut self) -> Result<()> {
        if !self.is_in_transaction() {
            return Err(CoordError::ExecutionError(format!(
                "No active transaction on session {}",
                self.slot
            )));
        }

        let result = self.handle.simple_query("ROLLBACK").await;
        self.state = SessionState::Active;
        result.map(|_| ())
    }

    /// Roll back if a transaction is open; errors are logged, not returned.
    pub async fn rollback_quietly(&mut self) {
        if self.is_in_transaction() {
            if let Err(e) = self.rollback().await {
                log::warn!("Session {}: rollback failed: {}", self.slot, e);
            }
        }
    }

    /// Check if session is in a transaction
    pub fn is_in_transaction(&self) -> bool {
        matches!(self.state, SessionState::InTransaction { .. })
    }

    /// Statements executed since BEGIN, or `None` outside a transaction.
    pub fn statements_in_transaction(&self) -> Option<usize> {
        match self.state {
            SessionState::InTransaction { statements, .. } => Some(statements),
            _ => None,
        }
    }

    /// True when a statement failed in the open transaction.
    pub fn is_transaction_failed(&self) -> bool {
        matches!(self.state, SessionState::InTransaction { failed: true, .. })
    }

    /// Check if session is usable
    pub fn is_active(&self) -> bool {
        self.state != SessionState::Closed
    }

    /// Close the session, rolling back any open transaction.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.rollback_quietly().await;
        self.state = SessionState::Closed;
        self.handle.close().await
    }
}
