use thiserror::Error;

use super::types::{ExpansionPhase, Operation};

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error on slot {slot}: {reason}")]
    ConnectionError { slot: usize, reason: String },

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Invalid connection slot {slot} (pool size {size})")]
    InvalidSlot { slot: usize, size: usize },

    #[error("{}", .operation.expansion_message(.phase))]
    ExpansionInProgress {
        phase: ExpansionPhase,
        operation: Operation,
    },

    #[error("Unable to acquire ACCESS SHARE lock on {tables} (slot {slot}): {reason}")]
    LockFailed {
        slot: usize,
        tables: String,
        reason: String,
    },

    #[error("Unable to export synchronized snapshot on slot {slot}: {reason}")]
    SnapshotExport { slot: usize, reason: String },

    #[error("Unable to import synchronized snapshot {snapshot} on slot {slot}: {reason}")]
    SnapshotImport {
        slot: usize,
        snapshot: String,
        reason: String,
    },

    #[error("Failed to execute {object_type} statement #{index}: {reason}")]
    StatementFailed {
        index: usize,
        object_type: String,
        statement: String,
        reason: String,
    },

    #[error("{message} on {}: {}", segment_count(.failures), format_node_failures(.failures))]
    Distribution {
        message: String,
        failures: Vec<NodeFailure>,
    },

    #[error("Data transfer exceeded {timeout_secs:.1}s; terminated {terminated} hanging session(s)")]
    TransferTimedOut { timeout_secs: f64, terminated: usize },

    #[error("Remote command error: {0}")]
    RemoteError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

/// Per-node failure collected by a cluster-wide remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub content_id: i32,
    pub host: String,
    pub reason: String,
}

fn segment_count(failures: &[NodeFailure]) -> String {
    match failures.len() {
        1 => "1 segment".to_string(),
        n => format!("{} segments", n),
    }
}

fn format_node_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("segment {} on host {} ({})", f.content_id, f.host, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl CoordError {
    /// Errors that invalidate the consistency guarantees of the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordError::ExpansionInProgress { .. }
                | CoordError::LockFailed { .. }
                | CoordError::SnapshotExport { .. }
                | CoordError::SnapshotImport { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;

impl From<std::io::Error> for CoordError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<tokio_postgres::Error> for CoordError {
    fn from(err: tokio_postgres::Error) -> Self {
        // The Display of tokio_postgres::Error omits the server message.
        match err.as_db_error() {
            Some(db) => Self::ExecutionError(format!("{}: {}", db.severity(), db.message())),
            None => Self::ExecutionError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}
