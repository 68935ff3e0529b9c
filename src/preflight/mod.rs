//! Cluster-expansion gate run once before any backup or restore work.

use crate::connection::pool::ConnectionPool;
use crate::connection::Session;
use crate::core::{CoordError, ExpansionPhase, Operation, Result};
use log::{debug, info};
use std::path::PathBuf;

pub const MAINTENANCE_DATABASE: &str = "postgres";
pub const EXPANSION_MARKER_FILE: &str = "gpexpand.status";
pub const EXPANSION_IN_PROGRESS: &str = "IN PROGRESS";

const COORDINATOR_DATA_DIR_QUERY: &str =
    "select datadir from gp_segment_configuration where content=-1 and role='p'";
const EXPANSION_STATUS_QUERY: &str = "SELECT status FROM gpexpand.status LIMIT 1";

/// Blocks a run while the cluster topology is being expanded.
#[derive(Debug, Clone, Copy)]
pub struct PreflightGate {
    operation: Operation,
}

impl PreflightGate {
    pub fn new(operation: Operation) -> Self {
        Self { operation }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Run the check on one slot of a pool opened against `postgres`.
    pub async fn check_pool(&self, pool: &ConnectionPool, slot: usize) -> Result<()> {
        let mut session = pool.acquire(slot).await?;
        self.check_not_expanding(&mut session).await
    }

    /// Fail with `ExpansionInProgress` if either expansion signal is present.
    ///
    /// Phase 1 is the marker file in the coordinator data directory. Phase 2
    /// is an `IN PROGRESS` row in the expansion status table; a failing
    /// status query means the table does not exist, which is not an error.
    pub async fn check_not_expanding(&self, session: &mut Session) -> Result<()> {
        match self.detect(session).await? {
            Some(phase) => Err(CoordError::ExpansionInProgress {
                phase,
                operation: self.operation,
            }),
            None => {
                debug!("No cluster expansion in progress");
                Ok(())
            }
        }
    }

    /// Which expansion phase, if any, is currently observable.
    pub async fn detect(&self, session: &mut Session) -> Result<Option<ExpansionPhase>> {
        if session.database() != MAINTENANCE_DATABASE {
            return Err(CoordError::ConfigError(format!(
                "expansion check requires a connection to the {} database, not {}",
                MAINTENANCE_DATABASE,
                session.database()
            )));
        }

        let data_dir = coordinator_data_dir(session).await?;
        let marker = data_dir.join(EXPANSION_MARKER_FILE);
        if tokio::fs::try_exists(&marker).await? {
            info!("Found expansion marker {}", marker.display());
            return Ok(Some(ExpansionPhase::MarkerFile));
        }

        let in_progress = match session.execute(EXPANSION_STATUS_QUERY).await {
            Ok(result) => result.first_value() == Some(EXPANSION_IN_PROGRESS),
            Err(e) => {
                debug!("Expansion status table not readable ({}); phase 2 not running", e);
                session.rollback_quietly().await;
                false
            }
        };
        Ok(in_progress.then_some(ExpansionPhase::StatusTable))
    }
}

async fn coordinator_data_dir(session: &mut Session) -> Result<PathBuf> {
    let result = session.execute(COORDINATOR_DATA_DIR_QUERY).await?;
    result.first_value().map(PathBuf::from).ok_or_else(|| {
        CoordError::ExecutionError("coordinator data directory not found in cluster catalog".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::ConnectionConfig;
    use crate::engine::MemoryCluster;
    use std::sync::Arc;

    async fn pool_for(cluster: &Arc<MemoryCluster>, database: &str) -> ConnectionPool {
        ConnectionPool::connect(cluster.connector(), ConnectionConfig::new("gpadmin", database))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_clean_cluster_passes() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = MemoryCluster::builder().coordinator_data_dir(dir.path()).build();
        let pool = pool_for(&cluster, "postgres").await;
        PreflightGate::new(Operation::Backup).check_pool(&pool, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_marker_file_blocks_backup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(EXPANSION_MARKER_FILE), "").unwrap();
        let cluster = MemoryCluster::builder().coordinator_data_dir(dir.path()).build();
        let pool = pool_for(&cluster, "postgres").await;

        let err = PreflightGate::new(Operation::Backup).check_pool(&pool, 0).await.unwrap_err();
        assert!(matches!(
            err,
            CoordError::ExpansionInProgress {
                phase: ExpansionPhase::MarkerFile,
                operation: Operation::Backup
            }
        ));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("phase 1"));
    }

    #[tokio::test]
    async fn test_status_row_blocks_restore() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = MemoryCluster::builder().coordinator_data_dir(dir.path()).build();
        let pool = pool_for(&cluster, "postgres").await;
        pool.execute(0, "CREATE TABLE gpexpand.status (status text, updated timestamp)")
            .await
            .unwrap();
        pool.execute(0, "INSERT INTO gpexpand.status VALUES ('IN PROGRESS', '2024-01-01 00:00:00')")
            .await
            .unwrap();

        let err = PreflightGate::new(Operation::Restore).check_pool(&pool, 0).await.unwrap_err();
        assert!(err.to_string().contains("phase 2"));
        assert!(err.to_string().contains("restart restore"));
    }

    #[tokio::test]
    async fn test_finished_status_row_passes() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = MemoryCluster::builder().coordinator_data_dir(dir.path()).build();
        let pool = pool_for(&cluster, "postgres").await;
        pool.execute(0, "CREATE TABLE gpexpand.status (status text, updated timestamp)")
            .await
            .unwrap();
        pool.execute(0, "INSERT INTO gpexpand.status VALUES ('EXPANSION COMPLETE', NULL)")
            .await
            .unwrap();
        PreflightGate::new(Operation::Restore).check_pool(&pool, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_requires_maintenance_database() {
        let cluster = MemoryCluster::new();
        let pool = pool_for(&cluster, "sales").await;
        let err = PreflightGate::new(Operation::Backup).check_pool(&pool, 0).await.unwrap_err();
        assert!(matches!(err, CoordError::ConfigError(_)));
    }
}
