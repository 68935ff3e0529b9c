// ============================================================================
// clustersnap Library
// ============================================================================

pub mod core;
pub mod result;
pub mod connection;
#[cfg(any(test, feature = "memory-engine"))]
pub mod engine;
pub mod preflight;
pub mod coordinator;
pub mod executor;
pub mod cluster;
pub mod agent;
pub mod context;

// Re-export main types for convenience
pub use crate::core::{CoordError, ObjectFilter, ObjectType, Operation, Result, StatementWithType, TableRef};
pub use result::QueryResult;

pub use connection::{
    config::ConnectionConfig,
    pool::ConnectionPool,
    Connector, Session, SessionHandle,
};
pub use context::ExecutionContext;
pub use coordinator::{FreezeReport, SnapshotHandle, TableLocker};
pub use executor::{ExecutionMode, ExecutionReport, ParallelExecutor};

use agent::{HangingSessionReaper, ReapReport};
use preflight::PreflightGate;
use std::sync::Arc;

// ============================================================================
// High-level run API
// ============================================================================

/// One backup or restore run against a cluster
///
/// Owns the connection pool for the run and the [`ExecutionContext`] every
/// component call receives. The pieces are also usable on their own through
/// the `coordinator`, `executor` and `agent` modules.
///
/// # Examples
///
/// ```
/// use clustersnap::{ConnectionConfig, Coordinator, ExecutionContext, Operation};
/// use clustersnap::engine::MemoryCluster;
///
/// # tokio_test::block_on(async {
/// let cluster = MemoryCluster::new();
/// let config = ConnectionConfig::new("gpadmin", "postgres").num_connections(2);
/// let ctx = ExecutionContext::current(Operation::Backup);
///
/// let run = Coordinator::connect(cluster.connector(), config, ctx).await?;
/// run.preflight().await?;
/// run.close().await?;
/// # Ok::<(), clustersnap::CoordError>(())
/// # }).unwrap();
/// ```
pub struct Coordinator {
    pool: ConnectionPool,
    ctx: ExecutionContext,
}

impl Coordinator {
    /// Open the run's pool, tagging every session with the run's
    /// application tag.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        ctx: ExecutionContext,
    ) -> Result<Self> {
        let pool = ConnectionPool::connect(connector, ctx.connection_config(config)).await?;
        Ok(Self { pool, ctx })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Refuse to run while the cluster is being expanded.
    pub async fn preflight(&self) -> Result<()> {
        PreflightGate::new(self.ctx.operation)
            .check_pool(&self.pool, self.ctx.control_slot)
            .await
    }

    /// Lock `tables` and put every session on one snapshot.
    ///
    /// # Examples
    ///
    /// ```
    /// # use clustersnap::{ConnectionConfig, Coordinator, ExecutionContext, Operation, TableLocker, TableRef};
    /// # use clustersnap::engine::MemoryCluster;
    /// # tokio_test::block_on(async {
    /// let cluster = MemoryCluster::new();
    /// let config = ConnectionConfig::new("gpadmin", "sales").num_connections(3);
    /// let run = Coordinator::connect(cluster.connector(), config, ExecutionContext::current(Operation::Backup)).await?;
    /// run.pool().execute(0, "CREATE TABLE public.orders (id int)").await?;
    ///
    /// let tables = vec![TableRef::new(16384, "public", "orders")];
    /// let report = run.freeze(&tables, &TableLocker::new()).await?;
    /// assert_eq!(report.sessions, 3);
    /// run.pool().commit_all().await?;
    /// # Ok::<(), clustersnap::CoordError>(())
    /// # }).unwrap();
    /// ```
    pub async fn freeze(&self, tables: &[TableRef], locker: &TableLocker) -> Result<FreezeReport> {
        coordinator::freeze(&self.pool, &self.ctx, tables, locker).await
    }

    /// Run typed statements with the context's error policy.
    pub async fn execute_statements(
        &self,
        executor: ParallelExecutor,
        statements: &[StatementWithType],
    ) -> Result<ExecutionReport> {
        executor
            .with_error_policy(self.ctx.error_policy)
            .execute(&self.pool, statements)
            .await
    }

    /// Reaper matching this run's tag and pipe paths.
    pub fn reaper(&self) -> HangingSessionReaper {
        HangingSessionReaper::new(self.ctx.file_paths(), &self.ctx.application_tag)
    }

    /// Terminate this run's hanging transfer sessions.
    ///
    /// Works while the pool is frozen; the reaper brings its own connection.
    pub async fn reap(&self) -> Result<ReapReport> {
        self.reaper().terminate(&self.pool).await
    }

    pub async fn close(&self) -> Result<()> {
        self.pool.close().await
    }
}
