//! Consistency protocol: table locks plus one synchronized snapshot.

pub mod lock;
pub mod snapshot;

pub use lock::{TableLocker, DEFAULT_LOCK_BATCH_SIZE};
pub use snapshot::{export_snapshot, import_snapshot, SnapshotCoordinator, SnapshotHandle};

use crate::connection::pool::ConnectionPool;
use crate::context::ExecutionContext;
use crate::core::{Result, TableRef};
use log::{info, warn};

/// Outcome of a successful [`freeze`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeReport {
    pub snapshot: SnapshotHandle,
    pub tables_locked: usize,
    pub sessions: usize,
}

/// Bring every session of the pool to one consistent view of `tables`.
///
/// The control slot locks first and exports its snapshot. Every other slot
/// then begins a transaction, imports the snapshot as its first statement and
/// takes the same locks. All transactions stay open on success; any failure
/// rolls back every session of the pool before the error is returned.
pub async fn freeze(
    pool: &ConnectionPool,
    ctx: &ExecutionContext,
    tables: &[TableRef],
    locker: &TableLocker,
) -> Result<FreezeReport> {
    let coordinator = SnapshotCoordinator::new(ctx.control_slot);
    match run_freeze(pool, &coordinator, tables, locker).await {
        Ok(report) => {
            info!(
                "Sessions frozen on snapshot {} ({} table(s), {} session(s))",
                report.snapshot, report.tables_locked, report.sessions
            );
            Ok(report)
        }
        Err(e) => {
            warn!("Freeze failed: {}", e);
            let slots: Vec<usize> = (0..pool.size()).collect();
            lock::rollback_slots(pool, &slots).await;
            Err(e)
        }
    }
}

async fn run_freeze(
    pool: &ConnectionPool,
    coordinator: &SnapshotCoordinator,
    tables: &[TableRef],
    locker: &TableLocker,
) -> Result<FreezeReport> {
    let control = coordinator.exporter_slot();
    let tables_locked = locker.lock_slots(pool, &[control], tables).await?;
    let snapshot = coordinator.export(pool).await?;
    coordinator.import_all(pool, &snapshot).await?;
    locker
        .lock_slots(pool, &coordinator.importer_slots(pool), tables)
        .await?;

    Ok(FreezeReport {
        snapshot,
        tables_locked,
        sessions: pool.size(),
    })
}
