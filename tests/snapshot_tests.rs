/// Snapshot and locking tests
///
/// Tests for synchronized snapshots, ACCESS SHARE locking and the freeze sequence
/// Run with: cargo test --test snapshot_tests

use clustersnap::coordinator::{self, import_snapshot, SnapshotCoordinator};
use clustersnap::engine::MemoryCluster;
use clustersnap::{
    ConnectionConfig, ConnectionPool, CoordError, ExecutionContext, Operation, TableLocker, TableRef,
};
use std::sync::Arc;
use std::time::Duration;

async fn pool(cluster: &Arc<MemoryCluster>, n: usize) -> ConnectionPool {
    let config = ConnectionConfig::new("gpadmin", "sales").num_connections(n);
    ConnectionPool::connect(cluster.connector(), config).await.unwrap()
}

async fn seed(writer: &ConnectionPool) {
    writer.execute(0, "CREATE TABLE public.items (id int, qty int)").await.unwrap();
    writer
        .execute(0, "INSERT INTO public.items VALUES (1, 10), (2, 20), (3, 30)")
        .await
        .unwrap();
}

fn items() -> Vec<TableRef> {
    vec![TableRef::new(16384, "public", "items")]
}

#[tokio::test]
async fn test_snapshot_consistency_across_writes() {
    let cluster = MemoryCluster::new();
    let writer = pool(&cluster, 1).await;
    let readers = pool(&cluster, 3).await;
    seed(&writer).await;

    let coordinator = SnapshotCoordinator::new(0);
    let handle = coordinator.export(&readers).await.unwrap();

    // A third session changes the data between export and import.
    writer.execute(0, "INSERT INTO public.items VALUES (4, 40)").await.unwrap();
    writer.execute(0, "UPDATE public.items SET qty = 99 WHERE id = 1").await.unwrap();
    writer.execute(0, "DELETE FROM public.items WHERE id = 2").await.unwrap();

    coordinator.import_all(&readers, &handle).await.unwrap();

    for slot in 0..3 {
        let count = readers.execute(slot, "SELECT count(*) FROM public.items").await.unwrap();
        assert_eq!(count.first_value(), Some("3"), "slot {}", slot);
        let qty = readers
            .execute(slot, "SELECT qty FROM public.items WHERE id = 1")
            .await
            .unwrap();
        assert_eq!(qty.first_value(), Some("10"), "slot {}", slot);
        let deleted = readers
            .execute(slot, "SELECT id FROM public.items WHERE id = 2")
            .await
            .unwrap();
        assert_eq!(deleted.row_count(), 1, "slot {}", slot);
        let inserted = readers
            .execute(slot, "SELECT id FROM public.items WHERE id = 4")
            .await
            .unwrap();
        assert_eq!(inserted.row_count(), 0, "slot {}", slot);
    }

    // Once the transactions end the writes become visible.
    readers.commit_all().await.unwrap();
    let qty = readers
        .execute(1, "SELECT qty FROM public.items WHERE id = 1")
        .await
        .unwrap();
    assert_eq!(qty.first_value(), Some("99"));
    let deleted = readers
        .execute(1, "SELECT id FROM public.items WHERE id = 2")
        .await
        .unwrap();
    assert_eq!(deleted.row_count(), 0);
}

#[tokio::test]
async fn test_import_after_statement_fails() {
    let cluster = MemoryCluster::new();
    let readers = pool(&cluster, 2).await;
    let handle = SnapshotCoordinator::new(0).export(&readers).await.unwrap();

    let mut session = readers.acquire(1).await.unwrap();
    let err = import_snapshot(&mut session, &handle).await.unwrap_err();
    assert!(matches!(err, CoordError::SnapshotImport { slot: 1, .. }));

    session.begin().await.unwrap();
    session.execute("SELECT 1").await.unwrap();
    match import_snapshot(&mut session, &handle).await {
        Err(CoordError::SnapshotImport { reason, .. }) => {
            assert!(reason.contains("already executed"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_import_fails_once_exporter_ends() {
    let cluster = MemoryCluster::new();
    let readers = pool(&cluster, 3).await;
    let coordinator = SnapshotCoordinator::new(0);
    let handle = coordinator.export(&readers).await.unwrap();
    readers.acquire(0).await.unwrap().commit().await.unwrap();

    let err = coordinator.import_all(&readers, &handle).await.unwrap_err();
    match err {
        CoordError::SnapshotImport { snapshot, reason, .. } => {
            assert_eq!(snapshot, handle.to_string());
            assert!(reason.contains("invalid snapshot identifier"));
        }
        other => panic!("unexpected {:?}", other),
    }
    // Every importer was rolled back.
    for slot in 1..3 {
        assert!(!readers.acquire(slot).await.unwrap().is_in_transaction());
    }
}

#[tokio::test]
async fn test_lock_tables_in_batches() {
    let cluster = MemoryCluster::new();
    let sessions = pool(&cluster, 2).await;
    let mut tables = Vec::new();
    for i in 0..5u32 {
        sessions
            .execute(0, &format!("CREATE TABLE public.t{} (id int)", i))
            .await
            .unwrap();
        tables.push(TableRef::new(20000 + i, "public", format!("t{}", i)));
    }

    let locked = TableLocker::with_batch_size(2).lock_tables(&sessions, &tables).await.unwrap();
    assert_eq!(locked, 5);
    for slot in 0..2 {
        let session = sessions.acquire(slot).await.unwrap();
        assert!(session.is_in_transaction());
        assert_eq!(session.statements_in_transaction(), Some(3));
        assert_eq!(cluster.lock_count(session.backend_pid()), 5);
    }
}

#[tokio::test]
async fn test_freeze_shares_snapshot_and_locks() {
    let cluster = MemoryCluster::new();
    let writer = pool(&cluster, 1).await;
    let sessions = pool(&cluster, 3).await;
    seed(&writer).await;

    let ctx = ExecutionContext::current(Operation::Backup);
    let report = coordinator::freeze(&sessions, &ctx, &items(), &TableLocker::new())
        .await
        .unwrap();
    assert_eq!(report.sessions, 3);
    assert_eq!(report.tables_locked, 1);

    writer.execute(0, "INSERT INTO public.items VALUES (4, 40)").await.unwrap();
    for slot in 0..3 {
        let session = sessions.acquire(slot).await.unwrap();
        assert_eq!(cluster.lock_count(session.backend_pid()), 1);
        drop(session);
        let count = sessions.execute(slot, "SELECT count(*) FROM public.items").await.unwrap();
        assert_eq!(count.first_value(), Some("3"));
    }
    sessions.commit_all().await.unwrap();
}

#[tokio::test]
async fn test_freeze_lock_failure_rolls_back_everything() {
    let cluster = MemoryCluster::builder()
        .lock_timeout(Duration::from_millis(100))
        .build();
    let holder = pool(&cluster, 1).await;
    let sessions = pool(&cluster, 3).await;
    seed(&holder).await;

    holder.begin_all().await.unwrap();
    holder
        .execute(0, "LOCK TABLE public.items IN ACCESS EXCLUSIVE MODE")
        .await
        .unwrap();

    let ctx = ExecutionContext::current(Operation::Backup);
    let err = coordinator::freeze(&sessions, &ctx, &items(), &TableLocker::new())
        .await
        .unwrap_err();
    match err {
        CoordError::LockFailed { slot, tables, reason } => {
            assert_eq!(slot, 0);
            assert_eq!(tables, "public.items");
            assert!(reason.contains("lock timeout"));
        }
        other => panic!("unexpected {:?}", other),
    }

    for slot in 0..3 {
        let session = sessions.acquire(slot).await.unwrap();
        assert!(!session.is_in_transaction());
        assert_eq!(cluster.lock_count(session.backend_pid()), 0);
    }
}

#[tokio::test]
async fn test_nowait_lock_attempt() {
    let cluster = MemoryCluster::new();
    let holder = pool(&cluster, 1).await;
    let workers = pool(&cluster, 1).await;
    seed(&holder).await;
    let table = &items()[0];

    {
        let mut worker = workers.acquire(0).await.unwrap();
        assert!(TableLocker::try_lock_nowait(&mut worker, table).await.unwrap());
        worker.rollback().await.unwrap();
    }

    holder.begin_all().await.unwrap();
    holder
        .execute(0, "LOCK TABLE public.items IN ACCESS EXCLUSIVE MODE")
        .await
        .unwrap();

    let mut worker = workers.acquire(0).await.unwrap();
    assert!(!TableLocker::try_lock_nowait(&mut worker, table).await.unwrap());
    assert!(!worker.is_in_transaction());

    let missing = TableRef::new(1, "public", "missing");
    assert!(TableLocker::try_lock_nowait(&mut worker, &missing).await.is_err());
}
