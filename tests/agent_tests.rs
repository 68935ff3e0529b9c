/// Segment agent tests
///
/// Tests for oid manifest distribution and hanging transfer session cleanup
/// Run with: cargo test --test agent_tests

use clustersnap::agent::{AgentDistributor, HangingSessionReaper, ReapScope};
use clustersnap::cluster::{Cluster, FilePathInfo, LocalExecutor, SegmentNode};
use clustersnap::core::{OidManifest, RunFingerprint};
use clustersnap::engine::MemoryCluster;
use clustersnap::{
    ConnectionConfig, ConnectionPool, CoordError, Coordinator, ExecutionContext, Operation,
    TableLocker, TableRef,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TAG: &str = "gprestore_20240101120000_4242";

fn paths() -> FilePathInfo {
    FilePathInfo::new(RunFingerprint::new(4242, "20240101120000")).with_prefix("gprestore")
}

fn local_cluster(dirs: &[TempDir]) -> Cluster {
    Cluster::new(
        SegmentNode::new(-1, "localhost", "/unused"),
        dirs.iter()
            .enumerate()
            .map(|(i, d)| SegmentNode::new(i as i32, "localhost", d.path()))
            .collect(),
    )
}

async fn tagged_pool(cluster: &Arc<MemoryCluster>, n: usize) -> ConnectionPool {
    let config = ConnectionConfig::new("gpadmin", "restoredb")
        .application_name(TAG)
        .num_connections(n);
    ConnectionPool::connect(cluster.connector(), config).await.unwrap()
}

#[tokio::test]
async fn test_distribute_writes_identical_files() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let cluster = local_cluster(&dirs);
    let template = paths().oid_file_template();
    let manifest = OidManifest::new([16384, 16385, 20001]);

    let output = AgentDistributor::new(Arc::new(LocalExecutor))
        .distribute(&manifest, &cluster, &template)
        .await
        .unwrap();
    assert_eq!(output.len(), 3);

    for node in cluster.segments() {
        let path = template.render(node);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("gprestore_{}_20240101120000_oid_4242", node.content_id)
        );
        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, b"16384\n16385\n20001\n");
        assert_eq!(OidManifest::parse(std::str::from_utf8(&written).unwrap()).unwrap(), manifest);
    }
}

#[tokio::test]
async fn test_distribute_reports_failed_nodes() {
    let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
    let mut nodes: Vec<SegmentNode> = dirs
        .iter()
        .enumerate()
        .map(|(i, d)| SegmentNode::new(i as i32, "localhost", d.path()))
        .collect();
    nodes.push(SegmentNode::new(2, "sdw9", dirs[0].path().join("no/such/dir")));
    let cluster = Cluster::new(SegmentNode::new(-1, "localhost", "/unused"), nodes);
    let template = paths().oid_file_template();

    let err = AgentDistributor::new(Arc::new(LocalExecutor))
        .distribute(&OidManifest::new([1]), &cluster, &template)
        .await
        .unwrap_err();
    match &err {
        CoordError::Distribution { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].content_id, 2);
            assert_eq!(failures[0].host, "sdw9");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(err.to_string().contains("sdw9"));

    // Healthy nodes were still written.
    for node in &cluster.segments()[..2] {
        assert!(template.render(node).exists());
    }
}

#[tokio::test]
async fn test_remove_all_reports_failed_nodes() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let cluster = local_cluster(&dirs);
    let template = paths().oid_file_template();
    let distributor = AgentDistributor::new(Arc::new(LocalExecutor));
    distributor
        .distribute(&OidManifest::new([1]), &cluster, &template)
        .await
        .unwrap();

    // A directory in place of segment 1's file makes `rm -f` fail there.
    let blocked = template.render(&cluster.segments()[1]);
    std::fs::remove_file(&blocked).unwrap();
    std::fs::create_dir(&blocked).unwrap();

    let err = distributor.remove_all(&cluster, &template).await.unwrap_err();
    match &err {
        CoordError::Distribution { message, failures } => {
            assert!(message.contains("Unable to remove oid list"));
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].content_id, 1);
            assert_eq!(failures[0].host, "localhost");
        }
        other => panic!("unexpected {:?}", other),
    }

    assert!(blocked.is_dir());
    for node in [&cluster.segments()[0], &cluster.segments()[2]] {
        assert!(!template.render(node).exists());
    }
}

#[tokio::test]
async fn test_reaper_without_hanging_sessions() {
    let cluster = MemoryCluster::new();
    let pool = tagged_pool(&cluster, 2).await;
    let reaper = HangingSessionReaper::new(paths(), TAG);

    for _ in 0..2 {
        let report = reaper.terminate(&pool).await.unwrap();
        assert_eq!(report.terminated, 0);
        assert_eq!(report.scope, ReapScope::Full);
    }
    assert_eq!(cluster.sessions_with_application_name(TAG), 2);
}

#[tokio::test]
async fn test_terminate_on_refuses_session_in_transaction() {
    let cluster = MemoryCluster::new();
    let pool = tagged_pool(&cluster, 1).await;
    pool.begin_all().await.unwrap();

    let reaper = HangingSessionReaper::new(paths(), TAG);
    let mut session = pool.acquire(0).await.unwrap();
    assert!(reaper.terminate_on(&mut session).await.is_err());
    assert!(session.is_in_transaction());
    assert!(!session.is_transaction_failed());
}

#[tokio::test]
async fn test_reaper_works_while_pool_is_frozen() {
    let cluster = MemoryCluster::new();
    let config = ConnectionConfig::new("gpadmin", "sales").num_connections(2);
    let ctx = ExecutionContext::new(Operation::Backup, RunFingerprint::new(4242, "20240101120000"))
        .with_application_tag("gpbackup_20240101120000_4242");
    let run = Coordinator::connect(cluster.connector(), config, ctx).await.unwrap();
    run.pool().execute(0, "CREATE TABLE public.orders (id int)").await.unwrap();

    let tables = vec![TableRef::new(16384, "public", "orders")];
    run.freeze(&tables, &TableLocker::new()).await.unwrap();
    assert_eq!(run.reap().await.unwrap().terminated, 0);

    let copy = format!(
        "COPY public.orders TO PROGRAM 'cat > {}' WITH CSV DELIMITER ',' ON SEGMENT",
        run.context().file_paths().pipe_path_for_copy_command()
    );
    let err = run
        .reaper()
        .with_drain_grace(Duration::from_secs(2))
        .watch(run.pool(), Duration::from_millis(200), async {
            run.pool().execute(1, &copy).await.map(|_| ())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::TransferTimedOut { terminated: 1, .. }));

    // The control session keeps its frozen view and the reaper left nothing behind.
    let control = run.pool().acquire(0).await.unwrap();
    assert!(control.is_in_transaction());
    assert!(!control.is_transaction_failed());
    assert_eq!(cluster.sessions_with_application_name("gpbackup_20240101120000_4242"), 1);
    assert_eq!(cluster.session_count(), 1);
}

async fn watch_hanging_copy(cluster: &Arc<MemoryCluster>) -> (CoordError, usize) {
    let pool = tagged_pool(cluster, 2).await;
    pool.execute(0, "CREATE TABLE public.t (id int)").await.unwrap();

    let copy = format!(
        "COPY public.t TO PROGRAM 'cat > {}' WITH CSV DELIMITER ',' ON SEGMENT",
        paths().pipe_path_for_copy_command()
    );
    let transfer = async { pool.execute(1, &copy).await.map(|_| ()) };

    let reaper = HangingSessionReaper::new(paths(), TAG).with_drain_grace(Duration::from_secs(2));
    let err = reaper
        .watch(&pool, Duration::from_millis(200), transfer)
        .await
        .unwrap_err();
    (err, cluster.sessions_with_application_name(TAG))
}

#[tokio::test]
async fn test_watch_terminates_hanging_transfer() {
    let cluster = MemoryCluster::new();
    let (err, remaining) = watch_hanging_copy(&cluster).await;
    match err {
        CoordError::TransferTimedOut { timeout_secs, terminated } => {
            assert_eq!(terminated, 1);
            assert!((timeout_secs - 0.2).abs() < 1e-9);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(remaining, 1);
}

#[tokio::test]
async fn test_watch_with_legacy_activity_columns() {
    let cluster = MemoryCluster::builder().legacy_activity_columns().build();
    let (err, remaining) = watch_hanging_copy(&cluster).await;
    assert!(matches!(err, CoordError::TransferTimedOut { terminated: 1, .. }));
    assert_eq!(remaining, 1);
}

#[tokio::test]
async fn test_watch_passes_through_fast_transfer() {
    let cluster = MemoryCluster::new();
    let pool = tagged_pool(&cluster, 2).await;
    let reaper = HangingSessionReaper::new(paths(), TAG);

    let value = reaper
        .watch(&pool, Duration::from_secs(5), async {
            pool.execute(1, "SELECT 7").await.map(|r| r.first_value().map(str::to_string))
        })
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("7"));
}
