// ============================================================================
// In-memory cluster engine
// ============================================================================
//
// A small MVCC server that speaks the subset of SQL the coordinator relies
// on: repeatable-read transactions, exported snapshots, relation locks, the
// activity view and backend termination. Sessions opened through
// `MemoryCluster::connector` behave like server connections, so everything
// above the `Connector` seam runs unchanged against it.

pub mod command;
pub mod locks;
pub mod table;
pub mod transaction;

use crate::connection::{config::ConnectionConfig, Connector, SessionHandle};
use crate::core::{CoordError, Result};
use crate::result::QueryResult;
use async_trait::async_trait;
use command::{Command, LockMode, Projection};
use locks::LockManager;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use table::{column_index, compare_values, matches_filter, Row, Table};
use tokio::sync::Notify;
use transaction::{Snapshot, TransactionManager, Xid, BOOTSTRAP_XID};

const SEGMENT_CATALOG: &str = "pg_catalog.gp_segment_configuration";
const ACTIVITY_VIEW: &str = "pg_catalog.pg_stat_activity";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

const TERMINATED: &str = "terminating connection due to administrator command";
const IN_FAILED_TRANSACTION: &str =
    "current transaction is aborted, commands ignored until end of transaction block";

/// Cancellation signal for one backend.
#[derive(Default)]
struct Signal {
    terminated: AtomicBool,
    notify: Notify,
}

impl Signal {
    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        // Stores a permit when nobody is waiting yet.
        self.notify.notify_one();
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        while !self.is_terminated() {
            self.notify.notified().await;
        }
    }
}

struct TxnState {
    xid: Xid,
    repeatable_read: bool,
    snapshot: Option<Snapshot>,
    failed: bool,
}

struct Backend {
    database: String,
    application_name: String,
    query: String,
    state: &'static str,
    txn: Option<TxnState>,
    signal: Arc<Signal>,
}

struct EngineState {
    tm: TransactionManager,
    tables: HashMap<String, Table>,
    locks: LockManager,
    backends: BTreeMap<i32, Backend>,
    next_pid: i32,
}

impl EngineState {
    fn backend(&mut self, pid: i32) -> Result<&mut Backend> {
        self.backends
            .get_mut(&pid)
            .ok_or_else(|| CoordError::ExecutionError(TERMINATED.into()))
    }

    fn resolve(&self, relation: &str) -> Option<String> {
        if self.tables.contains_key(relation) || relation == ACTIVITY_VIEW {
            return Some(relation.to_string());
        }
        let fallback = format!("pg_catalog.{}", relation.strip_prefix("public.")?);
        (self.tables.contains_key(&fallback) || fallback == ACTIVITY_VIEW).then_some(fallback)
    }

    fn table(&self, relation: &str) -> Result<&Table> {
        self.resolve(relation)
            .and_then(|name| self.tables.get(&name))
            .ok_or_else(|| relation_missing(relation))
    }

    fn table_mut(&mut self, relation: &str) -> Result<&mut Table> {
        let name = self.resolve(relation).ok_or_else(|| relation_missing(relation))?;
        self.tables.get_mut(&name).ok_or_else(|| relation_missing(relation))
    }

    /// Snapshot for the next statement of `pid`. The flag is true when the
    /// statement runs in its own implicit transaction.
    fn statement_snapshot(&mut self, pid: i32) -> Result<(Snapshot, bool)> {
        let EngineState { tm, backends, .. } = self;
        let backend = backends
            .get_mut(&pid)
            .ok_or_else(|| CoordError::ExecutionError(TERMINATED.into()))?;
        match backend.txn.as_mut() {
            Some(txn) if txn.failed => Err(CoordError::ExecutionError(IN_FAILED_TRANSACTION.into())),
            Some(txn) => {
                let snapshot = match (&txn.snapshot, txn.repeatable_read) {
                    (Some(existing), true) => existing.clone(),
                    _ => tm.snapshot(txn.xid),
                };
                txn.snapshot = Some(snapshot.clone());
                Ok((snapshot, false))
            }
            None => {
                let xid = tm.begin();
                Ok((tm.snapshot(xid), true))
            }
        }
    }

    fn terminate_backend(&mut self, pid: i32) -> bool {
        let Some(backend) = self.backends.remove(&pid) else {
            return false;
        };
        backend.signal.terminate();
        if let Some(txn) = backend.txn {
            self.tm.abort(txn.xid);
        }
        self.locks.release_all(pid);
        info!("Terminated backend {} ({})", pid, backend.application_name);
        true
    }

    fn activity(&self, legacy: bool) -> (Vec<String>, Vec<Row>) {
        let columns: Vec<String> = if legacy {
            vec!["procpid", "datname", "application_name", "current_query"]
        } else {
            vec!["pid", "datname", "application_name", "state", "query"]
        }
        .into_iter()
        .map(String::from)
        .collect();

        let rows = self
            .backends
            .iter()
            .map(|(pid, b)| {
                let mut row = vec![
                    Some(pid.to_string()),
                    Some(b.database.clone()),
                    Some(b.application_name.clone()),
                ];
                if !legacy {
                    row.push(Some(b.state.to_string()));
                }
                row.push(Some(b.query.clone()));
                row
            })
            .collect();
        (columns, rows)
    }
}

fn relation_missing(relation: &str) -> CoordError {
    let name = relation.strip_prefix("public.").unwrap_or(relation);
    CoordError::ExecutionError(format!("relation \"{}\" does not exist", name))
}

/// Options fixed when the cluster is built.
#[derive(Debug, Clone)]
struct EngineOptions {
    lock_timeout: Duration,
    legacy_activity_columns: bool,
    max_connections: Option<usize>,
}

/// Builder for [`MemoryCluster`].
pub struct MemoryClusterBuilder {
    options: EngineOptions,
    coordinator_data_dir: PathBuf,
    segments: Vec<(i32, String, PathBuf)>,
}

impl MemoryClusterBuilder {
    /// How long a lock request waits for conflicting holders.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.options.lock_timeout = timeout;
        self
    }

    /// Expose `procpid` and `current_query` instead of `pid`, `state` and
    /// `query`, like servers before 9.2.
    pub fn legacy_activity_columns(mut self) -> Self {
        self.options.legacy_activity_columns = true;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.options.max_connections = Some(n);
        self
    }

    pub fn coordinator_data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.coordinator_data_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Register a primary segment in the cluster catalog.
    pub fn segment(mut self, content_id: i32, hostname: &str, data_dir: impl AsRef<Path>) -> Self {
        self.segments
            .push((content_id, hostname.to_string(), data_dir.as_ref().to_path_buf()));
        self
    }

    pub fn build(self) -> Arc<MemoryCluster> {
        let mut tm = TransactionManager::new();
        let bootstrap = tm.snapshot(BOOTSTRAP_XID);

        let mut catalog = Table::new(
            SEGMENT_CATALOG,
            ["dbid", "content", "role", "preferred_role", "mode", "status", "port", "hostname", "address", "datadir"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
        );
        let coordinator = (-1, "localhost".to_string(), self.coordinator_data_dir);
        for (dbid, (content, hostname, data_dir)) in std::iter::once(coordinator)
            .chain(self.segments)
            .enumerate()
        {
            let row = vec![
                Some((dbid + 1).to_string()),
                Some(content.to_string()),
                Some("p".into()),
                Some("p".into()),
                Some("s".into()),
                Some("u".into()),
                Some((6000 + content + 1).to_string()),
                Some(hostname.clone()),
                Some(hostname),
                Some(data_dir.to_string_lossy().into_owned()),
            ];
            // Column count is fixed above.
            let _ = catalog.insert(row, &bootstrap);
        }

        let mut tables = HashMap::new();
        tables.insert(SEGMENT_CATALOG.to_string(), catalog);

        Arc::new(MemoryCluster {
            state: Mutex::new(EngineState {
                tm,
                tables,
                locks: LockManager::new(),
                backends: BTreeMap::new(),
                next_pid: 10_000,
            }),
            options: self.options,
        })
    }
}

/// In-process stand-in for a database cluster.
///
/// # Examples
///
/// ```
/// use clustersnap::engine::MemoryCluster;
///
/// let cluster = MemoryCluster::builder().segment(0, "sdw1", "/data/primary/gpseg0").build();
/// assert_eq!(cluster.session_count(), 0);
/// ```
pub struct MemoryCluster {
    state: Mutex<EngineState>,
    options: EngineOptions,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn builder() -> MemoryClusterBuilder {
        MemoryClusterBuilder {
            options: EngineOptions {
                lock_timeout: Duration::from_secs(1),
                legacy_activity_columns: false,
                max_connections: None,
            },
            coordinator_data_dir: PathBuf::from("/data/coordinator/gpseg-1"),
            segments: Vec::new(),
        }
    }

    /// Connector opening sessions against this cluster.
    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            cluster: Arc::clone(self),
        })
    }

    /// Number of live backends.
    pub fn session_count(&self) -> usize {
        self.lock_state().backends.len()
    }

    /// Backends whose application name equals `name`.
    pub fn sessions_with_application_name(&self, name: &str) -> usize {
        self.lock_state()
            .backends
            .values()
            .filter(|b| b.application_name == name)
            .count()
    }

    /// Locks held by one backend.
    pub fn lock_count(&self, pid: i32) -> usize {
        self.lock_state().locks.lock_count(pid)
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_backend(&self, config: &ConnectionConfig) -> Result<(i32, Arc<Signal>)> {
        let mut state = self.lock_state();
        if let Some(max) = self.options.max_connections {
            if state.backends.len() >= max {
                return Err(CoordError::ExecutionError(
                    "sorry, too many clients already".into(),
                ));
            }
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        let signal = Arc::new(Signal::default());
        state.backends.insert(
            pid,
            Backend {
                database: config.database.clone(),
                application_name: config.application_name.clone(),
                query: String::new(),
                state: "idle",
                txn: None,
                signal: Arc::clone(&signal),
            },
        );
        debug!("Backend {} connected to {}", pid, config.database);
        Ok((pid, signal))
    }

    fn close_backend(&self, pid: i32) {
        let mut state = self.lock_state();
        if let Some(backend) = state.backends.remove(&pid) {
            if let Some(txn) = backend.txn {
                state.tm.abort(txn.xid);
            }
            state.locks.release_all(pid);
        }
    }

    fn set_activity(&self, pid: i32, query: &str) -> Result<()> {
        let mut state = self.lock_state();
        let backend = state.backend(pid)?;
        backend.query = query.to_string();
        backend.state = "active";
        Ok(())
    }

    fn finish_activity(&self, pid: i32) {
        let mut state = self.lock_state();
        if let Ok(backend) = state.backend(pid) {
            backend.state = if backend.txn.is_some() {
                "idle in transaction"
            } else {
                "idle"
            };
        }
    }

    /// Bookkeeping after every statement: failures poison an open
    /// transaction, and locks outside a transaction are released.
    fn end_statement(&self, pid: i32, failed: bool) {
        let mut state = self.lock_state();
        let in_txn = match state.backends.get_mut(&pid) {
            Some(backend) => match backend.txn.as_mut() {
                Some(txn) => {
                    txn.failed |= failed;
                    true
                }
                None => false,
            },
            None => return,
        };
        if !in_txn {
            state.locks.release_all(pid);
        }
    }

    async fn execute(&self, pid: i32, signal: &Signal, sql: &str) -> Result<QueryResult> {
        if signal.is_terminated() {
            return Err(CoordError::ExecutionError(TERMINATED.into()));
        }
        let result = match command::parse(sql) {
            Ok(cmd) => self.run(pid, signal, cmd).await,
            Err(e) => Err(e),
        };
        self.end_statement(pid, result.is_err());
        result
    }

    /// Run `f` with the statement's snapshot, committing or aborting the
    /// implicit transaction when there is no explicit one.
    fn with_snapshot<T>(
        &self,
        pid: i32,
        f: impl FnOnce(&mut EngineState, &Snapshot) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock_state();
        let (snapshot, implicit) = state.statement_snapshot(pid)?;
        let result = f(&mut state, &snapshot);
        if implicit {
            match result {
                Ok(_) => state.tm.commit(snapshot.tx_id),
                Err(_) => state.tm.abort(snapshot.tx_id),
            }
        }
        result
    }

    fn check_not_failed(&self, pid: i32) -> Result<()> {
        let mut state = self.lock_state();
        match state.backend(pid)?.txn.as_ref() {
            Some(txn) if txn.failed => Err(CoordError::ExecutionError(IN_FAILED_TRANSACTION.into())),
            _ => Ok(()),
        }
    }

    async fn acquire_locks(
        &self,
        pid: i32,
        signal: &Signal,
        relations: &[String],
        mode: LockMode,
        nowait: bool,
    ) -> Result<()> {
        for relation in relations {
            let deadline = Instant::now() + self.options.lock_timeout;
            loop {
                let attempt = {
                    let mut state = self.lock_state();
                    state.backend(pid)?;
                    let name = state.resolve(relation).ok_or_else(|| relation_missing(relation))?;
                    state.locks.try_acquire(pid, &name, mode)
                };
                let Err(holder) = attempt else {
                    break;
                };

                let display = relation.strip_prefix("public.").unwrap_or(relation);
                if nowait {
                    return Err(CoordError::ExecutionError(format!(
                        "could not obtain lock on relation \"{}\"",
                        display
                    )));
                }
                if Instant::now() >= deadline {
                    return Err(CoordError::ExecutionError(format!(
                        "canceling statement due to lock timeout on \"{}\" (held by {})",
                        display, holder
                    )));
                }
                tokio::select! {
                    _ = signal.notify.notified() => {}
                    _ = tokio::time::sleep(LOCK_POLL_INTERVAL) => {}
                }
                if signal.is_terminated() {
                    return Err(CoordError::ExecutionError(TERMINATED.into()));
                }
            }
        }
        Ok(())
    }

    async fn run(&self, pid: i32, signal: &Signal, cmd: Command) -> Result<QueryResult> {
        match cmd {
            Command::Begin { repeatable_read } => {
                let mut state = self.lock_state();
                let EngineState { tm, backends, .. } = &mut *state;
                let backend = backends
                    .get_mut(&pid)
                    .ok_or_else(|| CoordError::ExecutionError(TERMINATED.into()))?;
                if backend.txn.is_none() {
                    backend.txn = Some(TxnState {
                        xid: tm.begin(),
                        repeatable_read,
                        snapshot: None,
                        failed: false,
                    });
                }
                Ok(QueryResult::empty())
            }
            Command::Commit | Command::Rollback => {
                let commit = matches!(cmd, Command::Commit);
                let mut state = self.lock_state();
                let txn = state.backend(pid)?.txn.take();
                if let Some(txn) = txn {
                    if commit && !txn.failed {
                        state.tm.commit(txn.xid);
                    } else {
                        state.tm.abort(txn.xid);
                    }
                    state.locks.release_all(pid);
                }
                Ok(QueryResult::empty())
            }
            Command::ImportSnapshot(id) => {
                let mut state = self.lock_state();
                let exported = state.tm.lookup_export(&id).cloned();
                let txn = state.backend(pid)?.txn.as_mut().ok_or_else(|| {
                    CoordError::ExecutionError(
                        "SET TRANSACTION SNAPSHOT can only be used in transaction blocks".into(),
                    )
                })?;
                if txn.failed {
                    return Err(CoordError::ExecutionError(IN_FAILED_TRANSACTION.into()));
                }
                if txn.snapshot.is_some() {
                    return Err(CoordError::ExecutionError(
                        "SET TRANSACTION SNAPSHOT must be called before any query".into(),
                    ));
                }
                if !txn.repeatable_read {
                    return Err(CoordError::ExecutionError(
                        "a snapshot-importing transaction must have isolation level SERIALIZABLE or REPEATABLE READ".into(),
                    ));
                }
                let exported = exported.ok_or_else(|| {
                    CoordError::ExecutionError(format!("invalid snapshot identifier: \"{}\"", id))
                })?;
                txn.snapshot = Some(exported.for_transaction(txn.xid));
                Ok(QueryResult::empty())
            }
            Command::SetApplicationName(name) => {
                self.check_not_failed(pid)?;
                self.lock_state().backend(pid)?.application_name = name;
                Ok(QueryResult::empty())
            }
            Command::SetOther | Command::CreateSchema | Command::Utility => {
                self.check_not_failed(pid)?;
                Ok(QueryResult::empty())
            }
            Command::ExportSnapshot => self.with_snapshot(pid, |state, snapshot| {
                let id = state.tm.export(snapshot);
                Ok(single_value("pg_export_snapshot", Some(id)))
            }),
            Command::Lock { tables, mode, nowait } => {
                self.check_not_failed(pid)?;
                if self.lock_state().backend(pid)?.txn.is_none() {
                    return Err(CoordError::ExecutionError(
                        "LOCK TABLE can only be used in transaction blocks".into(),
                    ));
                }
                self.acquire_locks(pid, signal, &tables, mode, nowait).await?;
                Ok(QueryResult::empty())
            }
            Command::CreateTable {
                table,
                columns,
                if_not_exists,
            } => self.with_snapshot(pid, |state, _| {
                if state.resolve(&table).is_some() {
                    if if_not_exists {
                        return Ok(QueryResult::empty());
                    }
                    let name = table.strip_prefix("public.").unwrap_or(&table);
                    return Err(CoordError::ExecutionError(format!(
                        "relation \"{}\" already exists",
                        name
                    )));
                }
                state.tables.insert(table.clone(), Table::new(table, columns));
                Ok(QueryResult::empty())
            }),
            Command::DropTable { table, if_exists } => {
                self.check_not_failed(pid)?;
                if self.lock_state().resolve(&table).is_none() {
                    return if if_exists {
                        Ok(QueryResult::empty())
                    } else {
                        Err(relation_missing(&table))
                    };
                }
                self.acquire_locks(pid, signal, std::slice::from_ref(&table), LockMode::AccessExclusive, false)
                    .await?;
                self.with_snapshot(pid, |state, _| {
                    if let Some(name) = state.resolve(&table) {
                        state.tables.remove(&name);
                    }
                    Ok(QueryResult::empty())
                })
            }
            Command::AlterTable { table } => {
                self.check_not_failed(pid)?;
                self.acquire_locks(pid, signal, std::slice::from_ref(&table), LockMode::AccessExclusive, false)
                    .await?;
                self.with_snapshot(pid, |state, _| state.table(&table).map(|_| QueryResult::empty()))
            }
            Command::Truncate { table } => {
                self.check_not_failed(pid)?;
                self.acquire_locks(pid, signal, std::slice::from_ref(&table), LockMode::AccessExclusive, false)
                    .await?;
                self.with_snapshot(pid, |state, snapshot| {
                    let name = state.resolve(&table).ok_or_else(|| relation_missing(&table))?;
                    let EngineState { tm, tables, .. } = state;
                    let target = tables.get_mut(&name).ok_or_else(|| relation_missing(&table))?;
                    target.modify(&[], None, snapshot, tm)?;
                    Ok(QueryResult::empty())
                })
            }
            Command::Insert { table, columns, rows } => self.with_snapshot(pid, |state, snapshot| {
                let target = state.table_mut(&table)?;
                let count = rows.len() as u64;
                for values in rows {
                    let row = match &columns {
                        None => values,
                        Some(names) => {
                            let mut row = vec![None; target.columns().len()];
                            for (name, value) in names.iter().zip(values) {
                                row[target.column_index(name)?] = value;
                            }
                            row
                        }
                    };
                    target.insert(row, snapshot)?;
                }
                Ok(QueryResult::command(count))
            }),
            Command::Update {
                table,
                assignments,
                filter,
            } => self.with_snapshot(pid, |state, snapshot| {
                let name = state.resolve(&table).ok_or_else(|| relation_missing(&table))?;
                let EngineState { tm, tables, .. } = state;
                let target = tables.get_mut(&name).ok_or_else(|| relation_missing(&table))?;
                let resolved = assignments
                    .into_iter()
                    .map(|(column, value)| Ok((target.column_index(&column)?, value)))
                    .collect::<Result<Vec<_>>>()?;
                let changed = target.modify(&filter, Some(&resolved), snapshot, tm)?;
                Ok(QueryResult::command(changed))
            }),
            Command::Delete { table, filter } => self.with_snapshot(pid, |state, snapshot| {
                let name = state.resolve(&table).ok_or_else(|| relation_missing(&table))?;
                let EngineState { tm, tables, .. } = state;
                let target = tables.get_mut(&name).ok_or_else(|| relation_missing(&table))?;
                let changed = target.modify(&filter, None, snapshot, tm)?;
                Ok(QueryResult::command(changed))
            }),
            Command::Select {
                projection,
                table,
                filter,
                order_by,
                limit,
            } => {
                let legacy = self.options.legacy_activity_columns;
                self.with_snapshot(pid, |state, snapshot| {
                    let (columns, rows) = if state.resolve(&table).as_deref() == Some(ACTIVITY_VIEW) {
                        state.activity(legacy)
                    } else {
                        let source = state.table(&table)?;
                        (source.columns().to_vec(), source.scan(snapshot))
                    };

                    for condition in &filter {
                        column_index(&columns, &condition.column)?;
                    }
                    let mut selected = Vec::new();
                    for row in rows {
                        if matches_filter(&columns, &row, &filter, pid)? {
                            selected.push(row);
                        }
                    }
                    if let Some((column, descending)) = order_by {
                        let idx = column_index(&columns, &column)?;
                        selected.sort_by(|a, b| compare_values(&a[idx], &b[idx]));
                        if descending {
                            selected.reverse();
                        }
                    }
                    if let Some(limit) = limit {
                        selected.truncate(limit);
                    }

                    project(state, columns, selected, projection)
                })
            }
            Command::SelectLiteral(values) => self.with_snapshot(pid, |_, _| {
                let columns = vec!["?column?".to_string(); values.len()];
                Ok(QueryResult::new(columns, vec![values]))
            }),
            Command::BackendPid => {
                self.check_not_failed(pid)?;
                Ok(single_value("pg_backend_pid", Some(pid.to_string())))
            }
            Command::Sleep(secs) => {
                self.with_snapshot(pid, |_, _| Ok(()))?;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => {
                        Ok(single_value("pg_sleep", Some(String::new())))
                    }
                    _ = signal.wait() => Err(CoordError::ExecutionError(TERMINATED.into())),
                }
            }
            Command::CopyProgram { table, program } => {
                self.check_not_failed(pid)?;
                self.acquire_locks(pid, signal, std::slice::from_ref(&table), LockMode::AccessShare, false)
                    .await?;
                self.with_snapshot(pid, |state, _| state.table(&table).map(|_| ()))?;
                // Nothing ever opens the other end of the program's pipe.
                debug!("Backend {} waiting on program: {}", pid, program);
                signal.wait().await;
                Err(CoordError::ExecutionError(TERMINATED.into()))
            }
        }
    }
}

fn single_value(column: &str, value: Option<String>) -> QueryResult {
    QueryResult::new(vec![column.to_string()], vec![vec![value]])
}

fn project(
    state: &mut EngineState,
    columns: Vec<String>,
    rows: Vec<Row>,
    projection: Projection,
) -> Result<QueryResult> {
    match projection {
        Projection::Star => Ok(QueryResult::new(columns, rows)),
        Projection::CountStar => Ok(single_value("count", Some(rows.len().to_string()))),
        Projection::Columns(names) => {
            let indices = names
                .iter()
                .map(|n| column_index(&columns, n))
                .collect::<Result<Vec<_>>>()?;
            let projected = rows
                .into_iter()
                .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                .collect();
            Ok(QueryResult::new(names, projected))
        }
        Projection::TerminateBackend(column) => {
            let idx = column_index(&columns, &column)?;
            let results = rows
                .iter()
                .filter_map(|row| row[idx].as_deref().and_then(|v| v.parse::<i32>().ok()))
                .map(|target| {
                    let ok = state.terminate_backend(target);
                    vec![Some(if ok { "t" } else { "f" }.to_string())]
                })
                .collect();
            Ok(QueryResult::new(vec!["pg_terminate_backend".into()], results))
        }
    }
}

struct MemoryConnector {
    cluster: Arc<MemoryCluster>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn SessionHandle>> {
        let (pid, signal) = self.cluster.open_backend(config)?;
        Ok(Box::new(MemorySession {
            cluster: Arc::clone(&self.cluster),
            pid,
            signal,
            closed: false,
        }))
    }
}

struct MemorySession {
    cluster: Arc<MemoryCluster>,
    pid: i32,
    signal: Arc<Signal>,
    closed: bool,
}

#[async_trait]
impl SessionHandle for MemorySession {
    async fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        if self.closed {
            return Err(CoordError::ExecutionError("Connection is closed".into()));
        }
        if self.signal.is_terminated() {
            return Err(CoordError::ExecutionError(
                "server closed the connection unexpectedly".into(),
            ));
        }
        self.cluster.set_activity(self.pid, sql)?;

        let mut last = QueryResult::empty();
        for statement in command::split_statements(sql) {
            match self.cluster.execute(self.pid, &self.signal, &statement).await {
                Ok(result) => last = result,
                Err(e) => {
                    self.cluster.finish_activity(self.pid);
                    return Err(e);
                }
            }
        }
        self.cluster.finish_activity(self.pid);
        Ok(last)
    }

    fn backend_pid(&self) -> i32 {
        self.pid
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.cluster.close_backend(self.pid);
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            self.cluster.close_backend(self.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(cluster: &Arc<MemoryCluster>) -> Box<dyn SessionHandle> {
        let config = ConnectionConfig::new("gpadmin", "testdb").application_name("engine_test");
        cluster.connector().connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_autocommit_visibility() {
        let cluster = MemoryCluster::new();
        let mut a = open(&cluster).await;
        let mut b = open(&cluster).await;

        a.simple_query("CREATE TABLE t (a int)").await.unwrap();
        a.simple_query("INSERT INTO t VALUES (1), (2)").await.unwrap();
        let count = b.simple_query("SELECT count(*) FROM public.t").await.unwrap();
        assert_eq!(count.first_value(), Some("2"));
    }

    #[tokio::test]
    async fn test_repeatable_read_holds_view() {
        let cluster = MemoryCluster::new();
        let mut reader = open(&cluster).await;
        let mut writer = open(&cluster).await;
        writer.simple_query("CREATE TABLE t (a int)").await.unwrap();

        reader.simple_query("BEGIN ISOLATION LEVEL REPEATABLE READ").await.unwrap();
        reader.simple_query("SELECT count(*) FROM t").await.unwrap();
        writer.simple_query("INSERT INTO t VALUES (1)").await.unwrap();

        let seen = reader.simple_query("SELECT count(*) FROM t").await.unwrap();
        assert_eq!(seen.first_value(), Some("0"));
        reader.simple_query("COMMIT").await.unwrap();
        let seen = reader.simple_query("SELECT count(*) FROM t").await.unwrap();
        assert_eq!(seen.first_value(), Some("1"));
    }

    #[tokio::test]
    async fn test_snapshot_export_and_import() {
        let cluster = MemoryCluster::new();
        let mut exporter = open(&cluster).await;
        let mut importer = open(&cluster).await;
        let mut writer = open(&cluster).await;
        writer.simple_query("CREATE TABLE t (a int)").await.unwrap();

        exporter.simple_query("BEGIN ISOLATION LEVEL REPEATABLE READ").await.unwrap();
        let id = exporter
            .simple_query("SELECT pg_export_snapshot()")
            .await
            .unwrap()
            .first_value()
            .unwrap()
            .to_string();
        writer.simple_query("INSERT INTO t VALUES (1)").await.unwrap();

        importer.simple_query("BEGIN ISOLATION LEVEL REPEATABLE READ").await.unwrap();
        importer
            .simple_query(&format!("SET TRANSACTION SNAPSHOT '{}'", id))
            .await
            .unwrap();
        let seen = importer.simple_query("SELECT count(*) FROM t").await.unwrap();
        assert_eq!(seen.first_value(), Some("0"));

        // Exports die with their transaction.
        exporter.simple_query("COMMIT").await.unwrap();
        let mut late = open(&cluster).await;
        late.simple_query("BEGIN ISOLATION LEVEL REPEATABLE READ").await.unwrap();
        let err = late
            .simple_query(&format!("SET TRANSACTION SNAPSHOT '{}'", id))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid snapshot identifier"));
    }

    #[tokio::test]
    async fn test_import_must_come_first() {
        let cluster = MemoryCluster::new();
        let mut exporter = open(&cluster).await;
        let mut importer = open(&cluster).await;
        exporter.simple_query("BEGIN ISOLATION LEVEL REPEATABLE READ").await.unwrap();
        let id = exporter.simple_query("SELECT pg_export_snapshot()").await.unwrap();
        let id = id.first_value().unwrap();

        importer.simple_query("BEGIN ISOLATION LEVEL REPEATABLE READ").await.unwrap();
        importer.simple_query("SELECT 1").await.unwrap();
        let err = importer
            .simple_query(&format!("SET TRANSACTION SNAPSHOT '{}'", id))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("before any query"));
    }

    #[tokio::test]
    async fn test_lock_conflict_nowait_and_timeout() {
        let cluster = MemoryCluster::builder()
            .lock_timeout(Duration::from_millis(50))
            .build();
        let mut holder = open(&cluster).await;
        let mut other = open(&cluster).await;
        holder.simple_query("CREATE TABLE t (a int)").await.unwrap();

        holder.simple_query("BEGIN").await.unwrap();
        holder.simple_query("LOCK TABLE t IN ACCESS EXCLUSIVE MODE").await.unwrap();
        assert_eq!(cluster.lock_count(holder.backend_pid()), 1);

        other.simple_query("BEGIN").await.unwrap();
        let err = other
            .simple_query("LOCK TABLE t IN ACCESS SHARE MODE NOWAIT")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("could not obtain lock"));
        other.simple_query("ROLLBACK").await.unwrap();

        other.simple_query("BEGIN").await.unwrap();
        let err = other.simple_query("LOCK TABLE t IN ACCESS SHARE MODE").await.unwrap_err();
        assert!(err.to_string().contains("lock timeout"));
        other.simple_query("ROLLBACK").await.unwrap();

        holder.simple_query("COMMIT").await.unwrap();
        assert_eq!(cluster.lock_count(holder.backend_pid()), 0);
    }

    #[tokio::test]
    async fn test_lock_requires_transaction() {
        let cluster = MemoryCluster::new();
        let mut s = open(&cluster).await;
        s.simple_query("CREATE TABLE t (a int)").await.unwrap();
        assert!(s.simple_query("LOCK TABLE t IN ACCESS SHARE MODE").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_transaction_rejects_statements() {
        let cluster = MemoryCluster::new();
        let mut s = open(&cluster).await;
        s.simple_query("BEGIN").await.unwrap();
        assert!(s.simple_query("SELECT * FROM missing").await.is_err());
        let err = s.simple_query("SELECT 1").await.unwrap_err();
        assert!(err.to_string().contains("current transaction is aborted"));
        s.simple_query("ROLLBACK").await.unwrap();
        assert!(s.simple_query("SELECT 1").await.is_ok());
    }

    #[tokio::test]
    async fn test_terminate_interrupts_sleep() {
        let cluster = MemoryCluster::new();
        let mut victim = open(&cluster).await;
        let mut killer = open(&cluster).await;

        let sleeper = tokio::spawn(async move {
            let result = victim.simple_query("SELECT pg_sleep(30)").await;
            (result, victim)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let killed = killer
            .simple_query(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE application_name = 'engine_test' AND query LIKE '%pg_sleep%' AND pid <> pg_backend_pid()",
            )
            .await
            .unwrap();
        assert_eq!(killed.row_count(), 1);

        let (result, mut victim) = sleeper.await.unwrap();
        assert!(result.unwrap_err().to_string().contains("administrator command"));
        assert!(victim.simple_query("SELECT 1").await.is_err());
        assert_eq!(cluster.session_count(), 1);
    }

    #[tokio::test]
    async fn test_legacy_activity_columns() {
        let cluster = MemoryCluster::builder().legacy_activity_columns().build();
        let mut s = open(&cluster).await;
        assert!(s
            .simple_query("SELECT pid FROM pg_stat_activity")
            .await
            .is_err());
        let rows = s
            .simple_query("SELECT procpid FROM pg_stat_activity WHERE current_query LIKE '%procpid%'")
            .await
            .unwrap();
        assert_eq!(rows.first_value(), Some(s.backend_pid().to_string().as_str()));
    }

    #[tokio::test]
    async fn test_segment_catalog() {
        let cluster = MemoryCluster::builder()
            .coordinator_data_dir("/tmp/coord")
            .segment(0, "sdw1", "/data/gpseg0")
            .build();
        let mut s = open(&cluster).await;
        let dir = s
            .simple_query("select datadir from gp_segment_configuration where content=-1 and role='p'")
            .await
            .unwrap();
        assert_eq!(dir.first_value(), Some("/tmp/coord"));
        let hosts = s
            .simple_query("SELECT hostname FROM gp_segment_configuration WHERE content <> -1")
            .await
            .unwrap();
        assert_eq!(hosts.column_values(0), vec!["sdw1"]);
    }

    #[tokio::test]
    async fn test_max_connections() {
        let cluster = MemoryCluster::builder().max_connections(1).build();
        let _first = open(&cluster).await;
        let config = ConnectionConfig::new("gpadmin", "testdb");
        assert!(cluster.connector().connect(&config).await.is_err());
    }
}
