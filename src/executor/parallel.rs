// ============================================================================
// Statement executor
// ============================================================================
//
// Runs an ordered list of typed statements on a pool, either on one session
// in input order or spread across idle sessions. Parallel dispatch is a
// single channel fed by a dispatcher and drained by one worker per session;
// every future is joined before `execute` returns.

use super::progress::{ProgressMode, ProgressReporter};
use crate::connection::pool::ConnectionPool;
use crate::core::{CoordError, ObjectFilter, Result, StatementWithType};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Pause between parallel dispatches. Statements touching the same relation
/// (e.g. two CREATE INDEX) can deadlock on exclusive locks when started at
/// the same instant.
pub const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// One session, input order.
    Serial { slot: usize },
    /// One worker per session, minus the reserved slots.
    Parallel { reserved_slots: Vec<usize> },
}

impl ExecutionMode {
    pub fn parallel() -> Self {
        ExecutionMode::Parallel {
            reserved_slots: Vec::new(),
        }
    }
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Serial { slot: 0 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorPolicy {
    /// Stop dispatching after the first failure and fail the run.
    #[default]
    Stop,
    /// Record every failure and keep going.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    Pending,
    Running,
    Completed,
    Failed,
    /// Excluded by the object filter.
    Filtered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Draining,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementFailure {
    pub index: usize,
    pub object_type: String,
    pub statement: String,
    pub error: String,
}

impl StatementFailure {
    fn into_error(self) -> CoordError {
        CoordError::StatementFailed {
            index: self.index,
            object_type: self.object_type,
            statement: self.statement,
            reason: self.error,
        }
    }
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Final state per input statement.
    pub states: Vec<StatementState>,
    /// Input indices in the order their execution finished.
    pub completion_order: Vec<usize>,
    pub failures: Vec<StatementFailure>,
}

impl ExecutionReport {
    fn count(&self, state: StatementState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }

    pub fn completed(&self) -> usize {
        self.count(StatementState::Completed)
    }

    pub fn filtered(&self) -> usize {
        self.count(StatementState::Filtered)
    }

    /// Statements that passed the filter but never ran.
    pub fn not_run(&self) -> usize {
        self.count(StatementState::Pending)
    }

    pub fn num_errors(&self) -> usize {
        self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.not_run() == 0
    }

    /// Append a later batch, shifting its indices past this one.
    pub fn merge(&mut self, other: ExecutionReport) {
        let offset = self.states.len();
        self.states.extend(other.states);
        self.completion_order
            .extend(other.completion_order.into_iter().map(|i| i + offset));
        self.failures.extend(other.failures.into_iter().map(|mut f| {
            f.index += offset;
            f
        }));
    }
}

/// Shared bookkeeping for one run.
struct RunTracker {
    states: Mutex<Vec<StatementState>>,
    completion_order: Mutex<Vec<usize>>,
    failures: Mutex<Vec<StatementFailure>>,
    progress: ProgressReporter,
}

impl RunTracker {
    fn set(&self, index: usize, state: StatementState) {
        if let Ok(mut states) = self.states.lock() {
            states[index] = state;
        }
    }

    fn finish(&self, index: usize, stmt: &StatementWithType, result: Result<()>) -> bool {
        let ok = result.is_ok();
        match result {
            Ok(()) => self.set(index, StatementState::Completed),
            Err(e) => {
                warn!(
                    "Error encountered when executing statement: {} Error was: {}",
                    stmt.statement.trim(),
                    e
                );
                self.set(index, StatementState::Failed);
                if let Ok(mut failures) = self.failures.lock() {
                    failures.push(StatementFailure {
                        index,
                        object_type: stmt.object_type.to_string(),
                        statement: stmt.statement.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        if let Ok(mut order) = self.completion_order.lock() {
            order.push(index);
        }
        self.progress.increment();
        ok
    }

    fn into_report(self) -> ExecutionReport {
        let mut failures = self.failures.into_inner().unwrap_or_default();
        failures.sort_by_key(|f| f.index);
        ExecutionReport {
            states: self.states.into_inner().unwrap_or_default(),
            completion_order: self.completion_order.into_inner().unwrap_or_default(),
            failures,
        }
    }
}

/// Executes typed statements on a connection pool.
///
/// # Examples
///
/// ```no_run
/// use clustersnap::core::ObjectFilter;
/// use clustersnap::executor::{ErrorPolicy, ExecutionMode, ParallelExecutor};
///
/// let executor = ParallelExecutor::new(ExecutionMode::parallel())
///     .with_filter(ObjectFilter::NoFilter)
///     .with_error_policy(ErrorPolicy::Continue);
/// ```
pub struct ParallelExecutor {
    mode: ExecutionMode,
    policy: ErrorPolicy,
    filter: ObjectFilter,
    progress: ProgressMode,
    dispatch_interval: Duration,
    title: String,
    state: Mutex<ExecutorState>,
}

impl ParallelExecutor {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            policy: ErrorPolicy::Stop,
            filter: ObjectFilter::NoFilter,
            progress: ProgressMode::None,
            dispatch_interval: DEFAULT_DISPATCH_INTERVAL,
            title: "Objects".to_string(),
            state: Mutex::new(ExecutorState::Idle),
        }
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_filter(mut self, filter: ObjectFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_progress(mut self, progress: ProgressMode) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    /// Label used in progress messages, e.g. "Tables".
    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn mode(&self) -> &ExecutionMode {
        &self.mode
    }

    pub fn state(&self) -> ExecutorState {
        self.state.lock().map(|s| *s).unwrap_or(ExecutorState::Done)
    }

    fn set_state(&self, state: ExecutorState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    /// Run `statements` and report what happened.
    ///
    /// Under `ErrorPolicy::Stop` the first failure is returned as
    /// `StatementFailed` once in-flight statements have finished.
    pub async fn execute(
        &self,
        pool: &ConnectionPool,
        statements: &[StatementWithType],
    ) -> Result<ExecutionReport> {
        let mut states = vec![StatementState::Pending; statements.len()];
        let mut work = Vec::new();
        for (index, stmt) in statements.iter().enumerate() {
            if self.filter.matches(stmt.object_type) {
                work.push((index, stmt));
            } else {
                states[index] = StatementState::Filtered;
            }
        }

        let tracker = RunTracker {
            states: Mutex::new(states),
            completion_order: Mutex::new(Vec::with_capacity(work.len())),
            failures: Mutex::new(Vec::new()),
            progress: ProgressReporter::new(
                format!("{} restored: ", self.title),
                work.len(),
                self.progress,
            ),
        };

        self.set_state(ExecutorState::Draining);
        let outcome = match &self.mode {
            ExecutionMode::Serial { slot } => self.run_serial(pool, *slot, work, &tracker).await,
            ExecutionMode::Parallel { reserved_slots } => {
                let slots: Vec<usize> = (0..pool.size())
                    .filter(|slot| !reserved_slots.contains(slot))
                    .collect();
                self.run_parallel(pool, &slots, work, &tracker).await
            }
        };
        self.set_state(ExecutorState::Done);
        tracker.progress.finish();
        outcome?;

        let report = tracker.into_report();
        if report.num_errors() > 0 {
            error!(
                "Encountered {} error(s) while executing {} statement(s)",
                report.num_errors(),
                report.states.len()
            );
        }
        if self.policy == ErrorPolicy::Stop {
            if let Some(first) = report.failures.first().cloned() {
                return Err(first.into_error());
            }
        }
        Ok(report)
    }

    /// Run batches one after another, accumulating a single report.
    pub async fn execute_batches(
        &self,
        pool: &ConnectionPool,
        batches: &[Vec<StatementWithType>],
    ) -> Result<ExecutionReport> {
        let mut total = ExecutionReport::default();
        for (n, batch) in batches.iter().enumerate() {
            debug!("Executing batch {} of {} ({} statements)", n + 1, batches.len(), batch.len());
            let report = self.execute(pool, batch).await?;
            total.merge(report);
        }
        Ok(total)
    }

    async fn run_serial(
        &self,
        pool: &ConnectionPool,
        slot: usize,
        work: Vec<(usize, &StatementWithType)>,
        tracker: &RunTracker,
    ) -> Result<()> {
        for (index, stmt) in work {
            tracker.set(index, StatementState::Running);
            let result = match pool.execute(slot, &stmt.statement).await {
                Err(e @ (CoordError::PoolClosed | CoordError::InvalidSlot { .. })) => return Err(e),
                other => other.map(|_| ()),
            };
            let ok = tracker.finish(index, stmt, result);
            if !ok && self.policy == ErrorPolicy::Stop {
                break;
            }
        }
        Ok(())
    }

    async fn run_parallel(
        &self,
        pool: &ConnectionPool,
        slots: &[usize],
        work: Vec<(usize, &StatementWithType)>,
        tracker: &RunTracker,
    ) -> Result<()> {
        if slots.is_empty() {
            return Err(CoordError::ConfigError(
                "parallel execution needs at least one unreserved session".into(),
            ));
        }
        info!(
            "Executing {} statement(s) on {} session(s)",
            work.len(),
            slots.len()
        );

        let (tx, rx) = mpsc::channel(work.len().max(1));
        let rx = tokio::sync::Mutex::new(rx);
        let stop = AtomicBool::new(false);
        let interval = self.dispatch_interval;

        let stop_ref = &stop;
        let dispatcher = async move {
            for (n, item) in work.into_iter().enumerate() {
                if stop_ref.load(Ordering::SeqCst) {
                    break;
                }
                if n > 0 && !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                if tx.send(item).await.is_err() {
                    break;
                }
            }
            // Dropping the sender lets idle workers exit.
        };

        let workers = join_all(slots.iter().map(|&slot| {
            let rx = &rx;
            let stop = stop_ref;
            async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((index, stmt)) = next else {
                        break;
                    };
                    if stop.load(Ordering::SeqCst) {
                        // Left as Pending: dispatched but never started.
                        continue;
                    }
                    tracker.set(index, StatementState::Running);
                    let result = pool.execute(slot, &stmt.statement).await.map(|_| ());
                    let ok = tracker.finish(index, stmt, result);
                    if !ok && self.policy == ErrorPolicy::Stop {
                        stop.store(true, Ordering::SeqCst);
                    }
                }
            }
        }));

        futures::join!(dispatcher, workers);
        Ok(())
    }
}
