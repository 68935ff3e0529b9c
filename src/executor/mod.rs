pub mod parallel;
pub mod progress;

pub use parallel::{
    ErrorPolicy, ExecutionMode, ExecutionReport, ExecutorState, ParallelExecutor, StatementFailure,
    StatementState, DEFAULT_DISPATCH_INTERVAL,
};
pub use progress::{ProgressMode, ProgressReporter};
