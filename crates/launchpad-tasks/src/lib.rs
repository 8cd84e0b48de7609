//! Launchpad Tasks - Task orchestration engine
//!
//! This crate sequences multi-stage, cancellable, progress-reporting
//! operations. Callers build a task graph out of leaf tasks and
//! combinators, hand the root to a [`TaskExecutor`], and observe progress
//! through reporters and the stage aggregator until exactly one stop
//! notification arrives on the UI scheduler.

pub mod adapter;
pub mod blocking;
pub mod cancel;
pub mod combinators;
pub mod context;
pub mod error;
pub mod executor;
pub mod fake_progress;
pub mod options;
pub mod output;
pub mod progress_callback;
pub mod reporter;
pub mod scheduler;
pub mod stages;
pub mod task;

pub use adapter::Completer;
pub use blocking::{BlockingContext, InterruptFlag};
pub use cancel::CancelToken;
pub use context::TaskContext;
pub use error::{ExecutorError, TaskError};
pub use executor::{ExecutorBuilder, ExecutorState, TaskExecutor};
pub use options::EngineOptions;
pub use output::OutputLine;
pub use progress_callback::{ProgressCallback, TaskProgressCallback};
pub use reporter::{
    ChannelReporter, CollectingReporter, TaskEvent, TaskReporter, TaskReporterRegistry,
    TracingReporter,
};
pub use scheduler::{Dispatch, InlineScheduler, IoScheduler, Job, Scheduler, Schedulers, UiScheduler};
pub use stages::{StageAggregator, StageSnapshot, StageStatus};
pub use task::{Significance, Task, TaskHandle, TaskId, TaskState};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
///
/// Task bodies run under `catch_unwind`, so a poisoned lock only means a
/// body panicked mid-update; the guarded state is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
