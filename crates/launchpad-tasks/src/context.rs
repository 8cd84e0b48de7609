//! Execution context handed to task bodies

use std::sync::Arc;

use crate::error::TaskError;
use crate::options::EngineOptions;
use crate::output::{OutputLine, OutputSender};
use crate::reporter::{TaskEvent, TaskReporter};
use crate::scheduler::Schedulers;
use crate::task::{TaskHandle, TaskId};

/// Everything a running graph shares: schedulers, reporting and options
#[derive(Clone)]
pub(crate) struct RunContext {
    pub(crate) schedulers: Schedulers,
    pub(crate) reporter: Arc<dyn TaskReporter>,
    pub(crate) output: OutputSender,
    pub(crate) options: Arc<EngineOptions>,
}

impl RunContext {
    pub(crate) fn new(
        schedulers: Schedulers,
        reporter: Arc<dyn TaskReporter>,
        output: OutputSender,
        options: Arc<EngineOptions>,
    ) -> Self {
        Self {
            schedulers,
            reporter,
            output,
            options,
        }
    }

    pub(crate) fn report(&self, event: &TaskEvent) {
        self.reporter.report(event);
    }
}

/// A task body's view of its own task.
///
/// Progress and message updates are dropped once the task is no longer
/// running or has been cancelled.
#[derive(Clone)]
pub struct TaskContext {
    handle: TaskHandle,
    run: RunContext,
}

impl TaskContext {
    pub(crate) fn new(handle: TaskHandle, run: RunContext) -> Self {
        Self { handle, run }
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Cancellation checkpoint for long-running bodies
    ///
    /// ```ignore
    /// for chunk in chunks {
    ///     cx.check_cancelled()?;
    ///     write(chunk)?;
    /// }
    /// ```
    pub fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            return Err(TaskError::Cancelled.into());
        }
        Ok(())
    }

    /// Resolves once the task is cancelled
    pub async fn cancelled(&self) {
        self.handle.token().cancelled().await
    }

    /// Register an interrupt action for work this body started
    pub fn on_cancel(&self, action: impl FnOnce() + Send + 'static) {
        self.handle.token().on_cancel(action);
    }

    /// Raise progress; values outside `[0, 1]` are clamped
    pub fn update_progress(&self, value: f64) {
        if let Some(progress) = self.handle.set_progress(value) {
            self.run.report(&TaskEvent::Progress {
                id: self.id(),
                progress,
            });
        }
    }

    pub fn update_message(&self, message: impl Into<String>) {
        let message = message.into();
        if self.handle.set_message(message.clone()) {
            self.run.report(&TaskEvent::Message {
                id: self.id(),
                message,
            });
        }
    }

    /// Publish a transfer rate; zero clears it
    pub fn report_speed(&self, bytes_per_second: u64) {
        if self.is_cancelled() {
            return;
        }
        self.run.report(&TaskEvent::Speed {
            id: self.id(),
            bytes_per_second,
        });
    }

    /// Queue a line of output for the executor's single output consumer
    pub fn log_line(&self, line: impl Into<String>, is_stderr: bool) {
        self.run.output.send(OutputLine {
            id: self.id(),
            line: line.into(),
            is_stderr,
        });
    }

    pub fn options(&self) -> &EngineOptions {
        &self.run.options
    }

    pub fn schedulers(&self) -> &Schedulers {
        &self.run.schedulers
    }
}
