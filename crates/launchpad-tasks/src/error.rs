//! Error types for the task engine

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Terminal error of a task.
///
/// Cloneable so that one failure can be handed to the enclosing join, the
/// executor and every stop listener.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Cooperative cancellation; not an application error
    #[error("operation was cancelled")]
    Cancelled,

    /// The task body returned an error
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    /// The task body panicked
    #[error("task body panicked: {0}")]
    Panicked(String),

    /// An asynchronous operation was dropped without producing a result
    #[error("asynchronous operation was dropped without completing")]
    Abandoned,

    /// A scheduler refused or dropped a unit of work
    #[error("scheduler '{0}' is no longer accepting work")]
    SchedulerClosed(String),
}

impl TaskError {
    /// Wrap an arbitrary error as a task failure
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::from(err.into())
    }

    /// Build a failure from a message
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    /// Whether this is the cancellation marker
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Recover the concrete error a task body failed with
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Self::Failed(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        // A body that bailed out with a TaskError keeps its meaning.
        match err.downcast::<TaskError>() {
            Ok(task_err) => task_err,
            Err(err) => Self::Failed(Arc::new(err)),
        }
    }
}

/// Errors from driving a [`TaskExecutor`](crate::TaskExecutor)
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// `start()` was called more than once
    #[error("executor was already started")]
    AlreadyStarted,

    /// `start()` was called outside of a tokio runtime
    #[error("executor must be started from within a tokio runtime")]
    NoRuntime,
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
