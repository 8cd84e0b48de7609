//! Adapters for single-shot external asynchronous operations
//!
//! Cancellation of an adapted operation is advisory: the operation keeps
//! running, its eventual result is discarded, and the only way to stop it
//! early is an abort hook registered with [`Task::with_abort`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::combinators::run_on;
use crate::error::{panic_message, TaskError};
use crate::lock;
use crate::scheduler::Dispatch;
use crate::task::{Significance, Task, TaskKind};

type Slot<T> = Arc<Mutex<Option<oneshot::Sender<Result<T, TaskError>>>>>;

/// Resolves a task created with [`Task::from_callback`].
///
/// Clones share one slot: the first `complete`, `fail` or `cancel` wins and
/// the rest return `false`. Dropping every clone without resolving fails the
/// task with [`TaskError::Abandoned`].
pub struct Completer<T> {
    slot: Slot<T>,
    token: CancelToken,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T> Completer<T> {
    fn resolve(&self, result: Result<T, TaskError>) -> bool {
        match lock(&self.slot).take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn complete(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(&self, err: impl Into<anyhow::Error>) -> bool {
        self.resolve(Err(TaskError::from(err.into())))
    }

    /// Break the operation off; the task ends `Cancelled`
    pub fn cancel(&self) -> bool {
        self.resolve(Err(TaskError::Cancelled))
    }

    /// Whether the owning task was cancelled and the result will be ignored
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T: Send + 'static> Task<T> {
    /// Wrap an already-created future as a task.
    ///
    /// The future runs on the I/O scheduler.
    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Task::composite("future", Significance::Major, TaskKind::Adapter, move |me, cx| {
            async move {
                let (tx, rx) = oneshot::channel();
                let scheduler = cx.schedulers.resolve(&Dispatch::Io);
                scheduler.submit(
                    async move {
                        let result = match AssertUnwindSafe(fut).catch_unwind().await {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(err)) => Err(TaskError::from(err)),
                            Err(payload) => {
                                Err(TaskError::Panicked(panic_message(payload.as_ref())))
                            }
                        };
                        if tx.send(result).is_err() {
                            debug!("adapted operation finished after its task gave up");
                        }
                    }
                    .boxed(),
                )?;

                tokio::select! {
                    biased;
                    _ = me.token().cancelled() => Err(TaskError::Cancelled),
                    result = rx => result.unwrap_or(Err(TaskError::Abandoned)),
                }
            }
            .boxed()
        })
    }

    /// Wrap a callback-style operation.
    ///
    /// `start` runs once on the I/O scheduler and receives a [`Completer`]
    /// that the external operation resolves from any thread.
    pub fn from_callback<F>(start: F) -> Self
    where
        F: FnOnce(Completer<T>) + Send + 'static,
    {
        Task::composite("callback", Significance::Major, TaskKind::Adapter, move |me, cx| {
            async move {
                let (tx, rx) = oneshot::channel();
                let completer = Completer {
                    slot: Arc::new(Mutex::new(Some(tx))),
                    token: me.token().clone(),
                };
                run_on(&cx, &Dispatch::Io, move || start(completer)).await?;

                tokio::select! {
                    biased;
                    _ = me.token().cancelled() => Err(TaskError::Cancelled),
                    result = rx => result.unwrap_or(Err(TaskError::Abandoned)),
                }
            }
            .boxed()
        })
    }
}
