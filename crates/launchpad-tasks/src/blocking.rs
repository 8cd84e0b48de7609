//! Bridge for blocking, non-cooperative calls
//!
//! The call runs on a dedicated OS thread. Cancelling the task raises the
//! [`InterruptFlag`] the call was handed, then waits up to the configured
//! grace period for the thread to give up. Once the grace period passes the
//! task reports `Cancelled` whether or not the thread stopped; a thread that
//! ignores the flag is left to finish on its own and its result is dropped.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::context::TaskContext;
use crate::error::{panic_message, TaskError};
use crate::task::{Significance, Task, TaskKind};

/// Interrupt signal observed by a blocking call
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Checkpoint: fails with the cancellation marker once interrupted
    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_interrupted() {
            return Err(TaskError::Cancelled.into());
        }
        Ok(())
    }
}

/// What a blocking body gets: its task context plus the interrupt flag
#[derive(Clone)]
pub struct BlockingContext {
    pub task: TaskContext,
    pub interrupt: InterruptFlag,
}

impl BlockingContext {
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted() || self.task.is_cancelled()
    }
}

impl<T: Send + 'static> Task<T> {
    /// Run `body` on a dedicated thread with bounded-wait cancellation
    pub fn blocking<F>(body: F) -> Self
    where
        F: FnOnce(BlockingContext) -> anyhow::Result<T> + Send + 'static,
    {
        Task::composite("blocking", Significance::Major, TaskKind::Adapter, move |me, cx| {
            async move {
                let interrupt = InterruptFlag::new();
                {
                    let flag = interrupt.clone();
                    me.token().on_cancel(move || flag.interrupt());
                }

                let (tx, mut rx) = oneshot::channel();
                let bcx = BlockingContext {
                    task: TaskContext::new(me.clone(), cx.clone()),
                    interrupt,
                };
                std::thread::Builder::new()
                    .name(format!("launchpad-blocking-{}", me.id().value()))
                    .spawn(move || {
                        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| body(bcx))) {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(err)) => Err(TaskError::from(err)),
                            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
                        };
                        let _ = tx.send(result);
                    })
                    .map_err(TaskError::failed)?;
                debug!(task = %me.id(), "blocking call started");

                tokio::select! {
                    biased;
                    result = &mut rx => result.unwrap_or(Err(TaskError::Abandoned)),
                    _ = me.token().cancelled() => {
                        let grace = cx.options.cancel_grace;
                        match tokio::time::timeout(grace, &mut rx).await {
                            Ok(_) => info!(task = %me.id(), "blocking call stopped after interrupt"),
                            Err(_) => warn!(
                                task = %me.id(),
                                grace_ms = grace.as_millis() as u64,
                                "blocking call ignored interrupt; abandoning it"
                            ),
                        }
                        Err(TaskError::Cancelled)
                    }
                }
            }
            .boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag() {
        let flag = InterruptFlag::new();
        let seen_by_worker = flag.clone();
        assert!(flag.check().is_ok());
        flag.interrupt();
        assert!(seen_by_worker.is_interrupted());
        let err = TaskError::from(seen_by_worker.check().unwrap_err());
        assert!(err.is_cancelled());
    }
}
