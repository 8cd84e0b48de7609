//! Composition: continuations, joins and observers
//!
//! Every combinator consumes its input task and returns a new task that
//! owns it. Owned tasks inherit the owner's stage and follow its
//! cancellation token.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::debug;

use crate::context::{RunContext, TaskContext};
use crate::error::{panic_message, TaskError};
use crate::scheduler::Dispatch;
use crate::task::{announce, run_leaf, LeafBody, Significance, Task, TaskKind};

/// Run a synchronous closure on the scheduler `dispatch` refers to
pub(crate) async fn run_on<R, F>(cx: &RunContext, dispatch: &Dispatch, f: F) -> Result<R, TaskError>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let scheduler = cx.schedulers.resolve(dispatch);
    let (tx, rx) = oneshot::channel();
    scheduler.submit(
        async move {
            let _ = tx.send(call_guarded(f));
        }
        .boxed(),
    )?;
    rx.await
        .unwrap_or_else(|_| Err(TaskError::SchedulerClosed(scheduler.name().to_string())))
}

fn call_guarded<R>(f: impl FnOnce() -> R) -> Result<R, TaskError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())))
}

impl<T: Send + 'static> Task<T> {
    /// Continue with `f` on the I/O scheduler once this task succeeds
    pub fn then<U, F, Fut>(self, f: F) -> Task<U>
    where
        U: Send + 'static,
        F: FnOnce(T, TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        self.then_on(Dispatch::Io, f)
    }

    /// Continue with `f` on the given scheduler once this task succeeds.
    ///
    /// If this task fails or is cancelled, `f` is never called and the
    /// terminal error propagates unchanged. The body reports progress on
    /// the composed task.
    pub fn then_on<U, F, Fut>(self, dispatch: Dispatch, f: F) -> Task<U>
    where
        U: Send + 'static,
        F: FnOnce(T, TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        let prev = self;
        let prev_handle = prev.handle.clone();
        let composed = Task::composite(
            format!("{} -> then", prev_handle.name()),
            Significance::Minor,
            TaskKind::Continuation,
            move |me, cx| {
                async move {
                    let value = prev.run(cx.clone()).await?;
                    announce(&me, &cx);
                    let body: LeafBody<U> = Box::new(move |tcx| f(value, tcx).boxed());
                    run_leaf(&me, &cx, &dispatch, body).await
                }
                .boxed()
            },
        );
        composed.handle.adopt(&prev_handle);
        composed.handle.add_dependency(&prev_handle);
        composed
    }

    /// Continue with the task `f` builds from this task's result
    pub fn and_then<U, F>(self, f: F) -> Task<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Task<U> + Send + 'static,
    {
        self.compose(None, f)
    }

    /// Like [`and_then`](Self::and_then), with the builder run on a scheduler
    pub fn and_then_on<U, F>(self, dispatch: Dispatch, f: F) -> Task<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Task<U> + Send + 'static,
    {
        self.compose(Some(dispatch), f)
    }

    fn compose<U, F>(self, dispatch: Option<Dispatch>, f: F) -> Task<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Task<U> + Send + 'static,
    {
        let prev = self;
        let prev_handle = prev.handle.clone();
        let dependency = prev_handle.clone();
        let composed = Task::composite(
            format!("{} -> and_then", prev_handle.name()),
            Significance::Minor,
            TaskKind::Continuation,
            move |me, cx| {
                async move {
                    let value = prev.run(cx.clone()).await?;
                    announce(&me, &cx);
                    let next = match dispatch {
                        Some(dispatch) => run_on(&cx, &dispatch, move || f(value)).await?,
                        None => call_guarded(move || f(value))?,
                    };
                    me.adopt(&next.handle);
                    next.handle.add_dependency(&dependency);
                    next.run(cx).await
                }
                .boxed()
            },
        );
        composed.handle.adopt(&prev_handle);
        composed
    }

    /// Transform the result synchronously
    pub fn map<U, F>(self, f: F) -> Task<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let prev = self;
        let prev_handle = prev.handle.clone();
        let composed = Task::composite(
            format!("{} -> map", prev_handle.name()),
            Significance::Minor,
            TaskKind::Continuation,
            move |me, cx| {
                async move {
                    let value = prev.run(cx.clone()).await?;
                    announce(&me, &cx);
                    call_guarded(move || f(value))
                }
                .boxed()
            },
        );
        composed.handle.adopt(&prev_handle);
        composed
    }

    /// Observe the terminal result on a scheduler without changing it.
    ///
    /// The observer also runs when this task fails or is cancelled. A
    /// panicking observer turns the result into [`TaskError::Panicked`].
    pub fn when_complete<F>(self, dispatch: Dispatch, f: F) -> Task<T>
    where
        F: FnOnce(Result<&T, &TaskError>) + Send + 'static,
    {
        let prev = self;
        let prev_handle = prev.handle.clone();
        let composed = Task::composite(
            format!("{} -> when_complete", prev_handle.name()),
            Significance::Minor,
            TaskKind::Continuation,
            move |me, cx| {
                async move {
                    let outcome = prev.run(cx.clone()).await;
                    announce(&me, &cx);
                    run_on(&cx, &dispatch, move || {
                        f(outcome.as_ref());
                        outcome
                    })
                    .await?
                }
                .boxed()
            },
        );
        composed.handle.adopt(&prev_handle);
        composed
    }
}

impl<T: Send + 'static> Task<Vec<T>> {
    /// Run `tasks` concurrently; results come back in input order.
    ///
    /// The first branch to fail fails the join. Every other branch still
    /// running is cancelled, and the join reports only after all of them
    /// have settled, so no branch outlives the join.
    pub fn all_of(tasks: Vec<Task<T>>) -> Task<Vec<T>> {
        let branches: Vec<_> = tasks.iter().map(|t| t.handle.clone()).collect();
        let owned = branches.clone();
        let join = Task::composite(
            format!("all_of({})", tasks.len()),
            Significance::Minor,
            TaskKind::Join,
            move |me, cx| {
                async move {
                    let count = tasks.len();
                    let mut pending: FuturesUnordered<_> = tasks
                        .into_iter()
                        .enumerate()
                        .map(|(index, task)| {
                            let cx = cx.clone();
                            async move { (index, task.run(cx).await) }
                        })
                        .collect();

                    let mut results: Vec<Option<T>> = (0..count).map(|_| None).collect();
                    let mut first_error: Option<TaskError> = None;
                    while let Some((index, outcome)) = pending.next().await {
                        match outcome {
                            Ok(value) => results[index] = Some(value),
                            Err(err) if first_error.is_none() => {
                                debug!(
                                    join = %me.id(),
                                    branch = index,
                                    error = %err,
                                    "branch stopped the join; cancelling siblings"
                                );
                                for (other, branch) in branches.iter().enumerate() {
                                    if other != index && !branch.state().is_terminal() {
                                        branch.cancel();
                                    }
                                }
                                first_error = Some(err);
                            }
                            Err(_) => {}
                        }
                    }

                    match first_error {
                        Some(err) => Err(err),
                        None => Ok(results.into_iter().flatten().collect()),
                    }
                }
                .boxed()
            },
        );
        for branch in &owned {
            join.handle.adopt(branch);
        }
        join
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskExecutor;
    use crate::scheduler::{InlineScheduler, IoScheduler, Schedulers, UiScheduler};
    use crate::task::TaskState;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn schedulers() -> Schedulers {
        Schedulers::new(
            Arc::new(IoScheduler::current(4).unwrap()),
            Arc::new(InlineScheduler),
        )
    }

    async fn run<T: Send + 'static>(task: Task<T>) -> Result<T, TaskError> {
        let executor = TaskExecutor::builder(task, schedulers()).without_tracing().build();
        executor.start().unwrap();
        if executor.wait().await {
            Ok(executor.take_result().unwrap())
        } else {
            Err(executor.exception().unwrap())
        }
    }

    #[tokio::test]
    async fn test_then_passes_result() {
        let task = Task::new(|_cx| async { Ok(20) }).then(|n, _cx| async move { Ok(n + 1) });
        assert_eq!(run(task).await.unwrap(), 21);
    }

    #[tokio::test]
    async fn test_then_skipped_after_failure() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = Task::new(|_cx| async { Err::<u32, _>(anyhow::anyhow!("fetch failed")) })
            .then(move |n, _cx| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(n)
            });
        let err = run(task).await.unwrap_err();
        assert_eq!(err.to_string(), "fetch failed");
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_then_records_dependency() {
        let first = Task::completed(1);
        let first_handle = first.handle().clone();
        let task = first.then(|n, _cx| async move { Ok(n) });
        assert_eq!(task.handle().dependencies(), vec![first_handle.clone()]);
        assert_eq!(task.handle().dependents(), vec![first_handle]);
    }

    #[tokio::test]
    async fn test_and_then_builds_next_task() {
        let task = Task::new(|_cx| async { Ok("java-17") })
            .and_then(|java| Task::new(move |_cx| async move { Ok(format!("using {java}")) }));
        assert_eq!(run(task).await.unwrap(), "using java-17");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_and_then_on_runs_builder_on_ui() {
        let ui = Arc::new(UiScheduler::spawn("ui-compose").unwrap());
        let io = Arc::new(IoScheduler::current(2).unwrap());
        let probe = ui.clone();
        let task = Task::completed(()).and_then_on(Dispatch::Ui, move |_| {
            Task::completed(probe.is_current())
        });
        let executor = task.executor(Schedulers::new(io, ui.clone()));
        executor.start().unwrap();
        assert!(executor.wait().await);
        assert_eq!(executor.take_result(), Some(true));
        ui.shutdown();
    }

    #[tokio::test]
    async fn test_builder_panic_fails_task() {
        let task: Task<()> = Task::completed(()).and_then(|_| panic!("no next step"));
        assert!(matches!(run(task).await, Err(TaskError::Panicked(_))));
    }

    #[tokio::test]
    async fn test_map_and_when_complete() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let task = Task::completed(3)
            .map(|n| n * 2)
            .when_complete(Dispatch::Ui, move |result| {
                *sink.lock().unwrap() = Some(result.map(|n| *n).map_err(|e| e.to_string()));
            });
        assert_eq!(run(task).await.unwrap(), 6);
        assert_eq!(*seen.lock().unwrap(), Some(Ok(6)));
    }

    #[tokio::test]
    async fn test_when_complete_sees_failure_unchanged() {
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();
        let task = Task::new(|_cx| async { Err::<(), _>(anyhow::anyhow!("offline")) })
            .when_complete(Dispatch::Io, move |result| {
                flag.store(result.is_err(), Ordering::SeqCst);
            });
        assert_eq!(run(task).await.unwrap_err().to_string(), "offline");
        assert!(seen.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_of_keeps_input_order() {
        let tasks = (0..5u64)
            .map(|i| {
                Task::new(move |_cx| async move {
                    tokio::time::sleep(Duration::from_millis(50 - i * 10)).await;
                    Ok(i)
                })
            })
            .collect();
        assert_eq!(run(Task::all_of(tasks)).await.unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_all_of_empty_succeeds() {
        let tasks: Vec<Task<u8>> = Vec::new();
        assert!(run(Task::all_of(tasks)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_of_cancels_siblings_on_failure() {
        let slow = Task::new(|_cx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let slow_handle = slow.handle().clone();
        let failing = Task::new(|_cx| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<(), _>(anyhow::anyhow!("checksum mismatch"))
        });

        let started = tokio::time::Instant::now();
        let err = run(Task::all_of(vec![slow, failing])).await.unwrap_err();
        assert_eq!(err.to_string(), "checksum mismatch");
        assert_eq!(slow_handle.state(), TaskState::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_composite_reaches_running_leaf() {
        let interrupted = Arc::new(AtomicUsize::new(0));
        let counter = interrupted.clone();
        let leaf = Task::new(move |cx| async move {
            cx.on_cancel(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let leaf_handle = leaf.handle().clone();
        let task = leaf.then(|_, _cx| async { Ok(()) });

        let executor = TaskExecutor::builder(task, schedulers()).without_tracing().build();
        executor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        executor.cancel();

        assert!(!executor.wait().await);
        assert!(executor.exception().unwrap().is_cancelled());
        assert_eq!(leaf_handle.state(), TaskState::Cancelled);
        assert_eq!(interrupted.load(Ordering::SeqCst), 1);
    }
}
