//! Schedulers - named execution contexts for units of work
//!
//! Two contexts are required by the engine: an I/O pool that runs many
//! units concurrently, and a UI context that runs exactly one unit at a
//! time in submission order. Both are injected into the executor through
//! [`Schedulers`]; nothing here is a process-wide singleton.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info};

use crate::error::{panic_message, TaskError};
use crate::lock;

/// A unit of work accepted by a scheduler
pub type Job = BoxFuture<'static, ()>;

/// An execution context with its own concurrency rule
pub trait Scheduler: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Enqueue a unit of work
    fn submit(&self, job: Job) -> Result<(), TaskError>;
}

/// Where a task body should run
#[derive(Clone, Default)]
pub enum Dispatch {
    /// The I/O worker pool
    #[default]
    Io,
    /// The single-threaded UI context
    Ui,
    /// A caller-supplied scheduler
    With(Arc<dyn Scheduler>),
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io => write!(f, "Io"),
            Self::Ui => write!(f, "Ui"),
            Self::With(s) => write!(f, "With({})", s.name()),
        }
    }
}

/// The pair of schedulers an executor runs on
#[derive(Clone)]
pub struct Schedulers {
    /// Pooled I/O and CPU context
    pub io: Arc<dyn Scheduler>,
    /// Single-threaded FIFO UI context
    pub ui: Arc<dyn Scheduler>,
}

impl Schedulers {
    /// Bundle an I/O and a UI scheduler
    pub fn new(io: Arc<dyn Scheduler>, ui: Arc<dyn Scheduler>) -> Self {
        Self { io, ui }
    }

    /// Pick the scheduler a dispatch refers to
    pub fn resolve(&self, dispatch: &Dispatch) -> Arc<dyn Scheduler> {
        match dispatch {
            Dispatch::Io => self.io.clone(),
            Dispatch::Ui => self.ui.clone(),
            Dispatch::With(s) => s.clone(),
        }
    }
}

impl fmt::Debug for Schedulers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedulers")
            .field("io", &self.io.name())
            .field("ui", &self.ui.name())
            .finish()
    }
}

async fn run_guarded(scheduler: &str, job: Job) {
    if let Err(payload) = AssertUnwindSafe(job).catch_unwind().await {
        error!(
            scheduler,
            panic = %panic_message(payload.as_ref()),
            "unit of work panicked"
        );
    }
}

/// Worker pool on a tokio runtime, bounded by a semaphore
pub struct IoScheduler {
    name: String,
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl IoScheduler {
    /// Create a pool on the given runtime running at most `workers` units at once
    pub fn new(handle: Handle, workers: usize) -> Self {
        Self {
            name: "io".to_string(),
            handle,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Create a pool on the runtime the caller is running in
    pub fn current(workers: usize) -> Result<Self, TryCurrentError> {
        Ok(Self::new(Handle::try_current()?, workers))
    }

    /// Units that could start right now without waiting for a permit
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Scheduler for IoScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: Job) -> Result<(), TaskError> {
        let permits = self.permits.clone();
        let name = self.name.clone();
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!(scheduler = %name, "worker pool closed; dropping unit");
                return;
            };
            run_guarded(&name, job).await;
        });
        Ok(())
    }
}

/// Single dedicated thread running units strictly one at a time, FIFO
pub struct UiScheduler {
    name: String,
    sender: std::sync::Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread: std::sync::Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl UiScheduler {
    /// Spawn the UI thread
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let loop_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                info!(scheduler = %loop_name, "ui loop started");
                runtime.block_on(async {
                    while let Some(job) = rx.recv().await {
                        run_guarded(&loop_name, job).await;
                    }
                });
                info!(scheduler = %loop_name, "ui loop finished (queue closed)");
            })?;

        Ok(Self {
            name,
            thread_id: thread.thread().id(),
            sender: std::sync::Mutex::new(Some(tx)),
            thread: std::sync::Mutex::new(Some(thread)),
        })
    }

    /// Whether the caller is running on this scheduler's thread
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Stop accepting work, let queued units finish, then join the thread
    pub fn shutdown(&self) {
        lock(&self.sender).take();
        if self.is_current() {
            return;
        }
        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                error!(scheduler = %self.name, "ui thread terminated abnormally");
            }
        }
    }
}

impl Scheduler for UiScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: Job) -> Result<(), TaskError> {
        lock(&self.sender)
            .as_ref()
            .ok_or_else(|| TaskError::SchedulerClosed(self.name.clone()))?
            .send(job)
            .map_err(|_| TaskError::SchedulerClosed(self.name.clone()))
    }
}

impl Drop for UiScheduler {
    fn drop(&mut self) {
        // Closing the queue lets the thread drain and exit on its own.
        lock(&self.sender).take();
    }
}

/// Runs every unit to completion on the submitting thread.
///
/// Deterministic stand-in for either context in tests. Units must not wait
/// on work driven by the submitting thread.
#[derive(Debug, Default)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn name(&self) -> &str {
        "inline"
    }

    fn submit(&self, job: Job) -> Result<(), TaskError> {
        futures::executor::block_on(run_guarded("inline", job));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_inline_runs_synchronously() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        InlineScheduler
            .submit(
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inline_survives_panicking_unit() {
        InlineScheduler
            .submit(async { panic!("unit exploded") }.boxed())
            .unwrap();
        InlineScheduler.submit(async {}.boxed()).unwrap();
    }

    #[test]
    fn test_ui_scheduler_is_fifo_and_single_threaded() {
        let ui = UiScheduler::spawn("ui-test").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        for i in 0..20 {
            let seen = seen.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            ui.submit(
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    seen.lock().unwrap().push(i);
                    active.fetch_sub(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .unwrap();
        }

        ui.shutdown();
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ui_scheduler_reports_its_thread() {
        let ui = Arc::new(UiScheduler::spawn("ui-thread-check").unwrap());
        assert!(!ui.is_current());

        let (tx, rx) = std::sync::mpsc::channel();
        let probe = ui.clone();
        ui.submit(
            async move {
                tx.send(probe.is_current()).unwrap();
            }
            .boxed(),
        )
        .unwrap();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn test_ui_scheduler_rejects_after_shutdown() {
        let ui = UiScheduler::spawn("ui-closed").unwrap();
        ui.shutdown();
        let err = ui.submit(async {}.boxed()).unwrap_err();
        assert!(matches!(err, TaskError::SchedulerClosed(name) if name == "ui-closed"));
    }

    #[test]
    fn test_ui_scheduler_keeps_running_after_panic() {
        let ui = UiScheduler::spawn("ui-panic").unwrap();
        ui.submit(async { panic!("listener bug") }.boxed()).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        ui.submit(
            async move {
                tx.send(()).unwrap();
            }
            .boxed(),
        )
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        ui.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_io_scheduler_bounds_concurrency() {
        let io = IoScheduler::current(2).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let mut done = Vec::new();

        for _ in 0..8 {
            let (tx, rx) = oneshot::channel();
            let active = active.clone();
            let max_active = max_active.clone();
            io.submit(
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(());
                }
                .boxed(),
            )
            .unwrap();
            done.push(rx);
        }

        for rx in done {
            rx.await.unwrap();
        }
        assert!(max_active.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_dispatch_resolution() {
        let schedulers = Schedulers::new(Arc::new(InlineScheduler), Arc::new(InlineScheduler));
        assert_eq!(schedulers.resolve(&Dispatch::Io).name(), "inline");
        assert_eq!(format!("{:?}", Dispatch::Ui), "Ui");
        let custom = Dispatch::With(Arc::new(InlineScheduler));
        assert_eq!(format!("{:?}", custom), "With(inline)");
    }
}
