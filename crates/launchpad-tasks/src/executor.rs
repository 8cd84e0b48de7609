//! Task executor - drives one root task graph to a terminal state

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::context::RunContext;
use crate::error::{panic_message, ExecutorError, TaskError};
use crate::lock;
use crate::options::EngineOptions;
use crate::output::OutputPump;
use crate::reporter::{TaskEvent, TaskReporter, TaskReporterRegistry, TracingReporter};
use crate::scheduler::Schedulers;
use crate::stages::{StageAggregator, StageSnapshot};
use crate::task::{Task, TaskHandle};

/// Lifecycle of an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    NotStarted,
    Running,
    Stopped,
}

type Listener<T> = Box<dyn FnOnce(bool, &TaskExecutor<T>) + Send>;

struct Listeners<T> {
    pending: Vec<Listener<T>>,
    fired: Option<bool>,
}

struct Inner<T> {
    root: Mutex<Option<Task<T>>>,
    root_handle: TaskHandle,
    schedulers: Schedulers,
    options: Arc<EngineOptions>,
    registry: Arc<TaskReporterRegistry>,
    aggregator: Arc<StageAggregator>,
    state: Mutex<ExecutorState>,
    exception: OnceLock<TaskError>,
    result: Mutex<Option<T>>,
    listeners: Mutex<Listeners<T>>,
    done: watch::Sender<Option<bool>>,
}

/// Drives one root task off the caller's thread and notifies listeners
/// exactly once, on the UI scheduler, when it stops.
///
/// An executor is single-use: it cannot be restarted.
pub struct TaskExecutor<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskExecutor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("root", &self.inner.root_handle)
            .field("state", &*lock(&self.inner.state))
            .finish()
    }
}

/// Builder for [`TaskExecutor`]
pub struct ExecutorBuilder<T> {
    root: Task<T>,
    schedulers: Schedulers,
    options: EngineOptions,
    reporters: Vec<Arc<dyn TaskReporter>>,
    tracing: bool,
}

impl<T: Send + 'static> ExecutorBuilder<T> {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Add a reporter; reporters see events in registration order
    pub fn reporter(mut self, reporter: Arc<dyn TaskReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Do not log engine events through tracing
    pub fn without_tracing(mut self) -> Self {
        self.tracing = false;
        self
    }

    pub fn build(self) -> TaskExecutor<T> {
        let root_handle = self.root.handle().clone();
        let hint = root_handle
            .walk()
            .into_iter()
            .map(|h| h.stages_hint())
            .find(|hint| !hint.is_empty())
            .unwrap_or_default();
        let aggregator = Arc::new(StageAggregator::new(hint));

        // The aggregator goes first so reporters reading it see fresh numbers.
        let mut registry = TaskReporterRegistry::empty();
        registry.register_shared(aggregator.clone());
        for reporter in self.reporters {
            registry.register_shared(reporter);
        }
        if self.tracing {
            registry.register(TracingReporter);
        }

        let (done, _) = watch::channel(None);
        TaskExecutor {
            inner: Arc::new(Inner {
                root: Mutex::new(Some(self.root)),
                root_handle,
                schedulers: self.schedulers,
                options: Arc::new(self.options),
                registry: Arc::new(registry),
                aggregator,
                state: Mutex::new(ExecutorState::NotStarted),
                exception: OnceLock::new(),
                result: Mutex::new(None),
                listeners: Mutex::new(Listeners {
                    pending: Vec::new(),
                    fired: None,
                }),
                done,
            }),
        }
    }
}

impl<T: Send + 'static> TaskExecutor<T> {
    /// Executor with default options and tracing output
    pub fn new(root: Task<T>, schedulers: Schedulers) -> Self {
        Self::builder(root, schedulers).build()
    }

    pub fn builder(root: Task<T>, schedulers: Schedulers) -> ExecutorBuilder<T> {
        ExecutorBuilder {
            root,
            schedulers,
            options: EngineOptions::default(),
            reporters: Vec::new(),
            tracing: true,
        }
    }

    /// Begin running the root graph on the current tokio runtime; does not block
    pub fn start(&self) -> Result<(), ExecutorError> {
        let runtime = Handle::try_current().map_err(|_| ExecutorError::NoRuntime)?;
        let root = {
            let mut state = lock(&self.inner.state);
            if *state != ExecutorState::NotStarted {
                return Err(ExecutorError::AlreadyStarted);
            }
            let root = lock(&self.inner.root)
                .take()
                .ok_or(ExecutorError::AlreadyStarted)?;
            *state = ExecutorState::Running;
            root
        };

        let executor = self.clone();
        runtime.spawn(async move { executor.drive(root).await });
        Ok(())
    }

    #[instrument(skip_all, fields(root = %self.inner.root_handle.id()))]
    async fn drive(self, root: Task<T>) {
        let started = Instant::now();
        info!(name = %self.inner.root_handle.name(), "executor started");

        let reporter: Arc<dyn TaskReporter> = self.inner.registry.clone();
        let pump = OutputPump::spawn(reporter.clone());
        let cx = RunContext::new(
            self.inner.schedulers.clone(),
            reporter,
            pump.sender(),
            self.inner.options.clone(),
        );

        let outcome = AssertUnwindSafe(root.run(cx))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))));
        pump.finish().await;
        self.stop(outcome, started);
    }

    fn stop(&self, outcome: Result<T, TaskError>, started: Instant) {
        let success = outcome.is_ok();
        match outcome {
            Ok(value) => *lock(&self.inner.result) = Some(value),
            Err(err) => {
                if err.is_cancelled() {
                    info!("executor cancelled");
                } else {
                    warn!(error = %err, "executor failed");
                }
                let _ = self.inner.exception.set(err);
            }
        }
        *lock(&self.inner.state) = ExecutorState::Stopped;
        self.inner.registry.broadcast(&TaskEvent::ExecutorStopped {
            success,
            duration: started.elapsed(),
        });

        self.on_ui(move |executor| executor.fire_listeners(success));
    }

    fn fire_listeners(&self, success: bool) {
        let pending = {
            let mut listeners = lock(&self.inner.listeners);
            listeners.fired = Some(success);
            std::mem::take(&mut listeners.pending)
        };
        for listener in pending {
            self.call_listener(listener, success);
        }
        self.inner.done.send_replace(Some(success));
    }

    fn call_listener(&self, listener: Listener<T>, success: bool) {
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| listener(success, self))) {
            error!(panic = %panic_message(payload.as_ref()), "stop listener panicked");
        }
    }

    /// Run `job` on the UI scheduler, or inline if it no longer accepts work
    fn on_ui(&self, job: impl FnOnce(&TaskExecutor<T>) + Send + 'static) {
        let slot = Arc::new(Mutex::new(Some(job)));
        let queued = slot.clone();
        let executor = self.clone();
        let submitted = self.inner.schedulers.ui.submit(
            async move {
                if let Some(job) = lock(&queued).take() {
                    job(&executor);
                }
            }
            .boxed(),
        );
        if let Err(err) = submitted {
            warn!(error = %err, "ui scheduler unavailable; notifying inline");
            if let Some(job) = lock(&slot).take() {
                job(self);
            }
        }
    }

    /// Register a stop listener.
    ///
    /// Listeners run once each, in registration order, on the UI scheduler.
    /// A listener added after the executor stopped is scheduled at once.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(bool, &TaskExecutor<T>) + Send + 'static,
    {
        let mut listeners = lock(&self.inner.listeners);
        match listeners.fired {
            None => listeners.pending.push(Box::new(listener)),
            Some(success) => {
                drop(listeners);
                self.on_ui(move |executor| executor.call_listener(Box::new(listener), success));
            }
        }
    }

    /// The captured error after an unsuccessful stop
    pub fn exception(&self) -> Option<TaskError> {
        self.inner.exception.get().cloned()
    }

    /// Cancel the root task and, through it, everything running under it
    pub fn cancel(&self) {
        self.inner.root_handle.cancel();
    }

    pub fn state(&self) -> ExecutorState {
        *lock(&self.inner.state)
    }

    pub fn root(&self) -> &TaskHandle {
        &self.inner.root_handle
    }

    /// Overall pipeline progress from the stage aggregator
    pub fn progress(&self) -> f64 {
        self.inner.aggregator.overall()
    }

    pub fn stages(&self) -> Vec<StageSnapshot> {
        self.inner.aggregator.stages()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Take the root's result after a successful stop
    pub fn take_result(&self) -> Option<T> {
        lock(&self.inner.result).take()
    }

    /// Wait until the executor stopped and its listeners ran
    pub async fn wait(&self) -> bool {
        let mut done = self.inner.done.subscribe();
        // The watch borrow must end before `done` is dropped.
        let success = match done.wait_for(Option::is_some).await {
            Ok(fired) => (*fired).unwrap_or(false),
            // unreachable while `self` holds the sender
            Err(_) => false,
        };
        success
    }
}
