//! Task types and the per-task state machine

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::context::{RunContext, TaskContext};
use crate::error::{panic_message, TaskError};
use crate::executor::TaskExecutor;
use crate::lock;
use crate::reporter::TaskEvent;
use crate::scheduler::{Dispatch, Schedulers};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a task
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Whether a task is surfaced individually in the stage list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    /// Visible in the stage list
    Major,
    /// Counted in progress only
    Minor,
}

struct Meta {
    name: String,
    state: TaskState,
    stage: Option<String>,
    significance: Significance,
    progress: f64,
    message: String,
    stages_hint: Vec<String>,
}

struct HandleInner {
    id: TaskId,
    meta: Mutex<Meta>,
    parent: Mutex<Weak<HandleInner>>,
    dependencies: Mutex<Vec<TaskHandle>>,
    dependents: Mutex<Vec<TaskHandle>>,
    token: CancelToken,
}

/// Shared, observable view of a task.
///
/// Handles stay valid after the task is consumed by a combinator or an
/// executor, so callers can keep one to watch progress or to cancel.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

impl TaskHandle {
    pub(crate) fn new(name: impl Into<String>, significance: Significance) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: TaskId::next(),
                meta: Mutex::new(Meta {
                    name: name.into(),
                    state: TaskState::Pending,
                    stage: None,
                    significance,
                    progress: 0.0,
                    message: String::new(),
                    stages_hint: Vec::new(),
                }),
                parent: Mutex::new(Weak::new()),
                dependencies: Mutex::new(Vec::new()),
                dependents: Mutex::new(Vec::new()),
                token: CancelToken::new(),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> String {
        lock(&self.inner.meta).name.clone()
    }

    pub fn state(&self) -> TaskState {
        lock(&self.inner.meta).state
    }

    /// Stage label, inherited from the composing task unless overridden
    pub fn stage(&self) -> Option<String> {
        if let Some(stage) = lock(&self.inner.meta).stage.clone() {
            return Some(stage);
        }
        self.parent().and_then(|p| p.stage())
    }

    pub fn significance(&self) -> Significance {
        lock(&self.inner.meta).significance
    }

    /// Current progress in `[0, 1]`
    pub fn progress(&self) -> f64 {
        lock(&self.inner.meta).progress
    }

    pub fn message(&self) -> String {
        lock(&self.inner.meta).message.clone()
    }

    /// Ordered stage ids this task declared for the whole pipeline
    pub fn stages_hint(&self) -> Vec<String> {
        lock(&self.inner.meta).stages_hint.clone()
    }

    /// Tasks whose success this task waited on
    pub fn dependencies(&self) -> Vec<TaskHandle> {
        lock(&self.inner.dependencies).clone()
    }

    /// Tasks owned by this one; cancellation fans out to them
    pub fn dependents(&self) -> Vec<TaskHandle> {
        lock(&self.inner.dependents).clone()
    }

    /// The task that composed this one, if it is still alive
    pub fn parent(&self) -> Option<TaskHandle> {
        lock(&self.inner.parent)
            .upgrade()
            .map(|inner| TaskHandle { inner })
    }

    /// Request cancellation. Idempotent; await the terminal state to observe it.
    pub fn cancel(&self) {
        if !self.inner.token.is_cancelled() {
            debug!(task = %self.id(), name = %self.name(), "cancellation requested");
        }
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// This task followed by every task it owns, depth-first
    pub fn walk(&self) -> Vec<TaskHandle> {
        let mut out = vec![self.clone()];
        for child in self.dependents() {
            out.extend(child.walk());
        }
        out
    }

    pub(crate) fn token(&self) -> &CancelToken {
        &self.inner.token
    }

    pub(crate) fn downgrade(&self) -> WeakHandle {
        WeakHandle(Arc::downgrade(&self.inner))
    }

    /// Take ownership of `child`: it inherits this stage and follows this token
    pub(crate) fn adopt(&self, child: &TaskHandle) {
        *lock(&child.inner.parent) = Arc::downgrade(&self.inner);
        lock(&self.inner.dependents).push(child.clone());
        self.inner.token.attach_child(&child.inner.token);
    }

    pub(crate) fn add_dependency(&self, dependency: &TaskHandle) {
        lock(&self.inner.dependencies).push(dependency.clone());
    }

    fn update_meta(&self, f: impl FnOnce(&mut Meta)) {
        f(&mut lock(&self.inner.meta));
    }

    /// Pending -> Running
    pub(crate) fn begin(&self) -> bool {
        let mut meta = lock(&self.inner.meta);
        if meta.state != TaskState::Pending {
            return false;
        }
        meta.state = TaskState::Running;
        true
    }

    /// Enter a terminal state; later calls are ignored
    pub(crate) fn finish(&self, state: TaskState) -> bool {
        let mut meta = lock(&self.inner.meta);
        if meta.state.is_terminal() {
            return false;
        }
        if state == TaskState::Succeeded {
            meta.progress = 1.0;
        }
        meta.state = state;
        true
    }

    fn is_publishing(meta: &Meta, token: &CancelToken) -> bool {
        meta.state == TaskState::Running && !token.is_cancelled()
    }

    /// Raise progress; returns the new value when it changed
    pub(crate) fn set_progress(&self, value: f64) -> Option<f64> {
        if value.is_nan() {
            return None;
        }
        let mut meta = lock(&self.inner.meta);
        if !Self::is_publishing(&meta, &self.inner.token) {
            return None;
        }
        let clamped = value.clamp(0.0, 1.0);
        if clamped <= meta.progress {
            return None;
        }
        meta.progress = clamped;
        Some(clamped)
    }

    pub(crate) fn set_message(&self, message: String) -> bool {
        let mut meta = lock(&self.inner.meta);
        if !Self::is_publishing(&meta, &self.inner.token) {
            return false;
        }
        meta.message = message;
        true
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = lock(&self.inner.meta);
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("name", &meta.name)
            .field("state", &meta.state)
            .field("progress", &meta.progress)
            .finish()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TaskHandle {}

/// Non-owning handle, for hooks stored inside the task's own token
#[derive(Clone)]
pub(crate) struct WeakHandle(Weak<HandleInner>);

impl WeakHandle {
    pub(crate) fn upgrade(&self) -> Option<TaskHandle> {
        self.0.upgrade().map(|inner| TaskHandle { inner })
    }
}

pub(crate) type LeafBody<T> =
    Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, anyhow::Result<T>> + Send>;

pub(crate) type Runner<T> =
    Box<dyn FnOnce(TaskHandle, RunContext) -> BoxFuture<'static, Result<T, TaskError>> + Send>;

pub(crate) enum TaskKind<T> {
    /// Already resolved value
    Ready(T),
    /// Explicit no-op; succeeds and is reported as skipped
    Skip(T),
    /// Caller-supplied body run on a scheduler
    Leaf { dispatch: Dispatch, body: LeafBody<T> },
    /// Runs a predecessor, then its own step
    Continuation(Runner<T>),
    /// Runs several tasks concurrently
    Join(Runner<T>),
    /// Bridges an external operation
    Adapter(Runner<T>),
    /// Wraps another task with extra behavior
    Decorated(Runner<T>),
}

impl<T> TaskKind<T> {
    fn label(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::Skip(_) => "skip",
            Self::Leaf { .. } => "leaf",
            Self::Continuation(_) => "continuation",
            Self::Join(_) => "join",
            Self::Adapter(_) => "adapter",
            Self::Decorated(_) => "decorated",
        }
    }
}

/// A unit of asynchronous work producing a `T`.
///
/// Tasks are inert until run by a [`TaskExecutor`]; combinators consume a
/// task and return a new one that owns it.
#[must_use = "tasks do nothing unless composed or executed"]
pub struct Task<T> {
    pub(crate) handle: TaskHandle,
    pub(crate) kind: TaskKind<T>,
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind.label())
            .field("handle", &self.handle)
            .finish()
    }
}

impl<T: Send + 'static> Task<T> {
    /// Leaf task whose body runs on the I/O scheduler
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::new_on(Dispatch::Io, body)
    }

    /// Leaf task whose body runs on the given scheduler
    pub fn new_on<F, Fut>(dispatch: Dispatch, body: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            handle: TaskHandle::new("task", Significance::Major),
            kind: TaskKind::Leaf {
                dispatch,
                body: Box::new(move |cx| body(cx).boxed()),
            },
        }
    }

    /// Task that is already resolved
    pub fn completed(value: T) -> Self {
        Self {
            handle: TaskHandle::new("completed", Significance::Minor),
            kind: TaskKind::Ready(value),
        }
    }

    pub(crate) fn composite(
        name: impl Into<String>,
        significance: Significance,
        make: impl FnOnce(Runner<T>) -> TaskKind<T>,
        run: impl FnOnce(TaskHandle, RunContext) -> BoxFuture<'static, Result<T, TaskError>>
            + Send
            + 'static,
    ) -> Self {
        Self {
            handle: TaskHandle::new(name, significance),
            kind: make(Box::new(run)),
        }
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.handle.update_meta(|m| m.name = name);
        self
    }

    /// Attach or override the stage label
    pub fn with_stage(self, stage: impl Into<String>) -> Self {
        let stage = stage.into();
        self.handle.update_meta(|m| m.stage = Some(stage));
        self
    }

    pub fn with_significance(self, significance: Significance) -> Self {
        self.handle.update_meta(|m| m.significance = significance);
        self
    }

    /// Declare the ordered stage ids the whole pipeline passes through
    pub fn with_stages_hint<I, S>(self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stages: Vec<String> = stages.into_iter().map(Into::into).collect();
        self.handle.update_meta(|m| m.stages_hint = stages);
        self
    }

    /// Move a leaf body to another scheduler. No effect on composed tasks.
    pub fn on(mut self, dispatch: Dispatch) -> Self {
        if let TaskKind::Leaf { dispatch: d, .. } = &mut self.kind {
            *d = dispatch;
        }
        self
    }

    /// Best-effort abort hook, invoked if the task is cancelled while running
    pub fn with_abort(self, hook: impl FnOnce() + Send + 'static) -> Self {
        let weak = self.handle.downgrade();
        self.handle.token().on_cancel(move || {
            let running = weak
                .upgrade()
                .map(|h| h.state() == TaskState::Running)
                .unwrap_or(false);
            if running {
                hook();
            }
        });
        self
    }

    /// Request cancellation of this task before or while it runs
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Bind this task to a new executor
    pub fn executor(self, schedulers: Schedulers) -> TaskExecutor<T> {
        TaskExecutor::new(self, schedulers)
    }

    /// Drive this task to a terminal state
    pub(crate) fn run(self, cx: RunContext) -> BoxFuture<'static, Result<T, TaskError>> {
        let Task { handle, kind } = self;
        async move {
            let id = handle.id();
            if handle.is_cancelled() {
                // never started
                handle.finish(TaskState::Cancelled);
                cx.report(&TaskEvent::Cancelled { id });
                return Err(TaskError::Cancelled);
            }

            if !handle.begin() {
                return Err(TaskError::msg(format!("task {} was already run", id)));
            }
            trace!(task = %id, kind = kind.label(), "task started");
            // Continuations announce themselves after their predecessor.
            if !matches!(kind, TaskKind::Continuation(_)) {
                announce(&handle, &cx);
            }

            let started = Instant::now();
            let mut skipped = false;
            let outcome = match kind {
                TaskKind::Ready(value) => Ok(value),
                TaskKind::Skip(value) => {
                    skipped = true;
                    Ok(value)
                }
                TaskKind::Leaf { dispatch, body } => run_leaf(&handle, &cx, &dispatch, body).await,
                TaskKind::Continuation(run)
                | TaskKind::Join(run)
                | TaskKind::Adapter(run)
                | TaskKind::Decorated(run) => run(handle.clone(), cx.clone()).await,
            };

            settle(&handle, &cx, outcome, skipped, started)
        }
        .boxed()
    }
}

impl Task<()> {
    /// Explicit no-op step; succeeds and is reported as skipped
    pub fn skip() -> Self {
        Self {
            handle: TaskHandle::new("skip", Significance::Minor),
            kind: TaskKind::Skip(()),
        }
    }
}

/// Report `Started` for a task, entering its stage
pub(crate) fn announce(handle: &TaskHandle, cx: &RunContext) {
    cx.report(&TaskEvent::Started {
        id: handle.id(),
        name: handle.name(),
        stage: handle.stage(),
        significance: handle.significance(),
    });
}

fn settle<T>(
    handle: &TaskHandle,
    cx: &RunContext,
    outcome: Result<T, TaskError>,
    skipped: bool,
    started: Instant,
) -> Result<T, TaskError> {
    let id = handle.id();
    match &outcome {
        Ok(_) => {
            handle.finish(TaskState::Succeeded);
            if skipped {
                cx.report(&TaskEvent::Skipped { id });
            } else {
                cx.report(&TaskEvent::Succeeded {
                    id,
                    duration: started.elapsed(),
                });
            }
        }
        Err(TaskError::Cancelled) => {
            handle.finish(TaskState::Cancelled);
            cx.report(&TaskEvent::Cancelled { id });
        }
        Err(err) => {
            handle.finish(TaskState::Failed);
            cx.report(&TaskEvent::Failed {
                id,
                error: err.to_string(),
            });
        }
    }
    outcome
}

/// Run a caller body on a scheduler, racing it against cancellation.
///
/// Panics and errors are captured at this boundary.
pub(crate) async fn run_leaf<T: Send + 'static>(
    handle: &TaskHandle,
    cx: &RunContext,
    dispatch: &Dispatch,
    body: LeafBody<T>,
) -> Result<T, TaskError> {
    let scheduler = cx.schedulers.resolve(dispatch);
    let (tx, rx) = oneshot::channel();
    let token = handle.token().clone();
    let task_cx = TaskContext::new(handle.clone(), cx.clone());

    scheduler.submit(
        async move {
            if token.is_cancelled() {
                let _ = tx.send(Err(TaskError::Cancelled));
                return;
            }
            let guarded = AssertUnwindSafe(async move { body(task_cx).await }).catch_unwind();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(TaskError::Cancelled),
                caught = guarded => match caught {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(TaskError::from(err)),
                    Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
                },
            };
            let _ = tx.send(result);
        }
        .boxed(),
    )?;

    rx.await
        .unwrap_or_else(|_| Err(TaskError::SchedulerClosed(scheduler.name().to_string())))
}
