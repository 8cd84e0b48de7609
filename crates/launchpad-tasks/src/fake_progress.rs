//! Simulated progress for tasks that cannot report their own
//!
//! While the wrapped task runs and the completion predicate is false, the
//! decorated task's progress follows `t / (t + k)`, where `k` is the target
//! duration: half way at `k`, never above [`FAKE_PROGRESS_CEILING`]. Once
//! the wrapped task settles nothing more is simulated; the decorated task
//! then waits for the predicate and takes the wrapped task's result.

use std::time::Duration;

use futures::FutureExt;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::warn;

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::task::{Significance, Task, TaskKind};

/// Simulated progress never goes past this
pub const FAKE_PROGRESS_CEILING: f64 = 0.99;

/// Eased progress after `elapsed` for target duration `target`
pub fn ease(elapsed: Duration, target: Duration) -> f64 {
    let t = elapsed.as_secs_f64();
    let k = target.as_secs_f64();
    if k <= 0.0 {
        return FAKE_PROGRESS_CEILING;
    }
    (t / (t + k)).min(FAKE_PROGRESS_CEILING)
}

impl<T: Send + 'static> Task<T> {
    /// Drive progress with an easing curve until `done` reports true.
    ///
    /// `done` is polled on the engine's fake-progress interval. A successful
    /// wrapped task does not finish the decorated one on its own: it still
    /// waits for `done`, forever unless cancelled, or until
    /// [`EngineOptions::fake_progress_max_wait`] runs out.
    ///
    /// [`EngineOptions::fake_progress_max_wait`]: crate::EngineOptions::fake_progress_max_wait
    pub fn with_fake_progress<F>(self, message: impl Into<String>, target: Duration, done: F) -> Task<T>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let inner = self;
        let inner_handle = inner.handle.clone();
        let message = message.into();

        let decorated = Task::composite(
            format!("{} (estimated)", inner_handle.name()),
            Significance::Major,
            TaskKind::Decorated,
            move |me, cx| {
                async move {
                    let tcx = TaskContext::new(me.clone(), cx.clone());
                    tcx.update_message(message);

                    let started = Instant::now();
                    let mut ticker = time::interval(cx.options.fake_progress_interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                    let mut running = inner.run(cx.clone());
                    let value = loop {
                        tokio::select! {
                            biased;
                            outcome = &mut running => break outcome?,
                            _ = ticker.tick() => {
                                if !done() {
                                    tcx.update_progress(ease(started.elapsed(), target));
                                }
                            }
                        }
                    };

                    let predicate = async {
                        while !done() {
                            ticker.tick().await;
                        }
                    };
                    let bounded = async {
                        match cx.options.fake_progress_max_wait {
                            Some(limit) => {
                                if time::timeout(limit, predicate).await.is_err() {
                                    warn!(
                                        task = %me.id(),
                                        waited_ms = limit.as_millis() as u64,
                                        "completion predicate never held; finishing anyway"
                                    );
                                }
                            }
                            None => predicate.await,
                        }
                    };
                    tokio::select! {
                        _ = me.token().cancelled() => return Err(TaskError::Cancelled),
                        _ = bounded => {}
                    }
                    Ok(value)
                }
                .boxed()
            },
        );
        decorated.handle.adopt(&inner_handle);
        decorated
    }
}
