//! Task execution reporting

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::lock;
use crate::task::{Significance, TaskId};

/// Events emitted while a task graph runs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task entered `Running`
    Started {
        id: TaskId,
        name: String,
        stage: Option<String>,
        significance: Significance,
    },
    /// A running task raised its progress
    Progress { id: TaskId, progress: f64 },
    /// A running task replaced its status message
    Message { id: TaskId, message: String },
    /// A transfer rate; zero clears the display
    Speed { id: TaskId, bytes_per_second: u64 },
    /// A task produced a line of output
    Output {
        id: TaskId,
        line: String,
        is_stderr: bool,
    },
    /// A task completed successfully
    Succeeded { id: TaskId, duration: Duration },
    /// A task failed
    Failed { id: TaskId, error: String },
    /// A task was cancelled, or never started because it was cancelled
    Cancelled { id: TaskId },
    /// An explicit no-op task ran
    Skipped { id: TaskId },
    /// The executor's root reached a terminal state
    ExecutorStopped { success: bool, duration: Duration },
}

impl TaskEvent {
    /// The task this event is about, if any
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Started { id, .. }
            | Self::Progress { id, .. }
            | Self::Message { id, .. }
            | Self::Speed { id, .. }
            | Self::Output { id, .. }
            | Self::Succeeded { id, .. }
            | Self::Failed { id, .. }
            | Self::Cancelled { id }
            | Self::Skipped { id } => Some(*id),
            Self::ExecutorStopped { .. } => None,
        }
    }
}

/// Trait for reporting task execution progress
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Started {
                id,
                name,
                stage,
                significance,
            } => {
                let stage = stage.as_deref().unwrap_or("-");
                match significance {
                    Significance::Major => tracing::info!(task = %id, stage, "Starting {}", name),
                    Significance::Minor => tracing::debug!(task = %id, stage, "Starting {}", name),
                }
            }
            TaskEvent::Progress { id, progress } => {
                tracing::trace!(task = %id, "progress {:.1}%", progress * 100.0);
            }
            TaskEvent::Message { id, message } => {
                tracing::debug!(task = %id, "{}", message);
            }
            TaskEvent::Speed {
                id,
                bytes_per_second,
            } => {
                tracing::trace!(task = %id, bytes_per_second, "transfer speed");
            }
            TaskEvent::Output { id, line, is_stderr } => {
                if *is_stderr {
                    tracing::warn!("[{}] {}", id, line);
                } else {
                    tracing::debug!("[{}] {}", id, line);
                }
            }
            TaskEvent::Succeeded { id, duration } => {
                tracing::debug!("{} completed in {:.1}s", id, duration.as_secs_f64());
            }
            TaskEvent::Failed { id, error } => {
                tracing::warn!("{} failed: {}", id, error);
            }
            TaskEvent::Cancelled { id } => {
                tracing::debug!("{} cancelled", id);
            }
            TaskEvent::Skipped { id } => {
                tracing::debug!("{} skipped", id);
            }
            TaskEvent::ExecutorStopped { success, duration } => {
                if *success {
                    tracing::info!("Pipeline complete ({:.1}s)", duration.as_secs_f64());
                } else {
                    tracing::warn!("Pipeline stopped without success ({:.1}s)", duration.as_secs_f64());
                }
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: std::sync::Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        lock(&self.events).clone()
    }

    /// Events concerning one task, in arrival order
    pub fn events_for(&self, id: TaskId) -> Vec<TaskEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| e.task_id() == Some(id))
            .cloned()
            .collect()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        lock(&self.events).push(event.clone());
    }
}

/// Forwards events into a channel, for presentation layers that poll
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TaskReporter for ChannelReporter {
    fn report(&self, event: &TaskEvent) {
        // A closed receiver just means nobody is watching any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Registry of task reporters
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    /// Register a reporter the caller keeps a reference to
    pub fn register_shared(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }

    pub fn broadcast(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        self.broadcast(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskHandle;

    fn some_id() -> TaskId {
        TaskHandle::new("t", Significance::Major).id()
    }

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::new();
        let id = some_id();
        reporter.report(&TaskEvent::Started {
            id,
            name: "fetch".into(),
            stage: Some("update".into()),
            significance: Significance::Major,
        });
        reporter.report(&TaskEvent::ExecutorStopped {
            success: true,
            duration: Duration::from_secs(1),
        });

        assert_eq!(reporter.events().len(), 2);
        assert_eq!(reporter.events_for(id).len(), 1);
    }

    #[test]
    fn test_registry_broadcasts_in_order() {
        let first = Arc::new(CollectingReporter::new());
        let second = Arc::new(CollectingReporter::new());
        let mut registry = TaskReporterRegistry::empty();
        registry.register_shared(first.clone());
        registry.register_shared(second.clone());

        let id = some_id();
        registry.broadcast(&TaskEvent::Skipped { id });
        assert_eq!(first.events(), vec![TaskEvent::Skipped { id }]);
        assert_eq!(second.events(), vec![TaskEvent::Skipped { id }]);
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn test_default_registry_has_tracing_reporter() {
        assert_eq!(TaskReporterRegistry::new().all().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_reporter_forwards() {
        let (reporter, mut rx) = ChannelReporter::new();
        let id = some_id();
        reporter.report(&TaskEvent::Progress { id, progress: 0.5 });
        assert_eq!(rx.recv().await, Some(TaskEvent::Progress { id, progress: 0.5 }));
    }
}
