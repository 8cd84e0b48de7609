//! Output pump: many producers, one ordered consumer

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::reporter::{TaskEvent, TaskReporter};
use crate::task::TaskId;

/// One line of output from a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub id: TaskId,
    pub line: String,
    pub is_stderr: bool,
}

/// Producer side of the output queue; cheap to clone into any task
#[derive(Debug, Clone, Default)]
pub(crate) struct OutputSender(Option<mpsc::UnboundedSender<OutputLine>>);

impl OutputSender {
    /// Sender that drops everything
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        Self(None)
    }

    pub(crate) fn send(&self, line: OutputLine) {
        if let Some(tx) = &self.0 {
            // After the pump closed, late lines from abandoned workers are dropped.
            let _ = tx.send(line);
        }
    }
}

/// The single consumer forwarding queued lines as [`TaskEvent::Output`]
pub(crate) struct OutputPump {
    sender: OutputSender,
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<usize>,
}

impl OutputPump {
    pub(crate) fn spawn(reporter: Arc<dyn TaskReporter>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let mut forwarded = 0usize;
            let forward = |line: OutputLine| {
                reporter.report(&TaskEvent::Output {
                    id: line.id,
                    line: line.line,
                    is_stderr: line.is_stderr,
                });
            };
            loop {
                tokio::select! {
                    biased;
                    line = rx.recv() => match line {
                        Some(line) => {
                            forward(line);
                            forwarded += 1;
                        }
                        None => break,
                    },
                    _ = &mut shutdown_rx => {
                        rx.close();
                        while let Some(line) = rx.recv().await {
                            forward(line);
                            forwarded += 1;
                        }
                        break;
                    }
                }
            }
            forwarded
        });

        Self {
            sender: OutputSender(Some(tx)),
            shutdown,
            join,
        }
    }

    pub(crate) fn sender(&self) -> OutputSender {
        self.sender.clone()
    }

    /// Stop accepting lines and wait until everything queued was forwarded
    pub(crate) async fn finish(self) {
        let _ = self.shutdown.send(());
        drop(self.sender);
        match self.join.await {
            Ok(forwarded) => debug!(forwarded, "output pump drained"),
            Err(err) => debug!(error = %err, "output pump ended abnormally"),
        }
    }
}
