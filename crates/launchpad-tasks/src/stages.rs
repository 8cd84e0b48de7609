//! Stage aggregation
//!
//! Folds the events of a whole task graph onto the short, ordered stage list
//! a pipeline declares with `with_stages_hint`, and derives one overall
//! progress number from it:
//!
//! ```text
//! overall = (stages done + fraction of the current stage) / stage count
//! ```
//!
//! Entering a stage completes every earlier stage, so a stage whose task
//! never ran does not stall the bar at zero.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::lock;
use crate::reporter::{TaskEvent, TaskReporter};
use crate::task::{Significance, TaskId};

/// Status of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

/// Point-in-time view of one stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub id: String,
    pub status: StageStatus,
    /// Fraction of this stage's work observed so far
    pub progress: f64,
    /// Latest major task seen in this stage
    pub task: Option<String>,
    /// Latest message from a major task in this stage
    pub message: Option<String>,
}

#[derive(Debug)]
struct TrackedTask {
    stage: usize,
    name: String,
    significance: Significance,
    progress: f64,
    counted: bool,
}

#[derive(Debug, Default)]
struct State {
    stages: Vec<StageSnapshot>,
    tasks: HashMap<TaskId, TrackedTask>,
    current: Option<usize>,
    overall: f64,
}

impl State {
    fn enter(&mut self, index: usize) {
        for earlier in &mut self.stages[..index] {
            if matches!(earlier.status, StageStatus::Pending | StageStatus::Running) {
                earlier.status = StageStatus::Done;
                earlier.progress = 1.0;
            }
        }
        let stage = &mut self.stages[index];
        if stage.status == StageStatus::Pending {
            stage.status = StageStatus::Running;
        }
        if self.current.map_or(true, |c| index > c) {
            self.current = Some(index);
        }
    }

    fn stage_fraction(&self, index: usize) -> f64 {
        let (sum, n) = self
            .tasks
            .values()
            .filter(|t| t.stage == index && t.counted)
            .fold((0.0, 0usize), |(sum, n), t| (sum + t.progress, n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }

    fn recompute(&mut self) {
        if self.stages.is_empty() {
            return;
        }
        for i in 0..self.stages.len() {
            if self.stages[i].status == StageStatus::Running {
                let fraction = self.stage_fraction(i);
                let stage = &mut self.stages[i];
                stage.progress = stage.progress.max(fraction);
            }
        }
        let done = self
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Done)
            .count();
        let current = self
            .current
            .filter(|&c| self.stages[c].status == StageStatus::Running)
            .map(|c| self.stages[c].progress)
            .unwrap_or(0.0);
        let overall = ((done as f64 + current) / self.stages.len() as f64).min(1.0);
        self.overall = self.overall.max(overall);
    }

    fn task_finished(&mut self, id: TaskId, status: Option<StageStatus>) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let stage = task.stage;
        match status {
            None => {
                task.progress = 1.0;
                task.counted = true;
            }
            Some(status) => {
                let entry = &mut self.stages[stage];
                if entry.status == StageStatus::Running {
                    entry.status = status;
                }
            }
        }
    }
}

/// Stage-level view of a running pipeline; a [`TaskReporter`]
#[derive(Debug, Default)]
pub struct StageAggregator {
    state: Mutex<State>,
}

impl StageAggregator {
    /// Track the given ordered stage ids
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stages = stages
            .into_iter()
            .map(|id| StageSnapshot {
                id: id.into(),
                status: StageStatus::Pending,
                progress: 0.0,
                task: None,
                message: None,
            })
            .collect();
        Self {
            state: Mutex::new(State {
                stages,
                ..State::default()
            }),
        }
    }

    /// Overall progress in `[0, 1]`; never decreases
    pub fn overall(&self) -> f64 {
        lock(&self.state).overall
    }

    pub fn stages(&self) -> Vec<StageSnapshot> {
        lock(&self.state).stages.clone()
    }

    /// Id of the furthest stage entered so far
    pub fn current(&self) -> Option<String> {
        let state = lock(&self.state);
        state.current.map(|c| state.stages[c].id.clone())
    }
}

impl TaskReporter for StageAggregator {
    fn report(&self, event: &TaskEvent) {
        let mut state = lock(&self.state);
        if state.stages.is_empty() {
            return;
        }
        match event {
            TaskEvent::Started {
                id,
                name,
                stage: Some(stage),
                significance,
            } => {
                let Some(index) = state.stages.iter().position(|s| &s.id == stage) else {
                    return;
                };
                state.enter(index);
                if *significance == Significance::Major {
                    state.stages[index].task = Some(name.clone());
                }
                state.tasks.insert(
                    *id,
                    TrackedTask {
                        stage: index,
                        name: name.clone(),
                        significance: *significance,
                        progress: 0.0,
                        counted: false,
                    },
                );
            }
            TaskEvent::Progress { id, progress } => {
                if let Some(task) = state.tasks.get_mut(id) {
                    task.progress = task.progress.max(*progress);
                    task.counted = true;
                }
            }
            TaskEvent::Message { id, message } => {
                if let Some(task) = state.tasks.get(id) {
                    if task.significance == Significance::Major {
                        let (index, name) = (task.stage, task.name.clone());
                        let stage = &mut state.stages[index];
                        stage.message = Some(message.clone());
                        stage.task = Some(name);
                    }
                }
            }
            TaskEvent::Succeeded { id, .. } | TaskEvent::Skipped { id } => {
                state.task_finished(*id, None);
            }
            TaskEvent::Failed { id, .. } => state.task_finished(*id, Some(StageStatus::Failed)),
            TaskEvent::Cancelled { id } => state.task_finished(*id, Some(StageStatus::Cancelled)),
            TaskEvent::ExecutorStopped { success: true, .. } => {
                for stage in &mut state.stages {
                    stage.status = StageStatus::Done;
                    stage.progress = 1.0;
                }
                state.overall = 1.0;
                return;
            }
            _ => return,
        }
        state.recompute();
    }
}
