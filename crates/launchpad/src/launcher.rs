//! Simulated launcher pipeline
//!
//! Builds the task graph the `launch` command runs: file update check,
//! Java resolution, dependency verification, login and game start. Every
//! step only pretends to work, but each one goes through the engine the
//! way a real launcher step would: the updater is an uncooperative
//! blocking call, login is callback based, verification is a parallel
//! join and the final wait for the game window is estimated progress.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use launchpad_tasks::{
    Completer, Dispatch, ProgressCallback, Significance, Task, TaskContext, TaskError,
    TaskProgressCallback,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub const STAGE_FILES: &str = "launch.state.files_updating";
pub const STAGE_JAVA: &str = "launch.state.java";
pub const STAGE_DEPENDENCIES: &str = "launch.state.dependencies";
pub const STAGE_LOGIN: &str = "launch.state.logging_in";
pub const STAGE_LAUNCH: &str = "launch.state.waiting_launching";

/// Stages of the pipeline, in order
pub const STAGES: [&str; 5] = [
    STAGE_FILES,
    STAGE_JAVA,
    STAGE_DEPENDENCIES,
    STAGE_LOGIN,
    STAGE_LAUNCH,
];

/// Files the simulated updater pretends to fetch, with their rate in KiB/s
const UPDATE_FILES: &[(&str, u32)] = &[
    ("mods/sodium.jar", 820),
    ("mods/lithium.jar", 410),
    ("config/options.txt", 12),
    ("resourcepacks/faithful.zip", 2400),
];

const CHUNKS_PER_FILE: u32 = 4;

/// Failure injected with `--fail-at`
#[derive(Debug, Error)]
#[error("simulated failure while {step}")]
pub struct SimulatedFailure {
    pub stage: &'static str,
    pub step: &'static str,
}

/// Find a stage by full id (`launch.state.java`) or by its last segment (`java`)
pub fn resolve_stage(name: &str) -> Option<&'static str> {
    STAGES
        .iter()
        .copied()
        .find(|id| *id == name || id.rsplit('.').next() == Some(name))
}

/// Knobs of one simulated launch
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Stage that fails on purpose
    pub fail_at: Option<&'static str>,
    /// Skip login and play offline
    pub offline_ready: bool,
    /// Time from process start until the game window shows up
    pub launch_delay: Duration,
    /// Easing constant of the estimated launch progress
    pub progress_target: Duration,
    /// Base unit of simulated work
    pub tick: Duration,
    pub player: String,
}

impl Default for LaunchPlan {
    fn default() -> Self {
        Self {
            fail_at: None,
            offline_ready: false,
            launch_delay: Duration::from_millis(1500),
            progress_target: Duration::from_secs_f64(6.95),
            tick: Duration::from_millis(40),
            player: "Player".to_string(),
        }
    }
}

impl LaunchPlan {
    fn check(&self, stage: &'static str, step: &'static str) -> anyhow::Result<()> {
        if self.fail_at == Some(stage) {
            return Err(SimulatedFailure { stage, step }.into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JavaRuntime {
    pub version: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub player: String,
    pub offline: bool,
}

/// What a successful launch produced
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub files_updated: bool,
    pub java: JavaRuntime,
    pub verified: usize,
    pub session: Session,
    pub pid: u32,
}

#[derive(Debug)]
struct Prepared {
    files_updated: bool,
    java: JavaRuntime,
    verified: usize,
    session: Session,
}

/// Build the whole launch graph
pub fn build(plan: LaunchPlan, stages: Vec<String>) -> Task<LaunchReport> {
    let plan = Arc::new(plan);
    let (java_plan, deps_plan, login_plan, launch_plan) =
        (plan.clone(), plan.clone(), plan.clone(), plan.clone());

    update_check(plan)
        .and_then(move |files_updated| {
            resolve_java(java_plan).map(move |java| (files_updated, java))
        })
        .and_then(move |(files_updated, java)| {
            verify_dependencies(deps_plan).map(move |verified| (files_updated, java, verified))
        })
        .and_then(move |(files_updated, java, verified)| {
            login(login_plan).map(move |session| Prepared {
                files_updated,
                java,
                verified,
                session,
            })
        })
        .and_then_on(Dispatch::Ui, move |prepared| launch(launch_plan, prepared))
        .with_name("launch pipeline")
        .with_stages_hint(stages)
}

fn update_check(plan: Arc<LaunchPlan>) -> Task<bool> {
    Task::blocking(move |bcx| {
        let callback = TaskProgressCallback::from_blocking(&bcx);
        run_updater(&callback, &plan)
    })
    .with_name("check for file updates")
    .with_stage(STAGE_FILES)
}

/// Stand-in for the external file updater: blocking, polls for interrupts
/// between chunks and talks only through its callback.
fn run_updater(callback: &dyn ProgressCallback, plan: &LaunchPlan) -> anyhow::Result<bool> {
    callback.update_title("Checking for file updates");
    callback.update_label("Comparing local files with the pack manifest");

    let total = UPDATE_FILES.len() as u32 * CHUNKS_PER_FILE;
    for (index, (file, rate)) in UPDATE_FILES.iter().enumerate() {
        for chunk in 1..=CHUNKS_PER_FILE {
            if callback.should_interrupt() {
                debug!(file, "updater interrupted");
                return Err(TaskError::Cancelled.into());
            }
            std::thread::sleep(plan.tick);
            let done = index as u32 * CHUNKS_PER_FILE + chunk;
            callback.update_progress(
                &format!("{file} - {}% - {rate} KiB/s", chunk * 100 / CHUNKS_PER_FILE),
                done * 1000 / total,
            );
        }
        if index == 1 {
            plan.check(STAGE_FILES, "downloading file updates")?;
        }
    }

    callback.show_completion_message(true);
    Ok(true)
}

fn resolve_java(plan: Arc<LaunchPlan>) -> Task<JavaRuntime> {
    Task::new(move |cx| async move {
        cx.update_message("Searching for Java runtimes");
        let candidates = [8u32, 17, 21];
        for (probed, version) in candidates.iter().enumerate() {
            cx.check_cancelled()?;
            tokio::time::sleep(plan.tick * 2).await;
            debug!(version, "probed java candidate");
            cx.update_progress((probed + 1) as f64 / candidates.len() as f64);
        }
        plan.check(STAGE_JAVA, "resolving the Java runtime")?;

        let java = JavaRuntime {
            version: 17,
            path: PathBuf::from("/usr/lib/jvm/java-17/bin/java"),
        };
        cx.update_message(format!("Using Java {}", java.version));
        Ok(java)
    })
    .with_name("resolve java")
    .with_stage(STAGE_JAVA)
}

fn verify_dependencies(plan: Arc<LaunchPlan>) -> Task<usize> {
    let checks = [("libraries", 48usize), ("assets", 160), ("natives", 6)];
    let branches: Vec<_> = checks
        .iter()
        .map(|&(kind, count)| verify(plan.clone(), kind, count))
        .collect();

    Task::all_of(branches)
        .with_name("verify dependencies")
        .with_significance(Significance::Major)
        .with_stage(STAGE_DEPENDENCIES)
        .map(|counts| counts.into_iter().sum())
}

fn verify(plan: Arc<LaunchPlan>, kind: &'static str, count: usize) -> Task<usize> {
    Task::new(move |cx| async move {
        for checked in 1..=count {
            if checked % 8 == 0 {
                tokio::time::sleep(plan.tick / 4).await;
            }
            cx.update_progress(checked as f64 / count as f64);
        }
        if kind == "natives" {
            plan.check(STAGE_DEPENDENCIES, "extracting natives")?;
        }
        debug!(kind, count, "dependencies verified");
        Ok(count)
    })
    .with_name(format!("verify {kind}"))
    .with_significance(Significance::Minor)
}

fn login(plan: Arc<LaunchPlan>) -> Task<Session> {
    if plan.offline_ready {
        return Task::skip()
            .with_name("log in")
            .with_stage(STAGE_LOGIN)
            .map(move |()| Session {
                player: plan.player.clone(),
                offline: true,
            });
    }

    Task::from_callback(move |completer: Completer<Session>| {
        let fallback = completer.clone();
        let spawned = std::thread::Builder::new()
            .name("launchpad-auth".to_string())
            .spawn(move || {
                std::thread::sleep(plan.tick * 8);
                if completer.is_cancelled() {
                    return;
                }
                match plan.check(STAGE_LOGIN, "authenticating") {
                    Ok(()) => completer.complete(Session {
                        player: plan.player.clone(),
                        offline: false,
                    }),
                    Err(err) => completer.fail(err),
                };
            });
        if let Err(err) = spawned {
            fallback.fail(err);
        }
    })
    .with_name("log in")
    .with_stage(STAGE_LOGIN)
}

/// Raise `window` after `delay` unless the task behind `cx` is cancelled first
fn open_window_after(cx: &TaskContext, delay: Duration, window: Arc<AtomicBool>) {
    let opener = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        window.store(true, Ordering::SeqCst);
    });
    cx.on_cancel(move || opener.abort());
}

fn launch(plan: Arc<LaunchPlan>, prepared: Prepared) -> Task<LaunchReport> {
    debug!(thread = ?std::thread::current().name(), "composing game start");
    let window = Arc::new(AtomicBool::new(false));
    let opened = window.clone();
    let delay = plan.launch_delay;
    let target = plan.progress_target;
    let java = prepared.java.clone();

    let process = Task::new(move |cx| async move {
        cx.log_line(format!("Starting game with {}", java.path.display()), false);
        tokio::time::sleep(delay / 3).await;
        if let Err(err) = plan.check(STAGE_LAUNCH, "starting the game process") {
            cx.log_line("Game process exited with code 1", true);
            return Err(err);
        }

        let pid = std::process::id().wrapping_add(1);
        cx.log_line(format!("[main/INFO]: Setting user: {}", plan.player), false);
        open_window_after(&cx, delay - delay / 3, opened);
        Ok(pid)
    })
    .with_name("start game process")
    .with_abort(|| info!("stopping simulated game process"));

    process
        .with_fake_progress("Waiting for the game window", target, move || {
            window.load(Ordering::SeqCst)
        })
        .with_stage(STAGE_LAUNCH)
        .map(move |pid| LaunchReport {
            files_updated: prepared.files_updated,
            java: prepared.java,
            verified: prepared.verified,
            session: prepared.session,
            pid,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use launchpad_tasks::{
        CollectingReporter, EngineOptions, InlineScheduler, IoScheduler, Schedulers, StageStatus,
        TaskEvent, TaskExecutor, UiScheduler,
    };
    use std::sync::Mutex;

    fn fast_plan() -> LaunchPlan {
        LaunchPlan {
            launch_delay: Duration::from_millis(30),
            progress_target: Duration::from_millis(50),
            tick: Duration::from_millis(1),
            ..LaunchPlan::default()
        }
    }

    fn fast_options() -> EngineOptions {
        EngineOptions {
            io_workers: 4,
            cancel_grace: Duration::from_millis(200),
            fake_progress_interval: Duration::from_millis(5),
            fake_progress_target: Duration::from_millis(50),
            fake_progress_max_wait: None,
        }
    }

    fn stage_ids() -> Vec<String> {
        STAGES.iter().map(|s| s.to_string()).collect()
    }

    fn executor(
        plan: LaunchPlan,
        reporter: Arc<CollectingReporter>,
    ) -> (TaskExecutor<LaunchReport>, Arc<UiScheduler>) {
        let ui = Arc::new(UiScheduler::spawn("launchpad-ui-test").unwrap());
        let schedulers = Schedulers::new(Arc::new(IoScheduler::current(4).unwrap()), ui.clone());
        let executor = TaskExecutor::builder(build(plan, stage_ids()), schedulers)
            .options(fast_options())
            .reporter(reporter)
            .without_tracing()
            .build();
        (executor, ui)
    }

    #[derive(Default)]
    struct RecordingCallback {
        progress: Mutex<Vec<u32>>,
        completed: Mutex<Option<bool>>,
        interrupt_after: Option<usize>,
    }

    impl ProgressCallback for RecordingCallback {
        fn update_title(&self, _title: &str) {}

        fn update_label(&self, _label: &str) {}

        fn update_progress(&self, _text: &str, permille: u32) {
            self.progress.lock().unwrap().push(permille);
        }

        fn should_interrupt(&self) -> bool {
            self.interrupt_after
                .is_some_and(|limit| self.progress.lock().unwrap().len() >= limit)
        }

        fn show_completion_message(&self, has_updates: bool) {
            *self.completed.lock().unwrap() = Some(has_updates);
        }
    }

    #[test]
    fn test_resolve_stage() {
        assert_eq!(resolve_stage("java"), Some(STAGE_JAVA));
        assert_eq!(resolve_stage("launch.state.logging_in"), Some(STAGE_LOGIN));
        assert_eq!(resolve_stage("state"), None);
        assert_eq!(resolve_stage("nope"), None);
    }

    #[test]
    fn test_updater_reports_rising_progress() {
        let callback = RecordingCallback::default();
        let plan = LaunchPlan {
            tick: Duration::ZERO,
            ..LaunchPlan::default()
        };
        assert!(run_updater(&callback, &plan).unwrap());

        let progress = callback.progress.lock().unwrap().clone();
        assert_eq!(progress.len(), UPDATE_FILES.len() * CHUNKS_PER_FILE as usize);
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last(), Some(&1000));
        assert_eq!(*callback.completed.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_updater_stops_when_interrupted() {
        let callback = RecordingCallback {
            interrupt_after: Some(3),
            ..RecordingCallback::default()
        };
        let plan = LaunchPlan {
            tick: Duration::ZERO,
            ..LaunchPlan::default()
        };
        let err = TaskError::from(run_updater(&callback, &plan).unwrap_err());
        assert!(err.is_cancelled());
        assert_eq!(callback.progress.lock().unwrap().len(), 3);
        assert_eq!(*callback.completed.lock().unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pipeline_runs_every_stage() {
        let reporter = Arc::new(CollectingReporter::new());
        let (executor, ui) = executor(fast_plan(), reporter.clone());
        executor.start().unwrap();

        assert!(executor.wait().await);
        let report = executor.take_result().unwrap();
        assert!(report.files_updated);
        assert_eq!(report.java.version, 17);
        assert_eq!(report.verified, 48 + 160 + 6);
        assert!(!report.session.offline);

        assert_eq!(executor.progress(), 1.0);
        assert!(executor
            .stages()
            .iter()
            .all(|stage| stage.status == StageStatus::Done));
        assert!(reporter
            .events()
            .iter()
            .any(|e| matches!(e, TaskEvent::Output { line, .. } if line.starts_with("Starting game"))));
        ui.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_launch_never_opens_window() {
        let window = Arc::new(AtomicBool::new(false));
        let opened = window.clone();
        let observed = window.clone();
        let waiting = Task::new(move |cx| async move {
            open_window_after(&cx, Duration::from_millis(100), opened);
            Ok(())
        })
        .with_fake_progress("Waiting for the game window", Duration::from_millis(50), move || {
            observed.load(Ordering::SeqCst)
        });
        let schedulers = Schedulers::new(
            Arc::new(IoScheduler::current(4).unwrap()),
            Arc::new(InlineScheduler),
        );
        let executor = TaskExecutor::builder(waiting, schedulers)
            .options(fast_options())
            .without_tracing()
            .build();
        executor.start().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        executor.cancel();
        assert!(!executor.wait().await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!window.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offline_ready_skips_login() {
        let reporter = Arc::new(CollectingReporter::new());
        let plan = LaunchPlan {
            offline_ready: true,
            ..fast_plan()
        };
        let (executor, ui) = executor(plan, reporter.clone());
        executor.start().unwrap();

        assert!(executor.wait().await);
        assert!(executor.take_result().unwrap().session.offline);
        assert!(reporter
            .events()
            .iter()
            .any(|e| matches!(e, TaskEvent::Skipped { .. })));
        ui.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_injected_failure_stops_the_pipeline() {
        let reporter = Arc::new(CollectingReporter::new());
        let plan = LaunchPlan {
            fail_at: Some(STAGE_DEPENDENCIES),
            ..fast_plan()
        };
        let (executor, ui) = executor(plan, reporter);
        executor.start().unwrap();

        assert!(!executor.wait().await);
        let err = executor.exception().unwrap();
        let failure = err.downcast_ref::<SimulatedFailure>().unwrap();
        assert_eq!(failure.stage, STAGE_DEPENDENCIES);

        let stages = executor.stages();
        assert_eq!(stages[1].status, StageStatus::Done);
        assert_eq!(stages[2].status, StageStatus::Failed);
        assert_eq!(stages[3].status, StageStatus::Pending);
        assert!(executor.take_result().is_none());
        ui.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_update_check() {
        let reporter = Arc::new(CollectingReporter::new());
        let plan = LaunchPlan {
            tick: Duration::from_millis(20),
            ..fast_plan()
        };
        let (executor, ui) = executor(plan, reporter);
        executor.start().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.cancel();

        assert!(!executor.wait().await);
        assert!(executor.exception().unwrap().is_cancelled());
        assert_eq!(executor.stages()[0].status, StageStatus::Cancelled);
        ui.shutdown();
    }
}
