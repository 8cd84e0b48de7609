//! Launch command: run the launcher pipeline with live stage progress

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use launchpad_core::config::load_config_or_default;
use launchpad_core::{Config, PipelineConfig};
use launchpad_tasks::{
    ChannelReporter, EngineOptions, IoScheduler, Schedulers, StageSnapshot, StageStatus,
    TaskEvent, TaskExecutor, UiScheduler,
};

use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;
use crate::launcher::{self, LaunchPlan, LaunchReport, STAGES};

/// Bar length; overall progress is rendered in thousandths
const PROGRESS_SCALE: u64 = 1000;

const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

/// Run the simulated launch pipeline
#[derive(Debug, Args)]
pub struct LaunchCommand {
    /// Make a stage fail on purpose (e.g. `java` or `launch.state.java`)
    #[arg(long, value_name = "STAGE")]
    pub fail_at: Option<String>,

    /// Cancel the launch after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub cancel_after: Option<u64>,

    /// Skip login and start offline
    #[arg(long)]
    pub offline_ready: bool,

    /// Time until the simulated game window appears
    #[arg(long, value_name = "MS", default_value_t = 1500)]
    pub launch_delay_ms: u64,

    /// Player name to log in with
    #[arg(long, default_value = "Player")]
    pub player: String,
}

impl LaunchCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<i32> {
        let cwd = std::env::current_dir()?;
        let (config, config_path) = load_config_or_default(&cwd)?;
        let options = EngineOptions::from(&config.engine);
        let plan = self.plan(&options)?;
        info!(
            config = ?config_path,
            fail_at = ?plan.fail_at,
            offline_ready = plan.offline_ready,
            "executing launch command"
        );

        if cli.interactive() {
            println!("{} {}", output::header("Launching as"), style(&plan.player).cyan());
            println!();
        }

        let ui = Arc::new(UiScheduler::spawn("launchpad-ui")?);
        let io = Arc::new(IoScheduler::current(options.io_workers)?);
        let schedulers = Schedulers::new(io, ui.clone());

        let (channel, mut events) = ChannelReporter::new();
        let root = launcher::build(plan, stage_hint(&config.pipeline));
        let executor = TaskExecutor::builder(root, schedulers)
            .options(options)
            .reporter(Arc::new(channel))
            .build();
        executor.add_listener(|success, executor| {
            debug!(success, progress = executor.progress(), "launch pipeline stopped");
        });

        let bar = progress_bar(cli.interactive());
        let mut view = View::new(&bar, &config.pipeline, cli.verbose);

        executor.start()?;

        let cancel_at = self
            .cancel_after
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut cancel_pending = cancel_at.is_some();
        let cancel_timer = tokio::time::sleep_until(cancel_at.unwrap_or_else(Instant::now));
        tokio::pin!(cancel_timer);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;

        let mut redraw = tokio::time::interval(REDRAW_INTERVAL);
        redraw.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let success = loop {
            tokio::select! {
                biased;
                success = executor.wait() => break success,
                Some(event) = events.recv() => view.event(&event),
                _ = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    view.note("Interrupted, cancelling launch");
                    executor.cancel();
                }
                () = &mut cancel_timer, if cancel_pending => {
                    cancel_pending = false;
                    info!("cancel deadline reached");
                    executor.cancel();
                }
                _ = redraw.tick() => view.draw(executor.progress(), &executor.stages()),
            }
        };
        while let Ok(event) = events.try_recv() {
            view.event(&event);
        }
        view.draw(executor.progress(), &executor.stages());
        bar.finish_and_clear();
        ui.shutdown();

        self.finish(cli, &config, &executor, success)
    }

    fn plan(&self, options: &EngineOptions) -> anyhow::Result<LaunchPlan> {
        let fail_at = self
            .fail_at
            .as_deref()
            .map(|name| {
                launcher::resolve_stage(name).ok_or_else(|| {
                    anyhow!("unknown stage '{}', expected one of: {}", name, STAGES.join(", "))
                })
            })
            .transpose()?;

        Ok(LaunchPlan {
            fail_at,
            offline_ready: self.offline_ready,
            launch_delay: Duration::from_millis(self.launch_delay_ms),
            progress_target: options.fake_progress_target,
            player: self.player.clone(),
            ..LaunchPlan::default()
        })
    }

    fn finish(
        &self,
        cli: &Cli,
        config: &Config,
        executor: &TaskExecutor<LaunchReport>,
        success: bool,
    ) -> anyhow::Result<i32> {
        let report = executor.take_result();
        let error = executor.exception();
        let cancelled = error.as_ref().is_some_and(|e| e.is_cancelled());
        let stages = executor.stages();

        if cli.format == OutputFormat::Json {
            let summary = serde_json::json!({
                "success": success,
                "cancelled": cancelled,
                "error": error.as_ref().filter(|_| !cancelled).map(|e| e.to_string()),
                "stages": stages,
                "report": report,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else if !cli.quiet {
            print_stages(&config.pipeline, &stages);
            if let Some(report) = &report {
                println!();
                output::success(&format!("Game started (pid {})", report.pid));
                println!("{}", output::key_value("Java", &report.java.version.to_string()));
                println!(
                    "{}",
                    output::key_value("Dependencies", &format!("{} verified", report.verified))
                );
                let player = if report.session.offline {
                    format!("{} (offline)", report.session.player)
                } else {
                    report.session.player.clone()
                };
                println!("{}", output::key_value("Player", &player));
            }
        }

        match error {
            None if success => Ok(exit_codes::SUCCESS),
            Some(_) if cancelled => {
                if cli.interactive() {
                    output::warning("Launch cancelled");
                }
                Ok(exit_codes::CANCELLED)
            }
            Some(err) => Err(anyhow!("launch failed: {err}")),
            None => Err(anyhow!("launch stopped without a result")),
        }
    }
}

fn progress_bar(visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(PROGRESS_SCALE);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.enable_steady_tick(REDRAW_INTERVAL);
    bar
}

/// Renders engine events and stage snapshots onto the progress bar
struct View<'a> {
    bar: &'a ProgressBar,
    pipeline: &'a PipelineConfig,
    verbose: bool,
    speed: Option<u64>,
}

impl<'a> View<'a> {
    fn new(bar: &'a ProgressBar, pipeline: &'a PipelineConfig, verbose: bool) -> Self {
        Self {
            bar,
            pipeline,
            verbose,
            speed: None,
        }
    }

    fn event(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::Speed {
                bytes_per_second, ..
            } => self.speed = Some(*bytes_per_second),
            TaskEvent::Output {
                id,
                line,
                is_stderr,
            } if self.verbose => {
                let tag = format!("[{id}]");
                let tag = if *is_stderr {
                    style(tag).red().dim()
                } else {
                    style(tag).dim()
                };
                self.bar.println(format!("    {tag} {line}"));
            }
            _ => {}
        }
    }

    fn note(&self, message: &str) {
        self.bar
            .println(format!("{} {}", style("!").yellow().bold(), message));
    }

    fn draw(&self, progress: f64, stages: &[StageSnapshot]) {
        self.bar
            .set_position((progress.clamp(0.0, 1.0) * PROGRESS_SCALE as f64) as u64);
        self.bar
            .set_message(status_line(self.pipeline, stages, self.speed));
    }
}

/// Stage ids the launch pipeline reports against.
///
/// The order and ids are fixed by the launcher; configuration only supplies
/// labels for them.
fn stage_hint(pipeline: &PipelineConfig) -> Vec<String> {
    for id in pipeline.stage_ids() {
        if !STAGES.contains(&id.as_str()) {
            warn!(stage = %id, "configured stage is not part of the launch pipeline; ignoring it");
        }
    }
    STAGES.iter().map(|s| s.to_string()).collect()
}

fn stage_label<'a>(pipeline: &'a PipelineConfig, id: &'a str) -> &'a str {
    match pipeline.label_for(id) {
        "" => id,
        label => label,
    }
}

/// Label and latest message of the furthest running stage
fn status_line(pipeline: &PipelineConfig, stages: &[StageSnapshot], speed: Option<u64>) -> String {
    let Some(stage) = stages
        .iter()
        .rev()
        .find(|s| s.status == StageStatus::Running)
    else {
        return String::new();
    };

    let mut line = stage_label(pipeline, &stage.id).to_string();
    if let Some(message) = &stage.message {
        line.push_str(": ");
        line.push_str(message);
    }
    if let Some(speed) = speed.filter(|s| *s > 0) {
        line.push_str(&format!(" ({})", output::format_speed(speed)));
    }
    line
}

fn print_stages(pipeline: &PipelineConfig, stages: &[StageSnapshot]) {
    for stage in stages {
        let label = stage_label(pipeline, &stage.id);
        let marker = match stage.status {
            StageStatus::Done => style("✓").green(),
            StageStatus::Failed => style("✗").red().bold(),
            StageStatus::Cancelled => style("-").yellow(),
            StageStatus::Running => style("▸").cyan(),
            StageStatus::Pending => style("·").dim(),
        };
        println!("  {marker} {label}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn snapshot(id: &str, status: StageStatus, message: Option<&str>) -> StageSnapshot {
        StageSnapshot {
            id: id.to_string(),
            status,
            progress: 0.0,
            task: None,
            message: message.map(str::to_string),
        }
    }

    fn command(args: &[&str]) -> LaunchCommand {
        let mut argv = vec!["launchpad", "launch"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            crate::cli::Commands::Launch(cmd) => cmd,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_status_line_uses_running_stage_label() {
        let pipeline = PipelineConfig::default();
        let stages = vec![
            snapshot(launcher::STAGE_FILES, StageStatus::Done, Some("Files updated")),
            snapshot(launcher::STAGE_JAVA, StageStatus::Running, Some("Using Java 17")),
            snapshot(launcher::STAGE_DEPENDENCIES, StageStatus::Pending, None),
        ];
        assert_eq!(
            status_line(&pipeline, &stages, None),
            "Resolving Java runtime: Using Java 17"
        );
        assert_eq!(
            status_line(&pipeline, &stages, Some(1_572_864)),
            "Resolving Java runtime: Using Java 17 (1.5 MiB/s)"
        );
    }

    #[test]
    fn test_status_line_is_empty_when_nothing_runs() {
        let stages = vec![snapshot("custom", StageStatus::Done, None)];
        assert_eq!(status_line(&PipelineConfig::default(), &stages, Some(10)), "");
    }

    #[test]
    fn test_stage_hint_ignores_configured_order_and_ids() {
        let mut pipeline = PipelineConfig::default();
        pipeline.stages.reverse();
        pipeline.stages[0].id = "launch.state.renamed".to_string();

        let hint = stage_hint(&pipeline);
        assert_eq!(hint, STAGES.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        assert_eq!(stage_label(&pipeline, launcher::STAGE_JAVA), "Resolving Java runtime");
        assert_eq!(stage_label(&pipeline, launcher::STAGE_LAUNCH), launcher::STAGE_LAUNCH);
    }

    #[test]
    fn test_plan_resolves_short_stage_names() {
        let plan = command(&["--fail-at", "dependencies", "--offline-ready"])
            .plan(&EngineOptions::default())
            .unwrap();
        assert_eq!(plan.fail_at, Some(launcher::STAGE_DEPENDENCIES));
        assert!(plan.offline_ready);
        assert_eq!(plan.launch_delay, Duration::from_millis(1500));
    }

    #[test]
    fn test_plan_rejects_unknown_stage() {
        let err = command(&["--fail-at", "render"])
            .plan(&EngineOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("unknown stage 'render'"));
    }
}
