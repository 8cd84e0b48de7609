//! CLI definition and command handling

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use launchpad_core::config::load_config_or_default;
use launchpad_core::LoggingConfig;

use commands::{ConfigCommand, LaunchCommand};

/// Launchpad - game launcher pipeline
#[derive(Debug, Parser)]
#[command(name = "launchpad")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the launch pipeline
    Launch(LaunchCommand),

    /// Inspect, validate or create configuration
    Config(ConfigCommand),
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub fn execute(self) -> anyhow::Result<i32> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match self.command {
            Commands::Launch(ref cmd) => cmd.execute(&self),
            Commands::Config(ref cmd) => cmd.execute(&self),
        }
    }

    /// Logging settings, read before any command runs.
    ///
    /// Config errors are left for the command to report.
    pub fn logging_config(&self) -> LoggingConfig {
        let dir = match &self.directory {
            Some(dir) => dir.clone(),
            None => match std::env::current_dir() {
                Ok(dir) => dir,
                Err(_) => return LoggingConfig::default(),
            },
        };
        load_config_or_default(&dir)
            .map(|(config, _)| config.logging)
            .unwrap_or_default()
    }

    /// Whether human readable progress and messages should be printed
    pub fn interactive(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_launch_flags() {
        let cli = Cli::try_parse_from([
            "launchpad",
            "--format",
            "json",
            "launch",
            "--fail-at",
            "java",
            "--cancel-after",
            "500",
            "--offline-ready",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(!cli.interactive());
        match cli.command {
            Commands::Launch(cmd) => {
                assert_eq!(cmd.fail_at.as_deref(), Some("java"));
                assert_eq!(cmd.cancel_after, Some(500));
                assert!(cmd.offline_ready);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["launchpad", "-v", "-q", "config", "show"]).is_err());
    }
}
