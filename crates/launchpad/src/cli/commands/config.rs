//! Config command

use std::path::Path;

use clap::{Args, Subcommand};
use tracing::info;

use launchpad_core::config::{load_config_from_dir, load_config_or_default, write_default_config};

use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

/// Inspect, validate or create configuration
#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration (defaults when no file exists)
    Show {
        /// Print as YAML instead of TOML
        #[arg(long)]
        yaml: bool,
    },

    /// Check the configuration file
    Validate,

    /// Write a default launchpad.toml into the working directory
    Init,
}

impl ConfigCommand {
    /// Execute the config command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        info!(action = ?self.action, "executing config command");
        let cwd = std::env::current_dir()?;
        self.execute_in(cli, &cwd)
    }

    fn execute_in(&self, cli: &Cli, dir: &Path) -> anyhow::Result<i32> {
        match self.action {
            ConfigAction::Show { yaml } => show(cli, dir, yaml),
            ConfigAction::Validate => validate(cli, dir),
            ConfigAction::Init => init(cli, dir),
        }
    }
}

fn show(cli: &Cli, dir: &Path, yaml: bool) -> anyhow::Result<i32> {
    let (config, path) = load_config_or_default(dir)?;

    if cli.format == OutputFormat::Json {
        let shown = serde_json::json!({
            "path": path,
            "config": config,
        });
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(exit_codes::SUCCESS);
    }

    if !cli.quiet {
        let source = match &path {
            Some(path) => output::path_style().apply_to(path.display()).to_string(),
            None => "built-in defaults".to_string(),
        };
        println!("{}", output::key_value("Source", &source));
        println!();
    }
    let rendered = if yaml {
        serde_yaml::to_string(&config)?
    } else {
        toml::to_string_pretty(&config)?
    };
    print!("{rendered}");
    Ok(exit_codes::SUCCESS)
}

fn validate(cli: &Cli, dir: &Path) -> anyhow::Result<i32> {
    let result = load_config_from_dir(dir);

    if cli.format == OutputFormat::Json {
        let report = match &result {
            Ok((config, path)) => serde_json::json!({
                "valid": true,
                "path": path,
                "stages": config.pipeline.stage_ids(),
            }),
            Err(e) => serde_json::json!({
                "valid": false,
                "error": e.to_string(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !cli.quiet {
        match &result {
            Ok((config, path)) => {
                output::success(&format!(
                    "Configuration is valid ({})",
                    output::path_style().apply_to(path.display())
                ));
                println!(
                    "{}",
                    output::key_value("Stages", &config.pipeline.stages.len().to_string())
                );
            }
            Err(e) => output::error(&e.to_string()),
        }
    }

    Ok(match result {
        Ok(_) => exit_codes::SUCCESS,
        Err(_) => exit_codes::CONFIG_ERROR,
    })
}

fn init(cli: &Cli, dir: &Path) -> anyhow::Result<i32> {
    let path = write_default_config(dir)?;

    if cli.format == OutputFormat::Json {
        println!("{}", serde_json::json!({ "created": path }));
    } else if !cli.quiet {
        output::success(&format!(
            "Created {}",
            output::path_style().apply_to(path.display())
        ));
    }
    Ok(exit_codes::SUCCESS)
}
