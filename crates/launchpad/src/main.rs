//! Launchpad - game launcher pipeline CLI

mod cli;
mod exit_codes;
mod launcher;

use clap::Parser;
use launchpad_core::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use cli::{output, Cli};

fn main() {
    let cli = Cli::parse();
    let guard = init_tracing(&cli.logging_config(), cli.verbose, cli.quiet);

    let code = match cli.execute() {
        Ok(code) => code,
        Err(err) => {
            output::error(&format!("{err:#}"));
            exit_codes::for_error(&err)
        }
    };

    // flush the file layer before exiting
    drop(guard);
    std::process::exit(code);
}

/// Set up tracing with two layers:
/// - Console: controlled by RUST_LOG (default: warn, or the configured level with --verbose)
/// - File: debug-level JSON to ~/.launchpad/logs/ when `logging.file` is on
fn init_tracing(
    logging: &LoggingConfig,
    verbose: bool,
    quiet: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directive(logging, verbose, quiet)));

    let log_dir = if logging.file { log_directory() } else { None };
    if let Some(log_dir) = log_dir {
        let file_appender = tracing_appender::rolling::daily(&log_dir, "launchpad.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_filter(EnvFilter::new("debug")),
            )
            .init();

        return Some(guard);
    }

    // Fallback: console only
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    None
}

/// Console filter used when RUST_LOG is not set
fn console_directive(logging: &LoggingConfig, verbose: bool, quiet: bool) -> &str {
    if quiet {
        "error"
    } else if verbose {
        &logging.level
    } else {
        "warn"
    }
}

/// Returns the log directory path, creating it if needed.
fn log_directory() -> Option<std::path::PathBuf> {
    let log_dir = dirs::home_dir()?.join(".launchpad").join("logs");
    std::fs::create_dir_all(&log_dir).ok()?;
    Some(log_dir)
}
