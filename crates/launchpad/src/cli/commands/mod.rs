//! CLI commands

mod config;
mod launch;

pub use config::{ConfigAction, ConfigCommand};
pub use launch::LaunchCommand;
