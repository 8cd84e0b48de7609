//! Launchpad Core - shared configuration and error types
//!
//! This crate holds the pieces every Launchpad crate needs: the error
//! taxonomy for configuration and IO, and the configuration file model
//! with its loader and validation.

pub mod config;
pub mod error;

pub use config::{Config, EngineConfig, LoggingConfig, PipelineConfig, StageConfig};
pub use error::{ConfigError, LaunchpadError, Result};
