//! Configuration validation

use std::collections::HashSet;

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_engine(config)?;
    validate_logging(config)?;
    validate_pipeline(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_engine(config: &Config) -> Result<()> {
    let engine = &config.engine;
    if engine.io_workers == 0 {
        return Err(ConfigError::invalid("engine.io_workers", "must be greater than zero").into());
    }

    if engine.fake_progress_interval_ms == 0 {
        return Err(ConfigError::invalid(
            "engine.fake_progress_interval_ms",
            "must be greater than zero",
        )
        .into());
    }

    if !(engine.fake_progress_target_secs.is_finite() && engine.fake_progress_target_secs > 0.0) {
        return Err(ConfigError::invalid(
            "engine.fake_progress_target_secs",
            "must be a positive number",
        )
        .into());
    }

    Ok(())
}

fn validate_logging(config: &Config) -> Result<()> {
    let valid_levels = ["error", "warn", "info", "debug", "trace"];
    let level = config.logging.level.to_lowercase();
    if !valid_levels.contains(&level.as_str()) {
        return Err(ConfigError::invalid(
            "logging.level",
            format!("must be one of: {}", valid_levels.join(", ")),
        )
        .into());
    }
    Ok(())
}

fn validate_pipeline(config: &Config) -> Result<()> {
    let mut seen = HashSet::new();
    for (i, stage) in config.pipeline.stages.iter().enumerate() {
        if stage.id.trim().is_empty() {
            return Err(ConfigError::invalid(
                format!("pipeline.stages[{}].id", i),
                "stage id cannot be empty",
            )
            .into());
        }
        if !seen.insert(stage.id.as_str()) {
            return Err(ConfigError::invalid(
                format!("pipeline.stages[{}].id", i),
                format!("duplicate stage id '{}'", stage.id),
            )
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = Config::default();
        config.engine.io_workers = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_bad_fake_progress_target() {
        let mut config = Config::default();
        config.engine.fake_progress_target_secs = 0.0;
        assert!(validate_config(&config).is_err());

        config.engine.fake_progress_target_secs = f64::NAN;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "WARN".to_string();
        assert!(validate_config(&config).is_ok());

        config.logging.level = "loud".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_duplicate_stage() {
        let mut config = Config::default();
        config.pipeline.stages.push(StageConfig::new("launch.state.java", "again"));
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate stage id"));
    }

    #[test]
    fn test_validate_empty_stage_id() {
        let mut config = Config::default();
        config.pipeline.stages[0].id = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }
}
