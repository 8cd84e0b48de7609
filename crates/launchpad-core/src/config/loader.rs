//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};

use super::defaults::{config_file_names, default_config_toml, DEFAULT_CONFIG_TOML};
use super::types::Config;
use super::validation::validate_config;

/// Parse and validate one config file; `.toml` files are TOML, anything else YAML
pub fn load_config(path: &Path) -> Result<Config> {
    let format = if path.extension().is_some_and(|e| e == "toml") {
        "TOML"
    } else {
        "YAML"
    };
    info!(path = %path.display(), format, "loading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

    let config: Config = if format == "TOML" {
        toml::from_str(&content).map_err(ConfigError::TomlError)?
    } else {
        serde_yaml::from_str(&content).map_err(ConfigError::YamlError)?
    };

    validate_config(&config)?;
    debug!(path = %path.display(), "config loaded and validated");
    Ok(config)
}

/// Locate the nearest launcher config, starting at `start_dir` and walking up.
///
/// Within one directory the names in [`config_file_names`] are tried in order.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    debug!(start_dir = %start_dir.display(), "searching for config file");
    let mut current = start_dir.to_path_buf();

    loop {
        for name in config_file_names() {
            let config_path = current.join(name);
            if config_path.exists() {
                info!(path = %config_path.display(), "found config file");
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    debug!("no config file found");
    None
}

/// Like [`load_config`], but the file is located with [`find_config`]
pub fn load_config_from_dir(dir: &Path) -> Result<(Config, PathBuf)> {
    let config_path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;

    let config = load_config(&config_path)?;
    Ok((config, config_path))
}

/// Load configuration or use defaults.
///
/// Only a missing file falls back to defaults; a file that exists but fails
/// to parse or validate is reported.
pub fn load_config_or_default(dir: &Path) -> Result<(Config, Option<PathBuf>)> {
    match find_config(dir) {
        Some(path) => {
            let config = load_config(&path)?;
            Ok((config, Some(path)))
        }
        None => {
            warn!(dir = %dir.display(), "no config found, using defaults");
            Ok((Config::default(), None))
        }
    }
}

/// Write a default `launchpad.toml` into `dir`, refusing to overwrite
pub fn write_default_config(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(DEFAULT_CONFIG_TOML);
    if path.exists() {
        return Err(ConfigError::invalid(
            path.display().to_string(),
            "configuration file already exists",
        )
        .into());
    }
    std::fs::write(&path, default_config_toml()?)?;
    info!(path = %path.display(), "wrote default config");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("launchpad.toml");
        std::fs::write(&config_path, "[engine]\ncancel_grace_ms = 100").unwrap();

        let found = find_config(temp.path());
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_prefers_toml_over_yaml() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("launchpad.toml");
        let yaml_path = temp.path().join("launchpad.yaml");
        std::fs::write(&toml_path, "[engine]\ncancel_grace_ms = 100").unwrap();
        std::fs::write(&yaml_path, "engine:\n  cancel_grace_ms: 200").unwrap();

        let found = find_config(temp.path()).unwrap();
        assert_eq!(found, toml_path);
    }

    #[test]
    fn test_find_config_in_parent_dir() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join(".launchpad.toml");
        std::fs::write(&config_path, "").unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config(&nested), Some(config_path));
    }

    #[test]
    fn test_load_yaml_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("launchpad.yaml");
        std::fs::write(
            &path,
            "engine:\n  io_workers: 2\npipeline:\n  stages:\n    - id: update\n      label: Update\n    - id: launch\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.engine.io_workers, 2);
        assert_eq!(config.pipeline.stage_ids(), vec!["update", "launch"]);
        assert_eq!(config.pipeline.stages[1].label, "");
    }

    #[test]
    fn test_load_invalid_config_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("launchpad.toml");
        std::fs::write(&path, "[engine]\nio_workers = 0\n").unwrap();

        assert!(load_config(&path).is_err());
        assert!(load_config_or_default(temp.path()).is_err());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let temp = TempDir::new().unwrap();
        let (config, path) = load_config_or_default(temp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.engine.cancel_grace_ms, 3_000);
    }

    #[test]
    fn test_write_default_config_refuses_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = write_default_config(temp.path()).unwrap();
        assert!(path.exists());
        assert!(load_config(&path).is_ok());
        assert!(write_default_config(temp.path()).is_err());
    }
}
