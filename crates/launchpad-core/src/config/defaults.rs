//! Default configuration values

use crate::error::Result;

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "launchpad.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "launchpad.yaml";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".launchpad.toml",
        ".launchpad.yaml",
    ]
}

/// Render the default configuration as commented TOML
pub fn default_config_toml() -> Result<String> {
    let body = toml::to_string_pretty(&Config::default())?;
    Ok(format!("# Launchpad configuration\n\n{body}"))
}
