//! Configuration types

use serde::{Deserialize, Serialize};

/// Main configuration for Launchpad
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Task engine tuning
    pub engine: EngineConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Launch pipeline layout
    pub pipeline: PipelineConfig,
}

/// Task engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of I/O units running at the same time
    pub io_workers: usize,

    /// How long a cancelled blocking call may take to wind down (milliseconds)
    pub cancel_grace_ms: u64,

    /// How often a fake-progress completion predicate is polled (milliseconds)
    pub fake_progress_interval_ms: u64,

    /// Easing constant for fake progress: the bar is half full after this many seconds
    pub fake_progress_target_secs: f64,

    /// Longest wait for a fake-progress predicate once the wrapped task
    /// finished (milliseconds); unbounded when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fake_progress_max_wait_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_workers: default_io_workers(),
            cancel_grace_ms: 3_000,
            fake_progress_interval_ms: 100,
            fake_progress_target_secs: 6.95,
            fake_progress_max_wait_ms: None,
        }
    }
}

fn default_io_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console log level when RUST_LOG is not set
    pub level: String,

    /// Whether to write JSON logs under ~/.launchpad/logs
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
        }
    }
}

/// Display labels for the launch pipeline's stages.
///
/// Entries are matched by id; the pipeline itself decides which stages
/// exist and in what order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stage labels, keyed by stage id
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let stages = [
            ("launch.state.files_updating", "Checking for file updates"),
            ("launch.state.java", "Resolving Java runtime"),
            ("launch.state.dependencies", "Verifying dependencies"),
            ("launch.state.logging_in", "Logging in"),
            ("launch.state.waiting_launching", "Waiting for the game to start"),
        ];
        Self {
            stages: stages
                .iter()
                .map(|(id, label)| StageConfig::new(*id, *label))
                .collect(),
        }
    }
}

impl PipelineConfig {
    /// Stage identifiers in pipeline order
    pub fn stage_ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.id.clone()).collect()
    }

    /// Human readable label for a stage, falling back to its id
    pub fn label_for<'a>(&'a self, id: &'a str) -> &'a str {
        self.stages
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.label.as_str())
            .unwrap_or(id)
    }
}

/// A single pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Opaque stage identifier
    pub id: String,

    /// Label shown to the user
    #[serde(default)]
    pub label: String,
}

impl StageConfig {
    /// Create a new stage entry
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert!(engine.io_workers > 0);
        assert_eq!(engine.cancel_grace_ms, 3_000);
        assert_eq!(engine.fake_progress_interval_ms, 100);
        assert!((engine.fake_progress_target_secs - 6.95).abs() < f64::EPSILON);
        assert_eq!(engine.fake_progress_max_wait_ms, None);
    }

    #[test]
    fn test_default_pipeline_has_launcher_stages() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.stages.len(), 5);
        assert_eq!(pipeline.stage_ids()[0], "launch.state.files_updating");
        assert_eq!(pipeline.label_for("launch.state.java"), "Resolving Java runtime");
        assert_eq!(pipeline.label_for("unknown"), "unknown");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("[engine]\ncancel_grace_ms = 500\n").unwrap();
        assert_eq!(config.engine.cancel_grace_ms, 500);
        assert_eq!(config.engine.fake_progress_interval_ms, 100);
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn test_fake_progress_max_wait_from_toml() {
        let config: Config =
            toml::from_str("[engine]\nfake_progress_max_wait_ms = 30000\n").unwrap();
        assert_eq!(config.engine.fake_progress_max_wait_ms, Some(30_000));
    }
}
