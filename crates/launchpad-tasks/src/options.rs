//! Engine tuning options

use std::time::Duration;

use launchpad_core::EngineConfig;

/// Runtime options shared by every task in one executor run
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Maximum concurrent units on the I/O scheduler
    pub io_workers: usize,
    /// Grace period a cancelled blocking call gets before it is abandoned
    pub cancel_grace: Duration,
    /// Poll interval of fake-progress completion predicates
    pub fake_progress_interval: Duration,
    /// Default easing constant for fake progress (half progress at this point)
    pub fake_progress_target: Duration,
    /// How long a finished fake-progress task waits for its predicate; `None` waits forever
    pub fake_progress_max_wait: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            io_workers: config.io_workers.max(1),
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
            fake_progress_interval: Duration::from_millis(config.fake_progress_interval_ms.max(1)),
            fake_progress_target: Duration::from_secs_f64(config.fake_progress_target_secs.max(0.001)),
            fake_progress_max_wait: config.fake_progress_max_wait_ms.map(Duration::from_millis),
        }
    }
}
