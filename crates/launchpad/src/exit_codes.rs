//! Exit codes for the CLI

/// Success
pub const SUCCESS: i32 = 0;

/// General error
pub const ERROR: i32 = 1;

/// Configuration error
pub const CONFIG_ERROR: i32 = 2;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// Exit code for an error that escaped a command
pub fn for_error(err: &anyhow::Error) -> i32 {
    use launchpad_core::{ConfigError, LaunchpadError};

    let is_config = err.chain().any(|cause| {
        cause.is::<ConfigError>() || matches!(
            cause.downcast_ref::<LaunchpadError>(),
            Some(LaunchpadError::Config(_))
        )
    });
    if is_config {
        CONFIG_ERROR
    } else {
        ERROR
    }
}
