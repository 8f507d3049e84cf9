// Error types shared across the bootstrap path
use thiserror::Error;

use crate::config::ConfigError;
use crate::connection::ConnectionState;
use crate::ota::UpdateError;

/// Failure reported by a platform driver (Wi-Fi, flash, HTTP, ADC).
///
/// Platforms map their native error codes into this at the trait seam so the
/// core never depends on a vendor error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed{}: {message}", .code.map(|c| format!(" (code {})", c)).unwrap_or_default())]
pub struct DriverError {
    pub operation: &'static str,
    pub code: Option<i32>,
    pub message: String,
}

impl DriverError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(operation: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            operation,
            code: Some(code),
            message: message.into(),
        }
    }
}

/// Error raised by an optional subsystem initializer.
#[derive(Debug, Error)]
#[error("plugin '{plugin}' failed to initialize: {source}")]
pub struct PluginError {
    pub plugin: &'static str,
    #[source]
    pub source: DriverError,
}

/// Why the device is about to restart.
///
/// Every path that leaves the bootstrap ends here: fatal startup errors,
/// fatal runtime errors and a successfully applied update.
#[derive(Debug, Error)]
pub enum RestartReason {
    #[error("configuration unusable: {0}")]
    Config(#[from] ConfigError),
    #[error("network subsystem init failed: {0}")]
    NetworkInit(#[source] DriverError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("no access point found in scan")]
    NoAccessPoint,
    #[error("station disconnected while {state:?}")]
    LinkLost { state: ConnectionState },
    #[error("wifi driver error while {state:?}: {source}")]
    WifiDriver {
        state: ConnectionState,
        #[source]
        source: DriverError,
    },
    #[error("bring-up worker stopped before the station connected")]
    BringUpAborted,
    #[error("firmware update failed: {0}")]
    UpdateFailed(#[from] UpdateError),
    #[error("firmware update applied ({bytes} bytes to {slot})")]
    UpdateApplied { bytes: u64, slot: String },
}

impl RestartReason {
    /// Everything except an applied update is a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, RestartReason::UpdateApplied { .. })
    }
}
