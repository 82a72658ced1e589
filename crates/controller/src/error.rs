//! Error kinds surfaced by command handlers. Every variant is recovered at the
//! boundary where it is detected and turned into a notification or an HTTP
//! error body; none of them end the process.

use thiserror::Error;
use tokio_cron_scheduler::JobSchedulerError;

use crate::light::LightError;
use crate::sensor::SensorError;

#[derive(Debug, Error)]
pub enum CommandError {
    /// Payload is not JSON, not an object, or lacks `sender`.
    #[error("Invalid message \"{payload}\": {reason}")]
    InvalidMessageFormat { payload: String, reason: String },

    /// Unknown command name or command value outside the accepted set.
    #[error("{0}")]
    InvalidCommand(String),

    /// Command recognised but its value fails shape/type/format checks.
    #[error("{0}")]
    InvalidValue(String),

    #[error("Error while reading temperature data: {0}")]
    SensorRead(#[from] SensorError),

    #[error("Light controller unreachable: {0}")]
    ActuatorTransport(#[from] LightError),

    #[error("Failed to persist settings: {0:#}")]
    Persistence(anyhow::Error),

    #[error("Failed to install schedule: {0}")]
    Schedule(#[from] JobSchedulerError),
}

impl CommandError {
    /// True for errors caused by the caller's input rather than by the
    /// controller's devices or storage.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidMessageFormat { .. } | Self::InvalidCommand(_) | Self::InvalidValue(_)
        )
    }
}
