//! Error types for the drip printer.
//!
//! Configuration and audio-setup errors are fatal and surface once, before a
//! print starts. Faults raised while pulling or executing a layer never appear
//! here: the controller records those as [`crate::status::MachineError`]
//! entries in the status snapshot instead.

use thiserror::Error;

/// Main error type for drip printer operations.
#[derive(Debug, Error)]
pub enum DripPrinterError {
    /// Errors related to audio capture and drip detection.
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    /// Errors related to the print controller lifecycle.
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    /// Configuration and setup errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while opening or running an audio capture stream.
#[derive(Debug, Error)]
pub enum AudioError {
    /// No default input device is available on this host.
    #[error("No audio input device available")]
    NoInputDevice,

    /// The device cannot deliver the requested sample rate or depth.
    #[error("Unsupported format for your audio card: {sample_rate} Hz, {bit_depth}")]
    UnsupportedFormat { sample_rate: u32, bit_depth: String },

    /// The input stream could not be built or started.
    #[error("Failed to open input stream: {0}")]
    StreamError(String),

    /// The capture thread went away before reporting whether the stream opened.
    #[error("Capture thread exited before the stream was opened")]
    CaptureThreadLost,
}

/// Errors specific to the print controller lifecycle.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// `start` was called on a controller that already started.
    #[error("Controller has already been started")]
    AlreadyStarted,

    /// The request needs a running execution thread.
    #[error("Controller is not running")]
    NotRunning,

    /// The execution thread panicked.
    #[error("Controller thread panicked")]
    WorkerPanicked,

    /// The z-axis could not be started.
    #[error("Failed to start z-axis: {0}")]
    ZAxisStart(String),

    /// The execution thread could not be spawned.
    #[error("Failed to spawn controller thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors related to configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value provided.
    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// Bit depth name not recognised.
    #[error("Bit depth {0} specified is not supported")]
    UnsupportedBitDepth(String),

    /// Dripper type name not recognised.
    #[error("Unknown dripper type '{0}'")]
    UnknownDripperType(String),
}

impl ConfigError {
    pub fn invalid(field: &str, value: &str, reason: impl ToString) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_nested_errors_with_context() {
        let err: DripPrinterError = AudioError::UnsupportedFormat {
            sample_rate: 96_000,
            bit_depth: "24 bit".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Audio error: Unsupported format for your audio card: 96000 Hz, 24 bit"
        );

        let err: DripPrinterError = ConfigError::invalid("SAMPLE_RATE", "fast", "not a number").into();
        assert!(err.to_string().contains("'fast' for 'SAMPLE_RATE'"));
    }
}
