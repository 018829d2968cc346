//! Drip Printer - layer controller for drip-fed resin printers.
//!
//! A resin reservoir drips into the vat, raising the liquid level a little
//! with every drop. This library listens for those drips, turns the count
//! into a height, and paces a laser so each layer is cured only once the
//! liquid has reached it.
//!
//! # Core Components
//!
//! * [`config`] - Configuration from environment variables
//! * [`audio`] - Microphone capture through cpal
//! * [`detector`] - Drip counting from raw samples
//! * [`zaxis`] - Height feedback built from drip counts
//! * [`controller`] - Layer pacing, backpressure and source swapping
//! * [`status`] - Thread-safe status aggregation and snapshots
//! * [`layers`] / [`sink`] - Seams to the layer generator and motion output
//! * [`error`] - Error types
//!
//! # Quick Start
//!
//! ```no_run
//! use drip_printer::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let zaxis = EmulatedZAxis::new(config.drip_settings(), config.emulated_drips_per_second);
//! let controller = Controller::new(
//!     Box::new(LoggingSink::new()),
//!     Some(Box::new(NullWriter)),
//!     Box::new(CalibrationLineSource::stacked(10.0, 0.1, 20)),
//!     Some(Box::new(zaxis)),
//!     None,
//!     config.controller_options(),
//! );
//! controller.start()?;
//! controller.join()?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod commands;
pub mod config;
pub mod controller;
pub mod detector;
pub mod error;
pub mod layers;
pub mod sink;
pub mod status;
pub mod zaxis;

// Re-export commonly used types for convenience
pub use audio::{AudioInput, BitDepth, CpalInput};
pub use commands::{Layer, MotionCommand, Position};
pub use config::{Config, DripperType};
pub use controller::{Controller, ControllerOptions, ControllerState, MachineState};
pub use detector::{AdaptiveDripDetector, DripDetector, ThresholdDripDetector};
pub use error::DripPrinterError;
pub use layers::{CalibrationLineSource, LayerSource, SinglePointSource, StubLayerSource};
pub use sink::{LoggingSink, MotionSink, NullWriter, OutputWriter};
pub use status::{MachineStatus, PrintState, StatusSnapshot};
pub use zaxis::{AudioDripZAxis, DripSettings, EmulatedZAxis, ZAxis};
