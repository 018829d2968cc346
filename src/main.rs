use anyhow::Result;
use log::{debug, info, warn};
use std::{thread, time::Duration};

use drip_printer::config::{Config, DripperType, constants};
use drip_printer::{
    AudioDripZAxis, CalibrationLineSource, Controller, CpalInput, DripPrinterError, EmulatedZAxis,
    LoggingSink, NullWriter, StatusSnapshot, ZAxis,
};

/// Drip Printer - runs a calibration print paced by drip feedback.
///
/// The z-axis is chosen with `DRIPPER_TYPE`: a microphone listening for drips
/// (`audio` or `audio-adaptive`), a timer standing in for one (`emulated`), or
/// nothing at all (`none`). Motions are logged rather than sent to hardware.
///
/// # Environment Variables
///
/// All optional; see [`Config`] for the full list and defaults.
/// * `DRIPPER_TYPE` - `audio`, `audio-adaptive`, `emulated` or `none`
/// * `DRIPS_PER_MM` - Drip calibration (default: "100.0")
/// * `SAMPLE_RATE` / `BIT_DEPTH` - Microphone format (default: "44100" / "16 bit")
/// * `MAX_LEAD_DISTANCE_MM` - Skip layers the liquid has passed by more than this
/// * `CALIBRATION_LAYERS` / `LAYER_HEIGHT_MM` - Size of the test print
///
/// # Usage
///
/// ```bash
/// export DRIPPER_TYPE="audio"
/// export DRIPS_PER_MM="120"
/// RUST_LOG=debug ./drip-printer
/// ```
fn main() -> Result<()> {
    // Initialize logger to output to stdout, using RUST_LOG env var or info level by default
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    let config = Config::load()?;

    info!("Drip Printer starting...");
    info!(
        "Dripper: {:?}, {} drips/mm, {} layers of {} mm",
        config.dripper_type,
        config.drips_per_mm,
        config.calibration_layers,
        config.layer_height_mm
    );

    let status = run_print(&config)?;
    for error in &status.errors {
        warn!("Layer {} failed at {}: {}", error.layer, error.timestamp, error.message);
    }
    Ok(())
}

/// Run the calibration print to the end and return the final status.
fn run_print(config: &Config) -> Result<StatusSnapshot, DripPrinterError> {
    let layers = CalibrationLineSource::stacked(
        constants::CALIBRATION_SPEED,
        config.layer_height_mm,
        config.calibration_layers,
    );

    let controller = Controller::new(
        Box::new(LoggingSink::new()),
        Some(Box::new(NullWriter)),
        Box::new(layers),
        build_zaxis(config),
        Some(Box::new(|status: &StatusSnapshot| {
            debug!(
                "Layer {} at {:.3} mm ({} drips)",
                status.current_layer, status.height, status.drips
            );
        })),
        config.controller_options(),
    );

    controller.start()?;
    info!("Print started");

    while !controller.is_finished() {
        log_status(&controller.get_status());
        thread::sleep(Duration::from_secs(constants::STATUS_LOG_INTERVAL_SECONDS));
    }
    controller.join()?;

    let status = controller.get_status();
    log_status(&status);
    info!(
        "Print finished as {:?} after {:.1}s, {} skipped layer(s)",
        controller.state(),
        status.elapsed_seconds,
        status.skipped_layers
    );
    Ok(status)
}

fn build_zaxis(config: &Config) -> Option<Box<dyn ZAxis>> {
    match config.dripper_type {
        DripperType::Audio => Some(Box::new(AudioDripZAxis::threshold(
            Box::new(CpalInput::new()),
            config.drip_settings(),
            config.sample_rate,
            config.bit_depth,
            config.threshold_percent,
            config.release_ms,
        ))),
        DripperType::AudioAdaptive => Some(Box::new(AudioDripZAxis::adaptive(
            Box::new(CpalInput::new()),
            config.drip_settings(),
            config.sample_rate,
            config.bit_depth,
            config.callbacks_per_second,
        ))),
        DripperType::Emulated => Some(Box::new(EmulatedZAxis::new(
            config.drip_settings(),
            config.emulated_drips_per_second,
        ))),
        DripperType::None => {
            warn!("No dripper configured, layers will not be paced");
            None
        }
    }
}

fn log_status(status: &StatusSnapshot) {
    match serde_json::to_string(status) {
        Ok(json) => info!("Status: {}", json),
        Err(e) => warn!("Failed to serialize status: {}", e),
    }
}
