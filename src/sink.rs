use anyhow::Result;
use log::debug;

/// Turns lateral motions into an output representation and switches the laser.
///
/// The encoding itself (galvo waveform, micro-controller packets, ...) lives
/// behind this trait; the controller only asks for a `from -> to` motion at a
/// given speed and hands the result to the [`OutputWriter`].
pub trait MotionSink: Send {
    fn set_laser_on(&mut self);
    fn set_laser_off(&mut self);
    fn encode(&mut self, from: [f64; 3], to: [f64; 3], speed: f64) -> Result<Vec<f32>>;
}

/// Final destination of encoded motions.
///
/// Owned by the controller and closed exactly once during teardown.
pub trait OutputWriter: Send {
    fn write_chunk(&mut self, chunk: &[f32]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Sink for dry runs: logs every motion and produces no output.
#[derive(Debug, Default)]
pub struct LoggingSink {
    laser_on: bool,
    motions: u64,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MotionSink for LoggingSink {
    fn set_laser_on(&mut self) {
        self.laser_on = true;
    }

    fn set_laser_off(&mut self) {
        self.laser_on = false;
    }

    fn encode(&mut self, from: [f64; 3], to: [f64; 3], speed: f64) -> Result<Vec<f32>> {
        self.motions += 1;
        debug!(
            "Motion {}: {} {:?} -> {:?} at {:.2} mm/s",
            self.motions,
            if self.laser_on { "Draw" } else { "Move" },
            from,
            to,
            speed
        );
        Ok(Vec::new())
    }
}

/// Writer that discards everything.
#[derive(Debug, Default)]
pub struct NullWriter;

impl OutputWriter for NullWriter {
    fn write_chunk(&mut self, _chunk: &[f32]) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
