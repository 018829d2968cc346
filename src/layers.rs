use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::commands::{Layer, MotionCommand, Position};

/// Supplier of layers for the print controller.
///
/// `Ok(None)` signals the end of the sequence and ends the print normally.
/// An `Err` is a per-layer fault: the controller records it against the
/// current layer index and then aborts or continues depending on its
/// configured policy.
pub trait LayerSource: Send {
    fn next_layer(&mut self) -> Result<Option<Layer>>;
}

/// Finite source backed by a prepared list of layers.
pub struct StubLayerSource {
    layers: VecDeque<Layer>,
}

impl StubLayerSource {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self {
            layers: layers.into(),
        }
    }
}

impl LayerSource for StubLayerSource {
    fn next_layer(&mut self) -> Result<Option<Layer>> {
        Ok(self.layers.pop_front())
    }
}

/// Endless source that keeps curing a single point.
///
/// The point can be moved from another thread through the handle returned by
/// [`SinglePointSource::handle`], which is how a focusing or alignment tool
/// steers the beam while the controller is running.
pub struct SinglePointSource {
    point: Arc<Mutex<Position>>,
    speed: f64,
}

impl SinglePointSource {
    pub fn new(start: Position) -> Self {
        Self {
            point: Arc::new(Mutex::new(start)),
            speed: 100.0,
        }
    }

    pub fn handle(&self) -> SinglePointHandle {
        SinglePointHandle {
            point: Arc::clone(&self.point),
        }
    }
}

impl LayerSource for SinglePointSource {
    fn next_layer(&mut self) -> Result<Option<Layer>> {
        let point = *self.point.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Some(Layer::with_commands(
            0.0,
            vec![MotionCommand::LateralDraw {
                start: point,
                end: point,
                speed: self.speed,
            }],
        )))
    }
}

/// Moves the point drawn by a [`SinglePointSource`].
#[derive(Clone)]
pub struct SinglePointHandle {
    point: Arc<Mutex<Position>>,
}

impl SinglePointHandle {
    pub fn set(&self, position: Position) {
        *self.point.lock().unwrap_or_else(|e| e.into_inner()) = position;
    }
}

/// Endless source that sweeps a horizontal line back and forth across the
/// unit square. Used to calibrate cure speed.
pub struct CalibrationLineSource {
    speed: f64,
    layer_height: f64,
    z: f64,
    limit: Option<usize>,
    produced: usize,
}

impl CalibrationLineSource {
    pub fn new(speed: f64) -> Self {
        Self {
            speed,
            layer_height: 0.0,
            z: 0.0,
            limit: None,
            produced: 0,
        }
    }

    /// Raise each successive layer by `layer_height` and stop after `count`
    /// layers, turning the calibration pattern into a small test print.
    pub fn stacked(speed: f64, layer_height: f64, count: usize) -> Self {
        Self {
            speed,
            layer_height,
            z: 0.0,
            limit: Some(count),
            produced: 0,
        }
    }
}

impl LayerSource for CalibrationLineSource {
    fn next_layer(&mut self) -> Result<Option<Layer>> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(None);
        }
        let left = Position::new(0.0, 0.5);
        let right = Position::new(1.0, 0.5);
        let layer = Layer::with_commands(
            self.z,
            vec![
                MotionCommand::LateralDraw {
                    start: left,
                    end: right,
                    speed: self.speed,
                },
                MotionCommand::LateralDraw {
                    start: right,
                    end: left,
                    speed: self.speed,
                },
            ],
        );
        self.produced += 1;
        self.z += self.layer_height;
        Ok(Some(layer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_source_drains_in_order_then_ends() {
        let mut source = StubLayerSource::new(vec![Layer::new(0.0), Layer::new(0.1)]);
        assert_eq!(source.next_layer().unwrap().unwrap().z, 0.0);
        assert_eq!(source.next_layer().unwrap().unwrap().z, 0.1);
        assert!(source.next_layer().unwrap().is_none());
        assert!(source.next_layer().unwrap().is_none());
    }

    #[test]
    fn single_point_follows_handle() {
        let mut source = SinglePointSource::new(Position::default());
        source.handle().set(Position::new(0.25, 0.75));
        let layer = source.next_layer().unwrap().unwrap();
        match &layer.commands[0] {
            MotionCommand::LateralDraw { start, end, .. } => {
                assert_eq!(*start, Position::new(0.25, 0.75));
                assert_eq!(start, end);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn stacked_calibration_rises_and_stops() {
        let mut source = CalibrationLineSource::stacked(10.0, 0.1, 3);
        let heights: Vec<f64> = std::iter::from_fn(|| source.next_layer().unwrap())
            .map(|layer| layer.z)
            .collect();
        assert_eq!(heights.len(), 3);
        assert!((heights[2] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn calibration_line_returns_to_start() {
        let mut source = CalibrationLineSource::new(10.0);
        let layer = source.next_layer().unwrap().unwrap();
        assert_eq!(layer.commands.len(), 2);
        assert_eq!(layer.z, 0.0);
        assert_eq!(layer.commands[0].speed(), 10.0);
    }
}
