//! Motion primitives handed to the print controller.
//!
//! A [`Layer`] is an ordered list of [`MotionCommand`]s that all share the
//! layer's z-height. Layers are produced by a [`crate::layers::LayerSource`]
//! and consumed exactly once.

/// A point in the lateral plane, in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A single motion request.
///
/// Lateral commands carry both endpoints so that the controller can tell
/// whether an implicit travel move is needed before a draw.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionCommand {
    /// Travel with the laser off.
    LateralMove {
        start: Position,
        end: Position,
        speed: f64,
    },
    /// Cure along a line with the laser on.
    LateralDraw {
        start: Position,
        end: Position,
        speed: f64,
    },
    /// Vertical travel. Handled by the z-axis, never executed by the controller.
    VerticalMove { start: f64, end: f64, speed: f64 },
}

impl MotionCommand {
    pub fn speed(&self) -> f64 {
        match self {
            MotionCommand::LateralMove { speed, .. }
            | MotionCommand::LateralDraw { speed, .. }
            | MotionCommand::VerticalMove { speed, .. } => *speed,
        }
    }
}

/// One slice of the model at a fixed height.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    /// Target z-height in millimetres.
    pub z: f64,
    pub commands: Vec<MotionCommand>,
}

impl Layer {
    pub fn new(z: f64) -> Self {
        Self {
            z,
            commands: Vec::new(),
        }
    }

    pub fn with_commands(z: f64, commands: Vec<MotionCommand>) -> Self {
        Self { z, commands }
    }
}
