use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::commands::{Layer, MotionCommand, Position};
use crate::config::constants;
use crate::error::ControllerError;
use crate::layers::LayerSource;
use crate::sink::{MotionSink, OutputWriter};
use crate::status::{MachineError, MachineStatus, StatusCallback, StatusSnapshot};
use crate::zaxis::ZAxis;

/// Tool position and feed speed as last commanded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineState {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub speed: f64,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            speed: 1.0,
        }
    }
}

impl MachineState {
    /// Pose the machine is reset to when the layer source is swapped.
    pub fn parked() -> Self {
        let [x, y, z] = constants::PARKED_POSITION;
        Self {
            x,
            y,
            z,
            speed: constants::PARKED_SPEED,
        }
    }

    pub fn xy(&self) -> Position {
        Position::new(self.x, self.y)
    }

    pub fn xyz(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn set_state(&mut self, [x, y, z]: [f64; 3], speed: f64) {
        self.x = x;
        self.y = y;
        self.z = z;
        self.speed = speed;
    }
}

/// Print policy knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerOptions {
    /// How far the measured height may run ahead of a layer's target before
    /// the layer is skipped.
    pub max_lead_distance: f64,
    /// End the print on the first per-layer fault instead of carrying on.
    pub abort_on_error: bool,
    /// Upper bound applied to every motion's speed.
    pub max_speed: Option<f64>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_lead_distance: f64::MAX,
            abort_on_error: true,
            max_speed: None,
        }
    }
}

/// Lifecycle of the execution thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Starting,
    Running,
    /// The layer source ran out.
    Complete,
    /// Stopped by request or by a fault with `abort_on_error` set.
    Aborted,
}

impl ControllerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ControllerState::Starting,
            1 => ControllerState::Running,
            2 => ControllerState::Complete,
            _ => ControllerState::Aborted,
        }
    }
}

/// Single-slot handoff for a replacement layer source.
struct SwapSlot {
    pending: Option<Box<dyn LayerSource>>,
    completed: u64,
    finished: bool,
}

/// Flags and state shared between the controller handle and its thread.
struct Shared {
    lifecycle: AtomicU8,
    shutting_down: AtomicBool,
    aborted: AtomicBool,
    abort_current_command: AtomicBool,
    laser_off_override: AtomicBool,
    machine: Mutex<MachineState>,
    swap: Mutex<SwapSlot>,
    swapped: Condvar,
}

impl Shared {
    fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn set_lifecycle(&self, state: ControllerState) {
        self.lifecycle.store(state as u8, Ordering::Release);
    }

    fn machine(&self) -> MutexGuard<'_, MachineState> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn swap_slot(&self) -> MutexGuard<'_, SwapSlot> {
        self.swap.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Runs a print on its own thread, pacing layers against the z-axis.
///
/// Each layer is pulled from the [`LayerSource`], the z-axis is told the new
/// target height, and the layer is drawn only if the measured height is not
/// more than `max_lead_distance` ahead of it; otherwise it is skipped. Every
/// eighth layer the controller holds until the measured height has caught up,
/// so consecutive layers are drawn without switching the laser off between
/// them.
pub struct Controller {
    shared: Arc<Shared>,
    status: Arc<MachineStatus>,
    worker: Mutex<Option<Worker>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    swap_gate: Mutex<()>,
}

impl Controller {
    /// Create a controller. Nothing runs until [`Controller::start`].
    ///
    /// # Arguments
    ///
    /// * `sink` - Encodes motions and switches the laser
    /// * `writer` - Output for encoded motions; `None` for a dry run
    /// * `layers` - Source of layers to print
    /// * `zaxis` - Height feedback; `None` prints every layer unpaced
    /// * `status_call_back` - Observer for status changes
    /// * `options` - Lead distance, error policy and speed limit
    pub fn new(
        sink: Box<dyn MotionSink>,
        writer: Option<Box<dyn OutputWriter>>,
        layers: Box<dyn LayerSource>,
        mut zaxis: Option<Box<dyn ZAxis>>,
        status_call_back: Option<StatusCallback>,
        options: ControllerOptions,
    ) -> Self {
        let status = Arc::new(MachineStatus::new(status_call_back));
        if let Some(zaxis) = zaxis.as_mut() {
            let status = Arc::clone(&status);
            zaxis.set_call_back(Arc::new(move |drips, height, drips_per_second| {
                status.drip_call_back(drips, height, drips_per_second)
            }));
        }

        let shared = Arc::new(Shared {
            lifecycle: AtomicU8::new(ControllerState::Starting as u8),
            shutting_down: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_current_command: AtomicBool::new(false),
            laser_off_override: AtomicBool::new(false),
            machine: Mutex::new(MachineState::default()),
            swap: Mutex::new(SwapSlot {
                pending: None,
                completed: 0,
                finished: false,
            }),
            swapped: Condvar::new(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            status: Arc::clone(&status),
            sink,
            writer,
            layers,
            zaxis,
            options,
        };

        Self {
            shared,
            status,
            worker: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
            swap_gate: Mutex::new(()),
        }
    }

    /// Start the z-axis and spawn the execution thread.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The controller was already started or stopped
    /// - The z-axis fails to start (for example an unsupported audio format);
    ///   the output writer is released before returning
    /// - The execution thread cannot be spawned
    pub fn start(&self) -> Result<(), ControllerError> {
        let mut worker = lock(&self.worker)
            .take()
            .ok_or(ControllerError::AlreadyStarted)?;

        info!("Running Controller");
        let started = match worker.zaxis.as_mut() {
            Some(zaxis) => zaxis.start(),
            None => Ok(()),
        };
        if let Err(e) = started {
            error!("Z-axis failed to start: {:#}", e);
            worker.shared.aborted.store(true, Ordering::Release);
            worker.finish();
            return Err(ControllerError::ZAxisStart(format!("{:#}", e)));
        }

        let handle = thread::Builder::new()
            .name("print-controller".to_string())
            .spawn(move || worker.run())?;
        *lock(&self.handle) = Some(handle);
        Ok(())
    }

    /// Ask the execution thread to finish.
    ///
    /// The flag is checked before each layer and each command; a command
    /// already being written completes. Safe to call any number of times.
    /// A controller that was never started is torn down immediately.
    pub fn stop(&self) {
        warn!("Shutdown requested");
        self.shared.aborted.store(true, Ordering::Release);
        self.shared.shutting_down.store(true, Ordering::Release);
        if let Some(worker) = lock(&self.worker).take() {
            worker.finish();
        }
    }

    /// Block until the execution thread has exited and torn down.
    pub fn join(&self) -> Result<(), ControllerError> {
        let handle = lock(&self.handle).take();
        match handle {
            Some(handle) => handle.join().map_err(|_| ControllerError::WorkerPanicked),
            None => Ok(()),
        }
    }

    /// Replace the layer source while printing.
    ///
    /// Aborts the layer in progress and blocks until the execution thread has
    /// installed `layers` and parked the machine. Once this returns no further
    /// layer is taken from the old source. Concurrent calls are serialised.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::NotRunning`] if the execution thread has
    /// already finished; `layers` is dropped in that case.
    pub fn change_generator(&self, layers: Box<dyn LayerSource>) -> Result<(), ControllerError> {
        let _gate = lock(&self.swap_gate);

        {
            let mut worker = lock(&self.worker);
            if let Some(worker) = worker.as_mut() {
                worker.layers = layers;
                *self.shared.machine() = MachineState::parked();
                return Ok(());
            }
        }

        info!("Changing layer source");
        self.shared
            .abort_current_command
            .store(true, Ordering::Release);
        let mut slot = self.shared.swap_slot();
        if slot.finished {
            return Err(ControllerError::NotRunning);
        }
        slot.pending = Some(layers);
        let target = slot.completed + 1;
        while slot.completed < target && !slot.finished {
            slot = self
                .shared
                .swapped
                .wait(slot)
                .unwrap_or_else(|e| e.into_inner());
        }
        if slot.completed < target {
            slot.pending = None;
            return Err(ControllerError::NotRunning);
        }
        Ok(())
    }

    /// Keep the laser off during draws (the path is still traced).
    pub fn set_laser_off_override(&self, enabled: bool) {
        self.shared
            .laser_off_override
            .store(enabled, Ordering::Release);
    }

    pub fn get_status(&self) -> StatusSnapshot {
        self.status.status()
    }

    pub fn machine_state(&self) -> MachineState {
        *self.shared.machine()
    }

    pub fn state(&self) -> ControllerState {
        ControllerState::from_u8(self.shared.lifecycle.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ControllerState::Running
    }

    /// True once the print has ended and torn down, however it ended.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state(),
            ControllerState::Complete | ControllerState::Aborted
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Everything the execution thread owns.
struct Worker {
    shared: Arc<Shared>,
    status: Arc<MachineStatus>,
    sink: Box<dyn MotionSink>,
    writer: Option<Box<dyn OutputWriter>>,
    layers: Box<dyn LayerSource>,
    zaxis: Option<Box<dyn ZAxis>>,
    options: ControllerOptions,
}

impl Worker {
    fn run(mut self) {
        self.shared.set_lifecycle(ControllerState::Running);
        self.process_layers();
        self.finish();
    }

    /// Mark the print complete, tear down and release any pending swap.
    fn finish(mut self) {
        self.status.set_complete();
        self.terminate();
        let mut slot = self.shared.swap_slot();
        slot.finished = true;
        slot.pending = None;
        self.shared.swapped.notify_all();
        drop(slot);

        let end = if self.shared.aborted.load(Ordering::Acquire) {
            ControllerState::Aborted
        } else {
            ControllerState::Complete
        };
        self.shared.set_lifecycle(end);
    }

    fn process_layers(&mut self) {
        let mut layer_count: u64 = 0;
        info!("Start Processing Layers");
        while !self.shared.shutting_down() {
            self.apply_pending_swap();

            let start = Instant::now();
            let layer = match self.layers.next_layer() {
                Ok(Some(layer)) => layer,
                Ok(None) => {
                    info!("Layers Complete");
                    self.shared.shutting_down.store(true, Ordering::Release);
                    break;
                }
                Err(e) => {
                    self.record_error(&e, layer_count);
                    continue;
                }
            };
            debug!(
                "Layer Generator Time: {:.2}",
                start.elapsed().as_secs_f64()
            );

            layer_count += 1;
            self.status.add_layer();
            self.status.set_model_height(layer.z);
            if let Err(e) = self.print_layer(&layer, layer_count) {
                self.record_error(&e, layer_count);
            }
            debug!("Layer Total Time: {:.2}", start.elapsed().as_secs_f64());
        }
    }

    fn apply_pending_swap(&mut self) {
        let pending = self.shared.swap_slot().pending.take();
        let Some(layers) = pending else {
            return;
        };
        self.layers = layers;
        *self.shared.machine() = MachineState::parked();
        self.shared
            .abort_current_command
            .store(false, Ordering::Release);

        let mut slot = self.shared.swap_slot();
        slot.completed += 1;
        self.shared.swapped.notify_all();
        info!("Layer source changed");
    }

    fn record_error(&mut self, e: &anyhow::Error, layer: u64) {
        self.status.add_error(MachineError::new(format!("{:#}", e), layer));
        error!("Unexpected Error: {:#}", e);
        if self.options.abort_on_error {
            self.shared.aborted.store(true, Ordering::Release);
            self.terminate();
        }
    }

    fn print_layer(&mut self, layer: &Layer, layer_count: u64) -> Result<()> {
        if let Some(zaxis) = self.zaxis.as_mut() {
            zaxis.move_to(layer.z);
        }
        if self.zaxis.is_some() && layer_count % constants::BATCH_LAYERS == 0 {
            self.wait_till(layer.z)?;
        }

        let ahead_by = self.measured_height().map(|height| height - layer.z);
        if self.should_process(ahead_by) {
            self.process_layer(layer)
        } else {
            warn!(
                "Dripping too fast, Skipping layer {} (ahead by {:.3} mm)",
                layer_count,
                ahead_by.unwrap_or_default()
            );
            self.status.add_skipped_layer();
            Ok(())
        }
    }

    fn measured_height(&self) -> Option<f64> {
        self.zaxis.as_ref().map(|zaxis| zaxis.current_height_mm())
    }

    fn should_process(&self, ahead_by: Option<f64>) -> bool {
        match ahead_by {
            None => true,
            Some(ahead_by) => ahead_by <= self.options.max_lead_distance,
        }
    }

    /// Hold the beam at its current position until the drips catch up.
    fn wait_till(&mut self, height: f64) -> Result<()> {
        let held = self.hold_until(height);
        self.status.set_not_waiting_for_drips();
        held
    }

    /// Returns early on shutdown or a pending source swap.
    fn hold_until(&mut self, height: f64) -> Result<()> {
        while self.measured_height().is_some_and(|current| current < height) {
            if self.shared.shutting_down()
                || self.shared.abort_current_command.load(Ordering::Acquire)
            {
                break;
            }
            self.status.set_waiting_for_drips();
            let state = *self.shared.machine();
            self.move_lateral(state.xy(), state.z, state.speed)?;
            thread::sleep(Duration::from_millis(constants::WAIT_POLL_INTERVAL_MS));
        }
        Ok(())
    }

    fn process_layer(&mut self, layer: &Layer) -> Result<()> {
        for command in &layer.commands {
            if self.shared.shutting_down() {
                return Ok(());
            }
            if self
                .shared
                .abort_current_command
                .swap(false, Ordering::AcqRel)
            {
                return Ok(());
            }
            match command {
                MotionCommand::LateralDraw { start, end, speed } => {
                    if self.shared.machine().xy() != *start {
                        self.move_lateral(*start, layer.z, *speed)?;
                    }
                    self.draw_lateral(*end, layer.z, *speed)?;
                }
                MotionCommand::LateralMove { end, speed, .. } => {
                    self.move_lateral(*end, layer.z, *speed)?;
                }
                MotionCommand::VerticalMove { end, .. } => {
                    debug!("Vertical move to {:.3} left to the z-axis", end);
                }
            }
        }
        Ok(())
    }

    fn move_lateral(&mut self, to: Position, z: f64, speed: f64) -> Result<()> {
        self.sink.set_laser_off();
        self.write_lateral(to, z, speed)
    }

    fn draw_lateral(&mut self, to: Position, z: f64, speed: f64) -> Result<()> {
        if self.shared.laser_off_override.load(Ordering::Acquire) {
            self.sink.set_laser_off();
        } else {
            self.sink.set_laser_on();
        }
        self.write_lateral(to, z, speed)
    }

    fn write_lateral(&mut self, to: Position, z: f64, speed: f64) -> Result<()> {
        let speed = match self.options.max_speed {
            Some(max_speed) if speed > max_speed => max_speed,
            _ => speed,
        };
        let to_xyz = [to.x, to.y, z];
        let from_xyz = self.shared.machine().xyz();
        let path = self.sink.encode(from_xyz, to_xyz, speed)?;
        if let Some(writer) = self.writer.as_mut() {
            writer.write_chunk(&path)?;
        }
        self.shared.machine().set_state(to_xyz, speed);
        Ok(())
    }

    /// Release the writer and stop the z-axis. Idempotent.
    fn terminate(&mut self) {
        info!("Controller shutdown requested");
        self.shared.shutting_down.store(true, Ordering::Release);
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close() {
                error!("Failed to close output writer: {:#}", e);
            }
        }
        if let Some(mut zaxis) = self.zaxis.take() {
            if let Err(e) = zaxis.stop() {
                error!("Failed to stop z-axis: {:#}", e);
            }
        }
    }
}
