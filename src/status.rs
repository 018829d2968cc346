use chrono::{DateTime, Local};
use log::trace;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, TryLockError};

/// Observer invoked with a fresh snapshot after a status mutation.
///
/// Runs synchronously on whichever thread made the mutation (the controller
/// thread or the audio capture thread), so it must not block for long.
pub type StatusCallback = Box<dyn Fn(&StatusSnapshot) + Send + Sync>;

/// A fault recorded while pulling or executing a layer.
#[derive(Debug, Clone, Serialize)]
pub struct MachineError {
    pub timestamp: DateTime<Local>,
    pub message: String,
    /// Index of the layer being processed when the fault occurred.
    pub layer: u64,
}

impl MachineError {
    pub fn new(message: impl Into<String>, layer: u64) -> Self {
        Self {
            timestamp: Local::now(),
            message: message.into(),
            layer,
        }
    }
}

/// Coarse progress of a print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrintState {
    Starting,
    Running,
    Complete,
}

impl fmt::Display for PrintState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PrintState::Starting => "Starting",
            PrintState::Running => "Running",
            PrintState::Complete => "Complete",
        };
        f.write_str(text)
    }
}

/// Immutable copy of the printer status at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub start_time: DateTime<Local>,
    pub elapsed_seconds: f64,
    pub current_layer: u64,
    pub status: PrintState,
    pub errors: Vec<MachineError>,
    pub waiting_for_drips: bool,
    pub height: f64,
    pub drips: u64,
    pub drips_per_second: f64,
    pub model_height: f64,
    pub skipped_layers: u64,
}

/// `f64` stored as raw bits so it can be shared without a lock.
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release)
    }
}

/// Thread-safe aggregator of printer state.
///
/// Every mutator writes its field unconditionally and then tries to notify
/// the observer. Delivery is serialised by a single lock that is only ever
/// *tried*: if a notification is already in flight the new one is dropped
/// rather than queued. Observers may therefore miss intermediate snapshots,
/// but the state they read next always includes every mutation made so far.
pub struct MachineStatus {
    call_back: Option<StatusCallback>,
    notify: Mutex<()>,
    start_time: DateTime<Local>,
    current_layer: AtomicU64,
    skipped_layers: AtomicU64,
    waiting_for_drips: AtomicBool,
    height: AtomicF64,
    model_height: AtomicF64,
    drips: AtomicU64,
    drips_per_second: AtomicF64,
    complete: AtomicBool,
    errors: Mutex<Vec<MachineError>>,
}

impl MachineStatus {
    pub fn new(call_back: Option<StatusCallback>) -> Self {
        Self {
            call_back,
            notify: Mutex::new(()),
            start_time: Local::now(),
            current_layer: AtomicU64::new(0),
            skipped_layers: AtomicU64::new(0),
            waiting_for_drips: AtomicBool::new(true),
            height: AtomicF64::new(0.0),
            model_height: AtomicF64::new(0.0),
            drips: AtomicU64::new(0),
            drips_per_second: AtomicF64::new(0.0),
            complete: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Records a drip report from the z-axis.
    pub fn drip_call_back(&self, drips: u64, height: f64, drips_per_second: f64) {
        self.height.store(height);
        self.drips.store(drips, Ordering::Release);
        self.drips_per_second.store(drips_per_second);
        self.update();
    }

    pub fn add_layer(&self) {
        self.current_layer.fetch_add(1, Ordering::AcqRel);
        self.update();
    }

    pub fn add_skipped_layer(&self) {
        self.skipped_layers.fetch_add(1, Ordering::AcqRel);
        self.update();
    }

    pub fn add_error(&self, error: MachineError) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(error);
        self.update();
    }

    pub fn set_waiting_for_drips(&self) {
        self.waiting_for_drips.store(true, Ordering::Release);
        self.update();
    }

    pub fn set_not_waiting_for_drips(&self) {
        self.waiting_for_drips.store(false, Ordering::Release);
        self.update();
    }

    pub fn set_model_height(&self, model_height: f64) {
        self.model_height.store(model_height);
        self.update();
    }

    /// Freezes the status as `Complete`. Only the first call notifies.
    pub fn set_complete(&self) {
        if !self.complete.swap(true, Ordering::AcqRel) {
            self.update();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn status(&self) -> StatusSnapshot {
        let current_layer = self.current_layer.load(Ordering::Acquire);
        let drips = self.drips.load(Ordering::Acquire);
        let elapsed = Local::now() - self.start_time;
        StatusSnapshot {
            start_time: self.start_time,
            elapsed_seconds: elapsed.num_milliseconds() as f64 / 1000.0,
            current_layer,
            status: self.state(drips, current_layer),
            errors: self
                .errors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            waiting_for_drips: self.waiting_for_drips.load(Ordering::Acquire),
            height: self.height.load(),
            drips,
            drips_per_second: self.drips_per_second.load(),
            model_height: self.model_height.load(),
            skipped_layers: self.skipped_layers.load(Ordering::Acquire),
        }
    }

    fn state(&self, drips: u64, current_layer: u64) -> PrintState {
        if self.is_complete() {
            PrintState::Complete
        } else if drips == 0 && current_layer == 0 {
            PrintState::Starting
        } else {
            PrintState::Running
        }
    }

    fn update(&self) {
        let Some(call_back) = &self.call_back else {
            return;
        };
        let _guard = match self.notify.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                trace!("Status notification already in flight, skipping");
                return;
            }
        };
        call_back(&self.status());
    }
}

impl fmt::Debug for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineStatus")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn reports_starting_until_first_layer_or_drip() {
        let status = MachineStatus::new(None);
        assert_eq!(status.status().status, PrintState::Starting);
        assert!(status.status().waiting_for_drips);

        status.drip_call_back(1, 0.01, 2.0);
        assert_eq!(status.status().status, PrintState::Running);

        status.set_complete();
        let snapshot = status.status();
        assert_eq!(snapshot.status, PrintState::Complete);
        assert_eq!(snapshot.status.to_string(), "Complete");
        assert_eq!(snapshot.drips, 1);
    }

    #[test]
    fn layer_alone_marks_running() {
        let status = MachineStatus::new(None);
        status.add_layer();
        status.set_model_height(0.3);
        let snapshot = status.status();
        assert_eq!(snapshot.status, PrintState::Running);
        assert_eq!(snapshot.current_layer, 1);
        assert_eq!(snapshot.model_height, 0.3);
    }

    #[test]
    fn errors_are_appended_in_order() {
        let status = MachineStatus::new(None);
        status.add_error(MachineError::new("first", 1));
        status.add_error(MachineError::new("second", 4));
        let errors = status.status().errors;
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "first");
        assert_eq!(errors[1].layer, 4);
    }

    #[test]
    fn completion_notifies_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let status = MachineStatus::new(Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        status.set_complete();
        status.set_complete();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drops_notification_in_flight_but_keeps_mutation() {
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let status = Arc::new(MachineStatus::new(Some(Box::new(move |snapshot| {
            counter.fetch_add(1, Ordering::SeqCst);
            if snapshot.current_layer == 1 && snapshot.errors.is_empty() {
                entered_tx.lock().unwrap().send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            }
        }))));

        let producer = Arc::clone(&status);
        let handle = thread::spawn(move || producer.add_layer());
        entered_rx.recv().unwrap();

        // The observer is blocked inside the first notification.
        status.add_layer();
        status.add_error(MachineError::new("late", 2));
        let snapshot = status.status();
        assert_eq!(snapshot.current_layer, 2);
        assert_eq!(snapshot.errors.len(), 1);

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let status = MachineStatus::new(None);
        status.add_layer();
        status.add_error(MachineError::new("boom", 1));
        let json = serde_json::to_value(status.status()).unwrap();
        assert_eq!(json["status"], "Running");
        assert_eq!(json["current_layer"], 1);
        assert_eq!(json["errors"][0]["message"], "boom");
    }
}
