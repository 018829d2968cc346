use anyhow::{Result, anyhow, bail};
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::{AudioInput, BitDepth, SampleStream, StreamFormat};
use crate::detector::{AdaptiveDripDetector, DripDetector, DripUpdate, ThresholdDripDetector};
use crate::error::AudioError;
use crate::status::AtomicF64;

/// Receives `(drips, height_mm, drips_per_second)` from a z-axis.
///
/// Called on the z-axis's own thread; it must return promptly.
pub type DripCallback = Arc<dyn Fn(u64, f64, f64) + Send + Sync>;

/// The vertical axis as seen by the print controller.
pub trait ZAxis: Send {
    fn current_height_mm(&self) -> f64;
    fn move_to(&mut self, height_mm: f64);
    fn start(&mut self) -> Result<()>;
    /// Must be idempotent and safe to call while the axis is active.
    fn stop(&mut self) -> Result<()>;
    fn set_call_back(&mut self, call_back: DripCallback);
}

/// Calibration shared by every drip-counting axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DripSettings {
    pub drips_per_mm: f64,
    pub initial_height_mm: f64,
}

impl Default for DripSettings {
    fn default() -> Self {
        Self {
            drips_per_mm: 1.0,
            initial_height_mm: 0.0,
        }
    }
}

/// Drip count and calibration shared between an axis and its worker thread.
struct DripState {
    drips: AtomicU64,
    initial_drips: u64,
    drips_per_mm: AtomicF64,
    running: AtomicBool,
    call_back: Mutex<Option<DripCallback>>,
}

impl DripState {
    fn new(settings: DripSettings) -> Self {
        let initial_drips = (settings.initial_height_mm * settings.drips_per_mm)
            .round()
            .max(0.0) as u64;
        Self {
            drips: AtomicU64::new(initial_drips),
            initial_drips,
            drips_per_mm: AtomicF64::new(settings.drips_per_mm),
            running: AtomicBool::new(false),
            call_back: Mutex::new(None),
        }
    }

    fn drips(&self) -> u64 {
        self.drips.load(Ordering::Acquire)
    }

    fn height(&self) -> f64 {
        let drips = self.drips();
        if drips == 0 {
            return 0.0;
        }
        drips as f64 / self.drips_per_mm.load()
    }

    /// Raise the count to `initial + detected`. Never lowers it.
    fn record(&self, detected: u64) -> u64 {
        let total = self.initial_drips + detected;
        self.drips.fetch_max(total, Ordering::AcqRel).max(total)
    }

    fn publish(&self, drips: u64, drips_per_second: f64) {
        let call_back = self
            .call_back
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(call_back) = call_back {
            call_back(drips, self.height(), drips_per_second);
        }
    }

    fn set_call_back(&self, call_back: DripCallback) {
        *self.call_back.lock().unwrap_or_else(|e| e.into_inner()) = Some(call_back);
    }
}

/// How the capture thread paces its reads.
#[derive(Debug, Clone, Copy)]
struct CaptureTiming {
    min_buffer_size: usize,
    buffer_wait: Duration,
}

/// Height inferred from drips heard through a microphone.
///
/// The capture thread opens the audio input, feeds every block to the drip
/// detector and publishes the running count. Height is
/// `drips / drips_per_mm`, so it only ever grows.
pub struct AudioDripZAxis {
    input: Option<Box<dyn AudioInput>>,
    detector: Option<Box<dyn DripDetector>>,
    format: StreamFormat,
    timing: CaptureTiming,
    state: Arc<DripState>,
    capture: Option<JoinHandle<()>>,
    target_height: f64,
}

impl AudioDripZAxis {
    /// Axis using the fixed threshold and hold strategy.
    ///
    /// A drip is reported to the callback as soon as it is counted.
    ///
    /// # Arguments
    ///
    /// * `input` - Audio input to open when the axis starts
    /// * `settings` - Drips-per-mm calibration and starting height
    /// * `sample_rate` - Capture rate in Hz
    /// * `bit_depth` - Capture depth; the threshold is a fraction of its full scale
    /// * `threshold_percent` - Trigger level (0.0 to 1.0)
    /// * `release_ms` - Hold time after the last loud sample
    pub fn threshold(
        input: Box<dyn AudioInput>,
        settings: DripSettings,
        sample_rate: u32,
        bit_depth: BitDepth,
        threshold_percent: f64,
        release_ms: u32,
    ) -> Self {
        let buffer_size = (sample_rate / 8).max(1) as usize;
        let timing = CaptureTiming {
            min_buffer_size: buffer_size / 8,
            buffer_wait: Duration::from_secs_f64(buffer_size as f64 / f64::from(sample_rate) / 8.0),
        };
        let detector =
            ThresholdDripDetector::new(sample_rate, bit_depth, threshold_percent, release_ms);
        info!(
            "Drip Listening initialized using: samplerate: {}, bit depth {}, drips per mm: {}",
            sample_rate, bit_depth, settings.drips_per_mm
        );
        Self::with_detector(
            input,
            Box::new(detector),
            settings,
            StreamFormat {
                sample_rate,
                bit_depth,
                buffer_size,
            },
            timing,
        )
    }

    /// Axis using the adaptive threshold and debounce strategy.
    ///
    /// The callback fires `calls_backs_per_second` times per second of audio
    /// regardless of how fast drips arrive.
    pub fn adaptive(
        input: Box<dyn AudioInput>,
        settings: DripSettings,
        sample_rate: u32,
        bit_depth: BitDepth,
        calls_backs_per_second: u32,
    ) -> Self {
        let min_buffer_size = (sample_rate / 8).max(1) as usize;
        let timing = CaptureTiming {
            min_buffer_size,
            buffer_wait: Duration::from_secs_f64(min_buffer_size as f64 / f64::from(sample_rate)),
        };
        let detector = AdaptiveDripDetector::new(sample_rate, calls_backs_per_second);
        Self::with_detector(
            input,
            Box::new(detector),
            settings,
            StreamFormat {
                sample_rate,
                bit_depth,
                buffer_size: (sample_rate / 2).max(1) as usize,
            },
            timing,
        )
    }

    fn with_detector(
        input: Box<dyn AudioInput>,
        detector: Box<dyn DripDetector>,
        settings: DripSettings,
        format: StreamFormat,
        timing: CaptureTiming,
    ) -> Self {
        Self {
            input: Some(input),
            detector: Some(detector),
            format,
            timing,
            state: Arc::new(DripState::new(settings)),
            capture: None,
            target_height: settings.initial_height_mm,
        }
    }

    pub fn drips(&self) -> u64 {
        self.state.drips()
    }

    pub fn drips_per_mm(&self) -> f64 {
        self.state.drips_per_mm.load()
    }

    pub fn set_drips_per_mm(&self, drips_per_mm: f64) {
        self.state.drips_per_mm.store(drips_per_mm);
    }

    /// Last height requested through [`ZAxis::move_to`].
    pub fn target_height(&self) -> f64 {
        self.target_height
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }
}

impl ZAxis for AudioDripZAxis {
    fn current_height_mm(&self) -> f64 {
        self.state.height()
    }

    fn move_to(&mut self, height_mm: f64) {
        // Drips fall at their own pace; the target is only informational.
        self.target_height = height_mm;
    }

    /// Open the audio input on a new capture thread.
    ///
    /// Returns once the stream is open, so an unsupported format is reported
    /// here rather than from the capture thread. An axis can be started once.
    fn start(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let (Some(mut input), Some(mut detector)) = (self.input.take(), self.detector.take())
        else {
            bail!("Drip z-axis has already been used and cannot be restarted");
        };

        info!("Starting to listen to drips");
        let state = Arc::clone(&self.state);
        let format = self.format;
        let timing = self.timing;
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), AudioError>>(1);
        state.running.store(true, Ordering::Release);

        let handle = thread::Builder::new()
            .name("drip-capture".to_string())
            .spawn(move || {
                let mut stream = match input.open(&format) {
                    Ok(stream) => stream,
                    Err(e) => {
                        state.running.store(false, Ordering::Release);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                capture_loop(stream.as_mut(), detector.as_mut(), &state, format, timing);
                drop(stream);
                state.running.store(false, Ordering::Release);
                info!("Shut Down Drip Detector");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.capture = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e.into())
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::CaptureThreadLost.into())
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        info!("Drip Detector Shutdown Requested");
        self.state.running.store(false, Ordering::Release);
        if let Some(handle) = self.capture.take() {
            handle
                .join()
                .map_err(|_| anyhow!("Drip capture thread panicked"))?;
        }
        Ok(())
    }

    fn set_call_back(&mut self, call_back: DripCallback) {
        self.state.set_call_back(call_back);
    }
}

impl Drop for AudioDripZAxis {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("{}", e);
        }
    }
}

fn capture_loop(
    stream: &mut dyn SampleStream,
    detector: &mut dyn DripDetector,
    state: &DripState,
    format: StreamFormat,
    timing: CaptureTiming,
) {
    let mut frames = Vec::with_capacity(format.buffer_size);
    while state.running.load(Ordering::Acquire) {
        if stream.available() < timing.min_buffer_size {
            thread::sleep(timing.buffer_wait);
        }
        frames.clear();
        if let Err(e) = stream.read(&mut frames) {
            error!("{}", e);
            break;
        }
        if frames.is_empty() {
            continue;
        }
        detector.process_samples(&frames, &mut |update: DripUpdate| {
            let drips = state.record(update.drips);
            state.publish(drips, update.drips_per_second);
        });
        state.record(detector.drips());
    }
}

/// Axis that drips at a set rate without any sensor.
///
/// Stands in for the real dripper in dry runs and demos. The rate can be
/// changed while running.
pub struct EmulatedZAxis {
    state: Arc<DripState>,
    drips_per_second: Arc<AtomicF64>,
    ticker: Option<JoinHandle<()>>,
}

impl EmulatedZAxis {
    /// Longest single sleep of the ticker thread, so `stop` stays responsive.
    const MAX_SLEEP: Duration = Duration::from_millis(20);

    pub fn new(settings: DripSettings, drips_per_second: f64) -> Self {
        Self {
            state: Arc::new(DripState::new(settings)),
            drips_per_second: Arc::new(AtomicF64::new(drips_per_second)),
            ticker: None,
        }
    }

    pub fn drips_per_second(&self) -> f64 {
        self.drips_per_second.load()
    }

    pub fn set_drips_per_second(&self, drips_per_second: f64) {
        self.drips_per_second.store(drips_per_second);
    }

    pub fn drips(&self) -> u64 {
        self.state.drips()
    }
}

impl ZAxis for EmulatedZAxis {
    fn current_height_mm(&self) -> f64 {
        self.state.height()
    }

    fn move_to(&mut self, height_mm: f64) {
        debug!("Emulated z-axis asked to move to {:.3} mm", height_mm);
    }

    fn start(&mut self) -> Result<()> {
        if self.ticker.is_some() {
            return Ok(());
        }
        info!(
            "Starting emulated dripper at {:.2} drips/s",
            self.drips_per_second()
        );
        let state = Arc::clone(&self.state);
        let rate = Arc::clone(&self.drips_per_second);
        state.running.store(true, Ordering::Release);

        let handle = thread::Builder::new()
            .name("emulated-dripper".to_string())
            .spawn(move || {
                let mut detected = 0u64;
                let mut last_drip = Instant::now();
                while state.running.load(Ordering::Acquire) {
                    let drips_per_second = rate.load();
                    // Rates with no representable interval produce no drips.
                    let interval = if drips_per_second.is_finite() && drips_per_second > 0.0 {
                        Duration::try_from_secs_f64(1.0 / drips_per_second).ok()
                    } else {
                        None
                    };
                    let Some(interval) = interval else {
                        thread::sleep(Self::MAX_SLEEP);
                        last_drip = Instant::now();
                        continue;
                    };
                    let elapsed = last_drip.elapsed();
                    if elapsed < interval {
                        thread::sleep((interval - elapsed).min(Self::MAX_SLEEP));
                        continue;
                    }
                    last_drip += interval;
                    detected += 1;
                    let drips = state.record(detected);
                    state.publish(drips, drips_per_second);
                }
            })?;
        self.ticker = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state.running.store(false, Ordering::Release);
        if let Some(handle) = self.ticker.take() {
            handle
                .join()
                .map_err(|_| anyhow!("Emulated dripper thread panicked"))?;
            info!("Emulated dripper stopped after {} drips", self.drips());
        }
        Ok(())
    }

    fn set_call_back(&mut self, call_back: DripCallback) {
        self.state.set_call_back(call_back);
    }
}

impl Drop for EmulatedZAxis {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const WAIT: Duration = Duration::from_secs(5);

    struct ScriptedInput {
        blocks: Vec<Vec<i32>>,
        reject: bool,
    }

    struct ScriptedStream {
        blocks: VecDeque<Vec<i32>>,
    }

    impl SampleStream for ScriptedStream {
        fn available(&self) -> usize {
            self.blocks.front().map_or(0, Vec::len)
        }

        fn read(&mut self, out: &mut Vec<i32>) -> Result<usize, AudioError> {
            let block = self.blocks.pop_front().unwrap_or_default();
            out.extend_from_slice(&block);
            Ok(block.len())
        }
    }

    impl AudioInput for ScriptedInput {
        fn open(&mut self, format: &StreamFormat) -> Result<Box<dyn SampleStream>, AudioError> {
            if self.reject {
                return Err(AudioError::UnsupportedFormat {
                    sample_rate: format.sample_rate,
                    bit_depth: format.bit_depth.to_string(),
                });
            }
            Ok(Box::new(ScriptedStream {
                blocks: std::mem::take(&mut self.blocks).into(),
            }))
        }
    }

    fn drip_block() -> Vec<i32> {
        let mut block = vec![0; 5];
        block.extend(std::iter::repeat_n(30_000, 20));
        block.extend(std::iter::repeat_n(0, 20));
        block
    }

    fn threshold_axis(blocks: Vec<Vec<i32>>, settings: DripSettings) -> AudioDripZAxis {
        AudioDripZAxis::threshold(
            Box::new(ScriptedInput {
                blocks,
                reject: false,
            }),
            settings,
            1_000,
            BitDepth::Int16,
            0.5,
            6,
        )
    }

    #[test]
    fn threshold_axis_reports_each_drip_with_height() {
        let settings = DripSettings {
            drips_per_mm: 2.0,
            initial_height_mm: 0.0,
        };
        let mut axis = threshold_axis(vec![drip_block(), drip_block(), drip_block()], settings);
        let (tx, rx) = mpsc::channel();
        axis.set_call_back(Arc::new(move |drips, height, _rate| {
            let _ = tx.send((drips, height));
        }));

        assert_eq!(axis.current_height_mm(), 0.0);
        axis.start().unwrap();
        let reports: Vec<(u64, f64)> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        axis.stop().unwrap();

        assert_eq!(reports, vec![(1, 0.5), (2, 1.0), (3, 1.5)]);
        assert_eq!(axis.drips(), 3);
        assert_eq!(axis.current_height_mm(), 1.5);
        assert!(!axis.is_running());
    }

    #[test]
    fn stop_is_idempotent() {
        let mut axis = threshold_axis(vec![drip_block()], DripSettings::default());
        axis.stop().unwrap();
        axis.start().unwrap();
        axis.stop().unwrap();
        axis.stop().unwrap();
        assert!(axis.start().is_err());
    }

    #[test]
    fn unsupported_format_fails_start() {
        let mut axis = AudioDripZAxis::adaptive(
            Box::new(ScriptedInput {
                blocks: Vec::new(),
                reject: true,
            }),
            DripSettings::default(),
            96_000,
            BitDepth::Int24,
            15,
        );
        let err = axis.start().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AudioError>(),
            Some(AudioError::UnsupportedFormat {
                sample_rate: 96_000,
                ..
            })
        ));
        assert!(!axis.is_running());
        axis.stop().unwrap();
    }

    #[test]
    fn initial_height_offsets_the_count() {
        let settings = DripSettings {
            drips_per_mm: 10.0,
            initial_height_mm: 0.5,
        };
        let mut axis = threshold_axis(vec![drip_block()], settings);
        assert_eq!(axis.drips(), 5);
        assert!((axis.current_height_mm() - 0.5).abs() < 1e-9);

        let (tx, rx) = mpsc::channel();
        axis.set_call_back(Arc::new(move |drips, _, _| {
            let _ = tx.send(drips);
        }));
        axis.start().unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 6);
        axis.stop().unwrap();
        assert!((axis.current_height_mm() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn changing_drips_per_mm_rescales_height() {
        let settings = DripSettings {
            drips_per_mm: 10.0,
            initial_height_mm: 1.0,
        };
        let axis = threshold_axis(Vec::new(), settings);
        axis.set_drips_per_mm(20.0);
        assert_eq!(axis.drips_per_mm(), 20.0);
        assert!((axis.current_height_mm() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn emulated_axis_drips_monotonically() {
        let mut axis = EmulatedZAxis::new(
            DripSettings {
                drips_per_mm: 4.0,
                initial_height_mm: 0.0,
            },
            200.0,
        );
        let (tx, rx) = mpsc::channel();
        axis.set_call_back(Arc::new(move |drips, height, rate| {
            let _ = tx.send((drips, height, rate));
        }));
        axis.start().unwrap();
        let reports: Vec<(u64, f64, f64)> =
            (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        axis.set_drips_per_second(50.0);
        axis.stop().unwrap();
        axis.stop().unwrap();

        for pair in reports.windows(2) {
            assert!(pair[1].0 > pair[0].0);
            assert!(pair[1].1 >= pair[0].1);
        }
        let (drips, height, rate) = reports[0];
        assert_eq!(drips, 1);
        assert_eq!(height, 0.25);
        assert_eq!(rate, 200.0);
        assert_eq!(axis.drips_per_second(), 50.0);
        assert!(axis.drips() >= 4);
    }

    #[test]
    fn emulated_axis_survives_unusable_rates() {
        for rate in [f64::NAN, 1e-20, f64::INFINITY, -3.0] {
            let mut axis = EmulatedZAxis::new(DripSettings::default(), rate);
            axis.start().unwrap();
            thread::sleep(Duration::from_millis(50));
            assert!(axis.stop().is_ok(), "ticker failed at rate {}", rate);
            assert_eq!(axis.drips(), 0);
        }

        let mut axis = EmulatedZAxis::new(DripSettings::default(), 100.0);
        axis.start().unwrap();
        axis.set_drips_per_second(f64::NAN);
        thread::sleep(Duration::from_millis(50));
        assert!(axis.stop().is_ok());
    }
}
