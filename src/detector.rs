use log::debug;
use std::collections::VecDeque;
use std::time::Instant;

use crate::audio::BitDepth;

/// Number of recent drip timestamps kept for the threshold detector's rate.
const RATE_WINDOW: usize = 10;

/// Drip count and rate published by a detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DripUpdate {
    pub drips: u64,
    pub drips_per_second: f64,
}

/// Turns a stream of signed sample amplitudes into discrete drips.
///
/// Detectors are fed fixed-size blocks from the capture thread and report
/// through `on_update`. When `on_update` fires is up to the strategy: the
/// threshold detector reports every drip, the adaptive detector reports at a
/// fixed sample cadence. The drip count never decreases.
pub trait DripDetector: Send {
    fn process_samples(&mut self, samples: &[i32], on_update: &mut dyn FnMut(DripUpdate));
    fn drips(&self) -> u64;
    fn drips_per_second(&self) -> f64;
}

/// Fixed threshold with a hold window.
///
/// A sample at or above the threshold starts (or extends) a hold of
/// `release_ms`. While held no drip can register; when the hold runs out
/// with a drip in progress, that drip is counted once.
pub struct ThresholdDripDetector {
    threshold: f64,
    release: u64,
    hold_samples: u64,
    in_drip: bool,
    drips: u64,
    recent: VecDeque<Instant>,
}

impl ThresholdDripDetector {
    /// Create a detector for the given stream format.
    ///
    /// # Arguments
    ///
    /// * `sample_rate` - Samples per second of the incoming stream
    /// * `bit_depth` - Sample depth, used to scale the threshold to full scale
    /// * `threshold_percent` - Trigger level as a fraction of full scale (0.0 to 1.0)
    /// * `release_ms` - Hold time after the last loud sample
    pub fn new(sample_rate: u32, bit_depth: BitDepth, threshold_percent: f64, release_ms: u32) -> Self {
        Self {
            threshold: bit_depth.threshold(threshold_percent),
            release: u64::from(sample_rate) * u64::from(release_ms) / 1000,
            hold_samples: 0,
            in_drip: false,
            drips: 0,
            recent: VecDeque::with_capacity(RATE_WINDOW + 1),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn release_samples(&self) -> u64 {
        self.release
    }

    fn drip_happened(&mut self) {
        self.recent.push_back(Instant::now());
        while self.recent.len() > RATE_WINDOW {
            self.recent.pop_front();
        }
    }
}

impl DripDetector for ThresholdDripDetector {
    fn process_samples(&mut self, samples: &[i32], on_update: &mut dyn FnMut(DripUpdate)) {
        for &value in samples {
            if f64::from(value) >= self.threshold {
                self.in_drip = true;
                self.hold_samples = self.release;
            } else if self.hold_samples > 0 {
                self.hold_samples -= 1;
            } else if self.in_drip {
                self.drips += 1;
                self.drip_happened();
                debug!("Drips: {}", self.drips);
                on_update(DripUpdate {
                    drips: self.drips,
                    drips_per_second: self.drips_per_second(),
                });
                self.in_drip = false;
                self.hold_samples = self.release;
            }
        }
    }

    fn drips(&self) -> u64 {
        self.drips
    }

    fn drips_per_second(&self) -> f64 {
        let Some(first) = self.recent.front() else {
            return 0.0;
        };
        let elapsed = first.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return f64::MAX;
        }
        self.recent.len() as f64 / elapsed
    }
}

/// Mean absolute amplitude over a capped buffer of recent samples.
///
/// The buffer is trimmed to the newest `max_samples` entries each time the
/// threshold is read, not on every insert.
struct RunningThreshold {
    samples: VecDeque<u32>,
    max_samples: usize,
}

impl RunningThreshold {
    fn new(sample_rate: u32) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back(0);
        Self {
            samples,
            max_samples: (sample_rate / 2).max(1) as usize,
        }
    }

    fn add_values(&mut self, values: &[i32]) {
        self.samples.extend(values.iter().map(|v| v.unsigned_abs()));
    }

    fn threshold(&mut self) -> f64 {
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        let sum: f64 = self.samples.iter().map(|&v| f64::from(v)).sum();
        sum / self.samples.len() as f64
    }
}

/// Adaptive threshold with debounce.
///
/// The threshold follows the running mean absolute amplitude of the last half
/// second, negated: drips show up as negative excursions. A run of at least
/// `min_sample_size` samples below the threshold is an in-drip condition, and
/// the drip is counted the first time the signal reaches half of the observed
/// peak. After that the event must stay quiet for the debounce period before
/// another drip can register.
pub struct AdaptiveDripDetector {
    sample_rate: u32,
    drips: u64,
    threshold: RunningThreshold,
    in_drip: u64,
    debounce: u64,
    min_sample_size: f64,
    debounce_time: f64,
    this_drip_recorded: bool,
    peak: f64,
    call_back_samples: u64,
    samples_since_call_back: u64,
    samples_since_drip: u64,
    drips_per_second: f64,
}

impl AdaptiveDripDetector {
    /// Create a detector that reports `calls_backs_per_second` times per
    /// second of audio, whether or not drips occur.
    pub fn new(sample_rate: u32, calls_backs_per_second: u32) -> Self {
        Self {
            sample_rate,
            drips: 0,
            threshold: RunningThreshold::new(sample_rate),
            in_drip: 0,
            debounce: 0,
            min_sample_size: f64::from(sample_rate) * 0.005,
            debounce_time: f64::from(sample_rate) * 0.08,
            this_drip_recorded: false,
            peak: 0.0,
            call_back_samples: u64::from(sample_rate / calls_backs_per_second.max(1)).max(1),
            samples_since_call_back: 0,
            samples_since_drip: 0,
            drips_per_second: 0.0,
        }
    }

    fn process_chunk(&mut self, values: &[i32], on_update: &mut dyn FnMut(DripUpdate)) {
        self.threshold.add_values(values);
        let current_threshold = -self.threshold.threshold();

        for &value in values {
            let value = f64::from(value);
            self.samples_since_drip += 1;
            if value < current_threshold {
                if self.peak > value {
                    self.peak = value;
                }
                self.in_drip += 1;
            } else {
                self.in_drip = 0;
                if self.this_drip_recorded {
                    self.debounce += 1;
                    if self.debounce as f64 > self.debounce_time {
                        self.debounce = 0;
                        self.this_drip_recorded = false;
                    }
                }
            }

            if self.in_drip as f64 >= self.min_sample_size
                && value <= self.peak * 0.5
                && !self.this_drip_recorded
            {
                self.drips += 1;
                self.update_average();
                self.peak *= 0.5;
                self.this_drip_recorded = true;
                debug!("Drips: {}", self.drips);
            }

            self.samples_since_call_back += 1;
            if self.samples_since_call_back >= self.call_back_samples {
                self.samples_since_call_back = 0;
                on_update(DripUpdate {
                    drips: self.drips,
                    drips_per_second: self.drips_per_second,
                });
            }
        }
    }

    fn update_average(&mut self) {
        let drips_per_second = f64::from(self.sample_rate) / self.samples_since_drip as f64;
        if self.drips_per_second > 0.0 {
            self.drips_per_second = self.drips_per_second * 0.5 + drips_per_second * 0.5;
        } else {
            self.drips_per_second = drips_per_second;
        }
        self.samples_since_drip = 0;
    }
}

impl DripDetector for AdaptiveDripDetector {
    fn process_samples(&mut self, samples: &[i32], on_update: &mut dyn FnMut(DripUpdate)) {
        let chunk_size = (self.sample_rate as usize).max(1);
        for chunk in samples.chunks(chunk_size) {
            self.process_chunk(chunk, on_update);
        }
    }

    fn drips(&self) -> u64 {
        self.drips
    }

    fn drips_per_second(&self) -> f64 {
        self.drips_per_second
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(detector: &mut dyn DripDetector, samples: &[i32]) -> Vec<DripUpdate> {
        let mut updates = Vec::new();
        detector.process_samples(samples, &mut |update| updates.push(update));
        updates
    }

    fn burst(quiet_before: usize, loud: usize, level: i32, quiet_after: usize) -> Vec<i32> {
        let mut samples = vec![0; quiet_before];
        samples.extend(std::iter::repeat_n(level, loud));
        samples.extend(std::iter::repeat_n(0, quiet_after));
        samples
    }

    #[test]
    fn threshold_scales_with_bit_depth() {
        let detector = ThresholdDripDetector::new(44_100, BitDepth::Int16, 0.5, 6);
        assert_eq!(detector.threshold(), 16_383.0);
        assert_eq!(detector.release_samples(), 264);
    }

    #[test]
    fn short_crossing_within_hold_counts_nothing() {
        let mut detector = ThresholdDripDetector::new(1_000, BitDepth::Int16, 0.5, 6);
        let updates = run(&mut detector, &burst(10, 3, 20_000, 6));
        assert!(updates.is_empty());
        assert_eq!(detector.drips(), 0);
        assert_eq!(detector.drips_per_second(), 0.0);
    }

    #[test]
    fn long_crossing_then_release_counts_once() {
        let mut detector = ThresholdDripDetector::new(1_000, BitDepth::Int16, 0.5, 6);
        let updates = run(&mut detector, &burst(10, 20, 20_000, 50));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].drips, 1);
        assert_eq!(detector.drips(), 1);
        assert!(detector.drips_per_second() > 0.0);
    }

    #[test]
    fn threshold_count_is_monotonic_across_blocks() {
        let mut detector = ThresholdDripDetector::new(1_000, BitDepth::Int16, 0.5, 6);
        let mut last = 0;
        for _ in 0..5 {
            run(&mut detector, &burst(5, 10, 30_000, 20));
            assert!(detector.drips() >= last);
            last = detector.drips();
        }
        assert_eq!(last, 5);
    }

    #[test]
    fn adaptive_counts_one_drip_for_a_decaying_run() {
        let mut detector = AdaptiveDripDetector::new(1_000, 15);
        let mut samples = vec![0; 200];
        samples.extend(std::iter::repeat_n(-1_000, 6));
        samples.extend([-600, -400, -200, -100]);
        samples.extend(std::iter::repeat_n(0, 200));
        run(&mut detector, &samples);

        assert_eq!(detector.drips(), 1);
        // 200 quiet samples plus the five that complete the minimum run.
        let expected = 1_000.0 / 205.0;
        assert!((detector.drips_per_second() - expected).abs() < 1e-9);
    }

    #[test]
    fn adaptive_rate_is_smoothed_half_and_half() {
        let mut detector = AdaptiveDripDetector::new(1_000, 15);
        let mut samples = burst(200, 20, -1_000, 200);
        samples.extend(burst(0, 20, -1_000, 50));
        run(&mut detector, &samples);

        assert_eq!(detector.drips(), 2);
        let first = 1_000.0 / 205.0;
        let second = 1_000.0 / 220.0;
        let expected = first * 0.5 + second * 0.5;
        assert!((detector.drips_per_second() - expected).abs() < 1e-9);
    }

    #[test]
    fn adaptive_debounce_blocks_recount_of_same_event() {
        let mut detector = AdaptiveDripDetector::new(1_000, 15);
        // Second excursion arrives before the 80-sample debounce has elapsed.
        let mut samples = burst(200, 20, -1_000, 30);
        samples.extend(burst(0, 20, -1_000, 30));
        run(&mut detector, &samples);
        assert_eq!(detector.drips(), 1);
    }

    #[test]
    fn adaptive_reports_at_fixed_cadence() {
        let mut detector = AdaptiveDripDetector::new(1_000, 15);
        let updates = run(&mut detector, &vec![0; 660]);
        assert_eq!(updates.len(), 10);
        assert!(updates.iter().all(|u| u.drips == 0));
    }
}
