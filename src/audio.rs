//! Audio capture for drip detection.
//!
//! The capture side is split in two: an [`AudioInput`] that knows how to open
//! a device, and the [`SampleStream`] it returns. The z-axis opens the stream
//! on its own capture thread, so the device handle never leaves that thread
//! and is released when the thread ends, whatever the exit path.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use log::{error, info};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::error::{AudioError, ConfigError};

/// Integer sample depth of the capture stream.
///
/// Samples handed to the detectors are scaled to this depth, so a threshold
/// expressed as a fraction of full scale means the same thing at every depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Int8,
    Int16,
    Int24,
    Int32,
}

impl BitDepth {
    pub fn bits(self) -> u32 {
        match self {
            BitDepth::Int8 => 8,
            BitDepth::Int16 => 16,
            BitDepth::Int24 => 24,
            BitDepth::Int32 => 32,
        }
    }

    /// Largest magnitude a sample of this depth can take.
    pub fn full_scale(self) -> f64 {
        2f64.powi(self.bits() as i32 - 1)
    }

    /// Absolute trigger level for a fraction of full scale.
    pub fn threshold(self, percent: f64) -> f64 {
        percent * self.full_scale() - 1.0
    }

    pub fn name(self) -> &'static str {
        match self {
            BitDepth::Int8 => "8 bit",
            BitDepth::Int16 => "16 bit",
            BitDepth::Int24 => "24 bit",
            BitDepth::Int32 => "32 bit",
        }
    }
}

impl fmt::Display for BitDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BitDepth {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "8 bit" => Ok(BitDepth::Int8),
            "16 bit" => Ok(BitDepth::Int16),
            "24 bit" => Ok(BitDepth::Int24),
            "32 bit" => Ok(BitDepth::Int32),
            other => Err(ConfigError::UnsupportedBitDepth(other.to_string())),
        }
    }
}

/// Parameters for opening a mono capture stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub bit_depth: BitDepth,
    /// Nominal number of frames buffered between reads.
    pub buffer_size: usize,
}

/// An open capture stream, owned by the capture thread.
pub trait SampleStream {
    /// Number of samples that can be read without waiting.
    fn available(&self) -> usize;

    /// Move every available sample into `out`, returning how many were read.
    fn read(&mut self, out: &mut Vec<i32>) -> Result<usize, AudioError>;
}

/// Something that can open a capture stream.
///
/// Opening happens once, before capture begins; a format the device cannot
/// deliver must be reported here and never mid-stream.
pub trait AudioInput: Send {
    fn open(&mut self, format: &StreamFormat) -> Result<Box<dyn SampleStream>, AudioError>;
}

/// Default input device of the host audio system.
#[derive(Debug, Default)]
pub struct CpalInput;

impl CpalInput {
    pub fn new() -> Self {
        Self
    }
}

impl AudioInput for CpalInput {
    fn open(&mut self, format: &StreamFormat) -> Result<Box<dyn SampleStream>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        let unsupported = || AudioError::UnsupportedFormat {
            sample_rate: format.sample_rate,
            bit_depth: format.bit_depth.to_string(),
        };

        let rate = cpal::SampleRate(format.sample_rate);
        let supported = device
            .supported_input_configs()
            .map_err(|e| AudioError::StreamError(e.to_string()))?
            .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
            .min_by_key(|range| range.channels())
            .ok_or_else(unsupported)?
            .with_sample_rate(rate);

        let channels = usize::from(supported.channels().max(1));
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let capacity = (format.sample_rate as usize * 2).max(format.buffer_size);
        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(format.buffer_size)));
        let target = Target {
            buffer: Arc::clone(&buffer),
            channels,
            scale: format.bit_depth.full_scale(),
            capacity,
        };

        let stream = match sample_format {
            SampleFormat::I8 => build_stream::<i8>(&device, &config, target),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, target),
            SampleFormat::I32 => build_stream::<i32>(&device, &config, target),
            SampleFormat::U8 => build_stream::<u8>(&device, &config, target),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, target),
            SampleFormat::F32 => build_stream::<f32>(&device, &config, target),
            SampleFormat::F64 => build_stream::<f64>(&device, &config, target),
            _ => return Err(unsupported()),
        }?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        info!(
            "Audio input opened: {} Hz, {} channel(s), {:?} scaled to {}",
            format.sample_rate, channels, sample_format, format.bit_depth
        );

        Ok(Box::new(CpalStream {
            _stream: stream,
            buffer,
        }))
    }
}

/// Where the device callback deposits converted samples.
struct Target {
    buffer: Arc<Mutex<VecDeque<i32>>>,
    channels: usize,
    scale: f64,
    capacity: usize,
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    target: Target,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let Target {
        buffer,
        channels,
        scale,
        capacity,
    } = target;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
                // First channel only; the drip microphone is mono.
                for frame in data.chunks(channels) {
                    let sample = f64::from(frame[0].to_sample::<f32>());
                    buffer.push_back((sample * scale).clamp(-scale, scale - 1.0) as i32);
                }
                while buffer.len() > capacity {
                    buffer.pop_front();
                }
            },
            |err| error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Open cpal stream. Dropping it stops capture and releases the device.
struct CpalStream {
    _stream: cpal::Stream,
    buffer: Arc<Mutex<VecDeque<i32>>>,
}

impl SampleStream for CpalStream {
    fn available(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn read(&mut self, out: &mut Vec<i32>) -> Result<usize, AudioError> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let count = buffer.len();
        out.extend(buffer.drain(..));
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_bit_depths() {
        assert_eq!("16 bit".parse::<BitDepth>().unwrap(), BitDepth::Int16);
        assert_eq!(" 24 bit ".parse::<BitDepth>().unwrap(), BitDepth::Int24);
        assert!(matches!(
            "12 bit".parse::<BitDepth>(),
            Err(ConfigError::UnsupportedBitDepth(_))
        ));
    }

    #[test]
    fn threshold_is_fraction_of_full_scale() {
        assert_eq!(BitDepth::Int8.threshold(0.5), 63.0);
        assert_eq!(BitDepth::Int16.full_scale(), 32_768.0);
        assert_eq!(BitDepth::Int24.threshold(1.0), 8_388_607.0);
    }
}
