//! In-memory signal source
//!
//! Backend used by tests and demos so the pipeline can run without a
//! file-format parser. Holds the whole recording channel-major in RAM.

use crate::file::{SignalFile, SignalIoError};

/// A complete recording held in memory.
#[derive(Debug, Clone)]
pub struct MemorySignalFile {
    sampling_frequency: f64,
    channels: Vec<Vec<f32>>,
    samples: u64,
}

impl MemorySignalFile {
    /// Wrap per-channel sample vectors. All channels must be the same
    /// length; there must be at least one channel.
    pub fn new(sampling_frequency: f64, channels: Vec<Vec<f32>>) -> Result<Self, SignalIoError> {
        let Some(first) = channels.first() else {
            return Err(SignalIoError::BufferCountMismatch {
                expected: 1,
                got: 0,
            });
        };
        let samples = first.len();
        if channels.iter().any(|c| c.len() != samples) {
            return Err(SignalIoError::DestinationSize {
                expected: samples,
                got: channels.iter().map(Vec::len).max().unwrap_or(0),
            });
        }
        Ok(Self {
            sampling_frequency,
            channels,
            samples: samples as u64,
        })
    }

    /// Generate a recording from a `(channel, sample_index) -> value`
    /// function.
    pub fn from_fn<F>(sampling_frequency: f64, channels: usize, samples: u64, value: F) -> Self
    where
        F: Fn(usize, u64) -> f32,
    {
        let channels = (0..channels)
            .map(|channel| (0..samples).map(|index| value(channel, index)).collect())
            .collect();
        Self {
            sampling_frequency,
            channels,
            samples,
        }
    }
}

impl SignalFile for MemorySignalFile {
    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn samples_recorded(&self) -> u64 {
        self.samples
    }

    fn read_channels(
        &self,
        buffers: &mut [&mut [f32]],
        first_sample: u64,
        last_sample: u64,
    ) -> Result<(), SignalIoError> {
        if first_sample > last_sample {
            return Err(SignalIoError::ReversedRange {
                first: first_sample as i64,
                last: last_sample as i64,
            });
        }
        if buffers.len() < self.channels.len() {
            return Err(SignalIoError::BufferCountMismatch {
                expected: self.channels.len(),
                got: buffers.len(),
            });
        }
        if last_sample >= self.samples {
            return Err(SignalIoError::OutOfBounds {
                first: first_sample,
                last: last_sample,
                recorded: self.samples,
            });
        }

        let samples = (last_sample - first_sample + 1) as usize;
        // Check every buffer before writing any, so a failure leaves the
        // destinations untouched.
        for buffer in buffers[..self.channels.len()].iter() {
            if buffer.len() != samples {
                return Err(SignalIoError::DestinationSize {
                    expected: samples,
                    got: buffer.len(),
                });
            }
        }

        let range = first_sample as usize..=last_sample as usize;
        for (channel, buffer) in self.channels.iter().zip(buffers.iter_mut()) {
            buffer.copy_from_slice(&channel[range.clone()]);
        }
        Ok(())
    }
}
