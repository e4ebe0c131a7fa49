//! Signal file backend interface
//!
//! Format backends (GDF, EDF, and friends) live outside this workspace;
//! the pipeline only sees this trait. Backends answer basic recording
//! metadata and fill per-channel buffers for an in-bounds sample range.
//! The provided [`read_signal`](SignalFile::read_signal) wrapper is what
//! the pipeline actually calls: it accepts any signed sample range and
//! zero-pads whatever falls outside the recording, so backends are never
//! asked to read out of bounds.

use thiserror::Error;

/// Errors for signal backend reads.
#[derive(Debug, Error)]
pub enum SignalIoError {
    /// The requested range runs backwards.
    #[error("reversed sample range: first {first} > last {last}")]
    ReversedRange { first: i64, last: i64 },

    /// Fewer channel buffers were supplied than the recording has channels.
    #[error("got {got} channel buffers for {expected} channels")]
    BufferCountMismatch { expected: usize, got: usize },

    /// A backend was asked for samples outside `[0, samples_recorded)`.
    /// Boundary padding is the caller's job, so this indicates a
    /// programming error in the calling layer.
    #[error("sample range [{first}, {last}] outside recording of {recorded} samples")]
    OutOfBounds { first: u64, last: u64, recorded: u64 },

    /// Destination buffer does not match channels x samples.
    #[error("destination holds {got} values, expected {expected}")]
    DestinationSize { expected: usize, got: usize },

    /// The underlying file read failed.
    #[error("backend read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Random-access multi-channel signal source.
///
/// Implementations must be callable from the loader threads, hence the
/// `Send + Sync` bound.
pub trait SignalFile: Send + Sync {
    /// Sampling frequency in Hz.
    fn sampling_frequency(&self) -> f64;

    /// Number of channels in the recording.
    fn channel_count(&self) -> usize;

    /// Total samples recorded per channel.
    fn samples_recorded(&self) -> u64;

    /// Fill one buffer per channel with samples `[first_sample,
    /// last_sample]` (inclusive).
    ///
    /// Fails with [`SignalIoError::ReversedRange`] if the range runs
    /// backwards, [`SignalIoError::BufferCountMismatch`] if fewer buffers
    /// than channels are supplied, [`SignalIoError::OutOfBounds`] if any
    /// requested sample lies outside the recording, and
    /// [`SignalIoError::DestinationSize`] if a buffer does not hold
    /// exactly the requested number of samples.
    fn read_channels(
        &self,
        buffers: &mut [&mut [f32]],
        first_sample: u64,
        last_sample: u64,
    ) -> Result<(), SignalIoError>;

    /// Read an arbitrary signed sample range into a channel-major buffer,
    /// zero-padding everything outside `[0, samples_recorded)`.
    ///
    /// `dst` must hold exactly `channel_count() * (last - first + 1)`
    /// values; channel `c`'s samples occupy the `c`-th chunk.
    fn read_signal(&self, dst: &mut [f32], first_sample: i64, last_sample: i64) -> Result<(), SignalIoError> {
        if first_sample > last_sample {
            return Err(SignalIoError::ReversedRange {
                first: first_sample,
                last: last_sample,
            });
        }
        let samples = (last_sample - first_sample + 1) as usize;
        let channels = self.channel_count();
        if dst.len() != channels * samples {
            return Err(SignalIoError::DestinationSize {
                expected: channels * samples,
                got: dst.len(),
            });
        }

        let recorded = self.samples_recorded() as i64;
        let inner_first = first_sample.max(0);
        let inner_last = last_sample.min(recorded - 1);
        if inner_first > inner_last {
            // Entirely outside the recording.
            dst.fill(0.0);
            return Ok(());
        }

        let lead = (inner_first - first_sample) as usize;
        let inner_len = (inner_last - inner_first + 1) as usize;

        let mut buffers: Vec<&mut [f32]> = Vec::with_capacity(channels);
        for chunk in dst.chunks_exact_mut(samples) {
            chunk[..lead].fill(0.0);
            chunk[lead + inner_len..].fill(0.0);
            buffers.push(&mut chunk[lead..lead + inner_len]);
        }
        self.read_channels(&mut buffers, inner_first as u64, inner_last as u64)
    }
}
