//! Two-stage signal processing pipeline
//!
//! `SignalProcessor` wires a raw stage (backend reads) in front of a
//! processed stage (filter/montage transform) and exposes the blocking
//! consumer API renderers use. The processed stage's filler pulls its
//! input by synchronously borrowing the matching raw block, so the
//! cross-stage dependency is an ordinary blocking call from one loader
//! thread into the other stage.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use signal_viewer_cache::{CacheStats, Priority};
use signal_viewer_io::{block_count, block_span, BlockIndex, SampleSpan, SignalFile};
use thiserror::Error;

use crate::compute::{BlockTransform, ComputeContext, TransformError};
use crate::stage::{BlockFiller, CacheStage, ErrorObserver, SignalBlock, StageConfig, StageError};

/// Errors raised while assembling the pipeline.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// A stage's memory budget cannot hold even one block.
    #[error("{stage} stage budget of {budget_bytes} bytes is below one block ({block_bytes} bytes)")]
    BudgetTooSmall {
        stage: &'static str,
        budget_bytes: usize,
        block_bytes: usize,
    },

    /// Blocks of zero channels or zero samples hold no data.
    #[error("empty block shape: {channel_count} channels x {block_size} samples")]
    EmptyBlockShape {
        channel_count: usize,
        block_size: u64,
    },

    /// Compute device initialization failed.
    #[error(transparent)]
    Compute(#[from] TransformError),

    /// A stage failed to start.
    #[error(transparent)]
    Stage(#[from] StageError),
}

/// Pipeline shape and memory budgets.
///
/// Budgets are in bytes of sample data per stage; each stage's slot count
/// is derived from its budget at construction time.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    /// Samples per block per channel
    pub block_size: u64,

    /// Sample memory allowed for the raw stage, in bytes
    pub raw_budget_bytes: usize,

    /// Sample memory allowed for the processed stage, in bytes
    pub processed_budget_bytes: usize,

    /// Extra leading samples read per raw block to prime the filter
    pub filter_overlap: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            block_size: 8192,
            raw_budget_bytes: 64 * 1024 * 1024,
            processed_budget_bytes: 64 * 1024 * 1024,
            filter_overlap: 0,
        }
    }
}

impl ProcessorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the samples per block per channel.
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the raw stage's sample memory budget in bytes.
    pub fn with_raw_budget_bytes(mut self, bytes: usize) -> Self {
        self.raw_budget_bytes = bytes;
        self
    }

    /// Set the processed stage's sample memory budget in bytes.
    pub fn with_processed_budget_bytes(mut self, bytes: usize) -> Self {
        self.processed_budget_bytes = bytes;
        self
    }

    /// Set the filter transient length in samples.
    pub fn with_filter_overlap(mut self, samples: u64) -> Self {
        self.filter_overlap = samples;
        self
    }
}

/// Fills raw blocks straight from the signal file backend.
struct RawFiller {
    file: Arc<dyn SignalFile>,
    config: StageConfig,
}

impl BlockFiller for RawFiller {
    fn fill(&mut self, index: BlockIndex, dst: &mut [f32]) -> Result<(), StageError> {
        let span = self.config.span_of(index);
        self.file.read_signal(dst, span.first, span.last)?;
        Ok(())
    }
}

/// Fills processed blocks by borrowing the matching raw block and running
/// the transform over it.
struct ProcessedFiller {
    raw: Arc<CacheStage>,
    transform: Box<dyn BlockTransform>,
    context: ComputeContext,
}

impl ProcessedFiller {
    fn process_into(&self, raw_block: &SignalBlock, dst: &mut [f32]) -> Result<(), StageError> {
        let completion = self
            .transform
            .process(raw_block.samples(), dst, &self.context)?;
        completion.wait();
        Ok(())
    }
}

impl BlockFiller for ProcessedFiller {
    fn fill(&mut self, index: BlockIndex, dst: &mut [f32]) -> Result<(), StageError> {
        let raw_block = self.raw.read_any_block(&BTreeSet::from([index]))?;
        let result = self.process_into(&raw_block, dst);
        // The raw block stays borrowed until the transform has finished
        // reading it.
        self.raw.release(raw_block, None);
        result
    }
}

/// The pipeline orchestrator: raw stage, processed stage, consumer API.
pub struct SignalProcessor {
    raw: Arc<CacheStage>,
    processed: CacheStage,
    config: ProcessorConfig,
    block_total: usize,
    sampling_frequency: f64,
}

impl SignalProcessor {
    /// Assemble the pipeline over `file`, running `transform` on every
    /// block before it reaches consumers.
    ///
    /// Initializes the process-wide compute context, derives each stage's
    /// slot count from its byte budget, and starts both loader threads.
    /// `observer` is invoked (from a loader thread) on any fatal pipeline
    /// failure.
    pub fn new(
        file: Arc<dyn SignalFile>,
        transform: Box<dyn BlockTransform>,
        config: ProcessorConfig,
        observer: Option<ErrorObserver>,
    ) -> Result<Self, ProcessorError> {
        let channel_count = file.channel_count();
        if channel_count == 0 || config.block_size == 0 {
            return Err(ProcessorError::EmptyBlockShape {
                channel_count,
                block_size: config.block_size,
            });
        }
        let sampling_frequency = file.sampling_frequency();
        let block_total = block_count(file.samples_recorded(), config.block_size);

        let raw_config = StageConfig {
            name: "raw",
            capacity: Self::stage_capacity(
                "raw",
                config.raw_budget_bytes,
                channel_count,
                config.block_size + config.filter_overlap,
            )?,
            channel_count,
            block_size: config.block_size,
            lead_samples: config.filter_overlap,
        };
        let processed_config = StageConfig {
            name: "processed",
            capacity: Self::stage_capacity(
                "processed",
                config.processed_budget_bytes,
                channel_count,
                config.block_size,
            )?,
            channel_count,
            block_size: config.block_size,
            lead_samples: 0,
        };

        let context = ComputeContext::initialize()?;
        let stop = Arc::new(AtomicBool::new(false));

        let raw = Arc::new(CacheStage::new(
            raw_config,
            RawFiller {
                file,
                config: raw_config,
            },
            Arc::clone(&stop),
            observer.clone(),
        )?);
        let processed = CacheStage::new(
            processed_config,
            ProcessedFiller {
                raw: Arc::clone(&raw),
                transform,
                context,
            },
            stop,
            observer,
        )?;

        log::info!(
            "pipeline ready: {} blocks of {} samples, raw capacity {}, processed capacity {}",
            block_total,
            config.block_size,
            raw_config.capacity,
            processed_config.capacity,
        );

        Ok(Self {
            raw,
            processed,
            config,
            block_total,
            sampling_frequency,
        })
    }

    fn stage_capacity(
        stage: &'static str,
        budget_bytes: usize,
        channel_count: usize,
        samples_per_channel: u64,
    ) -> Result<usize, ProcessorError> {
        let block_bytes = channel_count * samples_per_channel as usize * std::mem::size_of::<f32>();
        let capacity = budget_bytes / block_bytes;
        if capacity == 0 {
            return Err(ProcessorError::BudgetTooSmall {
                stage,
                budget_bytes,
                block_bytes,
            });
        }
        Ok(capacity)
    }

    /// Number of blocks covering the recording.
    pub fn block_count(&self) -> usize {
        self.block_total
    }

    /// Sample span of processed block `index`.
    pub fn block_span(&self, index: BlockIndex) -> SampleSpan {
        block_span(index, self.config.block_size)
    }

    /// Sampling frequency of the underlying recording.
    pub fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    /// Ask both stages to make the given blocks resident at `priority`.
    ///
    /// Returns immediately; the loader threads do the work. Typical use is
    /// prefetching blocks near the viewport at a lazier priority than the
    /// blocking reads use.
    pub fn prepare_blocks(&self, indices: &[BlockIndex], priority: Priority) {
        self.raw.enqueue(indices.iter().copied(), priority);
        self.processed.enqueue(indices.iter().copied(), priority);
    }

    /// Prefetch every block covering the inclusive sample range.
    pub fn prepare_sample_range(&self, first: u64, last: u64, priority: Priority) {
        let blocks: Vec<BlockIndex> =
            signal_viewer_io::blocks_for_range(first, last, self.config.block_size).collect();
        self.prepare_blocks(&blocks, priority);
    }

    /// Borrow any ready processed block among `candidates`, blocking until
    /// one is available.
    pub fn get_any_block(&self, candidates: &BTreeSet<BlockIndex>) -> Result<SignalBlock, StageError> {
        self.processed.read_any_block(candidates)
    }

    /// Return a borrowed block, optionally demoting its resting priority.
    pub fn release_block(&self, block: SignalBlock, new_priority: Option<Priority>) {
        self.processed.release(block, new_priority);
    }

    /// Drop all cached data in both stages. No blocks may be outstanding.
    pub fn clear(&self) {
        self.processed.clear();
        self.raw.clear();
    }

    /// Counters of the raw stage's cache.
    pub fn raw_stats(&self) -> CacheStats {
        self.raw.stats()
    }

    /// Counters of the processed stage's cache.
    pub fn processed_stats(&self) -> CacheStats {
        self.processed.stats()
    }

    /// Stop both stages and join their loader threads. Idempotent.
    ///
    /// Order matters: the stop flag is flipped and every condvar notified
    /// before any join, because the processed loader can be blocked inside
    /// the raw stage's `read_any_block`. The processed loader is joined
    /// first since it is the raw stage's only internal consumer.
    pub fn shutdown(&self) {
        self.processed.request_stop();
        self.raw.request_stop();
        self.processed.join_loader();
        self.raw.join_loader();
    }
}

impl Drop for SignalProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::IdentityTransform;
    use serial_test::serial;
    use signal_viewer_io::MemorySignalFile;

    /// channel * 1000 + sample, easy to spot-check at any offset.
    fn ramp_file(channels: usize, samples: u64) -> Arc<MemorySignalFile> {
        Arc::new(MemorySignalFile::from_fn(256.0, channels, samples, |channel, sample| {
            channel as f32 * 1000.0 + sample as f32
        }))
    }

    /// Budgets sized for exactly `slots` blocks per stage.
    fn slot_config(block_size: u64, channels: usize, slots: usize) -> ProcessorConfig {
        let block_bytes = channels * block_size as usize * 4;
        ProcessorConfig::new()
            .with_block_size(block_size)
            .with_raw_budget_bytes(block_bytes * slots)
            .with_processed_budget_bytes(block_bytes * slots)
    }

    #[test]
    #[serial(compute_context)]
    fn test_budget_below_one_block_is_rejected() {
        let file = ramp_file(2, 100);
        let config = slot_config(16, 2, 2).with_raw_budget_bytes(10);
        let result = SignalProcessor::new(file, Box::new(IdentityTransform), config, None);
        assert!(matches!(
            result,
            Err(ProcessorError::BudgetTooSmall { stage: "raw", .. })
        ));
    }

    #[test]
    fn test_empty_block_shape_is_rejected() {
        let file = ramp_file(2, 100);
        let result = SignalProcessor::new(
            Arc::clone(&file) as Arc<dyn SignalFile>,
            Box::new(IdentityTransform),
            slot_config(16, 2, 2).with_block_size(0),
            None,
        );
        assert!(matches!(
            result,
            Err(ProcessorError::EmptyBlockShape { block_size: 0, .. })
        ));

        // A backend reporting no channels is just as unusable.
        struct ChannellessFile;
        impl SignalFile for ChannellessFile {
            fn sampling_frequency(&self) -> f64 {
                100.0
            }
            fn channel_count(&self) -> usize {
                0
            }
            fn samples_recorded(&self) -> u64 {
                100
            }
            fn read_channels(
                &self,
                _buffers: &mut [&mut [f32]],
                _first_sample: u64,
                _last_sample: u64,
            ) -> Result<(), signal_viewer_io::SignalIoError> {
                Ok(())
            }
        }
        let result = SignalProcessor::new(
            Arc::new(ChannellessFile),
            Box::new(IdentityTransform),
            slot_config(16, 2, 2),
            None,
        );
        assert!(matches!(
            result,
            Err(ProcessorError::EmptyBlockShape {
                channel_count: 0,
                ..
            })
        ));
    }

    #[test]
    #[serial(compute_context)]
    fn test_block_data_matches_backend() {
        let file = ramp_file(2, 100);
        let processor = SignalProcessor::new(
            Arc::clone(&file) as Arc<dyn SignalFile>,
            Box::new(IdentityTransform),
            slot_config(16, 2, 2),
            None,
        )
        .unwrap();

        // Block 1 spans samples [15, 30].
        let block = processor.get_any_block(&BTreeSet::from([1])).unwrap();
        assert_eq!(block.index(), 1);
        assert_eq!(block.first_sample(), 15);
        assert_eq!(block.last_sample(), 30);
        let samples = block.samples();
        assert_eq!(samples.len(), 32);
        // Channel-major: channel 0 then channel 1.
        assert_eq!(samples[0], 15.0);
        assert_eq!(samples[15], 30.0);
        assert_eq!(samples[16], 1015.0);
        assert_eq!(samples[31], 1030.0);

        processor.release_block(block, None);
        processor.shutdown();
    }

    #[test]
    #[serial(compute_context)]
    fn test_final_block_is_zero_padded() {
        // 100 samples at block size 16 cover 7 blocks; block 6 spans
        // [95, 110] and the recording ends at sample 99.
        let file = ramp_file(1, 100);
        let processor = SignalProcessor::new(
            file,
            Box::new(IdentityTransform),
            slot_config(16, 1, 2),
            None,
        )
        .unwrap();
        assert_eq!(processor.block_count(), 7);

        let block = processor.get_any_block(&BTreeSet::from([6])).unwrap();
        let samples = block.samples();
        assert_eq!(samples[0], 95.0);
        assert_eq!(samples[4], 99.0);
        for &value in &samples[5..] {
            assert_eq!(value, 0.0);
        }
        processor.release_block(block, None);
        processor.shutdown();
    }

    #[test]
    #[serial(compute_context)]
    fn test_prepared_blocks_are_served_from_cache() {
        let file = ramp_file(1, 200);
        let processor = SignalProcessor::new(
            file,
            Box::new(IdentityTransform),
            slot_config(16, 1, 4),
            None,
        )
        .unwrap();

        processor.prepare_blocks(&[0, 1, 2], 3);
        // Blocking reads pick up the prefetched blocks as they land.
        for index in 0..3usize {
            let block = processor.get_any_block(&BTreeSet::from([index])).unwrap();
            assert_eq!(block.index(), index);
            processor.release_block(block, None);
        }
        processor.shutdown();
    }

    #[test]
    #[serial(compute_context)]
    fn test_prepare_sample_range_covers_boundary() {
        let file = ramp_file(1, 200);
        let processor = SignalProcessor::new(
            file,
            Box::new(IdentityTransform),
            slot_config(16, 1, 4),
            None,
        )
        .unwrap();

        // [10, 40] touches blocks 0, 1 and 2 at block size 16.
        processor.prepare_sample_range(10, 40, 5);
        let block = processor.get_any_block(&BTreeSet::from([2])).unwrap();
        assert_eq!(block.index(), 2);
        processor.release_block(block, None);
        processor.shutdown();
    }

    #[test]
    #[serial(compute_context)]
    fn test_filter_overlap_widens_raw_reads_only() {
        // A transform that consumes the overlap sees the widened input.
        struct TrimLead(usize);
        impl BlockTransform for TrimLead {
            fn process(
                &self,
                input: &[f32],
                output: &mut [f32],
                _context: &ComputeContext,
            ) -> Result<crate::compute::Completion, TransformError> {
                let completion = crate::compute::Completion::pending();
                output.copy_from_slice(&input[self.0..]);
                completion.signal();
                Ok(completion)
            }
        }

        let file = ramp_file(1, 100);
        let processor = SignalProcessor::new(
            file,
            Box::new(TrimLead(4)),
            slot_config(16, 1, 4).with_filter_overlap(4),
            None,
        )
        .unwrap();

        // Raw block 1 spans [11, 30] with the lead; trimming the lead
        // leaves the processed span [15, 30].
        let block = processor.get_any_block(&BTreeSet::from([1])).unwrap();
        assert_eq!(block.samples()[0], 15.0);
        assert_eq!(block.samples()[15], 30.0);
        processor.release_block(block, None);
        processor.shutdown();
    }

    #[test]
    #[serial(compute_context)]
    fn test_shutdown_with_pending_requests_terminates() {
        let file = ramp_file(2, 100_000);
        let processor = SignalProcessor::new(
            file,
            Box::new(IdentityTransform),
            slot_config(64, 2, 2),
            None,
        )
        .unwrap();

        let indices: Vec<BlockIndex> = (0..500).collect();
        processor.prepare_blocks(&indices, 1);
        processor.shutdown();
    }

    #[test]
    #[serial(compute_context)]
    fn test_second_pipeline_after_drop() {
        let file = ramp_file(1, 100);
        let config = slot_config(16, 1, 2);
        let first = SignalProcessor::new(
            Arc::clone(&file) as Arc<dyn SignalFile>,
            Box::new(IdentityTransform),
            config,
            None,
        )
        .unwrap();
        drop(first);

        // The compute context is freed on drop, so a fresh pipeline can
        // claim it.
        let second =
            SignalProcessor::new(file, Box::new(IdentityTransform), config, None).unwrap();
        second.shutdown();
    }
}
