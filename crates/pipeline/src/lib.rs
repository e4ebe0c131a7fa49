//! Threaded block pipeline for signal viewing
//!
//! Couples the priority cache logic from `signal-viewer-cache` with the
//! backend contract from `signal-viewer-io` into a two-stage pipeline:
//! a raw stage that reads sample blocks from the recording and a
//! processed stage that runs a filter/montage transform over them. Each
//! stage owns one background loader thread; consumers block on
//! [`SignalProcessor::get_any_block`] and get whichever requested block
//! is ready first.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//! use signal_viewer_io::MemorySignalFile;
//! use signal_viewer_pipeline::{IdentityTransform, ProcessorConfig, SignalProcessor};
//!
//! let file = Arc::new(MemorySignalFile::from_fn(256.0, 2, 100_000, |channel, sample| {
//!     (channel + 1) as f32 * (sample as f32 * 0.01).sin()
//! }));
//! let config = ProcessorConfig::new()
//!     .with_block_size(1024)
//!     .with_raw_budget_bytes(1 << 20)
//!     .with_processed_budget_bytes(1 << 20);
//! let processor = SignalProcessor::new(file, Box::new(IdentityTransform), config, None)?;
//!
//! processor.prepare_blocks(&[1, 2, 3], 10);
//! let block = processor.get_any_block(&BTreeSet::from([0]))?;
//! assert_eq!(block.first_sample(), 0);
//! processor.release_block(block, None);
//! processor.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod compute;
pub mod processor;
pub mod stage;

pub use compute::{BlockTransform, Completion, ComputeContext, IdentityTransform, TransformError};
pub use processor::{ProcessorConfig, ProcessorError, SignalProcessor};
pub use stage::{
    BlockFiller, CacheStage, ErrorObserver, SignalBlock, StageConfig, StageError,
};

// Re-exported so pipeline consumers can speak priorities without a direct
// cache crate dependency.
pub use signal_viewer_cache::{Priority, PRIORITY_IDLE, PRIORITY_URGENT};
