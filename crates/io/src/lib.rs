//! Signal Viewer I/O Library
//!
//! Backend-facing boundary of the block pipeline: the [`SignalFile`] trait
//! that file-format backends implement, the zero-padding
//! [`read_signal`](SignalFile::read_signal) wrapper the pipeline reads
//! through, an in-memory backend for tests, and the block/sample-range
//! arithmetic shared by every pipeline stage.

pub mod block;
pub mod file;
pub mod memory;

pub use block::{
    block_containing, block_count, block_span, blocks_for_range, BlockIndex, SampleSpan,
};
pub use file::{SignalFile, SignalIoError};
pub use memory::MemorySignalFile;
