//! Block and sample-range arithmetic
//!
//! A block is a fixed-length run of samples across all channels, the unit
//! of caching and rendering. Block 0 spans samples `[0, B-1]`; every later
//! block `i` spans `[i*B - 1, (i+1)*B - 2]`, overlapping its predecessor by
//! one sample. Downstream rendering relies on that overlap for continuity
//! of derivative-like displayed signals, so the asymmetry is exact and
//! load-bearing.

use std::ops::RangeInclusive;

/// Index of a block within a recording.
pub type BlockIndex = usize;

/// Inclusive sample span of one block.
///
/// Positions are signed because callers extend spans leftward to prime
/// filters, which can reach before the start of the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpan {
    /// First sample position (inclusive)
    pub first: i64,

    /// Last sample position (inclusive)
    pub last: i64,
}

impl SampleSpan {
    /// Number of samples in the span.
    pub fn len(&self) -> usize {
        (self.last - self.first + 1).max(0) as usize
    }

    /// Whether the span contains no samples.
    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }
}

/// Sample span of block `index` for blocks of `block_size` samples.
///
/// Every block spans exactly `block_size` samples; each block past the
/// first starts one sample before its predecessor ends.
pub fn block_span(index: BlockIndex, block_size: u64) -> SampleSpan {
    let size = block_size as i64;
    if index == 0 {
        SampleSpan {
            first: 0,
            last: size - 1,
        }
    } else {
        let index = index as i64;
        SampleSpan {
            first: index * size - 1,
            last: (index + 1) * size - 2,
        }
    }
}

/// Earliest block containing `sample`.
///
/// The one-sample overlap means a boundary sample belongs to two blocks;
/// this helper deterministically picks the earlier one.
pub fn block_containing(sample: u64, block_size: u64) -> BlockIndex {
    if sample < block_size {
        0
    } else {
        ((sample + 2).div_ceil(block_size) - 1) as BlockIndex
    }
}

/// The contiguous run of block indices covering the inclusive sample range
/// `[first, last]`.
pub fn blocks_for_range(first: u64, last: u64, block_size: u64) -> RangeInclusive<BlockIndex> {
    block_containing(first, block_size)..=block_containing(last.max(first), block_size)
}

/// Number of blocks needed to cover a recording of `samples` samples.
pub fn block_count(samples: u64, block_size: u64) -> usize {
    if samples == 0 {
        0
    } else {
        block_containing(samples - 1, block_size) + 1
    }
}
