//! Cache pipeline stage with a background loader thread
//!
//! One stage owns a fixed arena of block buffers, the priority cache logic
//! that binds block indices to them, and a single long-lived loader thread
//! that services pending requests. What "filling a block" means is
//! supplied by a [`BlockFiller`]: the raw stage reads samples from the
//! file backend, the processed stage runs the filter/montage transform.
//! Both stages are this one type with different fillers.
//!
//! Locking model: one mutex guards the cache metadata and the buffer
//! arena; two condition variables signal "work available" (toward the
//! loader) and "result available" (toward consumers). Buffer contents are
//! never touched under the mutex: a claimed or borrowed slot's buffer is
//! moved out of the arena, so exactly one thread can ever write it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use signal_viewer_cache::{CacheError, CacheStats, Priority, PriorityCache, PRIORITY_URGENT};
use signal_viewer_io::{block_span, BlockIndex, SampleSpan, SignalIoError};
use thiserror::Error;

use crate::compute::TransformError;

/// Errors surfaced by a pipeline stage.
///
/// Backpressure never appears here; it is handled inside the blocking
/// calls. These errors mean cancellation or a genuine failure.
#[derive(Debug, Error)]
pub enum StageError {
    /// The pipeline stop flag was set while waiting.
    #[error("pipeline is shutting down")]
    Cancelled,

    /// The stage's loader failed and exited; no further blocks will be
    /// produced by this pipeline.
    #[error("pipeline stage failed; no further blocks will be produced")]
    Broken,

    /// Cache construction failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The file backend failed.
    #[error(transparent)]
    Io(#[from] SignalIoError),

    /// The compute stage failed.
    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Callback the orchestrator installs to observe fatal loader failures.
pub type ErrorObserver = Arc<dyn Fn(&StageError) + Send + Sync>;

/// Strategy that populates one block buffer.
///
/// Runs on the stage's loader thread with no locks held; it is the only
/// writer of `dst` while the fill is in flight. Returning
/// [`StageError::Cancelled`] makes the loader exit quietly (used when a
/// blocking dependency is torn down); any other error is fatal to the
/// pipeline.
pub trait BlockFiller: Send + 'static {
    /// Fill `dst` with the contents of block `index`.
    fn fill(&mut self, index: BlockIndex, dst: &mut [f32]) -> Result<(), StageError>;
}

/// Shape of one pipeline stage.
#[derive(Debug, Clone, Copy)]
pub struct StageConfig {
    /// Thread and log name of the stage
    pub name: &'static str,

    /// Number of block slots
    pub capacity: usize,

    /// Channels per block
    pub channel_count: usize,

    /// Samples per block per channel (before overlap)
    pub block_size: u64,

    /// Extra leading samples per block, read to prime a filter's transient
    pub lead_samples: u64,
}

impl StageConfig {
    /// Values in one block buffer: channels x (lead + block samples).
    pub fn buffer_len(&self) -> usize {
        self.channel_count * (self.block_size + self.lead_samples) as usize
    }

    /// Sample span held in block `index`'s buffer, including the lead.
    pub fn span_of(&self, index: BlockIndex) -> SampleSpan {
        let mut span = block_span(index, self.block_size);
        span.first -= self.lead_samples as i64;
        span
    }
}

/// A borrowed, ready block handed to a consumer.
///
/// The handle owns the slot's buffer while borrowed; returning it with
/// [`CacheStage::release`] is what makes the slot evictable again, so
/// every obtained block must be released exactly once.
#[derive(Debug)]
pub struct SignalBlock {
    index: BlockIndex,
    first_sample: i64,
    last_sample: i64,
    samples: Vec<f32>,
    slot: usize,
}

impl SignalBlock {
    /// Block index within the recording.
    pub fn index(&self) -> BlockIndex {
        self.index
    }

    /// First sample position held in the buffer (inclusive; can be
    /// negative when a lead pads past the start of the recording).
    pub fn first_sample(&self) -> i64 {
        self.first_sample
    }

    /// Last sample position held in the buffer (inclusive).
    pub fn last_sample(&self) -> i64 {
        self.last_sample
    }

    /// Channel-major sample data.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

struct StageState {
    cache: PriorityCache<BlockIndex>,
    buffers: Vec<Option<Vec<f32>>>,

    /// Set when the loader exits on a fatal error
    broken: bool,
}

struct StageShared {
    state: Mutex<StageState>,

    /// Signals the loader that requests or slots may be available
    work_cv: Condvar,

    /// Signals consumers that a block may have become ready
    ready_cv: Condvar,

    /// Pipeline-wide stop flag, shared across stages
    stop: Arc<AtomicBool>,
}

/// One pipeline stage: priority cache plus loader thread.
pub struct CacheStage {
    shared: Arc<StageShared>,
    loader: Mutex<Option<JoinHandle<()>>>,
    config: StageConfig,
}

impl CacheStage {
    /// Create the stage, allocate its buffer arena, and start its loader
    /// thread.
    pub fn new<F>(
        config: StageConfig,
        filler: F,
        stop: Arc<AtomicBool>,
        observer: Option<ErrorObserver>,
    ) -> Result<Self, StageError>
    where
        F: BlockFiller,
    {
        let cache = PriorityCache::new(config.capacity)?;
        let buffers = vec![Some(vec![0.0f32; config.buffer_len()]); config.capacity];
        let shared = Arc::new(StageShared {
            state: Mutex::new(StageState {
                cache,
                buffers,
                broken: false,
            }),
            work_cv: Condvar::new(),
            ready_cv: Condvar::new(),
            stop,
        });

        let loader_shared = Arc::clone(&shared);
        let name = config.name;
        let handle = thread::Builder::new()
            .name(format!("{name}-loader"))
            .spawn(move || Self::run_loader(loader_shared, filler, observer, name))
            .map_err(SignalIoError::Io)?;

        Ok(Self {
            shared,
            loader: Mutex::new(Some(handle)),
            config,
        })
    }

    /// Stage shape.
    pub fn config(&self) -> StageConfig {
        self.config
    }

    /// Snapshot of the stage's cache counters.
    pub fn stats(&self) -> CacheStats {
        self.shared.state.lock().unwrap().cache.stats()
    }

    /// Request the given blocks at `priority` and wake the loader.
    pub fn enqueue<I>(&self, indices: I, priority: Priority)
    where
        I: IntoIterator<Item = BlockIndex>,
    {
        let mut state = self.shared.state.lock().unwrap();
        state.cache.enqueue(indices, priority);
        drop(state);
        self.shared.work_cv.notify_all();
    }

    /// Borrow any ready block among `candidates`, blocking until one is
    /// available.
    ///
    /// Candidates that are not resident are enqueued at the most urgent
    /// priority as a side effect, so the loader services them ahead of
    /// prefetch work. Returns [`StageError::Cancelled`] once the pipeline
    /// stop flag is set and [`StageError::Broken`] after a fatal loader
    /// failure.
    pub fn read_any_block(
        &self,
        candidates: &BTreeSet<BlockIndex>,
    ) -> Result<SignalBlock, StageError> {
        let mut state = self.shared.state.lock().unwrap();
        let mut first_attempt = true;
        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                return Err(StageError::Cancelled);
            }
            if state.broken {
                return Err(StageError::Broken);
            }
            // The first miss counts and queues the candidates; later
            // polls of the same blocking read only check residency.
            let found = if first_attempt {
                first_attempt = false;
                state.cache.read_any(candidates, PRIORITY_URGENT)
            } else {
                state.cache.try_read_any(candidates)
            };
            if let Some((slot, index)) = found {
                // A ready slot always has its buffer home.
                let Some(samples) = state.buffers[slot].take() else {
                    state.cache.release(&index, None);
                    continue;
                };
                let span = self.config.span_of(index);
                return Ok(SignalBlock {
                    index,
                    first_sample: span.first,
                    last_sample: span.last,
                    samples,
                    slot,
                });
            }
            // Not ready yet: the candidates are queued urgently; keep
            // the loader awake and wait for a publish.
            self.shared.work_cv.notify_all();
            state = self.shared.ready_cv.wait(state).unwrap();
        }
    }

    /// Return a borrowed block, optionally demoting its resting priority.
    ///
    /// Wakes both the loader (a freed slot may admit a pending fill) and
    /// consumers (a released block may satisfy a pending read).
    pub fn release(&self, block: SignalBlock, new_priority: Option<Priority>) {
        let mut state = self.shared.state.lock().unwrap();
        state.buffers[block.slot] = Some(block.samples);
        state.cache.release(&block.index, new_priority);
        drop(state);
        self.shared.work_cv.notify_all();
        self.shared.ready_cv.notify_all();
    }

    /// Drop every binding and pending request, keeping the buffer arena.
    ///
    /// For use when the upstream data changed wholesale (switching files);
    /// no blocks may be outstanding when this is called.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.cache.clear();
    }

    /// Set the shared stop flag and wake every waiter on this stage.
    pub(crate) fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        // Serialize with the wait loops: a thread that checked the flag
        // under the state lock either sees the store or is parked in a
        // wait by the time this lock is granted, so the notifications
        // below cannot be lost.
        drop(self.shared.state.lock().unwrap());
        self.shared.work_cv.notify_all();
        self.shared.ready_cv.notify_all();
    }

    /// Wait for the loader thread to exit.
    pub(crate) fn join_loader(&self) {
        let handle = self.loader.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("{}: loader thread panicked", self.config.name);
            }
        }
    }

    /// Stop the stage and join its loader thread. Idempotent.
    ///
    /// The stop flag is shared across the pipeline, so stopping one stage
    /// stops them all; orderly multi-stage teardown goes through the
    /// orchestrator, which stops every stage before joining any.
    pub fn shutdown(&self) {
        self.request_stop();
        self.join_loader();
    }

    fn run_loader<F>(
        shared: Arc<StageShared>,
        mut filler: F,
        observer: Option<ErrorObserver>,
        name: &'static str,
    ) where
        F: BlockFiller,
    {
        log::debug!("{name}: loader thread started");
        loop {
            // Wait for an admissible request and claim its slot.
            let (slot, index, mut buffer) = {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if shared.stop.load(Ordering::Acquire) {
                        log::debug!("{name}: loader thread stopping");
                        return;
                    }
                    if let Some((slot, index)) = state.cache.fill() {
                        // fill never claims a borrowed slot, so its
                        // buffer is home.
                        let Some(buffer) = state.buffers[slot].take() else {
                            state.cache.abort_fill(&index);
                            continue;
                        };
                        break (slot, index, buffer);
                    }
                    if state.cache.pending_len() > 0 {
                        log::trace!(
                            "{name}: fill refused, {} requests waiting",
                            state.cache.pending_len()
                        );
                    }
                    state = shared.work_cv.wait(state).unwrap();
                }
            };

            // The actual blocking work, with no lock held.
            let result = filler.fill(index, &mut buffer);

            let mut state = shared.state.lock().unwrap();
            state.buffers[slot] = Some(buffer);
            match result {
                Ok(()) => {
                    state.cache.release(&index, None);
                    drop(state);
                    shared.ready_cv.notify_all();
                }
                Err(StageError::Cancelled) => {
                    state.cache.abort_fill(&index);
                    drop(state);
                    shared.ready_cv.notify_all();
                    log::debug!("{name}: loader thread cancelled mid-fill");
                    return;
                }
                Err(error) => {
                    // Partial data must never be published as ready.
                    state.cache.abort_fill(&index);
                    state.broken = true;
                    drop(state);
                    log::error!("{name}: fill of block {index} failed: {error}");
                    // Waiters wake only after the observer has seen the
                    // failure.
                    if let Some(observer) = &observer {
                        observer(&error);
                    }
                    shared.ready_cv.notify_all();
                    return;
                }
            }
        }
    }
}

impl Drop for CacheStage {
    fn drop(&mut self) {
        self.shutdown();
    }
}
