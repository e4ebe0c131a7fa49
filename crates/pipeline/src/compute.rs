//! Opaque filter/montage compute interface
//!
//! The processed pipeline stage hands each raw block to a
//! [`BlockTransform`]. The transform may complete synchronously or enqueue
//! work on a device queue; either way it returns a [`Completion`] the
//! loader thread waits on before publishing the slot as ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

/// Errors from the compute side of the pipeline.
#[derive(Debug, Error)]
pub enum TransformError {
    /// A second [`ComputeContext`] was created while one was live.
    #[error("compute context is already initialized")]
    AlreadyInitialized,

    /// Input and output block shapes do not match the transform.
    #[error("transform shape mismatch: input {input} values, output {output}")]
    ShapeMismatch { input: usize, output: usize },

    /// The compute device/driver failed.
    #[error("transform failed: {0}")]
    Device(String),
}

/// Process-wide one-time compute-library state.
///
/// Filter/montage backends typically wrap libraries with one-time global
/// setup (FFT plans, device contexts). That lifecycle is modeled
/// explicitly: the orchestrator creates the context before any stage runs
/// and drops it after the last loader thread has joined. At most one
/// context is live per process; a second `initialize` fails until the
/// first is dropped.
#[derive(Debug)]
pub struct ComputeContext(());

static CONTEXT_LIVE: AtomicBool = AtomicBool::new(false);

impl ComputeContext {
    /// Claim the process-wide compute context.
    pub fn initialize() -> Result<Self, TransformError> {
        if CONTEXT_LIVE.swap(true, Ordering::AcqRel) {
            return Err(TransformError::AlreadyInitialized);
        }
        Ok(Self(()))
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        CONTEXT_LIVE.store(false, Ordering::Release);
    }
}

/// Observable completion of a possibly asynchronous transform.
///
/// Cloned handles share one flag: the producer calls
/// [`signal`](Completion::signal) from wherever the work finishes (a device
/// callback, another thread), and the loader blocks in
/// [`wait`](Completion::wait).
#[derive(Debug, Clone)]
pub struct Completion {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Completion {
    /// A completion that has not fired yet.
    pub fn pending() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// A completion that is already done, for synchronous transforms.
    pub fn ready() -> Self {
        Self {
            inner: Arc::new((Mutex::new(true), Condvar::new())),
        }
    }

    /// Mark the work done and wake every waiter.
    pub fn signal(&self) {
        let (done, cv) = &*self.inner;
        *done.lock().unwrap() = true;
        cv.notify_all();
    }

    /// Block until [`signal`](Completion::signal) has been called.
    pub fn wait(&self) {
        let (done, cv) = &*self.inner;
        let mut done = done.lock().unwrap();
        while !*done {
            done = cv.wait(done).unwrap();
        }
    }
}

/// Opaque filter/montage transform over one block.
///
/// `input` is the raw block in channel-major order, including any leading
/// overlap samples read to prime the filter; `output` receives the
/// processed block (channel-major, exactly the block's temporal extent).
/// Implementations may enqueue asynchronous work and signal the returned
/// completion later.
pub trait BlockTransform: Send + Sync {
    /// Start processing `input` into `output`.
    fn process(
        &self,
        input: &[f32],
        output: &mut [f32],
        context: &ComputeContext,
    ) -> Result<Completion, TransformError>;
}

/// Pass-through transform for untransformed viewing and tests. Requires
/// equally shaped input and output (no overlap priming).
#[derive(Debug, Default)]
pub struct IdentityTransform;

impl BlockTransform for IdentityTransform {
    fn process(
        &self,
        input: &[f32],
        output: &mut [f32],
        _context: &ComputeContext,
    ) -> Result<Completion, TransformError> {
        if input.len() != output.len() {
            return Err(TransformError::ShapeMismatch {
                input: input.len(),
                output: output.len(),
            });
        }
        output.copy_from_slice(input);
        Ok(Completion::ready())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::thread;
    use std::time::Duration;

    #[test]
    #[serial(compute_context)]
    fn test_context_is_exclusive() {
        let context = ComputeContext::initialize().unwrap();
        assert!(matches!(
            ComputeContext::initialize(),
            Err(TransformError::AlreadyInitialized)
        ));
        drop(context);
        // Reclaimable after teardown.
        let context = ComputeContext::initialize().unwrap();
        drop(context);
    }

    #[test]
    fn test_completion_signalled_from_another_thread() {
        let completion = Completion::pending();
        let producer = completion.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.signal();
        });
        completion.wait();
        handle.join().unwrap();
    }

    #[test]
    fn test_ready_completion_does_not_block() {
        Completion::ready().wait();
    }

    #[test]
    #[serial(compute_context)]
    fn test_identity_transform_copies() {
        let context = ComputeContext::initialize().unwrap();
        let input = [1.0f32, 2.0, 3.0];
        let mut output = [0.0f32; 3];
        let completion = IdentityTransform.process(&input, &mut output, &context).unwrap();
        completion.wait();
        assert_eq!(output, input);
        drop(context);
    }

    #[test]
    #[serial(compute_context)]
    fn test_identity_transform_rejects_shape_mismatch() {
        let context = ComputeContext::initialize().unwrap();
        let input = [1.0f32; 4];
        let mut output = [0.0f32; 3];
        assert!(matches!(
            IdentityTransform.process(&input, &mut output, &context),
            Err(TransformError::ShapeMismatch { input: 4, output: 3 })
        ));
        drop(context);
    }
}
