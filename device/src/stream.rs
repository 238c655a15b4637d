//! Execution stream handles.
//!
//! A [`Stream`] is an ordered queue of device operations. Operations enqueued on the same stream
//! run in submission order; nothing orders operations across streams unless the caller
//! synchronizes explicitly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "cuda")]
use cudarc::driver::CudaStream;
#[cfg(feature = "cuda")]
use snafu::ResultExt;

use crate::error::BackendError;
#[cfg(feature = "cuda")]
use crate::error::DriverSnafu;

/// Whether a transfer returns after enqueueing or after completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransferMode {
    /// Block the calling thread until the stream drained.
    #[default]
    Blocking,
    /// Only enqueue; the caller must synchronize before touching the destination.
    Async,
}

/// Cheap, cloneable handle to an execution stream.
#[derive(Clone)]
pub struct Stream {
    pub(crate) handle: StreamHandle,
}

#[derive(Clone)]
pub(crate) enum StreamHandle {
    Emulated(Arc<EmulatedStream>),
    #[cfg(feature = "cuda")]
    Cuda(Arc<CudaStream>),
}

/// Stream of the emulated backend. Work runs at enqueue time, so only bookkeeping lives here.
#[derive(Debug)]
pub(crate) struct EmulatedStream {
    id: u64,
    submitted: AtomicU64,
    synchronized: AtomicU64,
}

impl EmulatedStream {
    pub(crate) fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }
}

impl Stream {
    pub(crate) fn emulated(id: u64) -> Self {
        let stream = EmulatedStream { id, submitted: AtomicU64::new(0), synchronized: AtomicU64::new(0) };
        Self { handle: StreamHandle::Emulated(Arc::new(stream)) }
    }

    /// Wrap an existing CUDA stream.
    #[cfg(feature = "cuda")]
    pub fn from_cuda(stream: Arc<CudaStream>) -> Self {
        Self { handle: StreamHandle::Cuda(stream) }
    }

    /// Name of the backend this stream belongs to.
    pub fn backend(&self) -> &'static str {
        match &self.handle {
            StreamHandle::Emulated(_) => "emulated",
            #[cfg(feature = "cuda")]
            StreamHandle::Cuda(_) => "CUDA",
        }
    }

    /// Number of operations enqueued so far. Only tracked by the emulated backend.
    pub fn submitted(&self) -> Option<u64> {
        match &self.handle {
            StreamHandle::Emulated(stream) => Some(stream.submitted.load(Ordering::Relaxed)),
            #[cfg(feature = "cuda")]
            StreamHandle::Cuda(_) => None,
        }
    }

    /// Number of completed `synchronize` calls. Only tracked by the emulated backend.
    pub fn synchronizations(&self) -> Option<u64> {
        match &self.handle {
            StreamHandle::Emulated(stream) => Some(stream.synchronized.load(Ordering::Relaxed)),
            #[cfg(feature = "cuda")]
            StreamHandle::Cuda(_) => None,
        }
    }

    /// Block until every operation enqueued on this stream has completed.
    pub fn synchronize(&self) -> Result<(), BackendError> {
        match &self.handle {
            StreamHandle::Emulated(stream) => {
                stream.synchronized.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            StreamHandle::Cuda(stream) => stream.synchronize().context(DriverSnafu),
        }
    }

    /// Whether both handles refer to the same underlying stream.
    pub fn same_stream(&self, other: &Stream) -> bool {
        match (&self.handle, &other.handle) {
            (StreamHandle::Emulated(a), StreamHandle::Emulated(b)) => Arc::ptr_eq(a, b),
            #[cfg(feature = "cuda")]
            (StreamHandle::Cuda(a), StreamHandle::Cuda(b)) => Arc::ptr_eq(a, b),
            #[cfg(feature = "cuda")]
            _ => false,
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.handle {
            StreamHandle::Emulated(stream) => f.debug_struct("Stream").field("emulated", &stream.id).finish(),
            #[cfg(feature = "cuda")]
            StreamHandle::Cuda(stream) => f.debug_struct("Stream").field("cuda", &stream.cu_stream()).finish(),
        }
    }
}
