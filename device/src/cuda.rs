//! CUDA driver backend.
//!
//! Memory is managed through the raw driver calls rather than `CudaSlice` so containers can own
//! untyped allocations and free them explicitly.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaStream, result, sys};
use snafu::{OptionExt, ResultExt};

use crate::allocator::{Allocator, DevicePtr, MemorySpace};
use crate::error::{BackendError, DriverSnafu, ForeignStreamSnafu, OutOfMemorySnafu};
use crate::stream::{Stream, StreamHandle};

#[derive(Debug)]
pub struct CudaAllocator {
    context: Arc<CudaContext>,
    device_id: usize,
    default_stream: Arc<CudaStream>,
}

impl CudaAllocator {
    pub fn new(device_id: usize) -> Result<Self, BackendError> {
        let context = CudaContext::new(device_id).context(DriverSnafu)?;
        let default_stream = context.default_stream();
        tracing::debug!(device_id, "initialized CUDA context");
        Ok(Self { context, device_id, default_stream })
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    fn bind(&self) -> Result<(), BackendError> {
        self.context.bind_to_thread().context(DriverSnafu)
    }

    fn cu_stream(&self, stream: &Stream) -> Result<sys::CUstream, BackendError> {
        match &stream.handle {
            StreamHandle::Cuda(cuda) if Arc::ptr_eq(cuda.context(), &self.context) => Ok(cuda.cu_stream()),
            StreamHandle::Cuda(_) => ForeignStreamSnafu { expected: "CUDA", actual: "CUDA (other context)" }.fail(),
            StreamHandle::Emulated(_) => ForeignStreamSnafu { expected: "CUDA", actual: stream.backend() }.fail(),
        }
    }
}

impl Allocator for CudaAllocator {
    fn alloc_device(&self, bytes: usize) -> Result<DevicePtr, BackendError> {
        self.bind()?;
        // SAFETY: the context is bound to this thread.
        let ptr = unsafe { result::malloc_sync(bytes) }.context(DriverSnafu)?;
        Ok(DevicePtr::new(ptr))
    }

    unsafe fn free_device(&self, ptr: DevicePtr) -> Result<(), BackendError> {
        self.bind()?;
        // SAFETY: forwarded from the caller; `free_sync` waits for pending work touching `ptr`.
        unsafe { result::free_sync(ptr.addr()) }.context(DriverSnafu)
    }

    fn alloc_pinned(&self, bytes: usize) -> Result<NonNull<u8>, BackendError> {
        self.bind()?;
        // SAFETY: the context is bound to this thread.
        let ptr = unsafe { result::malloc_host(bytes, 0) }.context(DriverSnafu)?;
        NonNull::new(ptr.cast::<u8>()).context(OutOfMemorySnafu {
            space: MemorySpace::PinnedHost,
            requested: bytes,
            available: 0usize,
        })
    }

    unsafe fn free_pinned(&self, ptr: NonNull<u8>) -> Result<(), BackendError> {
        self.bind()?;
        // SAFETY: forwarded from the caller.
        unsafe { result::free_host(ptr.as_ptr().cast::<c_void>()) }.context(DriverSnafu)
    }

    unsafe fn copy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: &Stream,
    ) -> Result<(), BackendError> {
        let stream = self.cu_stream(stream)?;
        self.bind()?;
        // SAFETY: the caller keeps `src` readable for `bytes` until the copy completes.
        unsafe {
            let src = std::slice::from_raw_parts(src, bytes);
            result::memcpy_htod_async(dst.addr(), src, stream)
        }
        .context(DriverSnafu)
    }

    unsafe fn copy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: &Stream,
    ) -> Result<(), BackendError> {
        let stream = self.cu_stream(stream)?;
        self.bind()?;
        // SAFETY: the caller keeps `dst` writable and untouched until the copy completes.
        unsafe {
            let dst = std::slice::from_raw_parts_mut(dst, bytes);
            result::memcpy_dtoh_async(dst, src.addr(), stream)
        }
        .context(DriverSnafu)
    }

    unsafe fn copy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: &Stream,
    ) -> Result<(), BackendError> {
        let stream = self.cu_stream(stream)?;
        self.bind()?;
        // SAFETY: forwarded from the caller.
        unsafe { result::memcpy_dtod_async(dst.addr(), src.addr(), bytes, stream) }.context(DriverSnafu)
    }

    unsafe fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: &Stream,
    ) -> Result<(), BackendError> {
        let stream = self.cu_stream(stream)?;
        self.bind()?;
        // SAFETY: forwarded from the caller.
        unsafe { result::memset_d8_async(dst.addr(), value, bytes, stream) }.context(DriverSnafu)
    }

    fn create_stream(&self) -> Result<Stream, BackendError> {
        let stream = self.context.new_stream().context(DriverSnafu)?;
        Ok(Stream::from_cuda(stream))
    }

    fn default_stream(&self) -> Stream {
        Stream::from_cuda(Arc::clone(&self.default_stream))
    }

    fn synchronize(&self) -> Result<(), BackendError> {
        self.context.synchronize().context(DriverSnafu)
    }

    fn name(&self) -> &str {
        "CUDA"
    }
}
