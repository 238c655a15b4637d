//! Owning handles over single backend allocations.
//!
//! Each handle frees its memory exactly once, in `Drop`. Free failures cannot propagate from
//! `Drop` and are logged instead.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocator::{Allocator, DevicePtr};
use crate::error::BackendError;

/// Exclusively owned device memory.
#[derive(Debug)]
pub struct DeviceAllocation {
    ptr: DevicePtr,
    bytes: usize,
    allocator: Arc<dyn Allocator>,
}

impl DeviceAllocation {
    pub fn new(allocator: &Arc<dyn Allocator>, bytes: usize) -> Result<Self, BackendError> {
        let ptr = allocator.alloc_device(bytes)?;
        Ok(Self { ptr, bytes, allocator: Arc::clone(allocator) })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `alloc_device` on this allocator and is only freed here.
        if let Err(error) = unsafe { self.allocator.free_device(self.ptr) } {
            tracing::error!(ptr = %self.ptr, bytes = self.bytes, %error, "failed to free device allocation");
        }
    }
}

/// Exclusively owned page-locked host memory.
#[derive(Debug)]
pub struct PinnedAllocation {
    ptr: NonNull<u8>,
    bytes: usize,
    allocator: Arc<dyn Allocator>,
}

// SAFETY: the allocation is plain host memory owned by this handle alone; access goes through
// `&self`/`&mut self` of the owning container.
unsafe impl Send for PinnedAllocation {}
unsafe impl Sync for PinnedAllocation {}

impl PinnedAllocation {
    pub fn new(allocator: &Arc<dyn Allocator>, bytes: usize) -> Result<Self, BackendError> {
        let ptr = allocator.alloc_pinned(bytes)?;
        Ok(Self { ptr, bytes, allocator: Arc::clone(allocator) })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for PinnedAllocation {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `alloc_pinned` on this allocator and is only freed here.
        if let Err(error) = unsafe { self.allocator.free_pinned(self.ptr) } {
            tracing::error!(ptr = ?self.ptr, bytes = self.bytes, %error, "failed to free pinned allocation");
        }
    }
}

/// A device allocation and a pinned host allocation of equal size that live and die together.
///
/// Construction allocates both or neither; dropping releases both.
#[derive(Debug)]
pub struct MirroredAllocation {
    host: PinnedAllocation,
    device: DeviceAllocation,
}

impl MirroredAllocation {
    pub fn new(allocator: &Arc<dyn Allocator>, bytes: usize) -> Result<Self, BackendError> {
        let host = PinnedAllocation::new(allocator, bytes)?;
        // On failure `host` is dropped here, releasing the first half.
        let device = DeviceAllocation::new(allocator, bytes)?;
        Ok(Self { host, device })
    }

    pub fn host(&self) -> &PinnedAllocation {
        &self.host
    }

    pub fn device(&self) -> &DeviceAllocation {
        &self.device
    }

    pub fn bytes(&self) -> usize {
        self.device.bytes
    }
}
