//! Container keeping data only in pinned host memory.
//!
//! Page-locked memory speeds up transfers to and from the device. Like the other containers it
//! never releases memory before drop.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use snafu::{ResultExt, ensure};

use crate::allocation::PinnedAllocation;
use crate::allocator::PINNED_ALIGNMENT;
use crate::container::{Element, GpuContainer, Side, byte_len, enqueue, ensure_same_backend};
use crate::device::Device;
use crate::device_buffer::DeviceBuffer;
use crate::error::{AllocationSnafu, IncompatibleElementSizeSnafu, Result};
use crate::pinned_buffer::PinnedBuffer;
use crate::stream::Stream;

pub struct HostBuffer<T: Element> {
    device: Device,
    allocation: Option<PinnedAllocation>,
    len: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> HostBuffer<T> {
    /// Empty buffer. Nothing is allocated until the first resize.
    ///
    /// Element types aligned above [`PINNED_ALIGNMENT`] are rejected at compile time:
    ///
    /// ```compile_fail
    /// #[repr(C, align(512))]
    /// #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    /// struct Wide([u8; 512]);
    ///
    /// let device = cellflow_device::Device::emulated();
    /// let _ = cellflow_device::HostBuffer::<Wide>::new(&device);
    /// ```
    pub fn new(device: &Device) -> Self {
        const { assert!(size_of::<T>() > 0, "zero-sized element types are not supported") };
        const { assert!(align_of::<T>() <= PINNED_ALIGNMENT, "element alignment exceeds pinned allocation alignment") };
        Self { device: device.clone(), allocation: None, len: 0, capacity: 0, _marker: PhantomData }
    }

    /// Buffer holding `n` elements with unspecified contents.
    pub fn with_len(device: &Device, n: usize) -> Result<Self> {
        let mut buffer = Self::new(device);
        buffer.resize_discard(n)?;
        Ok(buffer)
    }

    /// Buffer holding a copy of `data`.
    pub fn from_slice(device: &Device, data: &[T]) -> Result<Self> {
        let mut buffer = Self::with_len(device, data.len())?;
        buffer.as_mut_slice().copy_from_slice(data);
        Ok(buffer)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        size_of::<T>()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Pointer to the first element, null while nothing is allocated.
    pub fn host_ptr(&self) -> *const T {
        self.allocation.as_ref().map_or(std::ptr::null(), |a| a.as_ptr().as_ptr().cast::<T>().cast_const())
    }

    fn host_ptr_mut(&mut self) -> *mut T {
        self.allocation.as_ref().map_or(std::ptr::null_mut(), |a| a.as_ptr().as_ptr().cast::<T>())
    }

    pub fn as_slice(&self) -> &[T] {
        match &self.allocation {
            // SAFETY: the allocation is aligned to PINNED_ALIGNMENT >= align_of::<T>() (checked in
            // `new`), holds `capacity >= len` elements and any bit pattern is a valid `T`.
            Some(allocation) => unsafe { std::slice::from_raw_parts(allocation.as_ptr().as_ptr().cast::<T>(), self.len) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match &self.allocation {
            // SAFETY: as in `as_slice`; `&mut self` guarantees exclusive access.
            Some(allocation) => unsafe {
                std::slice::from_raw_parts_mut(allocation.as_ptr().as_ptr().cast::<T>(), self.len)
            },
            None => &mut [],
        }
    }

    /// Set the length to `n`, growing without copying if needed.
    pub fn resize_discard(&mut self, n: usize) -> Result<()> {
        self.resize_with(n, false, "HostBuffer::resize_discard")
    }

    /// Set the length to `n`, copying the old contents synchronously if the buffer has to grow.
    pub fn resize_preserve(&mut self, n: usize) -> Result<()> {
        self.resize_with(n, true, "HostBuffer::resize_preserve")
    }

    fn resize_with(&mut self, n: usize, preserve: bool, operation: &'static str) -> Result<()> {
        let previous = self.len;
        let Some(capacity) = self.device.policy().plan(self.capacity, n) else {
            self.len = n;
            return Ok(());
        };

        let bytes = byte_len::<T>(operation, capacity)?;
        let allocation = PinnedAllocation::new(self.device.allocator(), bytes).context(AllocationSnafu {
            operation,
            element_size: size_of::<T>(),
            requested: n,
            previous,
        })?;

        if preserve && let Some(old) = &self.allocation {
            // SAFETY: distinct live allocations, both holding at least `previous` elements.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    old.as_ptr().as_ptr(),
                    allocation.as_ptr().as_ptr(),
                    previous * size_of::<T>(),
                )
            };
        }

        tracing::debug!(
            element_size = size_of::<T>(),
            previous,
            len = n,
            old_capacity = self.capacity,
            capacity,
            "growing HostBuffer"
        );

        self.allocation = Some(allocation);
        self.capacity = capacity;
        self.len = n;
        Ok(())
    }

    /// Zero every element.
    pub fn clear(&mut self) {
        bytemuck::fill_zeroes(self.as_mut_slice());
    }

    /// Synchronous copy of another host buffer.
    pub fn copy_from_host(&mut self, other: &HostBuffer<T>) -> Result<()> {
        self.resize_discard(other.len)?;
        self.as_mut_slice().copy_from_slice(other.as_slice());
        Ok(())
    }

    /// Device-to-host copy, enqueued on `stream`. The data may only be read after synchronizing.
    pub fn copy_from_device(&mut self, other: &DeviceBuffer<T>, stream: &Stream) -> Result<()> {
        const OP: &str = "HostBuffer::copy_from_device";
        ensure_same_backend(OP, &self.device, other.device())?;
        tracing::trace!(len = other.len(), element_size = size_of::<T>(), "D2H transfer into HostBuffer");
        self.resize_discard(other.len())?;

        let (dst, src) = (self.host_ptr_mut().cast::<u8>(), other.device_ptr());
        // SAFETY: both buffers hold `other.len()` elements.
        enqueue::<T>(OP, other.len(), |bytes| unsafe {
            self.device.allocator().copy_dtoh_async(dst, src, bytes, stream)
        })
    }

    /// Copy one side of a mirrored buffer. The host side is copied synchronously, the device
    /// side is enqueued on `stream`.
    pub fn copy_from_pinned(&mut self, other: &PinnedBuffer<T>, side: Side, stream: &Stream) -> Result<()> {
        const OP: &str = "HostBuffer::copy_from_pinned";
        match side {
            Side::Host => {
                self.resize_discard(other.len())?;
                self.as_mut_slice().copy_from_slice(other.as_slice());
                Ok(())
            }
            Side::Device => {
                ensure_same_backend(OP, &self.device, other.device())?;
                self.resize_discard(other.len())?;

                let (dst, src) = (self.host_ptr_mut().cast::<u8>(), other.device_ptr());
                // SAFETY: both buffers hold `other.len()` elements.
                enqueue::<T>(OP, other.len(), |bytes| unsafe {
                    self.device.allocator().copy_dtoh_async(dst, src, bytes, stream)
                })
            }
        }
    }

    /// Download any device container, reinterpreting its bytes as `T`.
    ///
    /// The source element size must be a multiple of `size_of::<T>()`, or the other way round
    /// with the total byte count divisible by `size_of::<T>()`. Enqueued on `stream`.
    pub fn generic_copy(&mut self, source: &dyn GpuContainer, stream: &Stream) -> Result<()> {
        const OP: &str = "HostBuffer::generic_copy";
        let (source_size, target_size) = (source.element_size(), size_of::<T>());
        let bytes = source.len() * source_size;
        ensure!(
            source_size % target_size == 0 || (target_size % source_size == 0 && bytes % target_size == 0),
            IncompatibleElementSizeSnafu { source_size, target_size, source_len: source.len() }
        );
        ensure_same_backend(OP, &self.device, source.device())?;

        let len = bytes / target_size;
        tracing::trace!(source_size, target_size, bytes, "type-erased D2H transfer into HostBuffer");
        self.resize_discard(len)?;

        let (dst, src) = (self.host_ptr_mut().cast::<u8>(), source.device_ptr());
        // SAFETY: the source holds `bytes` bytes and this buffer `len * target_size == bytes`.
        enqueue::<T>(OP, len, |bytes| unsafe { self.device.allocator().copy_dtoh_async(dst, src, bytes, stream) })
    }

    /// Deep copy with its own allocation.
    pub fn try_clone(&self) -> Result<Self> {
        let mut clone = Self::new(&self.device);
        clone.copy_from_host(self)?;
        Ok(clone)
    }

    /// Move the contents out, leaving this buffer empty and reusable.
    pub fn take(&mut self) -> Self {
        let empty = Self::new(&self.device);
        std::mem::replace(self, empty)
    }
}

impl<T: Element> Deref for HostBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Element> DerefMut for HostBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<'a, T: Element> IntoIterator for &'a HostBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

impl<'a, T: Element> IntoIterator for &'a mut HostBuffer<T> {
    type Item = &'a mut T;
    type IntoIter = std::slice::IterMut<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_mut_slice().iter_mut()
    }
}

impl<T: Element + fmt::Debug> fmt::Debug for HostBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("data", &self.as_slice())
            .finish()
    }
}

impl<T: Element> Drop for HostBuffer<T> {
    fn drop(&mut self) {
        if self.allocation.is_some() {
            tracing::trace!(
                element = std::any::type_name::<T>(),
                capacity = self.capacity,
                element_size = size_of::<T>(),
                "destroying HostBuffer"
            );
        }
    }
}
