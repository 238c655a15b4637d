//! Container keeping data only in device memory.
//!
//! Memory is never released before drop: the buffer keeps an allocation large enough for the
//! largest length it ever held.

use std::fmt;
use std::marker::PhantomData;

use snafu::ResultExt;

use crate::allocation::DeviceAllocation;
use crate::allocator::DevicePtr;
use crate::container::{Element, GpuContainer, Side, byte_len, element_ptr, enqueue, ensure_same_backend};
use crate::device::Device;
use crate::error::{AllocationSnafu, Result, TransferSnafu};
use crate::host_buffer::HostBuffer;
use crate::pinned_buffer::PinnedBuffer;
use crate::stream::Stream;

pub struct DeviceBuffer<T: Element> {
    device: Device,
    allocation: Option<DeviceAllocation>,
    len: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> DeviceBuffer<T> {
    /// Empty buffer. Nothing is allocated until the first resize.
    pub fn new(device: &Device) -> Self {
        const { assert!(size_of::<T>() > 0, "zero-sized element types are not supported") };
        Self { device: device.clone(), allocation: None, len: 0, capacity: 0, _marker: PhantomData }
    }

    /// Buffer holding `n` elements with unspecified contents.
    pub fn with_len(device: &Device, n: usize) -> Result<Self> {
        let mut buffer = Self::new(device);
        buffer.resize_discard(n)?;
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

    /// Device address of the first element, `DevicePtr::NULL` while nothing is allocated.
    pub fn device_ptr(&self) -> DevicePtr {
        self.allocation.as_ref().map_or(DevicePtr::NULL, DeviceAllocation::ptr)
    }

    /// Device address of element `index`, `None` unless `index < len()`.
    pub fn device_ptr_at(&self, index: usize) -> Option<DevicePtr> {
        element_ptr::<T>(self.device_ptr(), index, self.len)
    }

    /// Set the length to `n`, growing without copying if needed.
    pub fn resize_discard(&mut self, n: usize) -> Result<()> {
        self.resize_with(n, None, "DeviceBuffer::resize_discard")
    }

    /// Set the length to `n`. If the buffer has to grow, the old contents are copied to the new
    /// allocation on `stream` before the old allocation is released.
    pub fn resize_preserve(&mut self, n: usize, stream: &Stream) -> Result<()> {
        self.resize_with(n, Some(stream), "DeviceBuffer::resize_preserve")
    }

    fn resize_with(&mut self, n: usize, preserve: Option<&Stream>, operation: &'static str) -> Result<()> {
        let previous = self.len;
        let Some(capacity) = self.device.policy().plan(self.capacity, n) else {
            self.len = n;
            return Ok(());
        };

        let bytes = byte_len::<T>(operation, capacity)?;
        let allocation = DeviceAllocation::new(self.device.allocator(), bytes).context(AllocationSnafu {
            operation,
            element_size: size_of::<T>(),
            requested: n,
            previous,
        })?;

        if let Some(stream) = preserve
            && let Some(old) = &self.allocation
        {
            // SAFETY: both allocations are live and hold at least `previous` elements.
            enqueue::<T>(operation, previous, |bytes| unsafe {
                self.device.allocator().copy_dtod_async(allocation.ptr(), old.ptr(), bytes, stream)
            })?;
        }

        tracing::debug!(
            element_size = size_of::<T>(),
            previous,
            len = n,
            old_capacity = self.capacity,
            capacity,
            "growing DeviceBuffer"
        );

        self.allocation = Some(allocation);
        self.capacity = capacity;
        self.len = n;
        Ok(())
    }

    /// Zero the first `len` elements on `stream`.
    pub fn clear(&mut self, stream: &Stream) -> Result<()> {
        tracing::trace!(len = self.len, element_size = size_of::<T>(), "clearing DeviceBuffer");
        let ptr = self.device_ptr();
        // SAFETY: a non-empty buffer owns at least `len` elements at `ptr`.
        enqueue::<T>("DeviceBuffer::clear", self.len, |bytes| unsafe {
            self.device.allocator().memset_async(ptr, 0, bytes, stream)
        })
    }

    /// Device-to-device copy of another buffer's contents, enqueued on `stream`.
    pub fn copy_from_device(&mut self, other: &DeviceBuffer<T>, stream: &Stream) -> Result<()> {
        const OP: &str = "DeviceBuffer::copy_from_device";
        ensure_same_backend(OP, &self.device, &other.device)?;
        self.resize_discard(other.len)?;

        let (dst, src) = (self.device_ptr(), other.device_ptr());
        // SAFETY: both buffers hold `other.len` elements.
        enqueue::<T>(OP, other.len, |bytes| unsafe { self.device.allocator().copy_dtod_async(dst, src, bytes, stream) })
    }

    /// Device-to-device copy that returns once the data has landed.
    pub fn copy_from_device_blocking(&mut self, other: &DeviceBuffer<T>) -> Result<()> {
        let stream = self.device.default_stream();
        self.copy_from_device(other, &stream)?;
        self.synchronize("DeviceBuffer::copy_from_device_blocking", &stream)
    }

    /// Host-to-device copy from a pinned host buffer, enqueued on `stream`.
    pub fn copy_from_host(&mut self, other: &HostBuffer<T>, stream: &Stream) -> Result<()> {
        const OP: &str = "DeviceBuffer::copy_from_host";
        ensure_same_backend(OP, &self.device, other.device())?;
        tracing::trace!(len = other.len(), element_size = size_of::<T>(), "H2D transfer into DeviceBuffer");
        self.resize_discard(other.len())?;

        let (dst, src) = (self.device_ptr(), other.host_ptr().cast::<u8>());
        // SAFETY: both buffers hold `other.len()` elements; `other` outlives the enqueue.
        enqueue::<T>(OP, other.len(), |bytes| unsafe {
            self.device.allocator().copy_htod_async(dst, src, bytes, stream)
        })
    }

    /// Copy one side of a mirrored buffer, enqueued on `stream`.
    pub fn copy_from_pinned(&mut self, other: &PinnedBuffer<T>, side: Side, stream: &Stream) -> Result<()> {
        const OP: &str = "DeviceBuffer::copy_from_pinned";
        ensure_same_backend(OP, &self.device, other.device())?;
        self.resize_discard(other.len())?;

        let dst = self.device_ptr();
        let allocator = self.device.allocator();
        // SAFETY: both buffers hold `other.len()` elements on the side being read.
        enqueue::<T>(OP, other.len(), |bytes| unsafe {
            match side {
                Side::Device => allocator.copy_dtod_async(dst, other.device_ptr(), bytes, stream),
                Side::Host => allocator.copy_htod_async(dst, other.host_ptr().cast::<u8>(), bytes, stream),
            }
        })
    }

    /// Deep copy with its own allocation. Blocks until the copy completed.
    pub fn try_clone(&self) -> Result<Self> {
        let mut clone = Self::new(&self.device);
        clone.copy_from_device_blocking(self)?;
        Ok(clone)
    }

    /// Move the contents out, leaving this buffer empty and reusable.
    pub fn take(&mut self) -> Self {
        let empty = Self::new(&self.device);
        std::mem::replace(self, empty)
    }

    fn synchronize(&self, operation: &'static str, stream: &Stream) -> Result<()> {
        stream.synchronize().context(TransferSnafu { operation, element_size: size_of::<T>(), count: self.len })
    }
}

impl<T: Element> GpuContainer for DeviceBuffer<T> {
    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn element_size(&self) -> usize {
        size_of::<T>()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn device_ptr(&self) -> DevicePtr {
        self.allocation.as_ref().map_or(DevicePtr::NULL, DeviceAllocation::ptr)
    }

    fn resize_discard(&mut self, n: usize) -> Result<()> {
        self.resize_with(n, None, "DeviceBuffer::resize_discard")
    }

    fn resize_preserve(&mut self, n: usize, stream: &Stream) -> Result<()> {
        self.resize_with(n, Some(stream), "DeviceBuffer::resize_preserve")
    }

    fn clear_device(&mut self, stream: &Stream) -> Result<()> {
        self.clear(stream)
    }

    fn produce(&self) -> Box<dyn GpuContainer> {
        Box::new(Self::new(&self.device))
    }
}

impl<T: Element> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("element", &std::any::type_name::<T>())
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("ptr", &self.device_ptr())
            .finish()
    }
}

impl<T: Element> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if self.allocation.is_some() {
            tracing::trace!(
                element = std::any::type_name::<T>(),
                capacity = self.capacity,
                element_size = size_of::<T>(),
                "destroying DeviceBuffer"
            );
        }
    }
}
