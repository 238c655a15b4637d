//! Container keeping data on the device and in pinned host memory.
//!
//! Host and device contents are never synchronized implicitly. Use [`PinnedBuffer::upload`] and
//! [`PinnedBuffer::download`] explicitly; reading one side tells nothing about the other.
//!
//! Both allocations grow and die together through a single [`MirroredAllocation`], so the buffer
//! can never hold one side without the other.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use snafu::ResultExt;

use crate::allocation::MirroredAllocation;
use crate::allocator::{DevicePtr, PINNED_ALIGNMENT};
use crate::container::{Element, GpuContainer, byte_len, element_ptr, enqueue, ensure_same_backend};
use crate::device::Device;
use crate::device_buffer::DeviceBuffer;
use crate::error::{AllocationSnafu, Result, TransferSnafu};
use crate::host_buffer::HostBuffer;
use crate::stream::{Stream, TransferMode};

pub struct PinnedBuffer<T: Element> {
    device: Device,
    allocation: Option<MirroredAllocation>,
    len: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> PinnedBuffer<T> {
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
    /// let _ = cellflow_device::PinnedBuffer::<Wide>::new(&device);
    /// ```
    pub fn new(device: &Device) -> Self {
        const { assert!(size_of::<T>() > 0, "zero-sized element types are not supported") };
        const { assert!(align_of::<T>() <= PINNED_ALIGNMENT, "element alignment exceeds pinned allocation alignment") };
        Self { device: device.clone(), allocation: None, len: 0, capacity: 0, _marker: PhantomData }
    }

    /// Buffer holding `n` elements with unspecified contents on both sides.
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
        self.allocation.as_ref().map_or(DevicePtr::NULL, |a| a.device().ptr())
    }

    /// Device address of element `index`, `None` unless `index < len()`.
    pub fn device_ptr_at(&self, index: usize) -> Option<DevicePtr> {
        element_ptr::<T>(self.device_ptr(), index, self.len)
    }

    /// Host pointer to the first element, null while nothing is allocated.
    pub fn host_ptr(&self) -> *const T {
        self.allocation.as_ref().map_or(std::ptr::null(), |a| a.host().as_ptr().as_ptr().cast::<T>().cast_const())
    }

    fn host_ptr_mut(&mut self) -> *mut T {
        self.allocation.as_ref().map_or(std::ptr::null_mut(), |a| a.host().as_ptr().as_ptr().cast::<T>())
    }

    /// Host-side elements.
    pub fn as_slice(&self) -> &[T] {
        match &self.allocation {
            // SAFETY: the host allocation is aligned to PINNED_ALIGNMENT >= align_of::<T>() (checked
            // in `new`), holds `capacity >= len` elements and any bit pattern is a valid `T`.
            Some(allocation) => unsafe {
                std::slice::from_raw_parts(allocation.host().as_ptr().as_ptr().cast::<T>(), self.len)
            },
            None => &[],
        }
    }

    /// Host-side elements, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match &self.allocation {
            // SAFETY: as in `as_slice`; `&mut self` guarantees exclusive access.
            Some(allocation) => unsafe {
                std::slice::from_raw_parts_mut(allocation.host().as_ptr().as_ptr().cast::<T>(), self.len)
            },
            None => &mut [],
        }
    }

    /// Set the length to `n`, growing both sides without copying if needed.
    pub fn resize_discard(&mut self, n: usize) -> Result<()> {
        self.resize_with(n, None, "PinnedBuffer::resize_discard")
    }

    /// Set the length to `n`. If the buffer has to grow, each side's old contents are copied into
    /// the same side of the new allocation: host synchronously, device on `stream`.
    pub fn resize_preserve(&mut self, n: usize, stream: &Stream) -> Result<()> {
        self.resize_with(n, Some(stream), "PinnedBuffer::resize_preserve")
    }

    fn resize_with(&mut self, n: usize, preserve: Option<&Stream>, operation: &'static str) -> Result<()> {
        let previous = self.len;
        let Some(capacity) = self.device.policy().plan(self.capacity, n) else {
            self.len = n;
            return Ok(());
        };

        let bytes = byte_len::<T>(operation, capacity)?;
        let allocation = MirroredAllocation::new(self.device.allocator(), bytes).context(AllocationSnafu {
            operation,
            element_size: size_of::<T>(),
            requested: n,
            previous,
        })?;

        tracing::debug!(
            element_size = size_of::<T>(),
            previous,
            len = n,
            old_capacity = self.capacity,
            capacity,
            "growing PinnedBuffer"
        );

        if let Some(stream) = preserve
            && let Some(old) = &self.allocation
        {
            // SAFETY: both allocations are live and hold at least `previous` elements per side.
            enqueue::<T>(operation, previous, |bytes| unsafe {
                std::ptr::copy_nonoverlapping(old.host().as_ptr().as_ptr(), allocation.host().as_ptr().as_ptr(), bytes);
                self.device.allocator().copy_dtod_async(allocation.device().ptr(), old.device().ptr(), bytes, stream)
            })?;
        }

        self.allocation = Some(allocation);
        self.capacity = capacity;
        self.len = n;
        Ok(())
    }

    /// Copy device contents into the host side.
    ///
    /// With [`TransferMode::Async`] the copy is only enqueued and the host side must not be read
    /// before the stream is synchronized.
    pub fn download(&mut self, stream: &Stream, mode: TransferMode) -> Result<()> {
        const OP: &str = "PinnedBuffer::download";
        tracing::trace!(len = self.len, element_size = size_of::<T>(), ?mode, "D2H transfer of PinnedBuffer");

        let (dst, src) = (self.host_ptr_mut().cast::<u8>(), self.device_ptr());
        // SAFETY: both sides hold `len` elements.
        enqueue::<T>(OP, self.len, |bytes| unsafe { self.device.allocator().copy_dtoh_async(dst, src, bytes, stream) })?;

        if mode == TransferMode::Blocking {
            self.synchronize(OP, stream)?;
        }
        Ok(())
    }

    /// Copy host contents into the device side, enqueued on `stream`.
    pub fn upload(&mut self, stream: &Stream) -> Result<()> {
        tracing::trace!(len = self.len, element_size = size_of::<T>(), "H2D transfer of PinnedBuffer");

        let (dst, src) = (self.device_ptr(), self.host_ptr().cast::<u8>());
        // SAFETY: both sides hold `len` elements; the host side stays allocated while `self` lives.
        enqueue::<T>("PinnedBuffer::upload", self.len, |bytes| unsafe {
            self.device.allocator().copy_htod_async(dst, src, bytes, stream)
        })
    }

    /// Zero both sides.
    pub fn clear(&mut self, stream: &Stream) -> Result<()> {
        self.clear_device(stream)?;
        self.clear_host();
        Ok(())
    }

    /// Zero the device side on `stream`.
    pub fn clear_device(&mut self, stream: &Stream) -> Result<()> {
        tracing::trace!(len = self.len, element_size = size_of::<T>(), "clearing device side of PinnedBuffer");

        let ptr = self.device_ptr();
        // SAFETY: a non-empty buffer owns at least `len` device elements at `ptr`.
        enqueue::<T>("PinnedBuffer::clear_device", self.len, |bytes| unsafe {
            self.device.allocator().memset_async(ptr, 0, bytes, stream)
        })
    }

    /// Zero the host side.
    pub fn clear_host(&mut self) {
        tracing::trace!(len = self.len, element_size = size_of::<T>(), "clearing host side of PinnedBuffer");
        bytemuck::fill_zeroes(self.as_mut_slice());
    }

    /// Copy a device buffer into the device side, enqueued on `stream`. The host side is untouched.
    pub fn copy_from_device(&mut self, other: &DeviceBuffer<T>, stream: &Stream) -> Result<()> {
        const OP: &str = "PinnedBuffer::copy_from_device";
        ensure_same_backend(OP, &self.device, other.device())?;
        self.resize_discard(other.len())?;

        let (dst, src) = (self.device_ptr(), other.device_ptr());
        // SAFETY: both buffers hold `other.len()` device elements.
        enqueue::<T>(OP, other.len(), |bytes| unsafe { self.device.allocator().copy_dtod_async(dst, src, bytes, stream) })
    }

    /// Copy a host buffer into the host side. The device side is untouched.
    pub fn copy_from_host(&mut self, other: &HostBuffer<T>) -> Result<()> {
        self.resize_discard(other.len())?;
        self.as_mut_slice().copy_from_slice(other.as_slice());
        Ok(())
    }

    /// Copy both sides of another mirrored buffer: device side on `stream`, host side synchronously.
    pub fn copy_from_pinned(&mut self, other: &PinnedBuffer<T>, stream: &Stream) -> Result<()> {
        self.copy_device_side_from(other, stream)?;
        self.as_mut_slice().copy_from_slice(other.as_slice());
        Ok(())
    }

    /// Copy only the device side of another mirrored buffer, enqueued on `stream`.
    pub fn copy_device_side_from(&mut self, other: &PinnedBuffer<T>, stream: &Stream) -> Result<()> {
        const OP: &str = "PinnedBuffer::copy_device_side_from";
        ensure_same_backend(OP, &self.device, &other.device)?;
        self.resize_discard(other.len)?;

        let (dst, src) = (self.device_ptr(), other.device_ptr());
        // SAFETY: both buffers hold `other.len` device elements.
        enqueue::<T>(OP, other.len, |bytes| unsafe { self.device.allocator().copy_dtod_async(dst, src, bytes, stream) })
    }

    /// Copy both sides of another mirrored buffer and wait for the device copy to land.
    pub fn copy_from_pinned_blocking(&mut self, other: &PinnedBuffer<T>) -> Result<()> {
        let stream = self.device.default_stream();
        self.copy_from_pinned(other, &stream)?;
        self.synchronize("PinnedBuffer::copy_from_pinned_blocking", &stream)
    }

    /// Deep copy of both sides with its own allocations. Blocks until the copy completed.
    pub fn try_clone(&self) -> Result<Self> {
        let mut clone = Self::new(&self.device);
        clone.copy_from_pinned_blocking(self)?;
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

impl<T: Element> GpuContainer for PinnedBuffer<T> {
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
        self.allocation.as_ref().map_or(DevicePtr::NULL, |a| a.device().ptr())
    }

    fn resize_discard(&mut self, n: usize) -> Result<()> {
        self.resize_with(n, None, "PinnedBuffer::resize_discard")
    }

    fn resize_preserve(&mut self, n: usize, stream: &Stream) -> Result<()> {
        self.resize_with(n, Some(stream), "PinnedBuffer::resize_preserve")
    }

    fn clear_device(&mut self, stream: &Stream) -> Result<()> {
        PinnedBuffer::clear_device(self, stream)
    }

    fn produce(&self) -> Box<dyn GpuContainer> {
        Box::new(Self::new(&self.device))
    }
}

impl<T: Element> Deref for PinnedBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Element> DerefMut for PinnedBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<'a, T: Element> IntoIterator for &'a PinnedBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

impl<T: Element> fmt::Debug for PinnedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("element", &std::any::type_name::<T>())
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("device_ptr", &self.device_ptr())
            .field("host_ptr", &self.host_ptr())
            .finish()
    }
}

impl<T: Element> Drop for PinnedBuffer<T> {
    fn drop(&mut self) {
        if self.allocation.is_some() {
            tracing::trace!(
                element = std::any::type_name::<T>(),
                capacity = self.capacity,
                element_size = size_of::<T>(),
                "destroying PinnedBuffer"
            );
        }
    }
}
