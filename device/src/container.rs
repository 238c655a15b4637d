//! Type-erased view over device-backed containers.
//!
//! Generic code (particle storage, checkpointing) holds containers as `Box<dyn GpuContainer>`
//! and only needs sizes, an untyped device pointer, resizing and clearing. New containers of the
//! same concrete kind are made by example through [`GpuContainer::produce`].

use std::fmt;

use bytemuck::Pod;
use snafu::{OptionExt, ResultExt, ensure};

use crate::allocator::DevicePtr;
use crate::device::Device;
use crate::error::{BackendError, DeviceMismatchSnafu, Result, SizeOverflowSnafu, TransferSnafu};
use crate::stream::Stream;

/// Element types storable in a container: bit-copyable, valid when zeroed, shareable.
pub trait Element: Pod + Send + Sync {}

impl<T: Pod + Send + Sync> Element for T {}

/// Which half of a [`PinnedBuffer`](crate::PinnedBuffer) a copy reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Host,
    Device,
}

/// Capability interface implemented by every container with device-resident data.
pub trait GpuContainer: fmt::Debug + Send + Sync {
    /// Number of valid elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated element count, `>= len()`.
    fn capacity(&self) -> usize;

    /// `size_of` the element type.
    fn element_size(&self) -> usize;

    fn device(&self) -> &Device;

    /// Untyped device address of the first element, `DevicePtr::NULL` before the first allocation.
    /// Valid until the next resize or drop of this container.
    fn device_ptr(&self) -> DevicePtr;

    /// Resize without keeping previous contents.
    fn resize_discard(&mut self, n: usize) -> Result<()>;

    /// Resize keeping the first `min(len, n)` elements; copies are enqueued on `stream`.
    fn resize_preserve(&mut self, n: usize, stream: &Stream) -> Result<()>;

    /// Zero the device contents on `stream`.
    fn clear_device(&mut self, stream: &Stream) -> Result<()>;

    /// An empty container of the same concrete type on the same device.
    fn produce(&self) -> Box<dyn GpuContainer>;
}

/// Byte size of `count` elements of `T`.
pub(crate) fn byte_len<T>(operation: &'static str, count: usize) -> Result<usize> {
    count.checked_mul(size_of::<T>()).context(SizeOverflowSnafu {
        operation,
        element_size: size_of::<T>(),
        requested: count,
    })
}

/// Address of element `index` of `T` starting at `base`, for indices below `len`.
pub(crate) fn element_ptr<T>(base: DevicePtr, index: usize, len: usize) -> Option<DevicePtr> {
    if index >= len {
        return None;
    }
    base.checked_byte_add(index.checked_mul(size_of::<T>())?)
}

/// Run a transfer of `count` elements of `T`, skipping empty ones and attaching context on failure.
pub(crate) fn enqueue<T>(
    operation: &'static str,
    count: usize,
    transfer: impl FnOnce(usize) -> Result<(), BackendError>,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    transfer(count * size_of::<T>()).context(TransferSnafu { operation, element_size: size_of::<T>(), count })
}

/// Both containers must allocate from the same backend to exchange data.
pub(crate) fn ensure_same_backend(operation: &'static str, dst: &Device, src: &Device) -> Result<()> {
    ensure!(dst.same_backend(src), DeviceMismatchSnafu { operation, expected: dst.describe(), actual: src.describe() });
    Ok(())
}
