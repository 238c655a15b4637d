//! Growable containers for data living on an accelerator, in pinned host memory, or mirrored in
//! both.
//!
//! Every container is created from a [`Device`], which supplies the memory backend and the
//! [`GrowthPolicy`]. Containers only ever grow; shrinking keeps the allocation and lowers the
//! length. Device-side copies are stream-ordered and complete only after the stream is
//! synchronized.

pub mod allocation;
pub mod allocator;
pub mod container;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod device_buffer;
pub mod error;
pub mod growth;
pub mod host_buffer;
pub mod pinned_buffer;
pub mod registry;
pub mod stream;

#[cfg(test)]
mod test;

pub use allocator::{AllocationStats, Allocator, DevicePtr, EmulatedAllocator, MemorySpace};
pub use container::{Element, GpuContainer, Side};
#[cfg(feature = "cuda")]
pub use cuda::CudaAllocator;
pub use device::Device;
pub use device_buffer::DeviceBuffer;
pub use error::{BackendError, Error, Result};
pub use growth::GrowthPolicy;
pub use host_buffer::HostBuffer;
pub use pinned_buffer::PinnedBuffer;
#[cfg(feature = "cuda")]
pub use registry::cuda;
pub use registry::{DeviceRegistry, DeviceSpec, default_device, emulated, get_device, registry};
pub use stream::{Stream, TransferMode};
