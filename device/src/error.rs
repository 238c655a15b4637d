use snafu::Snafu;

use crate::allocator::MemorySpace;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by container operations.
///
/// None of these are retried inside the crate. Allocation and transfer failures carry enough
/// context (operation, element size, requested and previous lengths) to diagnose capacity
/// miscalculations from the report alone.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Device or pinned-host allocation failed while growing a container.
    #[snafu(display(
        "{operation}: failed to allocate {requested} x {element_size} bytes (previous size {previous} x {element_size}): {source}"
    ))]
    Allocation { operation: &'static str, element_size: usize, requested: usize, previous: usize, source: BackendError },

    /// A copy or memset could not be enqueued.
    #[snafu(display("{operation}: transfer of {count} x {element_size} bytes failed: {source}"))]
    Transfer { operation: &'static str, element_size: usize, count: usize, source: BackendError },

    /// Requested element count does not fit the address space.
    #[snafu(display("{operation}: {requested} x {element_size} bytes overflows the address space"))]
    SizeOverflow { operation: &'static str, element_size: usize, requested: usize },

    /// Type-erased copy between element types whose sizes do not divide each other.
    #[snafu(display(
        "incompatible underlying datatype sizes when copying {source_len} elements: {source_size} vs {target_size}"
    ))]
    IncompatibleElementSize { source_size: usize, target_size: usize, source_len: usize },

    /// Containers created from different backends cannot exchange data.
    #[snafu(display("{operation}: source lives on {actual}, destination on {expected}"))]
    DeviceMismatch { operation: &'static str, expected: String, actual: String },

    /// Invalid device specification.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    /// Invalid configuration value.
    #[snafu(display("invalid value {value:?} for {key}: {reason}"))]
    InvalidConfig { key: &'static str, value: String, reason: String },

    /// Backend failure outside of any container operation.
    #[snafu(display("backend error: {source}"))]
    Backend { source: BackendError },
}

/// Errors reported by an [`Allocator`](crate::allocator::Allocator) implementation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BackendError {
    #[snafu(display("out of {space} memory: requested {requested} bytes, {available} available"))]
    OutOfMemory { space: MemorySpace, requested: usize, available: usize },

    #[snafu(display("invalid {space} pointer {addr:#x} for {bytes} bytes"))]
    InvalidPointer { space: MemorySpace, addr: u64, bytes: usize },

    /// Free of an address this allocator does not own (double free included).
    #[snafu(display("{space} address {addr:#x} is not a live allocation"))]
    UnknownAllocation { space: MemorySpace, addr: u64 },

    #[snafu(display("stream belongs to {actual}, allocator is {expected}"))]
    ForeignStream { expected: &'static str, actual: &'static str },

    #[snafu(display("cannot lay out {bytes} bytes of host memory"))]
    HostLayout { bytes: usize },

    #[cfg(feature = "cuda")]
    /// CUDA driver errors.
    #[snafu(display("CUDA error: {source}"))]
    Driver { source: cudarc::driver::DriverError },
}
