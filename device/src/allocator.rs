use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use snafu::{OptionExt, ensure};

#[cfg(feature = "cuda")]
use crate::error::ForeignStreamSnafu;
use crate::error::{BackendError, HostLayoutSnafu, InvalidPointerSnafu, OutOfMemorySnafu, UnknownAllocationSnafu};
use crate::stream::{EmulatedStream, Stream, StreamHandle};

/// Alignment of every pinned host allocation handed out by the emulated backend.
pub const PINNED_ALIGNMENT: usize = 256;

/// Opaque address in device memory. Never dereferenced on the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: Self = Self(0);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one, wrapping around the address space.
    pub const fn byte_add(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes as u64))
    }

    /// Address `bytes` past this one, `None` if that leaves the address space.
    pub const fn checked_byte_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes as u64) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Address space an allocation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Device,
    PinnedHost,
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySpace::Device => f.write_str("device"),
            MemorySpace::PinnedHost => f.write_str("pinned host"),
        }
    }
}

/// Device memory backend.
///
/// All copy and memset operations are stream-ordered: they return once the work is enqueued.
/// Completion is only guaranteed after [`Stream::synchronize`] or [`Allocator::synchronize`].
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Allocate `bytes` of device memory.
    fn alloc_device(&self, bytes: usize) -> Result<DevicePtr, BackendError>;

    /// Release a device allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Allocator::alloc_device`] on this allocator and must not be used
    /// afterwards, including by work still pending on another stream.
    unsafe fn free_device(&self, ptr: DevicePtr) -> Result<(), BackendError>;

    /// Allocate `bytes` of page-locked host memory.
    fn alloc_pinned(&self, bytes: usize) -> Result<NonNull<u8>, BackendError>;

    /// Release a pinned host allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Allocator::alloc_pinned`] on this allocator and must not be used
    /// afterwards.
    unsafe fn free_pinned(&self, ptr: NonNull<u8>) -> Result<(), BackendError>;

    /// Enqueue a host-to-device copy.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `bytes` bytes until the copy completes.
    unsafe fn copy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: &Stream,
    ) -> Result<(), BackendError>;

    /// Enqueue a device-to-host copy.
    ///
    /// # Safety
    ///
    /// `dst` must be writable for `bytes` bytes and not accessed until the copy completes.
    unsafe fn copy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: &Stream,
    ) -> Result<(), BackendError>;

    /// Enqueue a device-to-device copy.
    ///
    /// # Safety
    ///
    /// Both ranges must stay allocated until the copy completes.
    unsafe fn copy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: &Stream,
    ) -> Result<(), BackendError>;

    /// Enqueue a byte fill of device memory.
    ///
    /// # Safety
    ///
    /// The range must stay allocated until the fill completes.
    unsafe fn memset_async(&self, dst: DevicePtr, value: u8, bytes: usize, stream: &Stream)
    -> Result<(), BackendError>;

    /// Create a new independent stream.
    fn create_stream(&self) -> Result<Stream, BackendError>;

    /// The stream used by blocking convenience operations.
    fn default_stream(&self) -> Stream;

    /// Wait for all outstanding work on every stream.
    fn synchronize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// Allocation counters of the emulated backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub device_allocs: usize,
    pub device_frees: usize,
    pub pinned_allocs: usize,
    pub pinned_frees: usize,
    pub live_device_bytes: usize,
    pub live_pinned_bytes: usize,
    pub peak_device_bytes: usize,
    pub transfers: usize,
    pub memsets: usize,
}

impl AllocationStats {
    pub fn live_device_allocations(&self) -> usize {
        self.device_allocs - self.device_frees
    }

    pub fn live_pinned_allocations(&self) -> usize {
        self.pinned_allocs - self.pinned_frees
    }
}

/// First address handed out by the emulated device address space.
const DEVICE_BASE: u64 = 0x7f00_0000_0000;
/// Unmapped gap kept between emulated device blocks so overruns never land in a neighbour.
const DEVICE_GUARD: u64 = 4096;

#[derive(Debug)]
struct PinnedBlock {
    layout: Layout,
}

#[derive(Debug)]
struct EmulatedState {
    device: BTreeMap<u64, Box<[u8]>>,
    pinned: HashMap<usize, PinnedBlock>,
    next_addr: u64,
    stats: AllocationStats,
}

impl EmulatedState {
    fn region(&self, addr: u64, bytes: usize) -> Result<&[u8], BackendError> {
        let invalid = InvalidPointerSnafu { space: MemorySpace::Device, addr, bytes };
        let (&base, block) = self.device.range(..=addr).next_back().context(invalid)?;
        let offset = (addr - base) as usize;
        let end = offset.checked_add(bytes).filter(|&end| end <= block.len()).context(invalid)?;
        Ok(&block[offset..end])
    }

    fn region_mut(&mut self, addr: u64, bytes: usize) -> Result<&mut [u8], BackendError> {
        let invalid = InvalidPointerSnafu { space: MemorySpace::Device, addr, bytes };
        let (&base, block) = self.device.range_mut(..=addr).next_back().context(invalid)?;
        let offset = (addr - base) as usize;
        let end = offset.checked_add(bytes).filter(|&end| end <= block.len()).context(invalid)?;
        Ok(&mut block[offset..end])
    }
}

/// Backend that emulates a discrete accelerator in host memory.
///
/// Device memory is a private address space that host code can only reach through the copy
/// operations, exactly like real device memory. Pinned memory is ordinary aligned host memory.
/// Streams execute work at enqueue time, which is one valid in-order schedule.
#[derive(Debug)]
pub struct EmulatedAllocator {
    name: String,
    device_limit: Option<usize>,
    state: Mutex<EmulatedState>,
    next_stream: AtomicU64,
    default_stream: Stream,
}

impl Default for EmulatedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedAllocator {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Emulated device with at most `bytes` of device memory.
    pub fn with_device_limit(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(device_limit: Option<usize>) -> Self {
        let state = EmulatedState {
            device: BTreeMap::new(),
            pinned: HashMap::new(),
            next_addr: DEVICE_BASE,
            stats: AllocationStats::default(),
        };
        Self {
            name: "EMU".to_string(),
            device_limit,
            state: Mutex::new(state),
            next_stream: AtomicU64::new(1),
            default_stream: Stream::emulated(0),
        }
    }

    /// Snapshot of the allocation counters.
    pub fn stats(&self) -> AllocationStats {
        self.state.lock().stats
    }

    fn check_stream<'a>(&self, stream: &'a Stream) -> Result<&'a EmulatedStream, BackendError> {
        match &stream.handle {
            StreamHandle::Emulated(stream) => Ok(&**stream),
            #[cfg(feature = "cuda")]
            _ => ForeignStreamSnafu { expected: "emulated", actual: stream.backend() }.fail(),
        }
    }
}

impl Allocator for EmulatedAllocator {
    fn alloc_device(&self, bytes: usize) -> Result<DevicePtr, BackendError> {
        let mut state = self.state.lock();

        let available = match self.device_limit {
            Some(limit) => limit.saturating_sub(state.stats.live_device_bytes),
            None => usize::MAX,
        }
        .min(isize::MAX as usize);
        let out_of_memory = OutOfMemorySnafu { space: MemorySpace::Device, requested: bytes, available };
        ensure!(bytes <= available, out_of_memory);

        let addr = state.next_addr;
        let next_addr = (bytes as u64)
            .div_ceil(DEVICE_GUARD)
            .checked_mul(DEVICE_GUARD)
            .and_then(|span| span.checked_add(DEVICE_GUARD))
            .and_then(|span| addr.checked_add(span))
            .context(out_of_memory)?;

        let mut block = Vec::new();
        block.try_reserve_exact(bytes).ok().context(out_of_memory)?;
        block.resize(bytes, 0u8);

        state.next_addr = next_addr;
        state.device.insert(addr, block.into_boxed_slice());

        let stats = &mut state.stats;
        stats.device_allocs += 1;
        stats.live_device_bytes += bytes;
        stats.peak_device_bytes = stats.peak_device_bytes.max(stats.live_device_bytes);

        Ok(DevicePtr::new(addr))
    }

    unsafe fn free_device(&self, ptr: DevicePtr) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let block = state
            .device
            .remove(&ptr.addr())
            .context(UnknownAllocationSnafu { space: MemorySpace::Device, addr: ptr.addr() })?;

        state.stats.device_frees += 1;
        state.stats.live_device_bytes -= block.len();
        Ok(())
    }

    fn alloc_pinned(&self, bytes: usize) -> Result<NonNull<u8>, BackendError> {
        ensure!(bytes > 0, HostLayoutSnafu { bytes });
        let layout = Layout::from_size_align(bytes, PINNED_ALIGNMENT).ok().context(HostLayoutSnafu { bytes })?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).context(OutOfMemorySnafu {
            space: MemorySpace::PinnedHost,
            requested: bytes,
            available: 0usize,
        })?;

        let mut state = self.state.lock();
        state.pinned.insert(ptr.as_ptr() as usize, PinnedBlock { layout });
        state.stats.pinned_allocs += 1;
        state.stats.live_pinned_bytes += bytes;

        Ok(ptr)
    }

    unsafe fn free_pinned(&self, ptr: NonNull<u8>) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let block = state
            .pinned
            .remove(&(ptr.as_ptr() as usize))
            .context(UnknownAllocationSnafu { space: MemorySpace::PinnedHost, addr: ptr.as_ptr() as u64 })?;

        state.stats.pinned_frees += 1;
        state.stats.live_pinned_bytes -= block.layout.size();
        drop(state);

        // SAFETY: the block was allocated by `alloc_pinned` with this layout and is removed from
        // the live set, so it cannot be freed twice.
        unsafe { dealloc(ptr.as_ptr(), block.layout) };
        Ok(())
    }

    unsafe fn copy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        bytes: usize,
        stream: &Stream,
    ) -> Result<(), BackendError> {
        let stream = self.check_stream(stream)?;
        let mut state = self.state.lock();
        // SAFETY: the caller guarantees `src` is readable for `bytes`.
        let src = unsafe { std::slice::from_raw_parts(src, bytes) };
        state.region_mut(dst.addr(), bytes)?.copy_from_slice(src);
        state.stats.transfers += 1;
        stream.record_submit();
        Ok(())
    }

    unsafe fn copy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        bytes: usize,
        stream: &Stream,
    ) -> Result<(), BackendError> {
        let stream = self.check_stream(stream)?;
        let mut state = self.state.lock();
        // SAFETY: the caller guarantees `dst` is writable for `bytes`.
        let dst = unsafe { std::slice::from_raw_parts_mut(dst, bytes) };
        dst.copy_from_slice(state.region(src.addr(), bytes)?);
        state.stats.transfers += 1;
        stream.record_submit();
        Ok(())
    }

    unsafe fn copy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: &Stream,
    ) -> Result<(), BackendError> {
        let stream = self.check_stream(stream)?;
        let mut state = self.state.lock();
        let data = state.region(src.addr(), bytes)?.to_vec();
        state.region_mut(dst.addr(), bytes)?.copy_from_slice(&data);
        state.stats.transfers += 1;
        stream.record_submit();
        Ok(())
    }

    unsafe fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: &Stream,
    ) -> Result<(), BackendError> {
        let stream = self.check_stream(stream)?;
        let mut state = self.state.lock();
        state.region_mut(dst.addr(), bytes)?.fill(value);
        state.stats.memsets += 1;
        stream.record_submit();
        Ok(())
    }

    fn create_stream(&self) -> Result<Stream, BackendError> {
        Ok(Stream::emulated(self.next_stream.fetch_add(1, Ordering::Relaxed)))
    }

    fn default_stream(&self) -> Stream {
        self.default_stream.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for EmulatedAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (addr, block) in state.pinned.drain() {
            // SAFETY: leaked pinned blocks are still owned by this allocator.
            unsafe { dealloc(addr as *mut u8, block.layout) };
        }
    }
}
