use std::sync::Arc;

use crate::{Device, DeviceSpec, EmulatedAllocator, GrowthPolicy};


/// Private emulated device together with its allocator, for inspecting allocation counters.
pub fn emulated_device() -> (Device, Arc<EmulatedAllocator>) {
    let allocator = Arc::new(EmulatedAllocator::new());
    (Device::new(DeviceSpec::Emulated, allocator.clone(), GrowthPolicy::standard()), allocator)
}

/// Emulated device with at most `bytes` of device memory.
pub fn limited_device(bytes: usize) -> (Device, Arc<EmulatedAllocator>) {
    let allocator = Arc::new(EmulatedAllocator::with_device_limit(bytes));
    (Device::new(DeviceSpec::Emulated, allocator.clone(), GrowthPolicy::standard()), allocator)
}
