//! Device handle shared by every container.
//!
//! A [`Device`] bundles the memory backend with the growth policy its containers use. It is cheap
//! to clone; every container keeps its own clone so it can allocate, copy and free on its own.

use std::sync::Arc;

use snafu::ResultExt;

use crate::allocator::{Allocator, EmulatedAllocator};
use crate::error::{BackendSnafu, Result};
use crate::growth::GrowthPolicy;
use crate::registry::DeviceSpec;
use crate::stream::Stream;

#[derive(Debug, Clone)]
pub struct Device {
    spec: DeviceSpec,
    allocator: Arc<dyn Allocator>,
    policy: GrowthPolicy,
}

impl Device {
    pub fn new(spec: DeviceSpec, allocator: Arc<dyn Allocator>, policy: GrowthPolicy) -> Self {
        Self { spec, allocator, policy }
    }

    /// A fresh, private emulated device with the standard growth policy.
    pub fn emulated() -> Self {
        Self::new(DeviceSpec::Emulated, Arc::new(EmulatedAllocator::new()), GrowthPolicy::standard())
    }

    /// Same backend, different growth policy.
    pub fn with_policy(&self, policy: GrowthPolicy) -> Self {
        Self { spec: self.spec.clone(), allocator: Arc::clone(&self.allocator), policy }
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn policy(&self) -> &GrowthPolicy {
        &self.policy
    }

    pub fn default_stream(&self) -> Stream {
        self.allocator.default_stream()
    }

    pub fn create_stream(&self) -> Result<Stream> {
        self.allocator.create_stream().context(BackendSnafu)
    }

    /// Wait for all outstanding work on every stream of this device.
    pub fn synchronize(&self) -> Result<()> {
        self.allocator.synchronize().context(BackendSnafu)
    }

    /// Whether both handles allocate from the same backend instance.
    pub fn same_backend(&self, other: &Device) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.allocator), Arc::as_ptr(&other.allocator))
    }

    /// Human readable backend identity used in error reports.
    pub(crate) fn describe(&self) -> String {
        format!("{} ({:p})", self.spec, Arc::as_ptr(&self.allocator) as *const ())
    }
}
