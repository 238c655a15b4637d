use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::allocator::{Allocator, EmulatedAllocator};
use crate::device::Device;
use crate::error::{Error, InvalidDeviceSnafu, Result};
use crate::growth::GrowthPolicy;

/// Which backend a [`Device`] runs on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceSpec {
    /// Host-memory emulation of a discrete accelerator.
    Emulated,
    Cuda { device_id: usize },
}

impl DeviceSpec {
    /// Parse a device string.
    ///
    /// Examples:
    /// - "EMU", "EMULATED", "CPU" -> DeviceSpec::Emulated
    /// - "CUDA:1" -> DeviceSpec::Cuda { device_id: 1 }
    /// - "cuda", "gpu" -> DeviceSpec::Cuda { device_id: 0 }
    pub fn parse(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        let (kind, ordinal) = match upper.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (upper.as_str(), None),
        };

        match (kind, ordinal) {
            ("EMU" | "EMULATED" | "CPU", None) => Ok(DeviceSpec::Emulated),
            ("CUDA" | "GPU", None) => Ok(DeviceSpec::Cuda { device_id: 0 }),
            ("CUDA" | "GPU", Some(ordinal)) => {
                let device_id = ordinal.parse().map_err(|_| Error::InvalidDevice { device: s.to_string() })?;
                Ok(DeviceSpec::Cuda { device_id })
            }
            _ => InvalidDeviceSnafu { device: s }.fail(),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Emulated => f.write_str("EMU"),
            DeviceSpec::Cuda { device_id } => write!(f, "CUDA:{device_id}"),
        }
    }
}

/// Lazily created devices, one per spec.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceSpec, Device>>,
    policy: GrowthPolicy,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(GrowthPolicy::standard())
    }
}

impl DeviceRegistry {
    pub fn new(policy: GrowthPolicy) -> Self {
        Self { devices: RwLock::new(HashMap::new()), policy }
    }

    /// Get or create a device.
    pub fn get(&self, spec: &DeviceSpec) -> Result<Device> {
        // Fast path: read lock
        {
            let devices = self.devices.read();
            if let Some(device) = devices.get(spec) {
                return Ok(device.clone());
            }
        }

        let mut devices = self.devices.write();

        // Double-check after acquiring write lock
        if let Some(device) = devices.get(spec) {
            return Ok(device.clone());
        }

        let device = Device::new(spec.clone(), self.create_allocator(spec)?, self.policy);
        tracing::debug!(device = %spec, "registered device");
        devices.insert(spec.clone(), device.clone());
        Ok(device)
    }

    /// Get a device by parsing a device string.
    pub fn get_device(&self, device: &str) -> Result<Device> {
        self.get(&DeviceSpec::parse(device)?)
    }

    fn create_allocator(&self, spec: &DeviceSpec) -> Result<Arc<dyn Allocator>> {
        match spec {
            DeviceSpec::Emulated => Ok(Arc::new(EmulatedAllocator::new())),
            #[cfg(feature = "cuda")]
            DeviceSpec::Cuda { device_id } => {
                use snafu::ResultExt;
                let allocator = crate::cuda::CudaAllocator::new(*device_id).context(crate::error::BackendSnafu)?;
                Ok(Arc::new(allocator))
            }
            #[cfg(not(feature = "cuda"))]
            DeviceSpec::Cuda { device_id } => {
                InvalidDeviceSnafu { device: format!("CUDA:{device_id} (built without the `cuda` feature)") }.fail()
            }
        }
    }
}

/// Global device registry instance, using the growth policy from the environment.
static REGISTRY: Lazy<DeviceRegistry> = Lazy::new(|| DeviceRegistry::new(GrowthPolicy::from_env()));

/// Get the global device registry.
pub fn registry() -> &'static DeviceRegistry {
    &REGISTRY
}

/// Convenience function to get a device by string.
pub fn get_device(device: &str) -> Result<Device> {
    registry().get_device(device)
}

/// The shared emulated device.
pub fn emulated() -> Result<Device> {
    registry().get(&DeviceSpec::Emulated)
}

/// Convenience function to get a CUDA device.
#[cfg(feature = "cuda")]
pub fn cuda(device_id: usize) -> Result<Device> {
    registry().get(&DeviceSpec::Cuda { device_id })
}

/// Device named by `CELLFLOW_DEVICE` (default: `EMU`).
pub fn default_device() -> Result<Device> {
    match std::env::var("CELLFLOW_DEVICE") {
        Ok(device) => get_device(&device),
        Err(_) => emulated(),
    }
}
