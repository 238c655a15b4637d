use test_case::test_case;

use crate::{DeviceRegistry, DeviceSpec, Error, GrowthPolicy};

#[test_case("EMU", DeviceSpec::Emulated; "emu")]
#[test_case("emulated", DeviceSpec::Emulated; "emulated_lowercase")]
#[test_case(" cpu ", DeviceSpec::Emulated; "cpu_trimmed")]
#[test_case("CUDA", DeviceSpec::Cuda { device_id: 0 }; "cuda_default")]
#[test_case("gpu:3", DeviceSpec::Cuda { device_id: 3 }; "gpu_ordinal")]
fn test_parse(input: &str, expected: DeviceSpec) {
    assert_eq!(DeviceSpec::parse(input).unwrap(), expected);
    assert_eq!(input.parse::<DeviceSpec>().unwrap(), expected);
}

#[test_case("TPU"; "unknown_kind")]
#[test_case("CUDA:x"; "bad_ordinal")]
#[test_case("EMU:1"; "ordinal_on_emulated")]
#[test_case(""; "empty")]
fn test_parse_rejects(input: &str) {
    assert!(matches!(DeviceSpec::parse(input), Err(Error::InvalidDevice { .. })));
}

#[test]
fn test_display_round_trips() {
    for spec in [DeviceSpec::Emulated, DeviceSpec::Cuda { device_id: 2 }] {
        assert_eq!(DeviceSpec::parse(&spec.to_string()).unwrap(), spec);
    }
}

#[test]
fn test_registry_caches_devices() {
    let registry = DeviceRegistry::default();
    let first = registry.get_device("EMU").unwrap();
    let second = registry.get(&DeviceSpec::Emulated).unwrap();

    assert!(first.same_backend(&second));
    assert_eq!(first.allocator().name(), "EMU");
    assert_eq!(first.spec(), &DeviceSpec::Emulated);
}

#[test]
fn test_registries_are_isolated() {
    let a = DeviceRegistry::default().get_device("EMU").unwrap();
    let b = DeviceRegistry::default().get_device("EMU").unwrap();
    assert!(!a.same_backend(&b));
}

#[test]
fn test_registry_policy() {
    let policy = GrowthPolicy::builder().granularity(64).build().unwrap();
    let device = DeviceRegistry::new(policy).get_device("emu").unwrap();
    assert_eq!(device.policy().granularity(), 64);
    assert_eq!(device.policy().capacity_for(1), 64);
}

#[test]
fn test_global_registry() {
    let device = crate::emulated().unwrap();
    assert!(device.same_backend(&crate::get_device("EMULATED").unwrap()));
    assert!(std::ptr::eq(crate::registry(), crate::registry()));
}

#[cfg(not(feature = "cuda"))]
#[test]
fn test_cuda_requires_feature() {
    let err = DeviceRegistry::default().get_device("CUDA:0").unwrap_err();
    assert!(err.to_string().contains("cuda"));
}

#[cfg(feature = "cuda")]
#[test]
fn test_cuda_device() {
    let device = match crate::cuda(0) {
        Ok(device) => device,
        Err(_) => {
            eprintln!("CUDA not available, skipping test");
            return;
        }
    };

    let stream = device.default_stream();
    let mut buffer = crate::PinnedBuffer::<u32>::with_len(&device, 4).unwrap();
    buffer.copy_from_slice(&[1, 2, 3, 4]);
    buffer.upload(&stream).unwrap();
    buffer.clear_host();
    buffer.download(&stream, crate::TransferMode::Blocking).unwrap();
    assert_eq!(buffer.as_slice(), [1, 2, 3, 4]);
}
