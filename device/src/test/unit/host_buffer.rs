use bytemuck::{Pod, Zeroable};
use test_case::test_case;

use crate::allocator::PINNED_ALIGNMENT;
use crate::test::emulated_device;
use crate::{DeviceBuffer, Error, HostBuffer, PinnedBuffer, Side};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct Vec3 {
    x: f32,
    y: f32,
    z: f32,
}

fn device_buffer<T: crate::Element>(data: &[T]) -> DeviceBuffer<T> {
    let (device, _) = emulated_device();
    let host = HostBuffer::from_slice(&device, data).unwrap();
    let mut buffer = DeviceBuffer::new(&device);
    buffer.copy_from_host(&host, &device.default_stream()).unwrap();
    buffer
}

#[test]
fn test_slice_access() {
    let (device, allocator) = emulated_device();
    let mut buffer = HostBuffer::from_slice(&device, &[1.0f32, 2.0, 3.0]).unwrap();

    buffer[1] = 5.0;
    for value in &mut buffer {
        *value *= 2.0;
    }
    assert_eq!(buffer.as_slice(), [2.0, 10.0, 6.0]);
    assert_eq!(buffer.iter().sum::<f32>(), 18.0);
    assert_eq!(buffer.host_ptr() as usize % PINNED_ALIGNMENT, 0);
    assert_eq!(allocator.stats().pinned_allocs, 1);
    assert_eq!(allocator.stats().device_allocs, 0, "host buffers never touch device memory");
}

/// Element with the largest alignment pinned allocations guarantee.
#[repr(C, align(256))]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct Aligned {
    value: u64,
    _pad: [u64; 31],
}

#[test]
fn test_max_alignment_element() {
    assert_eq!(align_of::<Aligned>(), PINNED_ALIGNMENT);
    let (device, _) = emulated_device();
    let item = Aligned { value: 7, _pad: [0; 31] };

    let mut buffer = HostBuffer::from_slice(&device, &[item; 3]).unwrap();
    buffer.resize_preserve(500).unwrap();
    assert_eq!(buffer.as_slice().as_ptr() as usize % align_of::<Aligned>(), 0);
    assert_eq!(buffer[2], item);

    let mut pinned = PinnedBuffer::<Aligned>::with_len(&device, 2).unwrap();
    pinned.copy_from_slice(&[item; 2]);
    assert_eq!(pinned.host_ptr() as usize % align_of::<Aligned>(), 0);
}

#[test]
fn test_resize_preserve_keeps_prefix() {
    let (device, allocator) = emulated_device();
    let data: Vec<u64> = (0..200).collect();
    let mut buffer = HostBuffer::from_slice(&device, &data).unwrap();

    buffer.resize_preserve(10_000).unwrap();
    assert_eq!(buffer.len(), 10_000);
    assert_eq!(&buffer[..200], &data[..]);

    let stats = allocator.stats();
    assert_eq!(stats.pinned_allocs, 2);
    assert_eq!(stats.live_pinned_allocations(), 1);
}

#[test]
fn test_resize_discard_within_capacity_keeps_data() {
    let (device, _) = emulated_device();
    let mut buffer = HostBuffer::from_slice(&device, &[7u8, 8, 9]).unwrap();
    let ptr = buffer.host_ptr();

    buffer.resize_discard(1).unwrap();
    buffer.resize_discard(3).unwrap();
    assert_eq!(buffer.host_ptr(), ptr);
    assert_eq!(buffer.as_slice(), [7, 8, 9]);
}

#[test]
fn test_clear() {
    let (device, _) = emulated_device();
    let mut buffer = HostBuffer::from_slice(&device, &[Vec3 { x: 1.0, y: 2.0, z: 3.0 }; 4]).unwrap();
    buffer.clear();
    assert!(buffer.iter().all(|v| *v == Vec3::zeroed()));
}

#[test]
fn test_copy_from_pinned_sides() {
    let (device, _) = emulated_device();
    let stream = device.default_stream();
    let mut pinned = PinnedBuffer::<i32>::with_len(&device, 2).unwrap();
    pinned.copy_from_slice(&[-1, -2]);
    pinned.upload(&stream).unwrap();
    pinned.clear_host();

    let mut host = HostBuffer::new(&device);
    host.copy_from_pinned(&pinned, Side::Host, &stream).unwrap();
    assert_eq!(host.as_slice(), [0, 0]);

    host.copy_from_pinned(&pinned, Side::Device, &stream).unwrap();
    stream.synchronize().unwrap();
    assert_eq!(host.as_slice(), [-1, -2]);
}

#[test]
fn test_try_clone_and_take() {
    let (device, allocator) = emulated_device();
    let mut original = HostBuffer::from_slice(&device, &[1u16, 2, 3]).unwrap();
    let clone = original.try_clone().unwrap();
    original[0] = 100;
    assert_eq!(clone.as_slice(), [1, 2, 3]);

    let moved = original.take();
    assert!(original.is_empty());
    assert!(original.host_ptr().is_null());
    assert_eq!(moved.as_slice(), [100, 2, 3]);
    assert_eq!(allocator.stats().live_pinned_allocations(), 2);
}

#[test]
fn test_generic_copy_widening() {
    let source = device_buffer(&[1u32, 2, 3, 4, 5, 6]);
    let mut target = HostBuffer::<[u32; 2]>::new(source.device());

    target.generic_copy(&source, &source.device().default_stream()).unwrap();
    assert_eq!(target.as_slice(), [[1, 2], [3, 4], [5, 6]]);
}

#[test]
fn test_generic_copy_narrowing() {
    let values = [Vec3 { x: 1.0, y: 2.0, z: 3.0 }, Vec3 { x: 4.0, y: 5.0, z: 6.0 }];
    let source = device_buffer(&values);
    let mut target = HostBuffer::<f32>::new(source.device());

    target.generic_copy(&source, &source.device().default_stream()).unwrap();
    assert_eq!(target.len(), 6);
    assert_eq!(target.as_slice(), bytemuck::cast_slice::<Vec3, f32>(&values));
}

#[test_case(5; "odd_count")]
#[test_case(1; "single")]
fn test_generic_copy_rejects_partial_elements(count: u32) {
    let data: Vec<u32> = (0..count).collect();
    let source = device_buffer(&data);
    let mut target = HostBuffer::<u64>::new(source.device());

    let err = target.generic_copy(&source, &source.device().default_stream()).unwrap_err();
    assert!(matches!(err, Error::IncompatibleElementSize { source_size: 4, target_size: 8, .. }));
    assert!(err.to_string().contains("incompatible underlying datatype sizes"));
    assert!(target.is_empty());
}

#[test]
fn test_generic_copy_rejects_unrelated_sizes() {
    let source = device_buffer(&[Vec3::zeroed(); 8]);
    let mut target = HostBuffer::<u64>::new(source.device());

    let err = target.generic_copy(&source, &source.device().default_stream()).unwrap_err();
    assert!(matches!(err, Error::IncompatibleElementSize { source_size: 12, target_size: 8, source_len: 8 }));
}

#[test]
fn test_generic_copy_of_empty_source() {
    let (device, allocator) = emulated_device();
    let source = DeviceBuffer::<u32>::new(&device);
    let mut target = HostBuffer::<u8>::new(&device);

    target.generic_copy(&source, &device.default_stream()).unwrap();
    assert!(target.is_empty());
    assert_eq!(allocator.stats().transfers, 0);
}
