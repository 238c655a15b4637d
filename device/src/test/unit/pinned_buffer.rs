use bytemuck::{Pod, Zeroable};

use crate::test::{emulated_device, limited_device};
use crate::{DeviceBuffer, DevicePtr, Error, GpuContainer, HostBuffer, PinnedBuffer, TransferMode};

/// 12-byte particle record, the typical payload of a mirrored buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct Particle {
    position: [f32; 2],
    id: u32,
}

fn particles(n: u32) -> Vec<Particle> {
    (0..n).map(|i| Particle { position: [i as f32, -(i as f32)], id: i }).collect()
}

#[test]
fn test_round_trip_through_device_buffer() {
    let (device, _) = emulated_device();
    let stream = device.default_stream();
    assert_eq!(size_of::<Particle>(), 12);

    let mut first = PinnedBuffer::<Particle>::new(&device);
    assert!(first.is_empty());
    first.resize_preserve(5, &stream).unwrap();
    first.copy_from_slice(&particles(5));
    first.upload(&stream).unwrap();

    let mut staging = DeviceBuffer::new(&device);
    staging.copy_from_pinned(&first, crate::Side::Device, &stream).unwrap();

    let mut second = PinnedBuffer::<Particle>::new(&device);
    second.copy_from_device(&staging, &stream).unwrap();
    assert!(second.iter().all(|p| *p == Particle::zeroed()), "host side must not change before download");

    second.download(&stream, TransferMode::Blocking).unwrap();
    assert_eq!(second.as_slice(), particles(5));
}

#[test]
fn test_sides_are_independent() {
    let (device, _) = emulated_device();
    let stream = device.default_stream();
    let mut buffer = PinnedBuffer::<u32>::with_len(&device, 4).unwrap();

    buffer.copy_from_slice(&[1, 2, 3, 4]);
    buffer.upload(&stream).unwrap();
    buffer.copy_from_slice(&[5, 6, 7, 8]);
    assert_eq!(buffer.as_slice(), [5, 6, 7, 8], "upload must not touch the host side");

    buffer.download(&stream, TransferMode::Blocking).unwrap();
    assert_eq!(buffer.as_slice(), [1, 2, 3, 4]);

    buffer.clear_host();
    assert_eq!(buffer.as_slice(), [0; 4]);
    buffer.download(&stream, TransferMode::Blocking).unwrap();
    assert_eq!(buffer.as_slice(), [1, 2, 3, 4], "clearing the host side must not touch the device side");

    buffer.clear_device(&stream).unwrap();
    assert_eq!(buffer.as_slice(), [1, 2, 3, 4]);
    buffer.download(&stream, TransferMode::Blocking).unwrap();
    assert_eq!(buffer.as_slice(), [0; 4]);
}

#[test]
fn test_clear_zeroes_both_sides() {
    let (device, _) = emulated_device();
    let stream = device.default_stream();
    let mut buffer = PinnedBuffer::<u64>::with_len(&device, 3).unwrap();
    buffer.copy_from_slice(&[u64::MAX; 3]);
    buffer.upload(&stream).unwrap();

    buffer.clear(&stream).unwrap();
    assert_eq!(buffer.as_slice(), [0; 3]);
    buffer.copy_from_slice(&[1; 3]);
    buffer.download(&stream, TransferMode::Blocking).unwrap();
    assert_eq!(buffer.as_slice(), [0; 3]);
}

#[test]
fn test_download_modes() {
    let (device, _) = emulated_device();
    let stream = device.create_stream().unwrap();
    let mut buffer = PinnedBuffer::<u8>::with_len(&device, 16).unwrap();

    buffer.download(&stream, TransferMode::Async).unwrap();
    assert_eq!(stream.synchronizations(), Some(0));
    buffer.download(&stream, TransferMode::Blocking).unwrap();
    assert_eq!(stream.synchronizations(), Some(1));
    assert_eq!(stream.submitted(), Some(2));
    assert!(!stream.same_stream(&device.default_stream()));
}

#[test]
fn test_resize_preserve_keeps_both_sides() {
    let (device, allocator) = emulated_device();
    let stream = device.default_stream();
    let mut buffer = PinnedBuffer::<u32>::with_len(&device, 3).unwrap();
    buffer.copy_from_slice(&[1, 2, 3]);
    buffer.upload(&stream).unwrap();
    buffer.copy_from_slice(&[4, 5, 6]);

    buffer.resize_preserve(300, &stream).unwrap();
    assert_eq!(buffer.capacity(), 384);
    assert_eq!(&buffer[..3], [4, 5, 6]);

    buffer.resize_discard(3).unwrap();
    buffer.download(&stream, TransferMode::Blocking).unwrap();
    assert_eq!(buffer.as_slice(), [1, 2, 3]);

    let stats = allocator.stats();
    assert_eq!((stats.live_device_allocations(), stats.live_pinned_allocations()), (1, 1));
    assert_eq!(stats.live_device_bytes, stats.live_pinned_bytes);
}

#[test]
fn test_copy_from_pinned_copies_both_sides() {
    let (device, _) = emulated_device();
    let stream = device.default_stream();
    let mut source = PinnedBuffer::<i16>::with_len(&device, 2).unwrap();
    source.copy_from_slice(&[10, 20]);
    source.upload(&stream).unwrap();
    source.copy_from_slice(&[30, 40]);

    let mut target = PinnedBuffer::new(&device);
    target.copy_from_pinned_blocking(&source).unwrap();
    assert_eq!(target.as_slice(), [30, 40]);
    target.download(&stream, TransferMode::Blocking).unwrap();
    assert_eq!(target.as_slice(), [10, 20]);

    let mut device_only = PinnedBuffer::new(&device);
    device_only.copy_device_side_from(&source, &stream).unwrap();
    assert_eq!(device_only.as_slice(), [0, 0]);
    device_only.download(&stream, TransferMode::Blocking).unwrap();
    assert_eq!(device_only.as_slice(), [10, 20]);
}

#[test]
fn test_copy_from_host_touches_host_side_only() {
    let (device, _) = emulated_device();
    let stream = device.default_stream();
    let host = HostBuffer::from_slice(&device, &[3.5f64, 4.5]).unwrap();

    let mut buffer = PinnedBuffer::new(&device);
    buffer.copy_from_host(&host).unwrap();
    assert_eq!(buffer.as_slice(), [3.5, 4.5]);

    buffer.download(&stream, TransferMode::Blocking).unwrap();
    assert_eq!(buffer.as_slice(), [0.0, 0.0]);
}

#[test]
fn test_try_clone_copies_both_sides() {
    let (device, allocator) = emulated_device();
    let stream = device.default_stream();
    let mut original = PinnedBuffer::<u32>::with_len(&device, 2).unwrap();
    original.copy_from_slice(&[1, 2]);
    original.upload(&stream).unwrap();
    original.copy_from_slice(&[3, 4]);

    let mut clone = original.try_clone().unwrap();
    assert_ne!(clone.device_ptr(), original.device_ptr());
    assert_eq!(clone.as_slice(), [3, 4]);
    clone.download(&stream, TransferMode::Blocking).unwrap();
    assert_eq!(clone.as_slice(), [1, 2]);
    assert_eq!(allocator.stats().live_device_allocations(), 2);
}

#[test]
fn test_take_moves_both_allocations() {
    let (device, allocator) = emulated_device();
    let mut source = PinnedBuffer::<u32>::with_len(&device, 7).unwrap();
    let (device_ptr, host_ptr) = (source.device_ptr(), source.host_ptr());

    let moved = source.take();
    assert_eq!((moved.device_ptr(), moved.host_ptr()), (device_ptr, host_ptr));
    assert_eq!(source.device_ptr(), DevicePtr::NULL);
    assert!(source.host_ptr().is_null());
    assert_eq!(source.len(), 0);

    drop(moved);
    let stats = allocator.stats();
    assert_eq!((stats.live_device_allocations(), stats.live_pinned_allocations()), (0, 0));
}

#[test]
fn test_failed_growth_releases_partial_allocation() {
    let (device, allocator) = limited_device(4096);
    let mut buffer = PinnedBuffer::<u32>::with_len(&device, 100).unwrap();
    let (device_ptr, host_ptr) = (buffer.device_ptr(), buffer.host_ptr());

    let err = buffer.resize_discard(2000).unwrap_err();
    assert!(matches!(err, Error::Allocation { requested: 2000, previous: 100, .. }));

    assert_eq!(buffer.len(), 100);
    assert_eq!(buffer.capacity(), 128);
    assert_eq!((buffer.device_ptr(), buffer.host_ptr()), (device_ptr, host_ptr));

    let stats = allocator.stats();
    assert_eq!(stats.pinned_allocs, 2, "host half is allocated first");
    assert_eq!((stats.live_device_allocations(), stats.live_pinned_allocations()), (1, 1));
}

#[test]
fn test_type_erased_access() {
    let (device, _) = emulated_device();
    let mut buffer: Box<dyn GpuContainer> = Box::new(PinnedBuffer::<Particle>::new(&device));
    buffer.resize_discard(10).unwrap();

    assert_eq!(buffer.len(), 10);
    assert_eq!(buffer.element_size(), 12);
    assert!(!buffer.device_ptr().is_null());

    let pinned = PinnedBuffer::<Particle>::with_len(&device, 3).unwrap();
    assert_eq!(pinned.device_ptr_at(2), Some(pinned.device_ptr().byte_add(24)));
    assert_eq!(pinned.device_ptr_at(3), None);

    let sibling = buffer.produce();
    assert!(sibling.is_empty());
    assert!(sibling.device().same_backend(&device));
}
