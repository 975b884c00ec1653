//! Integration tests for descriptor pool growth and recycling.

use kiln_rhi::descriptor::{DescriptorLayoutBuilder, PoolSizeRatio};
use kiln_rhi::descriptor_allocator::{DescriptorAllocator, MAX_SETS_PER_POOL};
use kiln_rhi::descriptor_writer::DescriptorWriter;
use kiln_rhi::testing::FakeDevice;
use kiln_rhi::{RhiError, vk};

fn ratios() -> Vec<PoolSizeRatio> {
    vec![
        PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 1.0),
        PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 2.0),
    ]
}

#[test]
fn test_exhaustion_grows_into_new_pool() {
    let device = FakeDevice::new();
    let layout = DescriptorLayoutBuilder::new()
        .add_binding(0, vk::DescriptorType::STORAGE_IMAGE)
        .build(device.clone(), vk::ShaderStageFlags::COMPUTE)
        .unwrap();
    let mut allocator = DescriptorAllocator::new(device.clone(), 10, &ratios()).unwrap();

    for _ in 0..10 {
        allocator.allocate(layout.handle()).unwrap();
    }
    assert_eq!(allocator.pool_count(), 1);

    // The eleventh set overflows into a fresh pool of 15
    allocator.allocate(layout.handle()).unwrap();
    assert_eq!(device.descriptor_pool_capacities(), vec![10, 15]);
    assert_eq!(allocator.full_pool_count(), 1);
    assert_eq!(allocator.ready_pool_count(), 1);
    assert_eq!(allocator.sets_per_pool(), 22);
}

#[test]
fn test_growth_is_monotonic_and_capped() {
    let device = FakeDevice::new();
    let mut allocator = DescriptorAllocator::new(device.clone(), 10, &ratios()).unwrap();

    // One forced failure per call retires the current pool every time
    for _ in 0..20 {
        device.fail_next_descriptor_allocations(1);
        allocator.allocate(vk::DescriptorSetLayout::null()).unwrap();
    }

    let capacities = device.descriptor_pool_capacities();
    assert_eq!(capacities.len(), 21);
    assert!(capacities.windows(2).all(|w| w[0] <= w[1]));
    assert!(capacities.iter().all(|&c| c <= MAX_SETS_PER_POOL));
    assert_eq!(*capacities.last().unwrap(), MAX_SETS_PER_POOL);
    assert_eq!(allocator.sets_per_pool(), MAX_SETS_PER_POOL);
}

#[test]
fn test_second_failure_is_exhaustion_and_keeps_partition() {
    let device = FakeDevice::new();
    let mut allocator = DescriptorAllocator::new(device.clone(), 4, &ratios()).unwrap();
    device.fail_next_descriptor_allocations(2);

    let err = allocator
        .allocate(vk::DescriptorSetLayout::null())
        .unwrap_err();
    assert!(matches!(err, RhiError::DescriptorPoolExhausted { .. }));
    assert!(err.is_fatal());

    // Both pools that failed are accounted for in the full list
    assert_eq!(allocator.full_pool_count(), 2);
    assert_eq!(allocator.ready_pool_count(), 0);
    assert_eq!(
        allocator.pool_count(),
        device.descriptor_pool_capacities().len()
    );
}

#[test]
fn test_reset_merges_full_pools_and_is_idempotent() {
    let device = FakeDevice::new();
    let mut allocator = DescriptorAllocator::new(device.clone(), 2, &ratios()).unwrap();
    for _ in 0..5 {
        allocator.allocate(vk::DescriptorSetLayout::null()).unwrap();
    }
    let pools = allocator.pool_count();
    assert!(allocator.full_pool_count() > 0);

    allocator.reset_pools().unwrap();
    assert_eq!(allocator.full_pool_count(), 0);
    assert_eq!(allocator.ready_pool_count(), pools);

    allocator.reset_pools().unwrap();
    assert_eq!(allocator.ready_pool_count(), pools);
    assert_eq!(allocator.pool_count(), pools);

    // Reset pools are reused before any new one is created
    let created = device.descriptor_pool_capacities().len();
    allocator.allocate(vk::DescriptorSetLayout::null()).unwrap();
    assert_eq!(device.descriptor_pool_capacities().len(), created);
}

#[test]
fn test_allocate_then_write_in_one_batch() {
    let device = FakeDevice::new();
    let layout = DescriptorLayoutBuilder::new()
        .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
        .add_binding(1, vk::DescriptorType::STORAGE_IMAGE)
        .build(
            device.clone(),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        )
        .unwrap();
    let mut allocator = DescriptorAllocator::new(device.clone(), 4, &ratios()).unwrap();
    let set = allocator.allocate(layout.handle()).unwrap();

    let mut writer = DescriptorWriter::new();
    writer
        .write_buffer(
            0,
            vk::Buffer::null(),
            256,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
        )
        .write_image(
            1,
            vk::ImageView::null(),
            vk::Sampler::null(),
            vk::ImageLayout::GENERAL,
            vk::DescriptorType::STORAGE_IMAGE,
        );
    writer.update_set(device.as_ref(), set);

    let batches = device.descriptor_writes();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].iter().all(|w| w.set == set));
}
