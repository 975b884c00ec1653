//! Batched descriptor set writes.
//!
//! [`DescriptorWriter`] collects buffer and image writes, then applies them
//! to a set with a single `vkUpdateDescriptorSets` call. The writer can be
//! reused: [`clear`](DescriptorWriter::clear) it and record the next batch.

use std::slice;

use ash::vk;

use crate::descriptor::{buffer_info, image_info};
use crate::gpu::GpuDevice;

#[derive(Clone, Debug)]
enum PendingWrite {
    Buffer {
        binding: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    },
    Images {
        binding: u32,
        ty: vk::DescriptorType,
        infos: Vec<vk::DescriptorImageInfo>,
    },
}

/// Accumulates descriptor writes for one set.
#[derive(Clone, Debug, Default)]
pub struct DescriptorWriter {
    writes: Vec<PendingWrite>,
    staged_images: Vec<vk::DescriptorImageInfo>,
}

impl DescriptorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a buffer write of `size` bytes at `offset`.
    pub fn write_buffer(
        &mut self,
        binding: u32,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
        ty: vk::DescriptorType,
    ) -> &mut Self {
        self.writes.push(PendingWrite::Buffer {
            binding,
            ty,
            info: buffer_info(buffer, offset, size),
        });
        self
    }

    /// Queues a single image write.
    ///
    /// `sampler` is ignored by the driver for types that do not sample.
    pub fn write_image(
        &mut self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
        ty: vk::DescriptorType,
    ) -> &mut Self {
        self.writes.push(PendingWrite::Images {
            binding,
            ty,
            infos: vec![image_info(view, sampler, layout)],
        });
        self
    }

    /// Stages one element of an image array.
    pub fn stage_image(
        &mut self,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> &mut Self {
        self.staged_images.push(image_info(view, sampler, layout));
        self
    }

    /// Turns every staged image into one array write at `binding`.
    ///
    /// Does nothing if no image is staged.
    pub fn commit_image_array(&mut self, binding: u32, ty: vk::DescriptorType) -> &mut Self {
        if !self.staged_images.is_empty() {
            let infos = std::mem::take(&mut self.staged_images);
            self.writes.push(PendingWrite::Images { binding, ty, infos });
        }
        self
    }

    /// Drops every pending and staged write.
    pub fn clear(&mut self) {
        self.writes.clear();
        self.staged_images.clear();
    }

    /// Number of writes the next update will issue.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Applies every pending write to `set` in one device call.
    ///
    /// Pending writes are kept, so the same batch can target several sets.
    pub fn update_set<D: GpuDevice>(&self, device: &D, set: vk::DescriptorSet) {
        if self.writes.is_empty() {
            return;
        }

        let writes: Vec<vk::WriteDescriptorSet<'_>> = self
            .writes
            .iter()
            .map(|pending| match pending {
                PendingWrite::Buffer { binding, ty, info } => vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .buffer_info(slice::from_ref(info)),
                PendingWrite::Images { binding, ty, infos } => vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .image_info(infos),
            })
            .collect();

        device.update_descriptor_sets(&writes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    #[test]
    fn test_commit_image_array_consumes_staged() {
        let mut writer = DescriptorWriter::new();
        writer
            .stage_image(
                vk::ImageView::null(),
                vk::Sampler::null(),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .stage_image(
                vk::ImageView::null(),
                vk::Sampler::null(),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .commit_image_array(2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(writer.len(), 1);

        // Nothing staged, nothing queued
        writer.commit_image_array(3, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_update_set_issues_one_batched_call() {
        let device = FakeDevice::new();
        let mut writer = DescriptorWriter::new();
        writer
            .write_buffer(
                0,
                vk::Buffer::null(),
                64,
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

        writer.update_set(device.as_ref(), vk::DescriptorSet::null());

        let batches = device.descriptor_writes();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].binding, 0);
        assert_eq!(batch[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(batch[0].count, 1);
        assert_eq!(batch[1].ty, vk::DescriptorType::STORAGE_IMAGE);
    }

    #[test]
    fn test_clear_then_update_is_noop() {
        let device = FakeDevice::new();
        let mut writer = DescriptorWriter::new();
        writer.write_buffer(
            0,
            vk::Buffer::null(),
            16,
            0,
            vk::DescriptorType::STORAGE_BUFFER,
        );
        writer.clear();
        assert!(writer.is_empty());

        writer.update_set(device.as_ref(), vk::DescriptorSet::null());
        assert!(device.descriptor_writes().is_empty());
    }
}
