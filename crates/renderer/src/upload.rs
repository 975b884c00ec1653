//! Staged uploads through the immediate path.
//!
//! Every helper writes the data into a host-visible staging buffer, records
//! the copy with [`ImmediateSubmitter::submit_and_wait`], and drops the
//! staging buffer once the GPU has finished with it.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use tracing::debug;

use kiln_rhi::buffer::{Buffer, BufferUsage};
use kiln_rhi::command::CommandBuffer;
use kiln_rhi::gpu::GpuDevice;
use kiln_rhi::image::{CUBE_FACES, Image, ImageDesc};
use kiln_rhi::{RhiError, RhiResult};

use crate::immediate::ImmediateSubmitter;

/// Vertex and index buffers of one mesh on the GPU.
pub struct GpuMesh<D: GpuDevice> {
    pub vertices: Buffer<D>,
    pub indices: Buffer<D>,
    pub index_count: u32,
}

/// Creates a buffer for `usage` filled with `data`.
///
/// Host-visible usages are written directly; device-local ones go through a
/// staging copy.
///
/// # Errors
///
/// Returns [`RhiError::InvalidState`] for empty data, or any creation or
/// submission error.
pub fn upload_buffer<D: GpuDevice>(
    immediate: &mut ImmediateSubmitter<D>,
    device: &Arc<D>,
    usage: BufferUsage,
    data: &[u8],
) -> RhiResult<Buffer<D>> {
    if usage.is_host_visible() {
        return Buffer::new_with_data(device.clone(), usage, data);
    }

    let staging = Buffer::new_with_data(device.clone(), BufferUsage::Staging, data)?;
    let buffer = Buffer::new(device.clone(), usage, data.len() as vk::DeviceSize)?;

    immediate.submit_and_wait(|cmd| {
        let region = [vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: data.len() as vk::DeviceSize,
        }];
        cmd.copy_buffer(staging.handle(), buffer.handle(), &region);
    })?;

    debug!("Uploaded {} bytes into {} buffer", data.len(), usage.name());
    Ok(buffer)
}

/// Uploads a mesh with one staging buffer and one submission.
///
/// # Errors
///
/// Returns [`RhiError::InvalidState`] if either slice is empty, or any
/// creation or submission error.
pub fn upload_mesh<D: GpuDevice, V: Pod>(
    immediate: &mut ImmediateSubmitter<D>,
    device: &Arc<D>,
    vertices: &[V],
    indices: &[u32],
) -> RhiResult<GpuMesh<D>> {
    let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
    let index_bytes: &[u8] = bytemuck::cast_slice(indices);
    if vertex_bytes.is_empty() || index_bytes.is_empty() {
        return Err(RhiError::InvalidState(
            "mesh upload needs vertices and indices".to_string(),
        ));
    }

    let vertex_size = vertex_bytes.len() as vk::DeviceSize;
    let index_size = index_bytes.len() as vk::DeviceSize;

    let mut staging = Buffer::new(device.clone(), BufferUsage::Staging, vertex_size + index_size)?;
    staging.write_data(0, vertex_bytes)?;
    staging.write_data(vertex_size, index_bytes)?;

    let vertex_buffer = Buffer::new(device.clone(), BufferUsage::Vertex, vertex_size)?;
    let index_buffer = Buffer::new(device.clone(), BufferUsage::Index, index_size)?;

    immediate.submit_and_wait(|cmd| {
        cmd.copy_buffer(
            staging.handle(),
            vertex_buffer.handle(),
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: vertex_size,
            }],
        );
        cmd.copy_buffer(
            staging.handle(),
            index_buffer.handle(),
            &[vk::BufferCopy {
                src_offset: vertex_size,
                dst_offset: 0,
                size: index_size,
            }],
        );
    })?;

    debug!(
        "Uploaded mesh ({} vertices, {} indices)",
        vertices.len(),
        indices.len()
    );

    Ok(GpuMesh {
        vertices: vertex_buffer,
        indices: index_buffer,
        index_count: indices.len() as u32,
    })
}

/// Creates an image from `desc` and fills it with `data`.
///
/// `data` holds the base mip level of every layer, tightly packed, layer
/// after layer. With `desc.mipmapped` the rest of the chain is generated by
/// blitting. The image ends in `SHADER_READ_ONLY_OPTIMAL`.
///
/// # Errors
///
/// Returns [`RhiError::InvalidState`] if the format has no fixed texel size
/// or `data` is not exactly one base level per layer, or any creation or
/// submission error.
pub fn upload_image<D: GpuDevice>(
    immediate: &mut ImmediateSubmitter<D>,
    device: &Arc<D>,
    data: &[u8],
    desc: &ImageDesc,
    name: &str,
) -> RhiResult<Image<D>> {
    let mut desc = *desc;
    desc.usage |= vk::ImageUsageFlags::TRANSFER_DST;
    if desc.mipmapped {
        desc.usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }

    let layers = desc.layer_count();
    let layer_size = desc.layer_size().ok_or_else(|| {
        RhiError::InvalidState(format!(
            "cannot upload image '{}': {:?} has no fixed texel size",
            name, desc.format
        ))
    })?;
    let expected = layer_size * layers as vk::DeviceSize;
    if data.len() as vk::DeviceSize != expected {
        return Err(RhiError::InvalidState(format!(
            "image '{}' needs {} bytes for {} layer(s), got {}",
            name,
            expected,
            layers,
            data.len()
        )));
    }

    let image = Image::new(device.clone(), &desc, name)?;

    let staging = Buffer::new_with_data(device.clone(), BufferUsage::Staging, data)?;

    let regions: Vec<vk::BufferImageCopy> = (0..layers)
        .map(|layer| {
            vk::BufferImageCopy::default()
                .buffer_offset(layer as vk::DeviceSize * layer_size)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(image.aspect())
                        .mip_level(0)
                        .base_array_layer(layer)
                        .layer_count(1),
                )
                .image_extent(image.extent())
        })
        .collect();

    immediate.submit_and_wait(|cmd| {
        cmd.transition_image(
            image.handle(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        cmd.copy_buffer_to_image(
            staging.handle(),
            image.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &regions,
        );
        if image.mip_levels() > 1 {
            generate_mipmaps(cmd, &image);
        } else {
            cmd.transition_image(
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        }
    })?;

    debug!("Uploaded image '{}' ({} bytes)", name, data.len());
    Ok(image)
}

/// Creates a cube map from six square faces in +X, -X, +Y, -Y, +Z, -Z order.
///
/// # Errors
///
/// Returns [`RhiError::InvalidState`] if the faces differ in size, or any
/// error from [`upload_image`].
pub fn upload_cube_map<D: GpuDevice>(
    immediate: &mut ImmediateSubmitter<D>,
    device: &Arc<D>,
    faces: [&[u8]; CUBE_FACES as usize],
    size: u32,
    format: vk::Format,
    name: &str,
) -> RhiResult<Image<D>> {
    let face_len = faces[0].len();
    if faces.iter().any(|face| face.len() != face_len) {
        return Err(RhiError::InvalidState(format!(
            "cube map '{name}' faces differ in size"
        )));
    }

    let data = faces.concat();
    let desc = ImageDesc::new_cube(size, format, vk::ImageUsageFlags::SAMPLED);
    upload_image(immediate, device, &data, &desc, name)
}

/// Blits each mip level into the next one.
///
/// Expects every level in `TRANSFER_DST_OPTIMAL` with level 0 filled and
/// leaves the whole chain in `SHADER_READ_ONLY_OPTIMAL`.
fn generate_mipmaps<D: GpuDevice>(cmd: &CommandBuffer<D>, image: &Image<D>) {
    let levels = image.mip_levels();
    let layers = image.layer_count();
    let mut size = image.extent_2d();

    for mip in 0..levels {
        let barrier = [vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .image(image.handle())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(mip)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(layers),
            )];
        cmd.pipeline_barrier2(&vk::DependencyInfo::default().image_memory_barriers(&barrier));

        if mip + 1 < levels {
            let half = vk::Extent2D {
                width: (size.width / 2).max(1),
                height: (size.height / 2).max(1),
            };
            let region = [vk::ImageBlit2::default()
                .src_subresource(mip_layers(mip, layers))
                .src_offsets([vk::Offset3D::default(), corner(size)])
                .dst_subresource(mip_layers(mip + 1, layers))
                .dst_offsets([vk::Offset3D::default(), corner(half)])];
            let blit = vk::BlitImageInfo2::default()
                .src_image(image.handle())
                .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .dst_image(image.handle())
                .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .filter(vk::Filter::LINEAR)
                .regions(&region);
            cmd.blit(&blit);
            size = half;
        }
    }

    cmd.transition_image(
        image.handle(),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );
}

fn mip_layers(mip: u32, layers: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(mip)
        .base_array_layer(0)
        .layer_count(layers)
}

fn corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kiln_rhi::testing::FakeDevice;

    fn submitter(device: &Arc<FakeDevice>) -> ImmediateSubmitter<FakeDevice> {
        ImmediateSubmitter::new(device.clone(), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_upload_storage_buffer_copies_through_staging() {
        let device = FakeDevice::new();
        let mut immediate = submitter(&device);

        let buffer =
            upload_buffer(&mut immediate, &device, BufferUsage::Storage, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buffer.size(), 4);
        assert_eq!(immediate.submissions(), 1);
        // submitter pool and fence plus the buffer; staging is gone
        assert_eq!(device.live_objects(), 3);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_upload_host_visible_buffer_skips_submission() {
        let device = FakeDevice::new();
        let mut immediate = submitter(&device);

        let buffer = upload_buffer(&mut immediate, &device, BufferUsage::Uniform, &[9; 16]).unwrap();
        let mut out = [0u8; 16];
        buffer.read_data(0, &mut out).unwrap();
        assert_eq!(out, [9; 16]);
        assert_eq!(immediate.submissions(), 0);
    }

    #[test]
    fn test_upload_mesh_counts_indices() {
        let device = FakeDevice::new();
        let mut immediate = submitter(&device);

        let vertices: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let mesh = upload_mesh(&mut immediate, &device, &vertices, &[0, 1, 2]).unwrap();
        assert_eq!(mesh.index_count, 3);
        assert_eq!(mesh.vertices.size(), 36);
        assert_eq!(mesh.indices.size(), 12);
        assert_eq!(immediate.submissions(), 1);
    }

    #[test]
    fn test_empty_mesh_rejected() {
        let device = FakeDevice::new();
        let mut immediate = submitter(&device);
        let vertices: [[f32; 3]; 0] = [];
        assert!(upload_mesh(&mut immediate, &device, &vertices, &[0]).is_err());
    }

    #[test]
    fn test_upload_image_ends_shader_readable() {
        let device = FakeDevice::new();
        let mut immediate = submitter(&device);
        let desc = ImageDesc::new_2d(
            vk::Extent2D {
                width: 2,
                height: 2,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        );

        let image = upload_image(&mut immediate, &device, &[255; 16], &desc, "white").unwrap();
        let barriers = device.barriers();
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barriers[1].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(barriers.iter().all(|b| b.image == image.handle()));
    }

    #[test]
    fn test_mipmapped_upload_walks_every_level() {
        let device = FakeDevice::new();
        let mut immediate = submitter(&device);
        let desc = ImageDesc::new_2d(
            vk::Extent2D {
                width: 4,
                height: 4,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        )
        .with_mipmaps();

        let image = upload_image(&mut immediate, &device, &[0; 64], &desc, "mips").unwrap();
        assert_eq!(image.mip_levels(), 3);
        // to TRANSFER_DST, one per level, final to SHADER_READ_ONLY
        assert_eq!(device.barriers().len(), 1 + 3 + 1);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_upload_image_rejects_wrong_length() {
        let device = FakeDevice::new();
        let mut immediate = submitter(&device);
        let desc = ImageDesc::new_2d(
            vk::Extent2D {
                width: 64,
                height: 64,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        );

        for len in [4, 64 * 64 * 4 - 1, 64 * 64 * 4 + 4] {
            let data = vec![0u8; len];
            let err = upload_image(&mut immediate, &device, &data, &desc, "short").err().unwrap();
            assert!(matches!(err, RhiError::InvalidState(_)));
        }
        assert_eq!(immediate.submissions(), 0);
        // submitter pool and fence only; no image or staging was created
        assert_eq!(device.live_objects(), 2);
    }

    #[test]
    fn test_upload_image_rejects_compressed_format() {
        let device = FakeDevice::new();
        let mut immediate = submitter(&device);
        let desc = ImageDesc::new_2d(
            vk::Extent2D {
                width: 4,
                height: 4,
            },
            vk::Format::BC7_UNORM_BLOCK,
            vk::ImageUsageFlags::SAMPLED,
        );
        let err = upload_image(&mut immediate, &device, &[0; 16], &desc, "bc7").err().unwrap();
        assert!(matches!(err, RhiError::InvalidState(_)));
    }

    #[test]
    fn test_cube_map_rejects_faces_smaller_than_size() {
        let device = FakeDevice::new();
        let mut immediate = submitter(&device);
        // 2x2 RGBA faces are 16 bytes; these are a quarter of that
        let face = [0u8; 4];
        let faces: [&[u8]; 6] = [&face; 6];

        let err = upload_cube_map(
            &mut immediate,
            &device,
            faces,
            2,
            vk::Format::R8G8B8A8_UNORM,
            "sky",
        )
        .err().unwrap();
        assert!(matches!(err, RhiError::InvalidState(_)));
        assert_eq!(immediate.submissions(), 0);
    }

    #[test]
    fn test_cube_map_rejects_uneven_faces() {
        let device = FakeDevice::new();
        let mut immediate = submitter(&device);
        let big = [0u8; 16];
        let small = [0u8; 8];
        let faces: [&[u8]; 6] = [&big, &big, &big, &big, &big, &small];

        let err = upload_cube_map(
            &mut immediate,
            &device,
            faces,
            2,
            vk::Format::R8G8B8A8_UNORM,
            "sky",
        )
        .err().unwrap();
        assert!(matches!(err, RhiError::InvalidState(_)));
    }

    #[test]
    fn test_cube_map_uploads_six_layers() {
        let device = FakeDevice::new();
        let mut immediate = submitter(&device);
        let face = [128u8; 16];
        let faces: [&[u8]; 6] = [&face; 6];

        let cube = upload_cube_map(
            &mut immediate,
            &device,
            faces,
            2,
            vk::Format::R8G8B8A8_UNORM,
            "sky",
        )
        .unwrap();
        assert_eq!(cube.layer_count(), CUBE_FACES);
    }
}
