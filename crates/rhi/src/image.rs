//! Device-local images and their default views.
//!
//! [`ImageDesc`] describes what to create; [`Image`] owns the image, its
//! memory and one view covering every mip level and layer.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln_rhi::device::Device;
//! use kiln_rhi::image::{Image, ImageDesc};
//! use ash::vk;
//!
//! # fn example(device: Arc<Device>) -> Result<(), kiln_rhi::RhiError> {
//! let desc = ImageDesc::new_2d(
//!     vk::Extent2D { width: 1920, height: 1080 },
//!     vk::Format::R16G16B16A16_SFLOAT,
//!     vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
//! );
//! let draw_target: Image = Image::new(device, &desc, "draw target")?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::gpu::GpuDevice;

/// Faces in a cube map.
pub const CUBE_FACES: u32 = 6;

/// Parameters of an image to create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    /// Allocate a full mip chain.
    pub mipmapped: bool,
    pub array_layers: u32,
    /// Six layers viewed as a cube.
    pub cube: bool,
}

impl ImageDesc {
    /// A single-layer 2D image without mips.
    pub fn new_2d(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            format,
            usage,
            mipmapped: false,
            array_layers: 1,
            cube: false,
        }
    }

    /// A cube map with one square face of `size` per layer.
    pub fn new_cube(size: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent: vk::Extent3D {
                width: size,
                height: size,
                depth: 1,
            },
            format,
            usage,
            mipmapped: false,
            array_layers: CUBE_FACES,
            cube: true,
        }
    }

    pub fn with_mipmaps(mut self) -> Self {
        self.mipmapped = true;
        self
    }

    /// Mip levels the image is created with.
    pub fn mip_levels(&self) -> u32 {
        if self.mipmapped {
            mip_count(self.extent.width, self.extent.height)
        } else {
            1
        }
    }

    /// Aspect of the default view.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        if self.format == vk::Format::D32_SFLOAT {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    /// Array layers the image is created with.
    pub fn layer_count(&self) -> u32 {
        if self.cube {
            CUBE_FACES
        } else {
            self.array_layers.max(1)
        }
    }

    /// Bytes of one tightly packed layer of the base mip level, or `None`
    /// for formats without a fixed texel size.
    pub fn layer_size(&self) -> Option<vk::DeviceSize> {
        let texel = texel_size(self.format)?;
        Some(
            texel
                * self.extent.width as vk::DeviceSize
                * self.extent.height as vk::DeviceSize
                * self.extent.depth.max(1) as vk::DeviceSize,
        )
    }

    fn view_type(&self) -> vk::ImageViewType {
        if self.cube {
            vk::ImageViewType::CUBE
        } else if self.layer_count() > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        }
    }
}

/// Size in bytes of one texel of an uncompressed `format`.
///
/// Returns `None` for block-compressed, multi-planar and unlisted formats.
pub fn texel_size(format: vk::Format) -> Option<vk::DeviceSize> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM
        | vk::Format::R8G8_SNORM
        | vk::Format::R8G8_UINT
        | vk::Format::R16_UNORM
        | vk::Format::R16_SFLOAT
        | vk::Format::R16_UINT
        | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::E5B9G9R9_UFLOAT_PACK32
        | vk::Format::R16G16_UNORM
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT => 4,
        vk::Format::R16G16B16A16_UNORM
        | vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R16G16B16A16_UINT
        | vk::Format::R32G32_SFLOAT
        | vk::Format::R32G32_UINT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => return None,
    };
    Some(size)
}

/// `floor(log2(max(width, height))) + 1`.
pub fn mip_count(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Device-local image with a default view.
pub struct Image<D: GpuDevice = Device> {
    device: Arc<D>,
    image: vk::Image,
    view: vk::ImageView,
    memory: Option<D::Memory>,
    desc: ImageDesc,
    mip_levels: u32,
}

impl<D: GpuDevice> Image<D> {
    /// Creates the image, binds device-local memory and builds the view.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] for an empty extent or a cube that
    /// is not square, or the device error if creation fails.
    pub fn new(device: Arc<D>, desc: &ImageDesc, name: &str) -> RhiResult<Self> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RhiError::InvalidState(format!(
                "image '{name}' has an empty extent"
            )));
        }
        if desc.cube && desc.extent.width != desc.extent.height {
            return Err(RhiError::InvalidState(format!(
                "cube image '{name}' must have square faces"
            )));
        }

        let mip_levels = desc.mip_levels();
        let layers = desc.layer_count();
        let flags = if desc.cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(mip_levels)
            .array_layers(layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (image, memory) = device.create_image(&create_info, name)?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(desc.view_type())
            .format(desc.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(desc.aspect())
                    .base_mip_level(0)
                    .level_count(mip_levels)
                    .base_array_layer(0)
                    .layer_count(layers),
            );

        let view = match device.create_image_view(&view_info) {
            Ok(view) => view,
            Err(e) => {
                device.destroy_image(image, memory);
                return Err(e);
            }
        };

        debug!(
            "Created image '{}' ({}x{}, {:?}, {} mip(s), {} layer(s))",
            name, desc.extent.width, desc.extent.height, desc.format, mip_levels, layers
        );

        Ok(Self {
            device,
            image,
            view,
            memory: Some(memory),
            desc: *desc,
            mip_levels,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent3D {
        self.desc.extent
    }

    /// Width and height.
    #[inline]
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.extent.width,
            height: self.desc.extent.height,
        }
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    #[inline]
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    #[inline]
    pub fn layer_count(&self) -> u32 {
        self.desc.layer_count()
    }

    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.desc.aspect()
    }

    #[inline]
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }
}

impl<D: GpuDevice> Drop for Image<D> {
    fn drop(&mut self) {
        self.device.destroy_image_view(self.view);
        if let Some(memory) = self.memory.take() {
            self.device.destroy_image(self.image, memory);
        }
        debug!("Destroyed image ({:?})", self.desc.format);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_layer_size_from_texel_size() {
        let rgba = ImageDesc::new_2d(
            extent(64, 32),
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert_eq!(rgba.layer_size(), Some(64 * 32 * 4));

        let cube = ImageDesc::new_cube(
            8,
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert_eq!(cube.layer_size(), Some(8 * 8 * 8));
        assert_eq!(cube.layer_count(), CUBE_FACES);
    }

    #[test]
    fn test_compressed_formats_have_no_texel_size() {
        assert_eq!(texel_size(vk::Format::BC7_UNORM_BLOCK), None);
        assert_eq!(texel_size(vk::Format::D32_SFLOAT), Some(4));
    }

    #[test]
    fn test_mip_count() {
        assert_eq!(mip_count(1, 1), 1);
        assert_eq!(mip_count(2, 1), 2);
        assert_eq!(mip_count(1024, 512), 11);
        assert_eq!(mip_count(1000, 1000), 10);
        assert_eq!(mip_count(0, 0), 1);
    }

    #[test]
    fn test_desc_mip_levels_only_when_mipmapped() {
        let desc = ImageDesc::new_2d(
            extent(256, 128),
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert_eq!(desc.mip_levels(), 1);
        assert_eq!(desc.with_mipmaps().mip_levels(), 9);
    }

    #[test]
    fn test_depth_format_selects_depth_aspect() {
        let depth = ImageDesc::new_2d(
            extent(64, 64),
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        );
        assert_eq!(depth.aspect(), vk::ImageAspectFlags::DEPTH);

        let color = ImageDesc::new_2d(
            extent(64, 64),
            vk::Format::B8G8R8A8_UNORM,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        );
        assert_eq!(color.aspect(), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn test_cube_desc_has_six_layers_and_cube_view() {
        let cube = ImageDesc::new_cube(
            32,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert_eq!(cube.layer_count(), CUBE_FACES);
        assert_eq!(cube.view_type(), vk::ImageViewType::CUBE);
    }

    #[test]
    fn test_image_create_and_drop() {
        let device = FakeDevice::new();
        {
            let desc = ImageDesc::new_2d(
                extent(16, 16),
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED,
            )
            .with_mipmaps();
            let image = Image::new(device.clone(), &desc, "test").unwrap();
            assert_eq!(image.mip_levels(), 5);
            assert_eq!(image.layer_count(), 1);
            // image + view
            assert_eq!(device.live_objects(), 2);
        }
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_non_square_cube_rejected() {
        let device = FakeDevice::new();
        let mut desc = ImageDesc::new_cube(
            32,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        );
        desc.extent.height = 16;
        assert!(Image::new(device, &desc, "bad cube").is_err());
    }
}
