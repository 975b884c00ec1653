//! Swapchain management and the presentation seam.
//!
//! # Overview
//!
//! [`PresentTarget`] is what the frame loop renders into: acquire an image,
//! present it, and report when the target no longer matches the surface.
//! [`Swapchain`] is its Vulkan implementation.
//!
//! Out-of-date and suboptimal results are not errors. They surface as
//! [`AcquireOutcome::Stale`] / [`PresentOutcome::Stale`] so the caller can
//! flag a rebuild and carry on.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ash::vk;
//! use kiln_rhi::device::Device;
//! use kiln_rhi::instance::Instance;
//! use kiln_rhi::swapchain::{AcquireOutcome, PresentTarget, Swapchain};
//!
//! # fn example(
//! #     instance: &Instance,
//! #     device: Arc<Device>,
//! #     surface: vk::SurfaceKHR,
//! #     image_ready: vk::Semaphore,
//! # ) -> Result<(), kiln_rhi::RhiError> {
//! let mut swapchain = Swapchain::new(instance, device, surface, 1280, 720, true)?;
//!
//! match swapchain.acquire_next_image(image_ready, Duration::from_secs(1))? {
//!     AcquireOutcome::Ready { image_index, .. } => {
//!         let _target = swapchain.image(image_index);
//!     }
//!     AcquireOutcome::Stale => {
//!         swapchain.recreate(instance, surface, 1280, 720)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::gpu::{GpuDevice, timeout_nanos};
use crate::instance::Instance;

/// Result of asking for the next presentable image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired; the semaphore will be signaled when it is ready.
    Ready {
        image_index: u32,
        /// The image is usable but the target should be rebuilt soon.
        suboptimal: bool,
    },
    /// The target no longer matches the surface. Nothing was signaled.
    Stale,
}

/// Result of presenting an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented or dropped, and the target needs a rebuild.
    Stale,
}

/// Something frames can be presented to.
pub trait PresentTarget {
    /// Acquires the next image, signaling `signal` once it can be written.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`] if no image becomes available within
    /// `timeout`, or the device error on any other failure.
    fn acquire_next_image(
        &mut self,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> RhiResult<AcquireOutcome>;

    /// Queues image `image_index` for presentation after `wait` is signaled.
    ///
    /// # Errors
    ///
    /// Returns the device error for failures other than a stale target.
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> RhiResult<PresentOutcome>;

    /// Image handle for an index returned by acquire.
    fn image(&self, image_index: u32) -> vk::Image;

    /// Default view of an acquired image.
    fn image_view(&self, image_index: u32) -> vk::ImageView;

    fn extent(&self) -> vk::Extent2D;

    fn format(&self) -> vk::Format;
}

/// Surface capabilities, formats and present modes.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// Queries what `surface` supports on `physical_device`.
    ///
    /// # Errors
    ///
    /// Returns an error if any surface query fails.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> RhiResult<Self> {
        let (capabilities, formats, present_modes) = unsafe {
            (
                surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?,
                surface_loader.get_physical_device_surface_formats(physical_device, surface)?,
                surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            )
        };

        debug!(
            "Surface supports {} format(s), {} present mode(s), min {} image(s)",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// At least one format and one present mode.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Vulkan swapchain with one view per image.
///
/// Images are created with `COLOR_ATTACHMENT | TRANSFER_DST` so frames can
/// either render into them directly or blit an offscreen target onto them.
pub struct Swapchain {
    device: Arc<Device>,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    vsync: bool,
}

impl Swapchain {
    /// Creates a swapchain for `surface`.
    ///
    /// `vsync` selects FIFO; otherwise MAILBOX, then IMMEDIATE, are preferred
    /// when available.
    ///
    /// # Errors
    ///
    /// Returns an error if the surface cannot be queried, supports no format,
    /// or swapchain or view creation fails.
    pub fn new(
        instance: &Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> RhiResult<Self> {
        Self::create(
            instance,
            device,
            surface,
            width,
            height,
            vsync,
            vk::SwapchainKHR::null(),
        )
    }

    fn create(
        instance: &Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        vsync: bool,
        old_swapchain: vk::SwapchainKHR,
    ) -> RhiResult<Self> {
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());
        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());

        let support =
            SwapchainSupportDetails::query(device.physical_device(), surface, &surface_loader)?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "surface reports no formats or present modes".to_string(),
            ));
        }

        let surface_format = choose_surface_format(&support.formats)?;
        let present_mode = choose_present_mode(&support.present_modes, vsync);
        let extent = choose_extent(&support.capabilities, width, height);
        let image_count = determine_image_count(&support.capabilities);

        let families = device.queue_families();
        let (graphics_family, present_family) =
            match (families.graphics_family, families.present_family) {
                (Some(graphics), Some(present)) => (graphics, present),
                _ => return Err(RhiError::NoSuitableGpu),
            };
        let shared_families = [graphics_family, present_family];
        let (sharing_mode, family_indices) = if graphics_family != present_family {
            (vk::SharingMode::CONCURRENT, &shared_families[..])
        } else {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None)? };
        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };
        let image_views = match create_image_views(&device, &images, surface_format.format) {
            Ok(views) => views,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        info!(
            "Swapchain created: {}x{}, {:?}, {:?}, {} image(s)",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            images.len()
        );

        Ok(Self {
            device,
            swapchain_loader,
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
            present_mode,
            vsync,
        })
    }

    /// Rebuilds the swapchain for a new window size.
    ///
    /// The caller waits for the device to be idle first; no submitted work
    /// may still reference the old images.
    ///
    /// # Errors
    ///
    /// Returns an error if the new swapchain cannot be created. The old one
    /// stays valid in that case.
    pub fn recreate(
        &mut self,
        instance: &Instance,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
    ) -> RhiResult<()> {
        info!("Recreating swapchain at {}x{}", width, height);
        let rebuilt = Self::create(
            instance,
            self.device.clone(),
            surface,
            width,
            height,
            self.vsync,
            self.swapchain,
        )?;
        // The retired swapchain and its views are released as `rebuilt` takes its place.
        drop(std::mem::replace(self, rebuilt));
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }
}

impl PresentTarget for Swapchain {
    fn acquire_next_image(
        &mut self,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> RhiResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_nanos(timeout),
                signal,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                warn!("Swapchain out of date on acquire");
                Ok(AcquireOutcome::Stale)
            }
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(RhiError::Timeout {
                operation: "swapchain acquire",
                waited: timeout,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> RhiResult<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader
                .queue_present(self.device.present_queue(), &present_info)
        };
        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                warn!("Swapchain stale on present");
                Ok(PresentOutcome::Stale)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// # Panics
    ///
    /// Panics if `image_index` was not returned by acquire.
    #[inline]
    fn image(&self, image_index: u32) -> vk::Image {
        self.images[image_index as usize]
    }

    /// # Panics
    ///
    /// Panics if `image_index` was not returned by acquire.
    #[inline]
    fn image_view(&self, image_index: u32) -> vk::ImageView {
        self.image_views[image_index as usize]
    }

    #[inline]
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        for view in self.image_views.drain(..) {
            self.device.destroy_image_view(view);
        }
        unsafe { self.swapchain_loader.destroy_swapchain(self.swapchain, None) };
        debug!(
            "Swapchain destroyed ({}x{}, {} image(s))",
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
    }
}

/// Prefers a UNORM BGRA format so frames can be blitted onto the image
/// without an extra encode, then its sRGB twin, then whatever comes first.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> RhiResult<vk::SurfaceFormatKHR> {
    let find = |format: vk::Format| {
        formats.iter().copied().find(|f| {
            f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
    };

    if let Some(format) = find(vk::Format::B8G8R8A8_UNORM) {
        return Ok(format);
    }
    if let Some(format) = find(vk::Format::B8G8R8A8_SRGB) {
        warn!("B8G8R8A8_UNORM unavailable, presenting to B8G8R8A8_SRGB");
        return Ok(format);
    }
    let first = formats
        .first()
        .copied()
        .ok_or_else(|| RhiError::SwapchainError("no surface formats".to_string()))?;
    warn!("Using first available surface format {:?}", first.format);
    Ok(first)
}

fn choose_present_mode(present_modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync {
        for mode in [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE] {
            if present_modes.contains(&mode) {
                return mode;
            }
        }
        debug!("No low-latency present mode, falling back to FIFO");
    }
    // FIFO is always supported.
    vk::PresentModeKHR::FIFO
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One image above the minimum, within the maximum (0 means unbounded).
fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

fn create_image_views(
    device: &Device,
    images: &[vk::Image],
    format: vk::Format,
) -> RhiResult<Vec<vk::ImageView>> {
    let mut views = Vec::with_capacity(images.len());

    for (i, &image) in images.iter().enumerate() {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );

        match device.create_image_view(&create_info) {
            Ok(view) => views.push(view),
            Err(e) => {
                for view in views {
                    device.destroy_image_view(view);
                }
                return Err(RhiError::SwapchainError(format!(
                    "failed to create view for swapchain image {i}: {e}"
                )));
            }
        }
    }

    Ok(views)
}
