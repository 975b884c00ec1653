//! Physical device (GPU) selection.
//!
//! A GPU qualifies when it exposes Vulkan 1.3 with `synchronization2` and
//! `dynamic_rendering`, supports the swapchain extension, and has a graphics
//! family plus a family that can present to the target surface. Among the
//! qualifying GPUs, discrete parts win, then the one with the most
//! device-local memory.

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::RhiError;

/// Queue family indices used by kiln.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Family used for graphics, transfer and immediate submissions.
    pub graphics_family: Option<u32>,
    /// Family used for presentation.
    pub present_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// True when both families were found.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// Distinct family indices, graphics first.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(2);
        for family in [self.graphics_family, self.present_family]
            .into_iter()
            .flatten()
        {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Information about the selected GPU.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version).
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types.
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue family indices.
    pub queue_families: QueueFamilyIndices,
}

impl PhysicalDeviceInfo {
    /// Returns the device name.
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    /// Total size of device-local heaps in bytes.
    pub fn device_local_memory(&self) -> u64 {
        let heaps = &self.memory_properties.memory_heaps
            [..self.memory_properties.memory_heap_count as usize];
        heaps
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.properties.device_type)
            .field("queue_families", &self.queue_families)
            .finish()
    }
}

/// Picks the best GPU able to render to `surface`.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] when no device meets the requirements.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Result<PhysicalDeviceInfo, RhiError> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    info!("Found {} GPU(s)", devices.len());

    let best = devices
        .into_iter()
        .filter_map(|device| check_device(instance, device, surface, surface_loader))
        .max_by_key(rate_device);

    match best {
        Some(info) => {
            info!(
                "Selected GPU '{}' ({:?}, {} MiB device-local)",
                info.device_name(),
                info.properties.device_type,
                info.device_local_memory() / (1024 * 1024)
            );
            Ok(info)
        }
        None => {
            warn!("No GPU supports Vulkan 1.3 with synchronization2 and a present queue");
            Err(RhiError::NoSuitableGpu)
        }
    }
}

fn check_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let name = properties
        .device_name_as_c_str()
        .unwrap_or(c"unknown")
        .to_string_lossy()
        .into_owned();

    if properties.api_version < vk::API_VERSION_1_3 {
        debug!("GPU '{}' skipped: Vulkan 1.3 not supported", name);
        return None;
    }

    let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut features_1_3);
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    let sampler_anisotropy = features.features.sampler_anisotropy;
    if features_1_3.synchronization2 == vk::FALSE || features_1_3.dynamic_rendering == vk::FALSE
    {
        debug!("GPU '{}' skipped: synchronization2/dynamic_rendering missing", name);
        return None;
    }
    if sampler_anisotropy == vk::FALSE {
        debug!("GPU '{}' skipped: sampler anisotropy missing", name);
        return None;
    }

    if !supports_swapchain(instance, device) {
        debug!("GPU '{}' skipped: no VK_KHR_swapchain", name);
        return None;
    }

    let queue_families = find_queue_families(instance, device, surface, surface_loader);
    if !queue_families.is_complete() {
        debug!("GPU '{}' skipped: incomplete queue families", name);
        return None;
    }

    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

    Some(PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_families,
    })
}

fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let extensions = match unsafe { instance.enumerate_device_extension_properties(device) } {
        Ok(extensions) => extensions,
        Err(_) => return false,
    };
    extensions
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(ash::khr::swapchain::NAME))
}

fn find_queue_families(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> QueueFamilyIndices {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let mut indices = QueueFamilyIndices::default();

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        if family.queue_count == 0 {
            continue;
        }

        let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let present = unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        };

        // One family doing both avoids concurrent sharing on swapchain images.
        if graphics && present {
            return QueueFamilyIndices {
                graphics_family: Some(index),
                present_family: Some(index),
            };
        }
        if graphics && indices.graphics_family.is_none() {
            indices.graphics_family = Some(index);
        }
        if present && indices.present_family.is_none() {
            indices.present_family = Some(index);
        }
    }

    indices
}

fn rate_device(info: &PhysicalDeviceInfo) -> u64 {
    let type_score: u64 = match info.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        _ => 1,
    };
    // Type dominates; memory (in MiB) breaks ties.
    (type_score << 40) + info.device_local_memory() / (1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_family_indices_default_incomplete() {
        let indices = QueueFamilyIndices::default();
        assert!(!indices.is_complete());
        assert!(indices.unique_families().is_empty());
    }

    #[test]
    fn test_unique_families_shared_family() {
        let indices = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(0),
        };
        assert!(indices.is_complete());
        assert_eq!(indices.unique_families(), vec![0]);
    }

    #[test]
    fn test_unique_families_split_family() {
        let indices = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(2),
        };
        assert_eq!(indices.unique_families(), vec![0, 2]);
    }

    #[test]
    fn test_rate_device_prefers_discrete() {
        let mut discrete = PhysicalDeviceInfo {
            device: vk::PhysicalDevice::null(),
            properties: vk::PhysicalDeviceProperties::default(),
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
            queue_families: QueueFamilyIndices::default(),
        };
        discrete.properties.device_type = vk::PhysicalDeviceType::DISCRETE_GPU;

        let mut integrated = discrete.clone();
        integrated.properties.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        integrated.memory_properties.memory_heap_count = 1;
        integrated.memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: 64 * 1024 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };

        assert!(rate_device(&discrete) > rate_device(&integrated));
        assert_eq!(integrated.device_local_memory(), 64 * 1024 * 1024 * 1024);
    }
}
