// Vulkan Device - physical device selection and logical device
//
// Responsibilities:
// - Describe every physical device as a `PhysicalDeviceCandidate`
// - First-fit selection in enumeration order (no scoring)
// - Logical device + graphics / present queue creation

use ash::extensions::khr;
use ash::vk;
use std::ffi::{c_char, CStr};

use super::instance::{missing_names, raw_name};
use super::{Surface, SwapchainSupport, VulkanInstance};
use crate::error::{RenderError, RenderResult};

pub fn required_device_extensions() -> [&'static CStr; 1] {
    [khr::Swapchain::name()]
}

/// Graphics and present queue families. Usable only when both are known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// `(graphics, present)` when both are known.
    pub fn resolved(&self) -> Option<(u32, u32)> {
        Some((self.graphics?, self.present?))
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut families: Vec<u32> = self.graphics.into_iter().chain(self.present).collect();
        families.dedup();
        families
    }
}

/// Walk the families in order, stopping once both roles are covered.
///
/// A later family that can do both replaces an earlier graphics-only match,
/// so a shared queue is found when it appears before the scan completes.
pub fn find_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> RenderResult<QueueFamilyIndices>
where
    F: FnMut(u32) -> RenderResult<bool>,
{
    let mut indices = QueueFamilyIndices::default();

    for (i, family) in families.iter().enumerate() {
        let index = i as u32;

        if family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = Some(index);
        }

        if family.queue_count > 0 && supports_present(index)? {
            indices.present = Some(index);
        }

        if indices.is_complete() {
            break;
        }
    }

    Ok(indices)
}

/// A GPU plus everything selection needs to know about it. Never mutated.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub api_version: u32,
    pub queue_families: QueueFamilyIndices,
    pub extensions: Vec<String>,
    pub support: SwapchainSupport,
}

impl PhysicalDeviceCandidate {
    pub fn query(
        instance: &ash::Instance,
        surface: &Surface,
        handle: vk::PhysicalDevice,
    ) -> RenderResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(handle) };

        let queue_families =
            find_queue_families(&families, |index| surface.supports_present(handle, index))?;

        let extensions = unsafe { instance.enumerate_device_extension_properties(handle) }
            .map_err(|e| RenderError::NoSuitableDevice(format!("extension query failed: {:?}", e)))?
            .iter()
            .map(|ext| raw_name(&ext.extension_name))
            .collect();

        Ok(Self {
            handle,
            name: raw_name(&properties.device_name),
            api_version: properties.api_version,
            queue_families,
            extensions,
            support: SwapchainSupport::query(surface, handle)?,
        })
    }

    /// Why this device cannot be used, or `None` if it can.
    pub fn rejection(&self, required_extensions: &[&CStr]) -> Option<String> {
        if self.queue_families.graphics.is_none() {
            return Some("no graphics queue family".to_string());
        }
        if self.queue_families.present.is_none() {
            return Some("no queue family can present to the surface".to_string());
        }
        let missing = missing_names(required_extensions, &self.extensions);
        if !missing.is_empty() {
            return Some(format!("missing extensions: {}", missing.join(", ")));
        }
        if self.support.formats.is_empty() {
            return Some("surface reports no formats".to_string());
        }
        if self.support.present_modes.is_empty() {
            return Some("surface reports no present modes".to_string());
        }
        None
    }
}

/// Return the first suitable candidate in enumeration order.
///
/// Candidates are pulled lazily, so nothing past the chosen device is queried.
/// A candidate whose queries failed is skipped like any other unsuitable one.
pub fn select_first_suitable<I>(
    candidates: I,
    required_extensions: &[&CStr],
) -> RenderResult<PhysicalDeviceCandidate>
where
    I: IntoIterator<Item = RenderResult<PhysicalDeviceCandidate>>,
{
    let mut checked = 0usize;

    for candidate in candidates {
        checked += 1;
        let candidate = match candidate {
            Ok(candidate) => candidate,
            Err(e) => {
                log::debug!("Skipping GPU #{}: {}", checked, e);
                continue;
            }
        };

        match candidate.rejection(required_extensions) {
            None => return Ok(candidate),
            Some(reason) => log::debug!("Skipping GPU '{}': {}", candidate.name, reason),
        }
    }

    if checked == 0 {
        Err(RenderError::NoSuitableDevice("no Vulkan-capable GPU found".to_string()))
    } else {
        Err(RenderError::NoSuitableDevice(format!(
            "none of {} GPU(s) meets the requirements",
            checked
        )))
    }
}

/// Logical device and its two queues (the same handle when the families coincide).
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_family: u32,
    pub present_family: u32,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
}

impl VulkanDevice {
    /// Select a GPU for `surface` and create the logical device on it.
    ///
    /// The chosen candidate is returned too, since its surface facts seed the swapchain.
    pub fn new(
        instance: &VulkanInstance,
        surface: &Surface,
    ) -> RenderResult<(Self, PhysicalDeviceCandidate)> {
        let devices = unsafe { instance.instance.enumerate_physical_devices() }
            .map_err(|e| RenderError::NoSuitableDevice(format!("enumeration failed: {:?}", e)))?;

        let required = required_device_extensions();
        let candidate = select_first_suitable(
            devices
                .into_iter()
                .map(|pd| PhysicalDeviceCandidate::query(&instance.instance, surface, pd)),
            &required,
        )?;

        let (graphics_family, present_family) = candidate
            .queue_families
            .resolved()
            .ok_or_else(|| RenderError::NoSuitableDevice("incomplete queue families".to_string()))?;

        log::info!("Selected GPU: {}", candidate.name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(candidate.api_version),
            vk::api_version_minor(candidate.api_version),
            vk::api_version_patch(candidate.api_version)
        );
        log::info!(
            "Queue families: graphics={}, present={}",
            graphics_family,
            present_family
        );

        let device = Self::create_logical_device(
            instance,
            candidate.handle,
            &candidate.queue_families,
            &required,
        )?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        Ok((
            Self {
                device,
                physical_device: candidate.handle,
                graphics_family,
                present_family,
                graphics_queue,
                present_queue,
            },
            candidate,
        ))
    }

    fn create_logical_device(
        instance: &VulkanInstance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilyIndices,
        extensions: &[&CStr],
    ) -> RenderResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&features);

        unsafe {
            instance
                .instance
                .create_device(physical_device, &create_info, None)
        }
        .map_err(RenderError::LogicalDeviceCreation)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(RenderError::DeviceWait)
    }

    /// # Safety
    /// Every object created from this device must already be destroyed.
    pub unsafe fn destroy(&self) {
        self.device.destroy_device(None);
    }
}
