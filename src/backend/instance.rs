// Vulkan Instance - loader, instance and validation plumbing
//
// Responsibilities:
// - Load the Vulkan library
// - Check requested layers and instance extensions before asking for them
// - Instance creation with optional validation layers
// - Debug messenger routing validation output into `log`

use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

use crate::error::{RenderError, RenderResult};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct VulkanInstance {
    pub entry: Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create the instance.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `enable_validation` - Request the Khronos validation layer
    /// * `display_handle` - Decides which surface extensions are required
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
    ) -> RenderResult<Self> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .map_err(|e| RenderError::LibraryLoad(e.to_string()))?;

        if enable_validation {
            Self::check_validation_layers(&entry)?;
        }

        let extensions = Self::required_extensions(&entry, enable_validation, display_handle)?;
        let instance = Self::create_instance(&entry, app_name, enable_validation, &extensions)?;

        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }

    fn check_validation_layers(entry: &Entry) -> RenderResult<()> {
        let available: Vec<String> = entry
            .enumerate_instance_layer_properties()
            .map_err(RenderError::InstanceCreation)?
            .iter()
            .map(|layer| raw_name(&layer.layer_name))
            .collect();

        match missing_names(&[VALIDATION_LAYER], &available).first() {
            Some(missing) => Err(RenderError::ValidationLayerUnavailable(missing.clone())),
            None => Ok(()),
        }
    }

    fn required_extensions(
        entry: &Entry,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
    ) -> RenderResult<Vec<&'static CStr>> {
        let window_extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(|e| RenderError::ExtensionUnsupported(format!("window system: {:?}", e)))?;

        // Names handed out by ash-window are static, NUL-terminated strings.
        let mut required: Vec<&'static CStr> = window_extensions
            .iter()
            .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
            .collect();
        if enable_validation {
            required.push(DebugUtils::name());
        }

        let available: Vec<String> = entry
            .enumerate_instance_extension_properties(None)
            .map_err(RenderError::InstanceCreation)?
            .iter()
            .map(|ext| raw_name(&ext.extension_name))
            .collect();

        let missing = missing_names(&required, &available);
        if !missing.is_empty() {
            return Err(RenderError::ExtensionUnsupported(missing.join(", ")));
        }

        Ok(required)
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        extensions: &[&CStr],
    ) -> RenderResult<ash::Instance> {
        let app_name_cstr = CString::new(app_name)
            .unwrap_or_else(|_| CString::from(c"Triangle"));
        let engine_name = c"No Engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }.map_err(RenderError::InstanceCreation)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> RenderResult<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(RenderError::InstanceCreation)?;

        Ok((debug_utils, messenger))
    }

    /// Destroy the debug messenger and the instance.
    ///
    /// # Safety
    /// Every object created from this instance (surface, device) must already be destroyed.
    pub unsafe fn destroy(&mut self) {
        if let Some((debug_utils, messenger)) = self.debug_utils.take() {
            debug_utils.destroy_debug_utils_messenger(messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}

/// Decode a fixed-size, NUL-padded name array as reported by the driver.
pub fn raw_name(raw: &[c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .map(|&c| c as u8)
        .take_while(|&b| b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Names from `required` that do not appear in `available`, in request order.
pub fn missing_names(required: &[&CStr], available: &[String]) -> Vec<String> {
    required
        .iter()
        .map(|name| name.to_string_lossy())
        .filter(|name| !available.iter().any(|a| a == name))
        .map(|name| name.into_owned())
        .collect()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
