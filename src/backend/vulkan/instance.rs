//! Vulkan instance creation.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::config::FrameParameters;
use crate::error::FrameError;

use super::{debug, VkResultExt};

/// Vulkan 1.3: dynamic rendering and synchronization2 are core.
const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance plus the optional validation messenger.
pub struct InstanceBundle {
    pub instance: ash::Instance,
    pub debug_utils: Option<ash::ext::debug_utils::Instance>,
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

/// Convert caller-supplied extension names.
pub fn extension_names(names: &[String]) -> Result<Vec<CString>, FrameError> {
    names
        .iter()
        .map(|name| {
            CString::new(name.as_str()).map_err(|_| {
                FrameError::InvalidParameter(format!(
                    "extension name {:?} contains a nul byte",
                    name
                ))
            })
        })
        .collect()
}

/// Create a Vulkan instance with optional validation layers and the
/// caller's instance extensions.
pub fn create_instance(
    entry: &ash::Entry,
    params: &FrameParameters,
) -> Result<InstanceBundle, FrameError> {
    let validation_available = params.validation && check_validation_layer_support(entry);
    if params.validation && !validation_available {
        log::warn!("Validation layers requested but not available");
    }

    let app_name = c"gpu-frames";
    let app_info = vk::ApplicationInfo::default()
        .application_name(app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(app_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    let requested = extension_names(&params.instance_extensions)?;
    let mut extensions: Vec<*const std::ffi::c_char> =
        requested.iter().map(|name| name.as_ptr()).collect();
    if validation_available {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let layer_names: Vec<*const std::ffi::c_char> = if validation_available {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }.check("vkCreateInstance")?;

    let (debug_utils, debug_messenger) = if validation_available {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
        let messenger = debug::create_debug_messenger(&debug_utils)?;
        (Some(debug_utils), Some(messenger))
    } else {
        (None, None)
    };

    Ok(InstanceBundle {
        instance,
        debug_utils,
        debug_messenger,
    })
}

fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let available_layers = match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers,
        Err(_) => return false,
    };

    available_layers.iter().any(|layer| {
        // SAFETY: layer_name is a null-terminated fixed-size array filled by the loader
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == VALIDATION_LAYER_NAME
    })
}
