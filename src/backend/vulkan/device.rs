//! Physical device selection, feature negotiation and logical device creation.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::backend::SupportedFeatures;
use crate::error::{FrameError, InitError};

use super::VkResultExt;

/// Queue families used by the backend.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilies {
    /// Supports graphics and compute.
    pub graphics: u32,
    /// Compute-only family, when the device has one.
    pub async_compute: Option<u32>,
}

/// Core features the device reports, gathered from the 1.0 to 1.3 feature structs.
#[derive(Debug, Clone, Copy, Default)]
struct CoreFeatures {
    sampler_anisotropy: bool,
    multiview: bool,
    shader_draw_parameters: bool,
    imageless_framebuffer: bool,
    descriptor_indexing: bool,
    runtime_descriptor_array: bool,
    partially_bound: bool,
    variable_descriptor_count: bool,
    update_after_bind: bool,
    synchronization2: bool,
    dynamic_rendering: bool,
}

impl CoreFeatures {
    fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut vulkan_11 = vk::PhysicalDeviceVulkan11Features::default();
        let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default();
        let base = {
            let mut features2 = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut vulkan_11)
                .push_next(&mut vulkan_12)
                .push_next(&mut vulkan_13);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
            features2.features
        };

        Self {
            sampler_anisotropy: base.sampler_anisotropy == vk::TRUE,
            multiview: vulkan_11.multiview == vk::TRUE,
            shader_draw_parameters: vulkan_11.shader_draw_parameters == vk::TRUE,
            imageless_framebuffer: vulkan_12.imageless_framebuffer == vk::TRUE,
            descriptor_indexing: vulkan_12.descriptor_indexing == vk::TRUE,
            runtime_descriptor_array: vulkan_12.runtime_descriptor_array == vk::TRUE,
            partially_bound: vulkan_12.descriptor_binding_partially_bound == vk::TRUE,
            variable_descriptor_count: vulkan_12.descriptor_binding_variable_descriptor_count
                == vk::TRUE,
            update_after_bind: vulkan_12.descriptor_binding_sampled_image_update_after_bind
                == vk::TRUE,
            synchronization2: vulkan_13.synchronization2 == vk::TRUE,
            dynamic_rendering: vulkan_13.dynamic_rendering == vk::TRUE,
        }
    }

    /// First required feature the device lacks.
    fn missing_required(&self) -> Option<&'static str> {
        [
            (self.multiview, "multiview"),
            (self.descriptor_indexing, "descriptorIndexing"),
            (self.partially_bound, "descriptorBindingPartiallyBound"),
            (
                self.variable_descriptor_count,
                "descriptorBindingVariableDescriptorCount",
            ),
            (self.imageless_framebuffer, "imagelessFramebuffer"),
            (self.synchronization2, "synchronization2"),
        ]
        .into_iter()
        .find(|(supported, _)| !supported)
        .map(|(_, name)| name)
    }
}

/// The chosen physical device and everything negotiated for it.
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub queue_families: QueueFamilies,
    pub features: SupportedFeatures,
    core: CoreFeatures,
    extensions: Vec<CString>,
}

impl SelectedDevice {
    pub fn name(&self) -> String {
        // SAFETY: device_name is a null-terminated fixed-size array filled by the driver
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

fn available_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<Vec<CString>, FrameError> {
    let properties = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .check("vkEnumerateDeviceExtensionProperties")?;
    Ok(properties
        .iter()
        .map(|extension| {
            // SAFETY: extension_name is a null-terminated fixed-size array filled by the driver
            unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) }.to_owned()
        })
        .collect())
}

/// Find a graphics+compute family and an optional compute-only family.
pub fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<QueueFamilies> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let graphics = families.iter().position(|family| {
        family
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    })?;
    let async_compute = families.iter().position(|family| {
        family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    });

    Some(QueueFamilies {
        graphics: graphics as u32,
        async_compute: async_compute.map(|index| index as u32),
    })
}

/// Evaluate one device. Returns its score, or the reason it cannot be used.
fn evaluate_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    requested_extensions: &[CString],
) -> Result<(u32, SelectedDevice), InitError> {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };

    let queue_families =
        find_queue_families(instance, physical_device).ok_or(InitError::NoGraphicsQueue)?;

    let core = CoreFeatures::query(instance, physical_device);
    if let Some(missing) = core.missing_required() {
        return Err(InitError::MissingFeature(missing));
    }

    let available = available_extensions(instance, physical_device)
        .map_err(|_| InitError::NoSuitableDevice)?;
    let has = |name: &CStr| available.iter().any(|extension| extension.as_c_str() == name);

    let mut extensions = Vec::new();
    for name in requested_extensions {
        if !has(name.as_c_str()) {
            return Err(InitError::MissingExtension(
                name.to_string_lossy().into_owned(),
            ));
        }
        extensions.push(name.clone());
    }

    let optional = |extensions: &mut Vec<CString>, names: &[&CStr]| -> bool {
        if names.iter().all(|name| has(*name)) {
            for name in names {
                if !extensions.iter().any(|e| e.as_c_str() == *name) {
                    extensions.push((*name).to_owned());
                }
            }
            true
        } else {
            false
        }
    };

    optional(&mut extensions, &[ash::khr::swapchain::NAME]);
    let ray_tracing = optional(
        &mut extensions,
        &[
            ash::khr::acceleration_structure::NAME,
            ash::khr::ray_query::NAME,
            ash::khr::deferred_host_operations::NAME,
        ],
    );
    let fragment_shading_rate =
        optional(&mut extensions, &[ash::khr::fragment_shading_rate::NAME]);

    let features = SupportedFeatures {
        dynamic_rendering: core.dynamic_rendering,
        ray_tracing,
        fragment_shading_rate,
        async_compute: queue_families.async_compute.is_some(),
    };

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        _ => 1,
    };
    score += properties.limits.max_image_dimension2_d / 1024;

    Ok((
        score,
        SelectedDevice {
            physical_device,
            properties,
            queue_families,
            features,
            core,
            extensions,
        },
    ))
}

/// Select the best device that satisfies every requirement.
///
/// Prefers discrete GPUs over integrated GPUs. When no device qualifies, the
/// reason the first candidate was rejected is returned.
pub fn select_physical_device(
    instance: &ash::Instance,
    requested_extensions: &[CString],
) -> Result<SelectedDevice, FrameError> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .check("vkEnumeratePhysicalDevices")?;
    if devices.is_empty() {
        return Err(InitError::NoSuitableDevice.into());
    }

    let mut best: Option<(u32, SelectedDevice)> = None;
    let mut first_rejection = None;

    for physical_device in devices {
        match evaluate_device(instance, physical_device, requested_extensions) {
            Ok((score, candidate)) => {
                log::info!(
                    "Found GPU: {} (type: {:?}, score: {})",
                    candidate.name(),
                    candidate.properties.device_type,
                    score
                );
                if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
                    best = Some((score, candidate));
                }
            }
            Err(reason) => {
                log::info!("Skipping GPU: {}", reason);
                first_rejection.get_or_insert(reason);
            }
        }
    }

    match best {
        Some((_, device)) => Ok(device),
        None => Err(first_rejection
            .unwrap_or(InitError::NoSuitableDevice)
            .into()),
    }
}

/// Create the logical device with every required feature and the negotiated
/// optional ones enabled.
pub fn create_logical_device(
    instance: &ash::Instance,
    selected: &SelectedDevice,
) -> Result<ash::Device, FrameError> {
    let queue_priorities = [1.0f32];
    let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
        .queue_family_index(selected.queue_families.graphics)
        .queue_priorities(&queue_priorities)];
    if let Some(family) = selected.queue_families.async_compute {
        queue_create_infos.push(
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities),
        );
    }

    let extension_ptrs: Vec<*const std::ffi::c_char> = selected
        .extensions
        .iter()
        .map(|name| name.as_ptr())
        .collect();

    let core = &selected.core;
    let features =
        vk::PhysicalDeviceFeatures::default().sampler_anisotropy(core.sampler_anisotropy);
    let mut vulkan_11 = vk::PhysicalDeviceVulkan11Features::default()
        .multiview(true)
        .shader_draw_parameters(core.shader_draw_parameters);
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default()
        .imageless_framebuffer(true)
        .descriptor_indexing(true)
        .runtime_descriptor_array(core.runtime_descriptor_array)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_variable_descriptor_count(true)
        .descriptor_binding_sampled_image_update_after_bind(core.update_after_bind);
    let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .dynamic_rendering(core.dynamic_rendering);
    let mut acceleration_structure =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut ray_query = vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);
    let mut shading_rate = vk::PhysicalDeviceFragmentShadingRateFeaturesKHR::default()
        .pipeline_fragment_shading_rate(true);

    let mut create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_ptrs)
        .enabled_features(&features)
        .push_next(&mut vulkan_11)
        .push_next(&mut vulkan_12)
        .push_next(&mut vulkan_13);
    if selected.features.ray_tracing {
        create_info = create_info
            .push_next(&mut acceleration_structure)
            .push_next(&mut ray_query);
    }
    if selected.features.fragment_shading_rate {
        create_info = create_info.push_next(&mut shading_rate);
    }

    unsafe { instance.create_device(selected.physical_device, &create_info, None) }
        .check("vkCreateDevice")
}
