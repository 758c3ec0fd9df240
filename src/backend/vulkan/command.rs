//! Command pool and descriptor pool creation.

use ash::vk;

use crate::error::FrameError;

use super::VkResultExt;

/// Descriptor sets the shared pool can hold.
const MAX_DESCRIPTOR_SETS: u32 = 1000;

/// Create a command pool whose buffers can be reset individually.
pub fn create_command_pool(
    device: &ash::Device,
    queue_family_index: u32,
) -> Result<vk::CommandPool, FrameError> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    unsafe { device.create_command_pool(&pool_info, None) }.check("vkCreateCommandPool")
}

/// Create the descriptor pool sets are allocated from.
///
/// Sets can be freed individually and updated after being bound.
pub fn create_descriptor_pool(device: &ash::Device) -> Result<vk::DescriptorPool, FrameError> {
    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 5000,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 500,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 500,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 500,
        },
    ];

    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .flags(
            vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND
                | vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
        )
        .max_sets(MAX_DESCRIPTOR_SETS)
        .pool_sizes(&pool_sizes);

    unsafe { device.create_descriptor_pool(&pool_info, None) }.check("vkCreateDescriptorPool")
}
