//! Native Vulkan backend implementation using ash.
//!
//! Buffers and textures are allocated through gpu-allocator and tracked in a
//! resource table keyed by the handle value; every other object handle carries
//! the raw Vulkan handle. Validation layers and the debug messenger are enabled
//! through [`FrameParameters::validation`].

mod allocator;
mod command;
pub(crate) mod conversion;
mod debug;
mod device;
mod instance;
mod render_pass;

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::time::Duration;

use ash::vk::{self, Handle};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use parking_lot::Mutex;

use crate::config::FrameParameters;
use crate::error::{FrameError, InitError};
use crate::profiling::profile_scope;
use crate::render_pass::{RenderPassBinding, RenderPassDescriptor, RenderTarget};
use crate::render_pass_cache::{FramebufferKey, RenderPassKey};
use crate::types::{
    BufferCopyRegion, BufferDescriptor, BufferTextureCopyRegion, TextureDescriptor, TextureInfo,
    TextureUsage,
};

use super::{
    BufferHandle, CommandBufferHandle, DeviceInfo, FenceHandle, FramebufferHandle, GpuBackend,
    GpuObject, ObjectKind, RenderPassHandle, SemaphoreHandle, Submission, SupportedFeatures,
    TextureHandle,
};

use self::conversion::{
    attachment_layout, convert_buffer_usage, convert_clear_value, convert_load_op,
    convert_memory_location, convert_sample_count, convert_store_op, convert_texture_format,
    convert_texture_usage, format_aspect, image_view_type, layout_scope, resting_layout,
};

/// Conversion of raw Vulkan results into [`FrameError`].
pub(crate) trait VkResultExt<T> {
    /// Map an error code to [`FrameError::GpuCall`] (or [`FrameError::DeviceLost`]),
    /// recording the caller's location.
    fn check(self, call: &'static str) -> Result<T, FrameError>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    #[track_caller]
    fn check(self, call: &'static str) -> Result<T, FrameError> {
        match self {
            Ok(value) => Ok(value),
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                log::error!("{} reported device loss", call);
                Err(FrameError::DeviceLost)
            }
            Err(code) => Err(FrameError::gpu_call(call, code.as_raw())),
        }
    }
}

#[track_caller]
fn allocation_error(error: gpu_allocator::AllocationError) -> FrameError {
    log::error!("GPU memory allocation failed: {}", error);
    FrameError::gpu_call(
        "gpu_allocator::Allocator::allocate",
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.as_raw(),
    )
}

struct BufferEntry {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

struct TextureEntry {
    image: vk::Image,
    /// Whole-texture view, created for render attachments.
    view: Option<vk::ImageView>,
    allocation: Option<Allocation>,
    info: TextureInfo,
}

impl TextureEntry {
    fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: format_aspect(self.info.format),
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        }
    }

    /// Barrier moving the whole texture from `old` to `new`, with the stage
    /// masks it waits on and blocks.
    fn transition(
        &self,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> (
        vk::PipelineStageFlags,
        vk::PipelineStageFlags,
        vk::ImageMemoryBarrier<'static>,
    ) {
        let (src_stage, src_access) = layout_scope(old);
        let (dst_stage, dst_access) = layout_scope(new);
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.full_range())
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        (src_stage, dst_stage, barrier)
    }

    fn attachment_view(&self) -> Result<vk::ImageView, FrameError> {
        self.view.ok_or_else(|| {
            FrameError::InvalidParameter("render target has no attachment view".to_string())
        })
    }
}

#[derive(Default)]
struct ResourceTable {
    next_id: u64,
    buffers: HashMap<u64, BufferEntry>,
    textures: HashMap<u64, TextureEntry>,
}

impl ResourceTable {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&BufferEntry, FrameError> {
        self.buffers
            .get(&handle.raw())
            .ok_or(FrameError::UnknownHandle {
                kind: ObjectKind::Buffer,
                raw: handle.raw(),
            })
    }

    fn texture(&self, handle: TextureHandle) -> Result<&TextureEntry, FrameError> {
        self.textures
            .get(&handle.raw())
            .ok_or(FrameError::UnknownHandle {
                kind: ObjectKind::Texture,
                raw: handle.raw(),
            })
    }
}

/// Vulkan-based GPU backend using ash.
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    /// Graphics queue. The lock provides the external synchronization queue calls need.
    graphics_queue: Mutex<vk::Queue>,
    graphics_queue_family: u32,
    compute_queue: Option<(u32, vk::Queue)>,
    /// Dropped explicitly before the device is destroyed.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    command_pool: Mutex<vk::CommandPool>,
    descriptor_pool: Mutex<vk::DescriptorPool>,
    resources: Mutex<ResourceTable>,
    device_info: DeviceInfo,
    features: SupportedFeatures,
    validation_enabled: bool,
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("device", &self.device_info.name)
            .field("features", &self.features)
            .field("validation_enabled", &self.validation_enabled)
            .finish()
    }
}

impl VulkanBackend {
    /// Create the instance, select a device and create the logical device,
    /// allocator and pools.
    pub fn new(params: &FrameParameters) -> Result<Self, FrameError> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| InitError::LoaderUnavailable(e.to_string()))?;

        let instance::InstanceBundle {
            instance,
            debug_utils,
            debug_messenger,
        } = instance::create_instance(&entry, params)?;

        let device_extensions = instance::extension_names(&params.device_extensions)?;
        let selected = device::select_physical_device(&instance, &device_extensions)?;
        let device = device::create_logical_device(&instance, &selected)?;

        let graphics_queue_family = selected.queue_families.graphics;
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let compute_queue = selected
            .queue_families
            .async_compute
            .map(|family| (family, unsafe { device.get_device_queue(family, 0) }));

        let allocator =
            allocator::create_allocator(&instance, selected.physical_device, device.clone())?;
        let command_pool = command::create_command_pool(&device, graphics_queue_family)?;
        let descriptor_pool = command::create_descriptor_pool(&device)?;

        let device_info = DeviceInfo {
            name: selected.name(),
            timestamp_period: selected.properties.limits.timestamp_period,
        };

        log::info!(
            "Vulkan backend initialized on {} (validation: {}, features: {:?})",
            device_info.name,
            params.validation,
            selected.features
        );

        Ok(Self {
            _entry: entry,
            instance,
            debug_utils,
            debug_messenger,
            physical_device: selected.physical_device,
            device,
            graphics_queue: Mutex::new(graphics_queue),
            graphics_queue_family,
            compute_queue,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            command_pool: Mutex::new(command_pool),
            descriptor_pool: Mutex::new(descriptor_pool),
            resources: Mutex::new(ResourceTable::default()),
            device_info,
            features: selected.features,
            validation_enabled: params.validation,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Family index and queue of the compute-only queue, if the device has one.
    pub fn compute_queue(&self) -> Option<(u32, vk::Queue)> {
        self.compute_queue
    }

    /// Pool descriptor sets are allocated from. Sets queued for deletion are freed back to it.
    pub fn descriptor_pool(&self) -> vk::DescriptorPool {
        *self.descriptor_pool.lock()
    }

    /// Raw Vulkan buffer behind a handle.
    pub fn raw_buffer(&self, buffer: BufferHandle) -> Result<vk::Buffer, FrameError> {
        Ok(self.resources.lock().buffer(buffer)?.buffer)
    }

    /// Raw Vulkan image behind a handle.
    pub fn raw_image(&self, texture: TextureHandle) -> Result<vk::Image, FrameError> {
        Ok(self.resources.lock().texture(texture)?.image)
    }

    fn destroy_buffer_entry(&self, entry: BufferEntry) {
        unsafe { self.device.destroy_buffer(entry.buffer, None) };
        if let Some(allocation) = entry.allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
    }

    fn destroy_texture_entry(&self, entry: TextureEntry) {
        if let Some(view) = entry.view {
            unsafe { self.device.destroy_image_view(view, None) };
        }
        unsafe { self.device.destroy_image(entry.image, None) };
        if let Some(allocation) = entry.allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::error!("Failed to free texture memory: {}", e);
            }
        }
    }

    /// Record commands into a temporary command buffer, submit them and wait
    /// for the queue to finish.
    fn submit_immediate(
        &self,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> Result<(), FrameError> {
        let pool = self.command_pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .check("vkAllocateCommandBuffers")?;
        let Some(&cb) = command_buffers.first() else {
            return Err(FrameError::gpu_call(
                "vkAllocateCommandBuffers",
                vk::Result::ERROR_OUT_OF_HOST_MEMORY.as_raw(),
            ));
        };

        let result = (|| {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(cb, &begin_info) }
                .check("vkBeginCommandBuffer")?;
            record(cb);
            unsafe { self.device.end_command_buffer(cb) }.check("vkEndCommandBuffer")?;

            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            let queue = self.graphics_queue.lock();
            unsafe { self.device.queue_submit(*queue, &[submit_info], vk::Fence::null()) }
                .check("vkQueueSubmit")?;
            unsafe { self.device.queue_wait_idle(*queue) }.check("vkQueueWaitIdle")
        })();

        unsafe { self.device.free_command_buffers(*pool, &command_buffers) };
        result
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let table = std::mem::take(self.resources.get_mut());
            if !table.buffers.is_empty() || !table.textures.is_empty() {
                log::warn!(
                    "Vulkan backend dropped with {} buffers and {} textures still alive",
                    table.buffers.len(),
                    table.textures.len()
                );
            }
            for (_, entry) in table.buffers {
                self.destroy_buffer_entry(entry);
            }
            for (_, entry) in table.textures {
                self.destroy_texture_entry(entry);
            }

            self.device.destroy_descriptor_pool(*self.descriptor_pool.get_mut(), None);
            self.device.destroy_command_pool(*self.command_pool.get_mut(), None);

            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan Backend (ash)"
    }

    fn device_info(&self) -> DeviceInfo {
        self.device_info.clone()
    }

    fn features(&self) -> SupportedFeatures {
        self.features
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferHandle, FrameError> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(convert_buffer_usage(descriptor.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer =
            unsafe { self.device.create_buffer(&buffer_info, None) }.check("vkCreateBuffer")?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: descriptor.label.as_deref().unwrap_or("buffer"),
                requirements,
                location: convert_memory_location(descriptor.location),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                unsafe { self.device.destroy_buffer(buffer, None) };
                allocation_error(e)
            })?;

        let bind = unsafe {
            self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let entry = BufferEntry {
            buffer,
            allocation: Some(allocation),
            size: descriptor.size,
        };
        if let Err(code) = bind {
            self.destroy_buffer_entry(entry);
            return Err(code).check("vkBindBufferMemory");
        }

        let mut resources = self.resources.lock();
        let id = resources.next_id();
        resources.buffers.insert(id, entry);
        Ok(BufferHandle(id))
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64, FrameError> {
        Ok(self.resources.lock().buffer(buffer)?.size)
    }

    fn write_mapped(
        &self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), FrameError> {
        let mut resources = self.resources.lock();
        let entry = resources
            .buffers
            .get_mut(&buffer.raw())
            .ok_or(FrameError::UnknownHandle {
                kind: ObjectKind::Buffer,
                raw: buffer.raw(),
            })?;
        let size = entry.size;
        let mapped = entry
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| {
                FrameError::InvalidParameter(format!(
                    "buffer {:#x} is not host visible",
                    buffer.raw()
                ))
            })?;

        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= size)
            .ok_or_else(|| {
                FrameError::InvalidParameter(format!(
                    "write of {} bytes at offset {} exceeds buffer size {}",
                    data.len(),
                    offset,
                    size
                ))
            })?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<TextureHandle, FrameError> {
        let info = descriptor.info();
        let image_type = if info.size.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(convert_texture_format(info.format))
            .extent(vk::Extent3D {
                width: info.size.width,
                height: info.size.height,
                depth: info.size.depth,
            })
            .mip_levels(info.mip_level_count)
            .array_layers(info.array_layer_count)
            .samples(convert_sample_count(info.sample_count))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_texture_usage(info.usage, info.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }.check("vkCreateImage")?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: descriptor.label.as_deref().unwrap_or("texture"),
                requirements,
                location: gpu_allocator::MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                unsafe { self.device.destroy_image(image, None) };
                allocation_error(e)
            })?;

        let bind = unsafe {
            self.device.bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        let mut entry = TextureEntry {
            image,
            view: None,
            allocation: Some(allocation),
            info,
        };
        if let Err(code) = bind {
            self.destroy_texture_entry(entry);
            return Err(code).check("vkBindImageMemory");
        }

        if info.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(image_view_type(&info))
                .format(convert_texture_format(info.format))
                .subresource_range(entry.full_range());
            match unsafe { self.device.create_image_view(&view_info, None) } {
                Ok(view) => entry.view = Some(view),
                Err(code) => {
                    self.destroy_texture_entry(entry);
                    return Err(code).check("vkCreateImageView");
                }
            }
        }

        let (src_stage, dst_stage, barrier) =
            entry.transition(vk::ImageLayout::UNDEFINED, resting_layout(&info));
        let initialized = self.submit_immediate(|cb| unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        });
        if let Err(e) = initialized {
            self.destroy_texture_entry(entry);
            return Err(e);
        }

        let mut resources = self.resources.lock();
        let id = resources.next_id();
        resources.textures.insert(id, entry);
        Ok(TextureHandle(id))
    }

    fn texture_info(&self, texture: TextureHandle) -> Result<TextureInfo, FrameError> {
        Ok(self.resources.lock().texture(texture)?.info)
    }

    fn create_command_buffer(&self) -> Result<CommandBufferHandle, FrameError> {
        let pool = self.command_pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .check("vkAllocateCommandBuffers")?;
        command_buffers
            .first()
            .map(|cb| CommandBufferHandle(cb.as_raw()))
            .ok_or_else(|| {
                FrameError::gpu_call(
                    "vkAllocateCommandBuffers",
                    vk::Result::ERROR_OUT_OF_HOST_MEMORY.as_raw(),
                )
            })
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        let pool = self.command_pool.lock();
        unsafe {
            self.device.free_command_buffers(
                *pool,
                &[vk::CommandBuffer::from_raw(command_buffer.raw())],
            )
        };
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle, FrameError> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.device.create_semaphore(&semaphore_info, None) }
            .check("vkCreateSemaphore")?;
        Ok(SemaphoreHandle(semaphore.as_raw()))
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle, FrameError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::default().flags(flags);
        let fence =
            unsafe { self.device.create_fence(&fence_info, None) }.check("vkCreateFence")?;
        Ok(FenceHandle(fence.as_raw()))
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<bool, FrameError> {
        profile_scope!("vulkan_wait_fence");
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let fences = [vk::Fence::from_raw(fence.raw())];
        match unsafe { self.device.wait_for_fences(&fences, true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(code) => Err(code).check("vkWaitForFences"),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), FrameError> {
        let fences = [vk::Fence::from_raw(fence.raw())];
        unsafe { self.device.reset_fences(&fences) }.check("vkResetFences")
    }

    fn begin_commands(&self, command_buffer: CommandBufferHandle) -> Result<(), FrameError> {
        let cb = vk::CommandBuffer::from_raw(command_buffer.raw());
        unsafe { self.device.reset_command_buffer(cb, vk::CommandBufferResetFlags::empty()) }
            .check("vkResetCommandBuffer")?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cb, &begin_info) }.check("vkBeginCommandBuffer")
    }

    fn end_commands(&self, command_buffer: CommandBufferHandle) -> Result<(), FrameError> {
        let cb = vk::CommandBuffer::from_raw(command_buffer.raw());
        unsafe { self.device.end_command_buffer(cb) }.check("vkEndCommandBuffer")
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        source: BufferHandle,
        destination: BufferHandle,
        region: BufferCopyRegion,
    ) -> Result<(), FrameError> {
        let (src, dst) = {
            let resources = self.resources.lock();
            (
                resources.buffer(source)?.buffer,
                resources.buffer(destination)?.buffer,
            )
        };
        let copy = vk::BufferCopy {
            src_offset: region.src_offset,
            dst_offset: region.dst_offset,
            size: region.size,
        };
        unsafe {
            self.device.cmd_copy_buffer(
                vk::CommandBuffer::from_raw(command_buffer.raw()),
                src,
                dst,
                &[copy],
            )
        };
        Ok(())
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        command_buffer: CommandBufferHandle,
        source: BufferHandle,
        destination: TextureHandle,
        regions: &[BufferTextureCopyRegion],
    ) -> Result<(), FrameError> {
        if regions.is_empty() {
            return Ok(());
        }
        let resources = self.resources.lock();
        let buffer = resources.buffer(source)?.buffer;
        let texture = resources.texture(destination)?;
        let cb = vk::CommandBuffer::from_raw(command_buffer.raw());
        let aspect_mask = format_aspect(texture.info.format);
        let rest = resting_layout(&texture.info);

        let copies: Vec<vk::BufferImageCopy> = regions
            .iter()
            .map(|region| {
                vk::BufferImageCopy::default()
                    .buffer_offset(region.buffer_offset)
                    .buffer_row_length(0)
                    .buffer_image_height(0)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask,
                        mip_level: region.mip_level,
                        base_array_layer: region.base_array_layer,
                        layer_count: region.array_layer_count,
                    })
                    .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                    .image_extent(vk::Extent3D {
                        width: region.extent.width,
                        height: region.extent.height,
                        depth: region.extent.depth,
                    })
            })
            .collect();

        // Same-layout transitions still order against earlier copies.
        let (to_src, to_dst, to_transfer) =
            texture.transition(rest, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let (back_src, back_dst, to_rest) =
            texture.transition(vk::ImageLayout::TRANSFER_DST_OPTIMAL, rest);

        unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                to_src,
                to_dst,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            self.device.cmd_copy_buffer_to_image(
                cb,
                buffer,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &copies,
            );
            self.device.cmd_pipeline_barrier(
                cb,
                back_src,
                back_dst,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_rest],
            );
        }
        Ok(())
    }

    fn cmd_transfer_barrier(&self, command_buffer: CommandBufferHandle) -> Result<(), FrameError> {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE);
        unsafe {
            self.device.cmd_pipeline_barrier(
                vk::CommandBuffer::from_raw(command_buffer.raw()),
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            )
        };
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: CommandBufferHandle,
        descriptor: &RenderPassDescriptor,
        binding: RenderPassBinding,
    ) -> Result<(), FrameError> {
        profile_scope!("vulkan_begin_render_pass");
        let cb = vk::CommandBuffer::from_raw(command_buffer.raw());
        let resources = self.resources.lock();
        let color = descriptor
            .color
            .map(|target| resources.texture(target.texture).map(|entry| (target, entry)))
            .transpose()?;
        let depth = descriptor
            .depth
            .map(|target| resources.texture(target.texture).map(|entry| (target, entry)))
            .transpose()?;

        // Order against the previous pass writing the same attachments.
        let mut src_stage = vk::PipelineStageFlags::empty();
        let mut dst_stage = vk::PipelineStageFlags::empty();
        let mut barriers = Vec::with_capacity(2);
        for (_, entry) in depth.iter().chain(color.iter()) {
            let layout = attachment_layout(entry.info.format);
            let (src, dst, barrier) = entry.transition(layout, layout);
            src_stage |= src;
            dst_stage |= dst;
            barriers.push(barrier);
        }
        unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            )
        };

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: descriptor.width,
                height: descriptor.height,
            },
        };

        match binding {
            RenderPassBinding::Dynamic => {
                let attachment = |target: &RenderTarget, entry: &TextureEntry| {
                    entry.attachment_view().map(|view| {
                        vk::RenderingAttachmentInfo::default()
                            .image_view(view)
                            .image_layout(attachment_layout(entry.info.format))
                            .load_op(convert_load_op(target.load_op))
                            .store_op(convert_store_op(target.store_op))
                            .clear_value(convert_clear_value(target.clear_value))
                    })
                };
                let color_attachments: Vec<_> = color
                    .map(|(target, entry)| attachment(&target, entry))
                    .transpose()?
                    .into_iter()
                    .collect();
                let depth_attachment = depth
                    .map(|(target, entry)| attachment(&target, entry))
                    .transpose()?;
                let stencil_attachment = depth
                    .filter(|(_, entry)| entry.info.format.has_stencil())
                    .and(depth_attachment);

                let mut rendering_info = vk::RenderingInfo::default()
                    .render_area(render_area)
                    .layer_count(1)
                    .view_mask(descriptor.view_mask)
                    .color_attachments(&color_attachments);
                if let Some(depth_attachment) = depth_attachment.as_ref() {
                    rendering_info = rendering_info.depth_attachment(depth_attachment);
                }
                if let Some(stencil_attachment) = stencil_attachment.as_ref() {
                    rendering_info = rendering_info.stencil_attachment(stencil_attachment);
                }
                unsafe { self.device.cmd_begin_rendering(cb, &rendering_info) };
            }
            RenderPassBinding::Cached {
                render_pass,
                framebuffer,
            } => {
                let views = depth
                    .iter()
                    .chain(color.iter())
                    .map(|(_, entry)| entry.attachment_view())
                    .collect::<Result<Vec<_>, _>>()?;
                let clear_values: Vec<vk::ClearValue> = descriptor
                    .targets()
                    .map(|target| convert_clear_value(target.clear_value))
                    .collect();

                let mut attachment_begin =
                    vk::RenderPassAttachmentBeginInfo::default().attachments(&views);
                let begin_info = vk::RenderPassBeginInfo::default()
                    .render_pass(vk::RenderPass::from_raw(render_pass.raw()))
                    .framebuffer(vk::Framebuffer::from_raw(framebuffer.raw()))
                    .render_area(render_area)
                    .clear_values(&clear_values)
                    .push_next(&mut attachment_begin);
                unsafe {
                    self.device.cmd_begin_render_pass(cb, &begin_info, vk::SubpassContents::INLINE)
                };
            }
        }
        Ok(())
    }

    fn cmd_end_render_pass(
        &self,
        command_buffer: CommandBufferHandle,
        binding: RenderPassBinding,
    ) -> Result<(), FrameError> {
        let cb = vk::CommandBuffer::from_raw(command_buffer.raw());
        match binding {
            RenderPassBinding::Dynamic => unsafe { self.device.cmd_end_rendering(cb) },
            RenderPassBinding::Cached { .. } => unsafe { self.device.cmd_end_render_pass(cb) },
        }
        Ok(())
    }

    fn submit(&self, submission: &Submission<'_>) -> Result<(), FrameError> {
        let command_buffers: Vec<vk::CommandBuffer> = submission
            .command_buffers
            .iter()
            .map(|cb| vk::CommandBuffer::from_raw(cb.raw()))
            .collect();
        let wait_semaphores: Vec<vk::Semaphore> = submission
            .wait_semaphores
            .iter()
            .map(|s| vk::Semaphore::from_raw(s.raw()))
            .collect();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let signal_semaphores: Vec<vk::Semaphore> = submission
            .signal_semaphores
            .iter()
            .map(|s| vk::Semaphore::from_raw(s.raw()))
            .collect();
        let fence = submission
            .signal_fence
            .map_or(vk::Fence::null(), |f| vk::Fence::from_raw(f.raw()));

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let queue = self.graphics_queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit_info], fence) }.check("vkQueueSubmit")
    }

    fn wait_idle(&self) -> Result<(), FrameError> {
        let queue = self.graphics_queue.lock();
        unsafe { self.device.queue_wait_idle(*queue) }.check("vkQueueWaitIdle")
    }

    fn destroy(&self, object: GpuObject) {
        let device = &self.device;
        unsafe {
            match object {
                GpuObject::Buffer(handle) => {
                    let entry = self.resources.lock().buffers.remove(&handle.raw());
                    match entry {
                        Some(entry) => self.destroy_buffer_entry(entry),
                        None => log::error!("Destroying unknown buffer {:#x}", handle.raw()),
                    }
                }
                GpuObject::Texture(handle) => {
                    let entry = self.resources.lock().textures.remove(&handle.raw());
                    match entry {
                        Some(entry) => self.destroy_texture_entry(entry),
                        None => log::error!("Destroying unknown texture {:#x}", handle.raw()),
                    }
                }
                GpuObject::TextureView(h) => {
                    device.destroy_image_view(vk::ImageView::from_raw(h.raw()), None)
                }
                GpuObject::Sampler(h) => {
                    device.destroy_sampler(vk::Sampler::from_raw(h.raw()), None)
                }
                GpuObject::Pipeline(h) => {
                    device.destroy_pipeline(vk::Pipeline::from_raw(h.raw()), None)
                }
                GpuObject::PipelineLayout(h) => {
                    device.destroy_pipeline_layout(vk::PipelineLayout::from_raw(h.raw()), None)
                }
                GpuObject::DescriptorSetLayout(h) => device.destroy_descriptor_set_layout(
                    vk::DescriptorSetLayout::from_raw(h.raw()),
                    None,
                ),
                GpuObject::DescriptorSet(h) => {
                    let pool = self.descriptor_pool.lock();
                    let sets = [vk::DescriptorSet::from_raw(h.raw())];
                    if let Err(code) = device.free_descriptor_sets(*pool, &sets) {
                        log::error!("vkFreeDescriptorSets failed with result {:?}", code);
                    }
                }
                GpuObject::Event(h) => device.destroy_event(vk::Event::from_raw(h.raw()), None),
                GpuObject::Semaphore(h) => {
                    device.destroy_semaphore(vk::Semaphore::from_raw(h.raw()), None)
                }
                GpuObject::Fence(h) => device.destroy_fence(vk::Fence::from_raw(h.raw()), None),
                GpuObject::RenderPass(h) => {
                    device.destroy_render_pass(vk::RenderPass::from_raw(h.raw()), None)
                }
                GpuObject::Framebuffer(h) => {
                    device.destroy_framebuffer(vk::Framebuffer::from_raw(h.raw()), None)
                }
            }
        }
    }

    fn create_render_pass(&self, key: &RenderPassKey) -> Result<RenderPassHandle, FrameError> {
        let render_pass = render_pass::create_render_pass(&self.device, key)?;
        Ok(RenderPassHandle(render_pass.as_raw()))
    }

    fn create_framebuffer(&self, key: &FramebufferKey) -> Result<FramebufferHandle, FrameError> {
        let render_pass = vk::RenderPass::from_raw(key.render_pass.raw());
        let framebuffer = render_pass::create_framebuffer(&self.device, render_pass, key)?;
        Ok(FramebufferHandle(framebuffer.as_raw()))
    }
}
