//! GPU backend abstraction layer.
//!
//! Every device call the frame core makes goes through the object-safe
//! [`GpuBackend`] trait. Two implementations exist:
//!
//! - `vulkan` (feature `vulkan-backend`, default): native Vulkan using ash and gpu-allocator
//! - [`dummy`]: a simulated device with host memory, a background queue thread and
//!   hazard tracking, used for tests and headless runs
//!
//! Objects are referred to by small `Copy` handles. For allocator-backed objects
//! (buffers, textures) the handle keys into the backend's resource table; for all
//! other objects it carries the raw API handle value.

pub mod dummy;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendType, FrameParameters};
use crate::error::FrameError;
use crate::render_pass::{RenderPassBinding, RenderPassDescriptor};
use crate::render_pass_cache::{FramebufferKey, RenderPassKey};
use crate::types::{
    BufferCopyRegion, BufferDescriptor, BufferTextureCopyRegion, TextureDescriptor, TextureInfo,
};

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Wrap a raw handle value, e.g. one created directly through the device.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw handle value.
            pub const fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

define_handle!(
    /// Handle to a GPU buffer.
    BufferHandle
);
define_handle!(
    /// Handle to a GPU texture (image).
    TextureHandle
);
define_handle!(
    /// Handle to a texture view.
    TextureViewHandle
);
define_handle!(
    /// Handle to a sampler.
    SamplerHandle
);
define_handle!(
    /// Handle to a graphics or compute pipeline.
    PipelineHandle
);
define_handle!(
    /// Handle to a pipeline layout.
    PipelineLayoutHandle
);
define_handle!(
    /// Handle to a descriptor set layout.
    DescriptorSetLayoutHandle
);
define_handle!(
    /// Handle to a descriptor set allocated from the backend's descriptor pool.
    DescriptorSetHandle
);
define_handle!(
    /// Handle to a GPU event.
    EventHandle
);
define_handle!(
    /// Handle to a binary semaphore.
    SemaphoreHandle
);
define_handle!(
    /// Handle to a fence.
    FenceHandle
);
define_handle!(
    /// Handle to a render pass.
    RenderPassHandle
);
define_handle!(
    /// Handle to a framebuffer.
    FramebufferHandle
);
define_handle!(
    /// Handle to a primary command buffer.
    CommandBufferHandle
);

/// Kinds of objects known to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Texture,
    TextureView,
    Sampler,
    Pipeline,
    PipelineLayout,
    DescriptorSetLayout,
    DescriptorSet,
    Event,
    Semaphore,
    Fence,
    RenderPass,
    Framebuffer,
    CommandBuffer,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Buffer => "buffer",
            Self::Texture => "texture",
            Self::TextureView => "texture view",
            Self::Sampler => "sampler",
            Self::Pipeline => "pipeline",
            Self::PipelineLayout => "pipeline layout",
            Self::DescriptorSetLayout => "descriptor set layout",
            Self::DescriptorSet => "descriptor set",
            Self::Event => "event",
            Self::Semaphore => "semaphore",
            Self::Fence => "fence",
            Self::RenderPass => "render pass",
            Self::Framebuffer => "framebuffer",
            Self::CommandBuffer => "command buffer",
        };
        f.write_str(name)
    }
}

/// A GPU object whose destruction can be deferred.
///
/// Dispatch on destruction is a `match` over the variant; see
/// [`GpuBackend::destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuObject {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    TextureView(TextureViewHandle),
    Sampler(SamplerHandle),
    Pipeline(PipelineHandle),
    PipelineLayout(PipelineLayoutHandle),
    DescriptorSetLayout(DescriptorSetLayoutHandle),
    DescriptorSet(DescriptorSetHandle),
    Event(EventHandle),
    Semaphore(SemaphoreHandle),
    Fence(FenceHandle),
    RenderPass(RenderPassHandle),
    Framebuffer(FramebufferHandle),
}

impl GpuObject {
    /// Build an object from its kind and raw handle value.
    ///
    /// Returns `None` for kinds that are not destroyed through deletion queues.
    pub fn from_raw(kind: ObjectKind, raw: u64) -> Option<Self> {
        let object = match kind {
            ObjectKind::Buffer => Self::Buffer(BufferHandle(raw)),
            ObjectKind::Texture => Self::Texture(TextureHandle(raw)),
            ObjectKind::TextureView => Self::TextureView(TextureViewHandle(raw)),
            ObjectKind::Sampler => Self::Sampler(SamplerHandle(raw)),
            ObjectKind::Pipeline => Self::Pipeline(PipelineHandle(raw)),
            ObjectKind::PipelineLayout => Self::PipelineLayout(PipelineLayoutHandle(raw)),
            ObjectKind::DescriptorSetLayout => {
                Self::DescriptorSetLayout(DescriptorSetLayoutHandle(raw))
            }
            ObjectKind::DescriptorSet => Self::DescriptorSet(DescriptorSetHandle(raw)),
            ObjectKind::Event => Self::Event(EventHandle(raw)),
            ObjectKind::Semaphore => Self::Semaphore(SemaphoreHandle(raw)),
            ObjectKind::Fence => Self::Fence(FenceHandle(raw)),
            ObjectKind::RenderPass => Self::RenderPass(RenderPassHandle(raw)),
            ObjectKind::Framebuffer => Self::Framebuffer(FramebufferHandle(raw)),
            ObjectKind::CommandBuffer => return None,
        };
        Some(object)
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Buffer(_) => ObjectKind::Buffer,
            Self::Texture(_) => ObjectKind::Texture,
            Self::TextureView(_) => ObjectKind::TextureView,
            Self::Sampler(_) => ObjectKind::Sampler,
            Self::Pipeline(_) => ObjectKind::Pipeline,
            Self::PipelineLayout(_) => ObjectKind::PipelineLayout,
            Self::DescriptorSetLayout(_) => ObjectKind::DescriptorSetLayout,
            Self::DescriptorSet(_) => ObjectKind::DescriptorSet,
            Self::Event(_) => ObjectKind::Event,
            Self::Semaphore(_) => ObjectKind::Semaphore,
            Self::Fence(_) => ObjectKind::Fence,
            Self::RenderPass(_) => ObjectKind::RenderPass,
            Self::Framebuffer(_) => ObjectKind::Framebuffer,
        }
    }

    pub fn raw(&self) -> u64 {
        match *self {
            Self::Buffer(h) => h.0,
            Self::Texture(h) => h.0,
            Self::TextureView(h) => h.0,
            Self::Sampler(h) => h.0,
            Self::Pipeline(h) => h.0,
            Self::PipelineLayout(h) => h.0,
            Self::DescriptorSetLayout(h) => h.0,
            Self::DescriptorSet(h) => h.0,
            Self::Event(h) => h.0,
            Self::Semaphore(h) => h.0,
            Self::Fence(h) => h.0,
            Self::RenderPass(h) => h.0,
            Self::Framebuffer(h) => h.0,
        }
    }
}

/// One queue submission: command buffers executed in order, waiting on and
/// signaling binary semaphores, optionally signaling a fence on completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [CommandBufferHandle],
    pub wait_semaphores: &'a [SemaphoreHandle],
    pub signal_semaphores: &'a [SemaphoreHandle],
    pub signal_fence: Option<FenceHandle>,
}

/// Optional device capabilities discovered at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupportedFeatures {
    /// Rendering without render pass objects. When absent the frame core
    /// creates a [`crate::RenderPassCache`].
    pub dynamic_rendering: bool,
    /// Ray queries and acceleration structures.
    pub ray_tracing: bool,
    /// Fragment shading rate (variable rate shading).
    pub fragment_shading_rate: bool,
    /// A dedicated compute-only queue family exists.
    pub async_compute: bool,
}

/// Identification of the selected device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    /// Nanoseconds per timestamp query tick.
    pub timestamp_period: f32,
}

/// GPU backend trait for abstracting the device and allocator layer.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    fn device_info(&self) -> DeviceInfo;

    fn features(&self) -> SupportedFeatures;

    /// Create a buffer. Host-visible buffers are persistently mapped.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferHandle, FrameError>;

    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64, FrameError>;

    /// Copy `data` into a host-visible buffer at `offset`.
    fn write_mapped(&self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> Result<(), FrameError>;

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<TextureHandle, FrameError>;

    fn texture_info(&self, texture: TextureHandle) -> Result<TextureInfo, FrameError>;

    fn create_command_buffer(&self) -> Result<CommandBufferHandle, FrameError>;

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle);

    fn create_semaphore(&self) -> Result<SemaphoreHandle, FrameError>;

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle, FrameError>;

    /// Wait for a fence to be signaled.
    ///
    /// Returns `Ok(false)` if `timeout` elapsed first.
    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<bool, FrameError>;

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), FrameError>;

    /// Reset a command buffer and begin one-time-submit recording.
    fn begin_commands(&self, command_buffer: CommandBufferHandle) -> Result<(), FrameError>;

    fn end_commands(&self, command_buffer: CommandBufferHandle) -> Result<(), FrameError>;

    fn cmd_copy_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        source: BufferHandle,
        destination: BufferHandle,
        region: BufferCopyRegion,
    ) -> Result<(), FrameError>;

    /// Record a buffer-to-texture copy, leaving the texture ready for shader reads.
    fn cmd_copy_buffer_to_texture(
        &self,
        command_buffer: CommandBufferHandle,
        source: BufferHandle,
        destination: TextureHandle,
        regions: &[BufferTextureCopyRegion],
    ) -> Result<(), FrameError>;

    /// Make transfer writes recorded so far visible to later transfer reads and writes
    /// in the same command buffer.
    fn cmd_transfer_barrier(&self, command_buffer: CommandBufferHandle) -> Result<(), FrameError>;

    /// Begin rendering into the descriptor's targets.
    ///
    /// `binding` carries the cached render pass and framebuffer on devices without
    /// dynamic rendering.
    fn cmd_begin_render_pass(
        &self,
        command_buffer: CommandBufferHandle,
        descriptor: &RenderPassDescriptor,
        binding: RenderPassBinding,
    ) -> Result<(), FrameError>;

    fn cmd_end_render_pass(
        &self,
        command_buffer: CommandBufferHandle,
        binding: RenderPassBinding,
    ) -> Result<(), FrameError>;

    fn submit(&self, submission: &Submission<'_>) -> Result<(), FrameError>;

    /// Block until all submitted work has completed.
    fn wait_idle(&self) -> Result<(), FrameError>;

    /// Destroy an object immediately. The caller guarantees no pending GPU work uses it.
    fn destroy(&self, object: GpuObject);

    fn create_render_pass(&self, key: &RenderPassKey) -> Result<RenderPassHandle, FrameError>;

    fn create_framebuffer(&self, key: &FramebufferKey) -> Result<FramebufferHandle, FrameError>;
}

/// Selects and creates the backend requested by `params`.
///
/// [`BackendType::Auto`] tries Vulkan first and falls back to the dummy backend.
pub fn create_backend(params: &FrameParameters) -> Result<Arc<dyn GpuBackend>, FrameError> {
    match params.backend {
        BackendType::Dummy => {
            log::info!("Using dummy backend");
            Ok(Arc::new(dummy::DummyBackend::new()))
        }
        BackendType::Vulkan => create_vulkan(params),
        BackendType::Auto => match create_vulkan(params) {
            Ok(backend) => Ok(backend),
            Err(e) => {
                log::warn!("Failed to create Vulkan backend: {}", e);
                log::info!("Using dummy backend");
                Ok(Arc::new(dummy::DummyBackend::new()))
            }
        },
    }
}

#[cfg(feature = "vulkan-backend")]
fn create_vulkan(params: &FrameParameters) -> Result<Arc<dyn GpuBackend>, FrameError> {
    let backend = vulkan::VulkanBackend::new(params)?;
    log::info!("Using Vulkan backend (ash)");
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "vulkan-backend"))]
fn create_vulkan(_params: &FrameParameters) -> Result<Arc<dyn GpuBackend>, FrameError> {
    Err(crate::error::InitError::BackendUnavailable("vulkan").into())
}
