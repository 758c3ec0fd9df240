//! # gpu-frames
//!
//! Frame-synchronized resource lifecycle for a low-level GPU renderer.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`FrameCore`] - a fixed ring of [`MAX_FRAMES_IN_FLIGHT`] frames, each with its own
//!   command buffers, fence and semaphores
//! - Deferred destruction: resources dropped while the GPU may still use them are queued
//!   on a frame slot and destroyed once that slot's fence has been observed
//! - Staged uploads: buffer and texture data copied through per-frame staging memory and
//!   submitted ahead of the frame's main work
//! - Render pass recording through dynamic rendering, or through the [`RenderPassCache`] of
//!   compiled render passes and framebuffers on devices without it
//! - Two backends: Vulkan (feature `vulkan-backend`) and Dummy (simulated, for testing)
//!
//! ## Example
//!
//! ```
//! use gpu_frames::{BackendType, BufferDescriptor, BufferUsage, FrameCore, FrameParameters};
//!
//! let core = FrameCore::with_parameters(
//!     FrameParameters::new()
//!         .with_backend(BackendType::Dummy)
//!         .with_staging_size(1024 * 1024),
//! )?;
//! let vertices = core.create_buffer(&BufferDescriptor::new(
//!     256,
//!     BufferUsage::VERTEX | BufferUsage::COPY_DST,
//! ))?;
//!
//! core.begin_frame()?;
//! core.queue_buffer_upload_pod(vertices.handle(), &[0.0f32; 64], 0)?;
//! // Record draws into core.frame_command_buffer()...
//! core.end_frame()?;
//!
//! drop(vertices); // destroyed once the frame above has completed
//! core.wait_idle()?;
//! # Ok::<(), gpu_frames::FrameError>(())
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod profiling;
pub mod render_pass;
pub mod render_pass_cache;
pub mod resources;
pub mod types;

// Re-export main types for convenience
pub use backend::dummy::DummyBackend;
pub use backend::{
    create_backend, BufferHandle, CommandBufferHandle, GpuBackend, GpuObject, ObjectKind,
    SemaphoreHandle, SupportedFeatures, TextureHandle,
};
pub use config::{BackendType, FrameParameters, OverflowPolicy};
pub use error::{FrameError, InitError};
pub use frame::{DeletionSink, FrameCore, MAX_FRAMES_IN_FLIGHT};
pub use render_pass::{
    ActiveRenderPass, ClearValue, RenderPassBinding, RenderPassDescriptor, RenderTarget,
};
pub use render_pass_cache::{
    AttachmentDescriptor, FramebufferAttachment, FramebufferKey, RenderPassCache, RenderPassKey,
};
pub use resources::{Buffer, Texture};
pub use types::{
    BufferDescriptor, BufferUsage, Extent3d, LoadOp, MemoryLocation, StoreOp, TextureDescriptor,
    TextureFormat, TextureUsage,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
