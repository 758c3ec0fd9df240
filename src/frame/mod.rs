//! Frame scheduling: a fixed ring of frames in flight.
//!
//! [`FrameCore`] owns [`MAX_FRAMES_IN_FLIGHT`] slots and cycles through them:
//!
//! ```text
//! begin_frame (slot i)
//!   wait fence(i) -> flush deletions(i) -> begin upload + main command buffers
//!   -> reset stager(i)
//!
//! ... record into frame_command_buffer(), queue uploads, drop resources ...
//!
//! end_frame (slot i)
//!   record staged copies -> submit uploads (signal upload semaphore)
//!   reset fence(i) -> submit main work (wait upload semaphore,
//!   signal fence(i) + completion semaphore)
//!   i = (i + 1) % N
//! ```
//!
//! The fence is reset only right before the submission that signals it again,
//! so a frame that fails before submitting leaves the slot claimable.
//!
//! The CPU can run at most `N - 1` frames ahead of the device: `begin_frame`
//! blocks until the work last submitted on the slot has completed. Only then
//! are the slot's deferred deletions executed and its staging memory reused.

mod deletion;
mod slot;
mod upload;

pub use deletion::{DeletionQueue, DeletionSink};
pub use upload::{PendingBufferUpload, PendingTextureCopy, UploadStager, STAGING_ALIGNMENT};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::backend::{
    create_backend, BufferHandle, CommandBufferHandle, GpuBackend, SemaphoreHandle, Submission,
    TextureHandle,
};
use crate::config::FrameParameters;
use crate::error::FrameError;
use crate::profiling::{frame_mark, profile_function, profile_plot, profile_scope};
use crate::render_pass::{ActiveRenderPass, RenderPassBinding, RenderPassDescriptor};
use crate::render_pass_cache::RenderPassCache;
use crate::resources::{Buffer, Texture};
use crate::types::{BufferDescriptor, TextureDescriptor, TextureInfo, TextureUsage};

use slot::FrameSlot;

/// Number of frames the CPU may record while the device still executes earlier ones.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

// The frame cursor packs the current slot index and the recording flag into one
// atomic so producers never observe an index from one frame paired with the
// recording state of another.
const RECORDING_BIT: usize = 1;

const fn cursor(index: usize, recording: bool) -> usize {
    (index << 1) | recording as usize
}

const fn cursor_index(cursor: usize) -> usize {
    cursor >> 1
}

const fn cursor_recording(cursor: usize) -> bool {
    cursor & RECORDING_BIT != 0
}

/// Reject textures a buffer-to-texture copy cannot write.
fn check_copy_destination(info: &TextureInfo) -> Result<(), FrameError> {
    if !info.usage.contains(TextureUsage::COPY_DST) {
        return Err(FrameError::InvalidParameter(
            "texture was not created with COPY_DST usage".to_string(),
        ));
    }
    if info.sample_count != 1 {
        return Err(FrameError::InvalidParameter(format!(
            "cannot copy into a texture with {} samples",
            info.sample_count
        )));
    }
    if info.format.has_stencil() {
        return Err(FrameError::InvalidParameter(format!(
            "cannot copy into combined depth-stencil format {:?}",
            info.format
        )));
    }
    Ok(())
}

/// State shared between the core and the deletion sinks handed to resources.
pub(crate) struct FrameShared {
    pub(crate) backend: Arc<dyn GpuBackend>,
    pub(crate) slots: Vec<FrameSlot>,
    cursor: AtomicUsize,
}

impl FrameShared {
    fn load_cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Slot whose pending or in-progress work may reference an object dropped now.
    ///
    /// During a frame that is the current slot. Between frames it is the slot
    /// submitted most recently.
    pub(crate) fn deletion_slot_index(&self) -> usize {
        let cursor = self.load_cursor();
        let index = cursor_index(cursor);
        if cursor_recording(cursor) {
            index
        } else {
            (index + MAX_FRAMES_IN_FLIGHT - 1) % MAX_FRAMES_IN_FLIGHT
        }
    }
}

/// Frame-in-flight scheduler and owner of the per-frame resource lifecycle.
///
/// `FrameCore` is `Send + Sync`. One thread drives [`begin_frame`](Self::begin_frame)
/// and [`end_frame`](Self::end_frame); any thread may queue uploads and drop
/// resources concurrently.
pub struct FrameCore {
    shared: Arc<FrameShared>,
    render_pass_cache: Option<RenderPassCache>,
    queue_lock: Mutex<()>,
    params: FrameParameters,
    frame_number: AtomicU64,
}

impl std::fmt::Debug for FrameCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCore")
            .field("backend", &self.shared.backend.name())
            .field("frame_index", &self.frame_index())
            .field("recording", &self.is_recording())
            .field("frame_number", &self.frame_number())
            .finish_non_exhaustive()
    }
}

impl FrameCore {
    /// Create the frame core on an existing backend.
    ///
    /// A [`RenderPassCache`] is created when the device lacks dynamic rendering.
    pub fn new(backend: Arc<dyn GpuBackend>, params: FrameParameters) -> Result<Self, FrameError> {
        if params.staging_size == 0 {
            return Err(FrameError::InvalidParameter(
                "staging size must be greater than zero".to_string(),
            ));
        }

        let slots = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|index| FrameSlot::new(backend.as_ref(), &params, index))
            .collect::<Result<Vec<_>, _>>()?;

        let render_pass_cache = if backend.features().dynamic_rendering {
            None
        } else {
            log::debug!("Dynamic rendering unavailable, using render pass cache");
            Some(RenderPassCache::new(backend.clone()))
        };

        log::info!(
            "Frame core created on {} ({}, {} frames in flight, {} bytes of staging per frame)",
            backend.device_info().name,
            backend.name(),
            MAX_FRAMES_IN_FLIGHT,
            params.staging_size
        );

        Ok(Self {
            shared: Arc::new(FrameShared {
                backend,
                slots,
                cursor: AtomicUsize::new(cursor(0, false)),
            }),
            render_pass_cache,
            queue_lock: Mutex::new(()),
            params,
            frame_number: AtomicU64::new(0),
        })
    }

    /// Create the backend selected by `params` and a frame core on it.
    pub fn with_parameters(params: FrameParameters) -> Result<Self, FrameError> {
        let backend = create_backend(&params)?;
        Self::new(backend, params)
    }

    /// Claim the current slot and start recording a frame.
    ///
    /// Blocks until the work submitted on this slot `N` frames ago has completed,
    /// then destroys the slot's deferred objects and rewinds its staging memory.
    ///
    /// # Panics
    ///
    /// Panics if a frame is already being recorded.
    pub fn begin_frame(&self) -> Result<(), FrameError> {
        profile_function!();
        let cursor_value = self.shared.load_cursor();
        assert!(
            !cursor_recording(cursor_value),
            "begin_frame called while a frame is already being recorded"
        );
        let index = cursor_index(cursor_value);
        let slot = &self.shared.slots[index];
        let backend = self.shared.backend.as_ref();

        {
            profile_scope!("wait_frame_fence");
            while !backend.wait_fence(slot.fence, self.params.fence_timeout)? {
                log::warn!(
                    "Frame slot {} not signaled after {:?}, still waiting",
                    index,
                    self.params.fence_timeout
                );
            }
        }

        let destroyed = slot.deletion.lock().flush(backend);
        if destroyed > 0 {
            log::debug!(
                "Frame slot {}: destroyed {} deferred objects",
                index,
                destroyed
            );
        }

        backend.begin_commands(slot.upload_command_buffer)?;
        backend.begin_commands(slot.command_buffer)?;
        slot.stager.lock().reset();

        self.shared
            .cursor
            .store(cursor(index, true), Ordering::Release);
        log::trace!(
            "Began frame {} on slot {}",
            self.frame_number.load(Ordering::Relaxed),
            index
        );
        Ok(())
    }

    /// Finish the current frame and submit it.
    ///
    /// Staged uploads are submitted first in their own command buffer; the
    /// main command buffer waits for them before executing.
    ///
    /// # Panics
    ///
    /// Panics if no frame is being recorded.
    pub fn end_frame(&self) -> Result<(), FrameError> {
        profile_function!();
        let cursor_value = self.shared.load_cursor();
        assert!(
            cursor_recording(cursor_value),
            "end_frame called without a matching begin_frame"
        );
        let index = cursor_index(cursor_value);
        let slot = &self.shared.slots[index];
        let backend = self.shared.backend.as_ref();

        let _queue = self.queue_lock.lock();

        let uploads = {
            let mut stager = slot.stager.lock();
            profile_plot!("staging bytes", stager.used());
            stager.write_upload_commands(backend, slot.upload_command_buffer)?
        };
        backend.end_commands(slot.upload_command_buffer)?;
        if uploads > 0 {
            backend.submit(&Submission {
                command_buffers: std::slice::from_ref(&slot.upload_command_buffer),
                signal_semaphores: std::slice::from_ref(&slot.upload_semaphore),
                ..Default::default()
            })?;
        }

        backend.end_commands(slot.command_buffer)?;
        backend.reset_fence(slot.fence)?;
        let wait_semaphores: &[SemaphoreHandle] = if uploads > 0 {
            std::slice::from_ref(&slot.upload_semaphore)
        } else {
            &[]
        };
        let signal_semaphores: &[SemaphoreHandle] = if self.params.signal_present_semaphore {
            std::slice::from_ref(&slot.completion_semaphore)
        } else {
            &[]
        };
        backend.submit(&Submission {
            command_buffers: std::slice::from_ref(&slot.command_buffer),
            wait_semaphores,
            signal_semaphores,
            signal_fence: Some(slot.fence),
        })?;

        self.shared.cursor.store(
            cursor((index + 1) % MAX_FRAMES_IN_FLIGHT, false),
            Ordering::Release,
        );
        let number = self.frame_number.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "Submitted frame {} on slot {} ({} uploads)",
            number,
            index,
            uploads
        );
        frame_mark!();
        Ok(())
    }

    /// Command buffer of the frame being recorded.
    ///
    /// # Panics
    ///
    /// Panics outside a `begin_frame`/`end_frame` window.
    pub fn frame_command_buffer(&self) -> CommandBufferHandle {
        let cursor_value = self.shared.load_cursor();
        assert!(
            cursor_recording(cursor_value),
            "frame_command_buffer called outside a recording window"
        );
        self.shared.slots[cursor_index(cursor_value)].command_buffer
    }

    /// Main command buffer of slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= MAX_FRAMES_IN_FLIGHT`.
    pub fn frame_command_buffer_at(&self, index: usize) -> CommandBufferHandle {
        assert!(
            index < MAX_FRAMES_IN_FLIGHT,
            "frame slot index {} out of range",
            index
        );
        self.shared.slots[index].command_buffer
    }

    /// Semaphore signaled when the current slot's main submission completes.
    pub fn frame_completion_semaphore(&self) -> SemaphoreHandle {
        self.shared.slots[cursor_index(self.shared.load_cursor())].completion_semaphore
    }

    pub fn frame_index(&self) -> u32 {
        cursor_index(self.shared.load_cursor()) as u32
    }

    pub fn next_frame_index(&self) -> u32 {
        (self.frame_index() + 1) % self.num_frames_in_flight()
    }

    pub fn previous_frame_index(&self) -> u32 {
        let n = self.num_frames_in_flight();
        (self.frame_index() + n - 1) % n
    }

    pub const fn num_frames_in_flight(&self) -> u32 {
        MAX_FRAMES_IN_FLIGHT as u32
    }

    /// Number of frames submitted so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number.load(Ordering::Relaxed)
    }

    /// Whether a frame is between `begin_frame` and `end_frame`.
    pub fn is_recording(&self) -> bool {
        cursor_recording(self.shared.load_cursor())
    }

    /// Block until all submitted work of every slot has completed.
    ///
    /// Meant for shutdown and resizes, not per-frame use.
    pub fn wait_idle(&self) -> Result<(), FrameError> {
        profile_function!();
        let _queue = self.queue_lock.lock();
        self.shared.backend.wait_idle()
    }

    /// Lock serializing queue submissions. Hold it while presenting.
    pub fn queue_lock(&self) -> MutexGuard<'_, ()> {
        self.queue_lock.lock()
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.shared.backend
    }

    pub fn parameters(&self) -> &FrameParameters {
        &self.params
    }

    /// Capability for handing objects over to deferred destruction.
    pub fn deletion_sink(&self) -> DeletionSink {
        DeletionSink::new(self.shared.clone())
    }

    /// Render pass cache, present when the device lacks dynamic rendering.
    pub fn render_pass_cache(&self) -> Option<&RenderPassCache> {
        self.render_pass_cache.as_ref()
    }

    /// Create a buffer whose destruction is deferred until the device is done with it.
    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<Buffer, FrameError> {
        let handle = self.shared.backend.create_buffer(descriptor)?;
        Ok(Buffer::new(handle, descriptor, self.deletion_sink()))
    }

    /// Create a texture whose destruction is deferred until the device is done with it.
    pub fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<Texture, FrameError> {
        let handle = self.shared.backend.create_texture(descriptor)?;
        Ok(Texture::new(handle, descriptor.info(), self.deletion_sink()))
    }

    /// Stage `data` for upload into `buffer` at `destination_offset`.
    ///
    /// The copy executes before the current frame's main work. Empty data is a no-op.
    pub fn queue_buffer_upload(
        &self,
        buffer: BufferHandle,
        data: &[u8],
        destination_offset: u64,
    ) -> Result<(), FrameError> {
        if data.is_empty() {
            return Ok(());
        }
        profile_function!();

        let size = data.len() as u64;
        let buffer_size = self.shared.backend.buffer_size(buffer)?;
        let in_bounds = destination_offset
            .checked_add(size)
            .is_some_and(|end| end <= buffer_size);
        if !in_bounds {
            return Err(FrameError::InvalidParameter(format!(
                "upload of {} bytes at offset {} exceeds buffer size {}",
                size, destination_offset, buffer_size
            )));
        }

        self.with_stager(|stager, slot| {
            let (source, source_offset) =
                stager.stage(self.shared.backend.as_ref(), data, &slot.deletion)?;
            stager.push_buffer_upload(PendingBufferUpload {
                destination: buffer,
                source,
                source_offset,
                size,
                destination_offset,
            });
            Ok(())
        })
    }

    /// [`queue_buffer_upload`](Self::queue_buffer_upload) for plain-old-data slices.
    pub fn queue_buffer_upload_pod<T: bytemuck::Pod>(
        &self,
        buffer: BufferHandle,
        data: &[T],
        destination_offset: u64,
    ) -> Result<(), FrameError> {
        self.queue_buffer_upload(buffer, bytemuck::cast_slice(data), destination_offset)
    }

    /// Stage the first `mip_count` levels of `texture` (all when `None`).
    ///
    /// `data` holds the levels back to back, each tightly packed with all array
    /// layers contiguous. Extra trailing bytes are ignored.
    pub fn queue_texture_upload(
        &self,
        texture: TextureHandle,
        data: &[u8],
        mip_count: Option<u32>,
    ) -> Result<(), FrameError> {
        profile_function!();
        let info = self.shared.backend.texture_info(texture)?;
        check_copy_destination(&info)?;
        let mip_count = mip_count.unwrap_or(info.mip_level_count);
        if mip_count == 0 || mip_count > info.mip_level_count {
            return Err(FrameError::InvalidParameter(format!(
                "mip count {} out of range for a texture with {} levels",
                mip_count, info.mip_level_count
            )));
        }
        let required = info.upload_size(mip_count);
        if (data.len() as u64) < required {
            return Err(FrameError::InvalidParameter(format!(
                "texture data has {} bytes, {} mip levels need {}",
                data.len(),
                mip_count,
                required
            )));
        }

        self.with_stager(|stager, slot| {
            let (source, source_offset) = stager.stage(
                self.shared.backend.as_ref(),
                &data[..required as usize],
                &slot.deletion,
            )?;
            stager.push_texture_copy(PendingTextureCopy {
                source,
                destination: texture,
                source_offset,
                mip_count: Some(mip_count),
            });
            Ok(())
        })
    }

    /// Copy every mip level of `texture` from `buffer`, starting at `buffer_offset`.
    ///
    /// The buffer must stay alive until the frame completes; dropping its wrapper
    /// during the frame is enough.
    pub fn queue_buffer_to_texture_copy(
        &self,
        buffer: BufferHandle,
        texture: TextureHandle,
        buffer_offset: u64,
    ) -> Result<(), FrameError> {
        let backend = self.shared.backend.as_ref();
        let info = backend.texture_info(texture)?;
        check_copy_destination(&info)?;
        let required = info.upload_size(info.mip_level_count);
        let buffer_size = backend.buffer_size(buffer)?;
        let in_bounds = buffer_offset
            .checked_add(required)
            .is_some_and(|end| end <= buffer_size);
        if !in_bounds {
            return Err(FrameError::InvalidParameter(format!(
                "copy of {} bytes at offset {} exceeds buffer size {}",
                required, buffer_offset, buffer_size
            )));
        }

        self.with_stager(|stager, _| {
            stager.push_texture_copy(PendingTextureCopy {
                source: buffer,
                destination: texture,
                source_offset: buffer_offset,
                mip_count: None,
            });
            Ok(())
        })
    }

    /// Begin a render pass on the frame's command buffer.
    ///
    /// Uses dynamic rendering when the device supports it. Otherwise the pass and
    /// its imageless framebuffer come from the [`RenderPassCache`], so equal
    /// target configurations reuse the same objects every frame.
    ///
    /// # Panics
    ///
    /// Panics outside a `begin_frame`/`end_frame` window.
    pub fn begin_render_pass(
        &self,
        descriptor: &RenderPassDescriptor,
    ) -> Result<ActiveRenderPass, FrameError> {
        profile_function!();
        let command_buffer = self.frame_command_buffer();
        let backend = self.shared.backend.as_ref();
        let color = descriptor
            .color
            .map(|target| backend.texture_info(target.texture))
            .transpose()?;
        let depth = descriptor
            .depth
            .map(|target| backend.texture_info(target.texture))
            .transpose()?;
        descriptor.validate(color.as_ref(), depth.as_ref())?;

        let binding = match &self.render_pass_cache {
            None => RenderPassBinding::Dynamic,
            Some(cache) => {
                let key = descriptor.render_pass_key(color.as_ref(), depth.as_ref());
                let render_pass = cache.get_pass(&key)?;
                let key = descriptor.framebuffer_key(render_pass, color.as_ref(), depth.as_ref());
                let framebuffer = cache.get_framebuffer(&key)?;
                RenderPassBinding::Cached {
                    render_pass,
                    framebuffer,
                }
            }
        };
        backend.cmd_begin_render_pass(command_buffer, descriptor, binding)?;
        Ok(ActiveRenderPass {
            command_buffer,
            binding,
        })
    }

    /// End a render pass begun with [`begin_render_pass`](Self::begin_render_pass).
    pub fn end_render_pass(&self, pass: ActiveRenderPass) -> Result<(), FrameError> {
        self.shared
            .backend
            .cmd_end_render_pass(pass.command_buffer, pass.binding)
    }

    /// Run `f` with the current slot's stager locked, if it accepts requests.
    fn with_stager<R>(
        &self,
        f: impl FnOnce(&mut UploadStager, &FrameSlot) -> Result<R, FrameError>,
    ) -> Result<R, FrameError> {
        let slot = &self.shared.slots[cursor_index(self.shared.load_cursor())];
        let mut stager = slot.stager.lock();
        stager.ensure_open()?;
        f(&mut stager, slot)
    }
}

impl Drop for FrameCore {
    fn drop(&mut self) {
        if self.is_recording() {
            log::warn!("Frame core dropped while a frame is being recorded");
        }
        if let Err(e) = self.wait_idle() {
            log::error!("Failed to wait for device idle during shutdown: {}", e);
        }

        let backend = self.shared.backend.as_ref();
        let mut destroyed = 0;
        for slot in &self.shared.slots {
            destroyed += slot.deletion.lock().close(backend);
        }
        for slot in &self.shared.slots {
            slot.destroy(backend);
        }
        log::info!(
            "Frame core destroyed after {} frames ({} deferred objects released)",
            self.frame_number(),
            destroyed
        );
    }
}
