//! One frame-in-flight slot.

use parking_lot::Mutex;

use crate::backend::{CommandBufferHandle, FenceHandle, GpuBackend, GpuObject, SemaphoreHandle};
use crate::config::FrameParameters;
use crate::error::FrameError;
use crate::types::BufferDescriptor;

use super::deletion::DeletionQueue;
use super::upload::UploadStager;

/// Synchronization objects, command buffers and per-slot queues of one frame in flight.
///
/// The fence is created signaled so the first `begin_frame` on the slot does
/// not block.
pub(crate) struct FrameSlot {
    pub(crate) index: usize,
    pub(crate) command_buffer: CommandBufferHandle,
    pub(crate) upload_command_buffer: CommandBufferHandle,
    /// Signaled by the upload submission, waited on by the main submission.
    pub(crate) upload_semaphore: SemaphoreHandle,
    /// Signaled by the main submission for presentation.
    pub(crate) completion_semaphore: SemaphoreHandle,
    pub(crate) fence: FenceHandle,
    pub(crate) deletion: Mutex<DeletionQueue>,
    pub(crate) stager: Mutex<UploadStager>,
}

impl FrameSlot {
    pub(crate) fn new(
        backend: &dyn GpuBackend,
        params: &FrameParameters,
        index: usize,
    ) -> Result<Self, FrameError> {
        let staging = backend.create_buffer(
            &BufferDescriptor::staging(params.staging_size)
                .with_label(format!("frame {} staging", index)),
        )?;

        Ok(Self {
            index,
            command_buffer: backend.create_command_buffer()?,
            upload_command_buffer: backend.create_command_buffer()?,
            upload_semaphore: backend.create_semaphore()?,
            completion_semaphore: backend.create_semaphore()?,
            fence: backend.create_fence(true)?,
            deletion: Mutex::new(DeletionQueue::new()),
            stager: Mutex::new(UploadStager::new(
                staging,
                params.staging_size,
                params.overflow_policy,
            )),
        })
    }

    /// Release the slot's own objects. The device must be idle.
    pub(crate) fn destroy(&self, backend: &dyn GpuBackend) {
        log::trace!("Destroying frame slot {}", self.index);
        backend.free_command_buffer(self.command_buffer);
        backend.free_command_buffer(self.upload_command_buffer);
        backend.destroy(GpuObject::Semaphore(self.upload_semaphore));
        backend.destroy(GpuObject::Semaphore(self.completion_semaphore));
        backend.destroy(GpuObject::Fence(self.fence));
        backend.destroy(GpuObject::Buffer(self.stager.lock().staging_buffer()));
    }
}
