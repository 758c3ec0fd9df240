//! Per-slot staging of CPU to GPU uploads.
//!
//! Each frame slot owns one persistently mapped staging buffer. Producers copy
//! their bytes into it with a bump allocator and record what has to be copied
//! where. At `end_frame` the pending copies are written into the slot's upload
//! command buffer, which is submitted ahead of the frame's main work.
//!
//! Copies recorded into one command buffer are not ordered against each other,
//! so a transfer barrier is recorded before any copy that reads memory an
//! earlier copy wrote, or overwrites bytes or a texture an earlier copy wrote.
//!
//! The stager is open only between the slot's `begin_frame` and the point in
//! `end_frame` where its copies are recorded. Requests outside that window are
//! refused with [`FrameError::NotRecording`].

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use parking_lot::Mutex;

use crate::backend::{BufferHandle, CommandBufferHandle, GpuBackend, GpuObject, TextureHandle};
use crate::config::OverflowPolicy;
use crate::error::FrameError;
use crate::profiling::profile_function;
use crate::types::{BufferCopyRegion, BufferDescriptor};

use super::deletion::DeletionQueue;

/// Alignment of every staging sub-allocation, in bytes.
///
/// Satisfies the copy offset rules of all formats handled here, including
/// 16-byte compressed blocks.
pub const STAGING_ALIGNMENT: u64 = 16;

/// A buffer-to-buffer copy waiting for the slot's upload submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBufferUpload {
    pub destination: BufferHandle,
    /// Staging buffer holding the bytes.
    pub source: BufferHandle,
    pub source_offset: u64,
    pub size: u64,
    pub destination_offset: u64,
}

/// A buffer-to-texture copy waiting for the slot's upload submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTextureCopy {
    pub source: BufferHandle,
    pub destination: TextureHandle,
    pub source_offset: u64,
    /// Number of leading mip levels to copy. `None` copies all of them.
    pub mip_count: Option<u32>,
}

/// Bump-allocated staging region plus the two pending copy lists of one slot.
#[derive(Debug)]
pub struct UploadStager {
    staging: BufferHandle,
    capacity: u64,
    offset: u64,
    policy: OverflowPolicy,
    open: bool,
    buffer_uploads: Vec<PendingBufferUpload>,
    texture_copies: Vec<PendingTextureCopy>,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Copy destinations written since the last transfer barrier.
#[derive(Default)]
struct RecordedWrites {
    buffers: HashMap<BufferHandle, Vec<Range<u64>>>,
    textures: HashSet<TextureHandle>,
}

impl RecordedWrites {
    fn conflicts_with_buffer_upload(&self, upload: &PendingBufferUpload) -> bool {
        let range = upload.destination_range();
        self.buffers.contains_key(&upload.source)
            || self.buffers.get(&upload.destination).is_some_and(|written| {
                written
                    .iter()
                    .any(|w| w.start < range.end && range.start < w.end)
            })
    }

    fn conflicts_with_texture_copy(&self, copy: &PendingTextureCopy) -> bool {
        self.buffers.contains_key(&copy.source) || self.textures.contains(&copy.destination)
    }
}

impl PendingBufferUpload {
    fn destination_range(&self) -> Range<u64> {
        self.destination_offset..self.destination_offset + self.size
    }
}

impl UploadStager {
    /// Wrap a host-visible staging buffer of `capacity` bytes. The stager starts sealed.
    pub(crate) fn new(staging: BufferHandle, capacity: u64, policy: OverflowPolicy) -> Self {
        Self {
            staging,
            capacity,
            offset: 0,
            policy,
            open: false,
            buffer_uploads: Vec::new(),
            texture_copies: Vec::new(),
        }
    }

    pub fn staging_buffer(&self) -> BufferHandle {
        self.staging
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes of the staging region handed out since the last reset.
    pub fn used(&self) -> u64 {
        self.offset
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer_uploads.is_empty() || !self.texture_copies.is_empty()
    }

    pub fn pending_buffer_uploads(&self) -> &[PendingBufferUpload] {
        &self.buffer_uploads
    }

    pub fn pending_texture_copies(&self) -> &[PendingTextureCopy] {
        &self.texture_copies
    }

    /// Rewind the staging region and accept new requests.
    ///
    /// Only valid after the slot's previous submission has completed.
    pub(crate) fn reset(&mut self) {
        debug_assert!(!self.has_pending(), "stager reset with unrecorded copies");
        self.offset = 0;
        self.buffer_uploads.clear();
        self.texture_copies.clear();
        self.open = true;
    }

    /// Refuse further requests until the next reset.
    pub(crate) fn seal(&mut self) {
        self.open = false;
    }

    pub(crate) fn ensure_open(&self) -> Result<(), FrameError> {
        if self.open {
            Ok(())
        } else {
            Err(FrameError::NotRecording)
        }
    }

    /// Reserve `size` bytes of staging memory.
    ///
    /// Returns the buffer to write into and the offset within it. When the
    /// slot's region is exhausted, [`OverflowPolicy::Grow`] creates a dedicated
    /// staging buffer and queues it for deletion on the same slot, so it lives
    /// exactly as long as the upload that uses it.
    pub(crate) fn allocate(
        &mut self,
        backend: &dyn GpuBackend,
        size: u64,
        deletion: &Mutex<DeletionQueue>,
    ) -> Result<(BufferHandle, u64), FrameError> {
        self.ensure_open()?;

        let start = align_up(self.offset, STAGING_ALIGNMENT);
        if let Some(end) = start.checked_add(size) {
            if end <= self.capacity {
                self.offset = end;
                return Ok((self.staging, start));
            }
        }

        match self.policy {
            OverflowPolicy::Fail => Err(FrameError::StagingExhausted {
                requested: size,
                available: self.capacity.saturating_sub(start),
            }),
            OverflowPolicy::Grow => {
                log::warn!(
                    "Staging region exhausted ({} of {} bytes used), allocating a dedicated {} byte staging buffer",
                    self.offset,
                    self.capacity,
                    size
                );
                let buffer = backend.create_buffer(
                    &BufferDescriptor::staging(size).with_label("overflow staging"),
                )?;
                deletion.lock().queue(GpuObject::Buffer(buffer));
                Ok((buffer, 0))
            }
        }
    }

    /// Allocate staging memory and copy `data` into it.
    pub(crate) fn stage(
        &mut self,
        backend: &dyn GpuBackend,
        data: &[u8],
        deletion: &Mutex<DeletionQueue>,
    ) -> Result<(BufferHandle, u64), FrameError> {
        let (buffer, offset) = self.allocate(backend, data.len() as u64, deletion)?;
        backend.write_mapped(buffer, offset, data)?;
        Ok((buffer, offset))
    }

    pub(crate) fn push_buffer_upload(&mut self, upload: PendingBufferUpload) {
        log::trace!(
            "Staged {} bytes for buffer {:#x} at offset {}",
            upload.size,
            upload.destination.raw(),
            upload.destination_offset
        );
        self.buffer_uploads.push(upload);
    }

    pub(crate) fn push_texture_copy(&mut self, copy: PendingTextureCopy) {
        log::trace!(
            "Staged copy into texture {:#x} ({:?} mips)",
            copy.destination.raw(),
            copy.mip_count
        );
        self.texture_copies.push(copy);
    }

    /// Record every pending copy into `command_buffer` and seal the stager.
    ///
    /// Buffer copies are recorded first, then texture copies, each list in
    /// enqueue order, with transfer barriers between copies that depend on
    /// each other. Both lists are empty afterwards. Returns the number of
    /// copies recorded.
    pub(crate) fn write_upload_commands(
        &mut self,
        backend: &dyn GpuBackend,
        command_buffer: CommandBufferHandle,
    ) -> Result<usize, FrameError> {
        profile_function!();
        self.seal();

        let count = self.buffer_uploads.len() + self.texture_copies.len();
        let mut writes = RecordedWrites::default();
        let mut barriers = 0;
        for upload in self.buffer_uploads.drain(..) {
            if writes.conflicts_with_buffer_upload(&upload) {
                backend.cmd_transfer_barrier(command_buffer)?;
                writes = RecordedWrites::default();
                barriers += 1;
            }
            backend.cmd_copy_buffer(
                command_buffer,
                upload.source,
                upload.destination,
                BufferCopyRegion {
                    src_offset: upload.source_offset,
                    dst_offset: upload.destination_offset,
                    size: upload.size,
                },
            )?;
            writes
                .buffers
                .entry(upload.destination)
                .or_default()
                .push(upload.destination_range());
        }
        for copy in self.texture_copies.drain(..) {
            if writes.conflicts_with_texture_copy(&copy) {
                backend.cmd_transfer_barrier(command_buffer)?;
                writes = RecordedWrites::default();
                barriers += 1;
            }
            let info = backend.texture_info(copy.destination)?;
            let mip_count = copy.mip_count.unwrap_or(info.mip_level_count);
            let regions = info.copy_regions(copy.source_offset, mip_count);
            backend.cmd_copy_buffer_to_texture(
                command_buffer,
                copy.source,
                copy.destination,
                &regions,
            )?;
            writes.textures.insert(copy.destination);
        }
        if barriers > 0 {
            log::trace!("Recorded {} copies with {} transfer barriers", count, barriers);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::{ObjectKind, Submission};
    use crate::types::{BufferUsage, TextureDescriptor, TextureFormat, TextureUsage};

    fn open_stager(
        backend: &DummyBackend,
        capacity: u64,
        policy: OverflowPolicy,
    ) -> UploadStager {
        let staging = backend
            .create_buffer(&BufferDescriptor::staging(capacity))
            .unwrap();
        let mut stager = UploadStager::new(staging, capacity, policy);
        stager.reset();
        stager
    }

    #[test]
    fn test_allocations_are_aligned() {
        let backend = DummyBackend::new();
        let deletion = Mutex::new(DeletionQueue::new());
        let mut stager = open_stager(&backend, 64, OverflowPolicy::Fail);

        let (_, first) = stager.stage(&backend, &[1, 2, 3], &deletion).unwrap();
        let (_, second) = stager.stage(&backend, &[4; 5], &deletion).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 16);
        assert_eq!(stager.used(), 21);

        let contents = backend.buffer_contents(stager.staging_buffer()).unwrap();
        assert_eq!(&contents[..3], &[1, 2, 3]);
        assert_eq!(&contents[16..21], &[4; 5]);
    }

    #[test]
    fn test_fail_policy_reports_exhaustion() {
        let backend = DummyBackend::new();
        let deletion = Mutex::new(DeletionQueue::new());
        let mut stager = open_stager(&backend, 32, OverflowPolicy::Fail);

        stager.allocate(&backend, 10, &deletion).unwrap();
        let err = stager.allocate(&backend, 20, &deletion).unwrap_err();
        assert_eq!(
            err,
            FrameError::StagingExhausted {
                requested: 20,
                available: 16
            }
        );
        assert!(deletion.lock().is_empty());
    }

    #[test]
    fn test_grow_policy_uses_dedicated_buffer() {
        let backend = DummyBackend::new();
        let deletion = Mutex::new(DeletionQueue::new());
        let mut stager = open_stager(&backend, 32, OverflowPolicy::Grow);

        let (buffer, offset) = stager.stage(&backend, &[7; 48], &deletion).unwrap();
        assert_ne!(buffer, stager.staging_buffer());
        assert_eq!(offset, 0);
        assert_eq!(backend.buffer_contents(buffer).unwrap(), vec![7; 48]);
        assert_eq!(deletion.lock().len(), 1);

        // The regular region is untouched and still usable.
        let (buffer, offset) = stager.stage(&backend, &[1; 8], &deletion).unwrap();
        assert_eq!(buffer, stager.staging_buffer());
        assert_eq!(offset, 0);
    }

    #[test]
    fn test_sealed_stager_refuses_requests() {
        let backend = DummyBackend::new();
        let deletion = Mutex::new(DeletionQueue::new());
        let staging = backend.create_buffer(&BufferDescriptor::staging(16)).unwrap();
        let mut stager = UploadStager::new(staging, 16, OverflowPolicy::Grow);

        assert_eq!(
            stager.allocate(&backend, 4, &deletion).unwrap_err(),
            FrameError::NotRecording
        );
        stager.reset();
        assert!(stager.allocate(&backend, 4, &deletion).is_ok());
        stager.seal();
        assert_eq!(stager.ensure_open().unwrap_err(), FrameError::NotRecording);
        assert_eq!(backend.live_count(ObjectKind::Buffer), 1);
    }

    #[test]
    fn test_write_upload_commands_copies_in_order() {
        let backend = DummyBackend::new();
        let deletion = Mutex::new(DeletionQueue::new());
        let mut stager = open_stager(&backend, 256, OverflowPolicy::Fail);
        let destination = backend
            .create_buffer(&BufferDescriptor::new(8, BufferUsage::COPY_DST))
            .unwrap();
        let texture = backend
            .create_texture(&TextureDescriptor::new_2d(
                2,
                2,
                TextureFormat::R8Unorm,
                TextureUsage::COPY_DST,
            ))
            .unwrap();

        // Two writes to the same range: the later one must win.
        for value in [1u8, 2] {
            let (source, source_offset) = stager.stage(&backend, &[value; 8], &deletion).unwrap();
            stager.push_buffer_upload(PendingBufferUpload {
                destination,
                source,
                source_offset,
                size: 8,
                destination_offset: 0,
            });
        }
        let (source, source_offset) = stager.stage(&backend, &[5, 6, 7, 8], &deletion).unwrap();
        stager.push_texture_copy(PendingTextureCopy {
            source,
            destination: texture,
            source_offset,
            mip_count: None,
        });
        assert!(stager.has_pending());

        let cb = backend.create_command_buffer().unwrap();
        backend.begin_commands(cb).unwrap();
        assert_eq!(stager.write_upload_commands(&backend, cb).unwrap(), 3);
        assert!(!stager.has_pending());
        assert!(!stager.is_open());
        backend.end_commands(cb).unwrap();
        backend
            .submit(&Submission {
                command_buffers: &[cb],
                ..Default::default()
            })
            .unwrap();
        backend.wait_idle().unwrap();

        assert_eq!(backend.buffer_contents(destination).unwrap(), vec![2; 8]);
        assert_eq!(backend.texture_contents(texture).unwrap(), vec![5, 6, 7, 8]);
        // Only the overwrite of the same bytes needed ordering.
        assert_eq!(backend.transfer_barrier_count(), 1);
        assert!(backend.violations().is_empty());
    }

    #[test]
    fn test_texture_copy_from_uploaded_buffer_waits_for_upload() {
        let backend = DummyBackend::new();
        let deletion = Mutex::new(DeletionQueue::new());
        let mut stager = open_stager(&backend, 256, OverflowPolicy::Fail);
        let intermediate = backend
            .create_buffer(&BufferDescriptor::new(
                16,
                BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            ))
            .unwrap();
        let first = backend
            .create_texture(&TextureDescriptor::new_2d(
                2,
                2,
                TextureFormat::R8Unorm,
                TextureUsage::COPY_DST,
            ))
            .unwrap();
        let second = backend
            .create_texture(&TextureDescriptor::new_2d(
                2,
                2,
                TextureFormat::R8Unorm,
                TextureUsage::COPY_DST,
            ))
            .unwrap();

        let (source, source_offset) = stager.stage(&backend, &[1, 2, 3, 4], &deletion).unwrap();
        stager.push_buffer_upload(PendingBufferUpload {
            destination: intermediate,
            source,
            source_offset,
            size: 4,
            destination_offset: 8,
        });
        // Reads the bytes uploaded above, then overwrites the same texture twice.
        for destination in [first, first, second] {
            stager.push_texture_copy(PendingTextureCopy {
                source: intermediate,
                destination,
                source_offset: 8,
                mip_count: None,
            });
        }

        let cb = backend.create_command_buffer().unwrap();
        backend.begin_commands(cb).unwrap();
        assert_eq!(stager.write_upload_commands(&backend, cb).unwrap(), 4);
        backend.end_commands(cb).unwrap();
        backend
            .submit(&Submission {
                command_buffers: &[cb],
                ..Default::default()
            })
            .unwrap();
        backend.wait_idle().unwrap();

        assert_eq!(backend.texture_contents(first).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(backend.texture_contents(second).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(backend.transfer_barrier_count(), 2);
        assert!(backend.violations().is_empty());
    }
}
