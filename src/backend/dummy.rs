//! Dummy GPU backend for testing and development.
//!
//! This backend simulates a device well enough to observe frame scheduling
//! without GPU hardware:
//!
//! - buffers and textures are backed by host memory, so copies really happen
//! - submissions are executed in FIFO order by a background "GPU thread"
//! - fences and binary semaphores carry real signaled state
//! - the GPU thread can be paused to hold work in the queue
//!
//! Misuse that a real device would punish with undefined behavior is recorded
//! as a [`Violation`] instead. That covers destroying an object a queued
//! submission references, writing a staging buffer the GPU is still reading,
//! waiting on a semaphore nobody signaled, and transfer commands that touch
//! memory an earlier copy wrote without a barrier in between.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::FrameError;
use crate::profiling::set_thread_name;
use crate::render_pass::{RenderPassBinding, RenderPassDescriptor};
use crate::render_pass_cache::{FramebufferKey, RenderPassKey};
use crate::types::{
    BufferCopyRegion, BufferDescriptor, BufferTextureCopyRegion, MemoryLocation,
    TextureDescriptor, TextureInfo,
};

use super::{
    BufferHandle, CommandBufferHandle, DeviceInfo, FenceHandle, FramebufferHandle, GpuBackend,
    GpuObject, ObjectKind, RenderPassHandle, SemaphoreHandle, Submission, SupportedFeatures,
    TextureHandle,
};

/// Misuse detected by the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// An object was destroyed while a queued submission still referenced it.
    DestroyedWhileInUse(GpuObject),
    /// Destruction of an object that does not exist (never created, or already destroyed).
    UnknownObject(GpuObject),
    /// Host write into a buffer that a queued submission still uses.
    HostWriteWhileInUse(BufferHandle),
    /// A command buffer was reset, submitted or freed while still pending.
    CommandBufferInUse(CommandBufferHandle),
    /// A fence was reset while a queued submission will signal it.
    FenceResetWhilePending(FenceHandle),
    /// A submission waited on a semaphore that was never signaled.
    WaitOnUnsignaledSemaphore(SemaphoreHandle),
    /// A copy command addressed memory outside its resource.
    CopyOutOfBounds(String),
    /// A transfer command read or overwrote memory written earlier in the same
    /// submission with no transfer barrier in between.
    TransferHazard(String),
    /// Render pass begin and end commands did not pair up within a submission.
    UnbalancedRenderPass(String),
}

/// A render pass as executed by the device, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassRecord {
    /// Attachments in binding order: depth first, then color.
    pub attachments: Vec<TextureHandle>,
    pub binding: RenderPassBinding,
}

/// A submission as seen by the device, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub command_buffers: Vec<CommandBufferHandle>,
    pub wait_semaphores: Vec<SemaphoreHandle>,
    pub signal_semaphores: Vec<SemaphoreHandle>,
    pub signal_fence: Option<FenceHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
}

#[derive(Debug, Clone)]
enum Command {
    CopyBuffer {
        source: u64,
        destination: u64,
        region: BufferCopyRegion,
    },
    CopyBufferToTexture {
        source: u64,
        destination: u64,
        regions: Vec<BufferTextureCopyRegion>,
    },
    TransferBarrier,
    BeginRenderPass {
        attachments: Vec<u64>,
        binding: RenderPassBinding,
    },
    EndRenderPass,
}

impl Command {
    fn resources(&self) -> Vec<u64> {
        match self {
            Self::CopyBuffer {
                source,
                destination,
                ..
            }
            | Self::CopyBufferToTexture {
                source,
                destination,
                ..
            } => vec![*source, *destination],
            Self::BeginRenderPass {
                attachments,
                binding,
            } => {
                let mut resources = attachments.clone();
                if let RenderPassBinding::Cached {
                    render_pass,
                    framebuffer,
                } = binding
                {
                    resources.extend([render_pass.0, framebuffer.0]);
                }
                resources
            }
            Self::TransferBarrier | Self::EndRenderPass => Vec::new(),
        }
    }
}

/// Transfer writes executed since the last barrier.
#[derive(Default)]
struct UnsyncedWrites {
    buffers: HashMap<u64, Vec<Range<u64>>>,
    textures: HashSet<u64>,
}

impl UnsyncedWrites {
    fn written(&self, raw: u64) -> bool {
        self.buffers.contains_key(&raw) || self.textures.contains(&raw)
    }

    fn overlaps(&self, buffer: u64, range: &Range<u64>) -> bool {
        self.buffers.get(&buffer).is_some_and(|ranges| {
            ranges
                .iter()
                .any(|r| r.start < range.end && range.start < r.end)
        })
    }
}

enum Object {
    Buffer {
        data: Vec<u8>,
        location: MemoryLocation,
    },
    Texture {
        info: TextureInfo,
        data: Vec<u8>,
    },
    CommandBuffer {
        state: CommandBufferState,
        commands: Vec<Command>,
    },
    Semaphore {
        signaled: bool,
    },
    Fence {
        signaled: bool,
    },
    /// Objects with no simulated contents (views, samplers, passes, ...).
    Opaque(ObjectKind),
}

impl Object {
    fn kind(&self) -> ObjectKind {
        match self {
            Self::Buffer { .. } => ObjectKind::Buffer,
            Self::Texture { .. } => ObjectKind::Texture,
            Self::CommandBuffer { .. } => ObjectKind::CommandBuffer,
            Self::Semaphore { .. } => ObjectKind::Semaphore,
            Self::Fence { .. } => ObjectKind::Fence,
            Self::Opaque(kind) => *kind,
        }
    }
}

struct QueuedSubmission {
    record: SubmissionRecord,
    commands: Vec<Command>,
    references: HashSet<u64>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    objects: HashMap<u64, Object>,
    queue: VecDeque<QueuedSubmission>,
    paused: bool,
    shutdown: bool,
    completed: usize,
    violations: Vec<Violation>,
    destroyed: Vec<GpuObject>,
    submissions: Vec<SubmissionRecord>,
    render_passes: Vec<RenderPassRecord>,
    transfer_barriers: usize,
    created: HashMap<ObjectKind, usize>,
}

struct Shared {
    state: Mutex<State>,
    /// Wakes the GPU thread when work is queued, the device resumes or shuts down.
    work_available: Condvar,
    /// Notified after every completed submission.
    work_done: Condvar,
}

/// Dummy GPU backend.
pub struct DummyBackend {
    shared: Arc<Shared>,
    features: SupportedFeatures,
    gpu_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DummyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DummyBackend")
            .field("objects", &state.objects.len())
            .field("queued", &state.queue.len())
            .field("paused", &state.paused)
            .finish_non_exhaustive()
    }
}

fn unknown(kind: ObjectKind, raw: u64) -> FrameError {
    FrameError::UnknownHandle { kind, raw }
}

fn byte_range(offset: u64, size: u64, len: usize) -> Option<Range<usize>> {
    let end = offset.checked_add(size)?;
    if end > len as u64 {
        return None;
    }
    Some(offset as usize..end as usize)
}

impl State {
    fn insert(&mut self, object: Object) -> u64 {
        self.next_id += 1;
        *self.created.entry(object.kind()).or_default() += 1;
        self.objects.insert(self.next_id, object);
        self.next_id
    }

    fn is_in_use(&self, raw: u64) -> bool {
        self.queue.iter().any(|s| s.references.contains(&raw))
    }

    fn violation(&mut self, violation: Violation) {
        log::error!("DummyBackend: {:?}", violation);
        self.violations.push(violation);
    }

    fn command_buffer_mut(
        &mut self,
        handle: CommandBufferHandle,
    ) -> Result<(&mut CommandBufferState, &mut Vec<Command>), FrameError> {
        match self.objects.get_mut(&handle.0) {
            Some(Object::CommandBuffer { state, commands }) => Ok((state, commands)),
            _ => Err(unknown(ObjectKind::CommandBuffer, handle.0)),
        }
    }

    fn record(&mut self, handle: CommandBufferHandle, command: Command) -> Result<(), FrameError> {
        let (state, commands) = self.command_buffer_mut(handle)?;
        if *state != CommandBufferState::Recording {
            return Err(FrameError::InvalidParameter(format!(
                "command buffer {:#x} is not recording",
                handle.0
            )));
        }
        commands.push(command);
        Ok(())
    }

    fn expect_kind(&self, raw: u64, kind: ObjectKind) -> Result<(), FrameError> {
        match self.objects.get(&raw) {
            Some(object) if object.kind() == kind => Ok(()),
            _ => Err(unknown(kind, raw)),
        }
    }

    fn read_buffer(&self, raw: u64, offset: u64, size: u64) -> Option<Vec<u8>> {
        match self.objects.get(&raw) {
            Some(Object::Buffer { data, .. }) => {
                byte_range(offset, size, data.len()).map(|r| data[r].to_vec())
            }
            _ => None,
        }
    }

    fn execute(&mut self, submission: QueuedSubmission) {
        for semaphore in &submission.record.wait_semaphores {
            if let Some(Object::Semaphore { signaled }) = self.objects.get_mut(&semaphore.0) {
                let was_signaled = std::mem::replace(signaled, false);
                if !was_signaled {
                    self.violation(Violation::WaitOnUnsignaledSemaphore(*semaphore));
                }
            }
        }

        let mut writes = UnsyncedWrites::default();
        let mut in_render_pass = false;
        for command in submission.commands {
            match command {
                Command::CopyBuffer {
                    source,
                    destination,
                    region,
                } => {
                    let written = region.dst_offset..region.dst_offset.saturating_add(region.size);
                    if writes.written(source) || writes.overlaps(destination, &written) {
                        self.violation(Violation::TransferHazard(format!(
                            "copy from buffer {:#x} into buffer {:#x} bytes {:?}",
                            source, destination, written
                        )));
                    }
                    writes.buffers.entry(destination).or_default().push(written);
                    self.copy_buffer(source, destination, region);
                }
                Command::CopyBufferToTexture {
                    source,
                    destination,
                    regions,
                } => {
                    if writes.written(source) || writes.written(destination) {
                        self.violation(Violation::TransferHazard(format!(
                            "copy from buffer {:#x} into texture {:#x}",
                            source, destination
                        )));
                    }
                    writes.textures.insert(destination);
                    for region in regions {
                        self.copy_buffer_to_texture(source, destination, region);
                    }
                }
                Command::TransferBarrier => {
                    writes = UnsyncedWrites::default();
                    self.transfer_barriers += 1;
                }
                Command::BeginRenderPass {
                    attachments,
                    binding,
                } => {
                    if in_render_pass {
                        self.violation(Violation::UnbalancedRenderPass(
                            "render pass begun inside another".to_string(),
                        ));
                    }
                    in_render_pass = true;
                    self.render_passes.push(RenderPassRecord {
                        attachments: attachments.into_iter().map(TextureHandle).collect(),
                        binding,
                    });
                }
                Command::EndRenderPass => {
                    if !in_render_pass {
                        self.violation(Violation::UnbalancedRenderPass(
                            "render pass ended without being begun".to_string(),
                        ));
                    }
                    in_render_pass = false;
                }
            }
        }
        if in_render_pass {
            self.violation(Violation::UnbalancedRenderPass(
                "render pass still open at the end of a submission".to_string(),
            ));
        }

        for semaphore in &submission.record.signal_semaphores {
            if let Some(Object::Semaphore { signaled }) = self.objects.get_mut(&semaphore.0) {
                *signaled = true;
            }
        }
        if let Some(fence) = submission.record.signal_fence {
            if let Some(Object::Fence { signaled }) = self.objects.get_mut(&fence.0) {
                *signaled = true;
            }
        }
        for command_buffer in &submission.record.command_buffers {
            if let Ok((state, _)) = self.command_buffer_mut(*command_buffer) {
                *state = CommandBufferState::Executable;
            }
        }
        self.completed += 1;
    }

    fn copy_buffer(&mut self, source: u64, destination: u64, region: BufferCopyRegion) {
        let Some(bytes) = self.read_buffer(source, region.src_offset, region.size) else {
            self.violation(Violation::CopyOutOfBounds(format!(
                "read of {} bytes at {} from buffer {:#x}",
                region.size, region.src_offset, source
            )));
            return;
        };
        if let Some(Object::Buffer { data, .. }) = self.objects.get_mut(&destination) {
            if let Some(range) = byte_range(region.dst_offset, region.size, data.len()) {
                data[range].copy_from_slice(&bytes);
                return;
            }
        }
        self.violation(Violation::CopyOutOfBounds(format!(
            "write of {} bytes at {} into buffer {:#x}",
            region.size, region.dst_offset, destination
        )));
    }

    fn copy_buffer_to_texture(
        &mut self,
        source: u64,
        destination: u64,
        region: BufferTextureCopyRegion,
    ) {
        let Some(Object::Texture { info, .. }) = self.objects.get(&destination) else {
            self.violation(Violation::CopyOutOfBounds(format!(
                "copy into missing texture {:#x}",
                destination
            )));
            return;
        };
        let info = *info;
        let layer_size = info.mip_level_size(region.mip_level) / u64::from(info.array_layer_count);
        let size = layer_size * u64::from(region.array_layer_count);
        let texture_offset =
            info.upload_size(region.mip_level) + layer_size * u64::from(region.base_array_layer);

        let Some(bytes) = self.read_buffer(source, region.buffer_offset, size) else {
            self.violation(Violation::CopyOutOfBounds(format!(
                "read of {} bytes at {} from buffer {:#x} for mip {}",
                size, region.buffer_offset, source, region.mip_level
            )));
            return;
        };
        if let Some(Object::Texture { data, .. }) = self.objects.get_mut(&destination) {
            if let Some(range) = byte_range(texture_offset, size, data.len()) {
                data[range].copy_from_slice(&bytes);
                return;
            }
        }
        self.violation(Violation::CopyOutOfBounds(format!(
            "write of mip {} layers {}..{} into texture {:#x}",
            region.mip_level,
            region.base_array_layer,
            region.base_array_layer + region.array_layer_count,
            destination
        )));
    }
}

fn run_gpu_thread(shared: Arc<Shared>) {
    set_thread_name!("Dummy GPU");
    let mut state = shared.state.lock();
    loop {
        while !state.shutdown && (state.paused || state.queue.is_empty()) {
            shared.work_available.wait(&mut state);
        }
        if state.shutdown {
            break;
        }
        if let Some(submission) = state.queue.pop_front() {
            log::trace!(
                "DummyBackend: executing submission of {} command buffer(s)",
                submission.record.command_buffers.len()
            );
            state.execute(submission);
            shared.work_done.notify_all();
        }
    }
}

impl DummyBackend {
    /// Create a new dummy backend reporting no optional features.
    pub fn new() -> Self {
        Self::with_features(SupportedFeatures::default())
    }

    /// Create a dummy backend that reports the given optional features.
    pub fn with_features(features: SupportedFeatures) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            work_available: Condvar::new(),
            work_done: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let gpu_thread = std::thread::Builder::new()
            .name("dummy-gpu".into())
            .spawn(move || run_gpu_thread(thread_shared))
            .ok();
        if gpu_thread.is_none() {
            log::error!(
                "DummyBackend: failed to spawn GPU thread, submissions will never complete"
            );
        }

        Self {
            shared,
            features,
            gpu_thread: Mutex::new(gpu_thread),
        }
    }

    /// Stop executing submissions. Queued work stays pending until [`Self::resume`].
    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.shared.state.lock().paused = false;
        self.shared.work_available.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// Submissions queued but not yet executed.
    pub fn pending_submissions(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn completed_submissions(&self) -> usize {
        self.shared.state.lock().completed
    }

    /// Every submission received so far, in order.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.shared.state.lock().submissions.clone()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.shared.state.lock().violations.clone()
    }

    /// Render passes executed so far, in order.
    pub fn render_passes(&self) -> Vec<RenderPassRecord> {
        self.shared.state.lock().render_passes.clone()
    }

    /// Transfer barriers executed so far.
    pub fn transfer_barrier_count(&self) -> usize {
        self.shared.state.lock().transfer_barriers
    }

    /// Objects destroyed so far, in destruction order.
    pub fn destroyed_objects(&self) -> Vec<GpuObject> {
        self.shared.state.lock().destroyed.clone()
    }

    /// Number of objects of `kind` ever created.
    pub fn created_count(&self, kind: ObjectKind) -> usize {
        self.shared
            .state
            .lock()
            .created
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    /// Number of objects of `kind` currently alive.
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.shared
            .state
            .lock()
            .objects
            .values()
            .filter(|o| o.kind() == kind)
            .count()
    }

    pub fn is_alive(&self, object: GpuObject) -> bool {
        self.shared
            .state
            .lock()
            .objects
            .get(&object.raw())
            .is_some_and(|o| o.kind() == object.kind())
    }

    /// Register an object the core never creates itself (a sampler, a pipeline, ...),
    /// standing in for one made directly through the device.
    pub fn create_object(&self, kind: ObjectKind) -> GpuObject {
        assert!(
            kind != ObjectKind::CommandBuffer,
            "command buffers are created with create_command_buffer"
        );
        let raw = self.shared.state.lock().insert(Object::Opaque(kind));
        match GpuObject::from_raw(kind, raw) {
            Some(object) => object,
            None => unreachable!("every kind except command buffers maps to an object"),
        }
    }

    /// Current contents of a buffer, regardless of its memory location.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        match self.shared.state.lock().objects.get(&buffer.0) {
            Some(Object::Buffer { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Current contents of a texture: every mip level tightly packed, level 0 first.
    pub fn texture_contents(&self, texture: TextureHandle) -> Option<Vec<u8>> {
        match self.shared.state.lock().objects.get(&texture.0) {
            Some(Object::Texture { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DummyBackend {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_available.notify_all();
        if let Some(thread) = self.gpu_thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "Dummy Adapter".to_string(),
            timestamp_period: 1.0,
        }
    }

    fn features(&self) -> SupportedFeatures {
        self.features
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferHandle, FrameError> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        let id = self.shared.state.lock().insert(Object::Buffer {
            data: vec![0; descriptor.size as usize],
            location: descriptor.location,
        });
        Ok(BufferHandle(id))
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<u64, FrameError> {
        match self.shared.state.lock().objects.get(&buffer.0) {
            Some(Object::Buffer { data, .. }) => Ok(data.len() as u64),
            _ => Err(unknown(ObjectKind::Buffer, buffer.0)),
        }
    }

    fn write_mapped(
        &self,
        buffer: BufferHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), FrameError> {
        let mut state = self.shared.state.lock();
        if state.is_in_use(buffer.0) {
            state.violation(Violation::HostWriteWhileInUse(buffer));
        }
        let Some(Object::Buffer { data, location }) = state.objects.get_mut(&buffer.0) else {
            return Err(unknown(ObjectKind::Buffer, buffer.0));
        };
        if !location.is_host_visible() {
            return Err(FrameError::InvalidParameter(format!(
                "buffer {:#x} is not host visible",
                buffer.0
            )));
        }
        let range = byte_range(offset, bytes.len() as u64, data.len()).ok_or_else(|| {
            FrameError::InvalidParameter(format!(
                "write of {} bytes at offset {} exceeds buffer size {}",
                bytes.len(),
                offset,
                data.len()
            ))
        })?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<TextureHandle, FrameError> {
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}x{})",
            descriptor.label,
            descriptor.size.width,
            descriptor.size.height,
            descriptor.size.depth
        );
        if descriptor.mip_level_count == 0 || descriptor.array_layer_count == 0 {
            return Err(FrameError::InvalidParameter(
                "texture needs at least one mip level and one array layer".to_string(),
            ));
        }
        let info = descriptor.info();
        let data = vec![0; info.upload_size(info.mip_level_count) as usize];
        let id = self
            .shared
            .state
            .lock()
            .insert(Object::Texture { info, data });
        Ok(TextureHandle(id))
    }

    fn texture_info(&self, texture: TextureHandle) -> Result<TextureInfo, FrameError> {
        match self.shared.state.lock().objects.get(&texture.0) {
            Some(Object::Texture { info, .. }) => Ok(*info),
            _ => Err(unknown(ObjectKind::Texture, texture.0)),
        }
    }

    fn create_command_buffer(&self) -> Result<CommandBufferHandle, FrameError> {
        let id = self.shared.state.lock().insert(Object::CommandBuffer {
            state: CommandBufferState::Initial,
            commands: Vec::new(),
        });
        Ok(CommandBufferHandle(id))
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        let mut state = self.shared.state.lock();
        if state.is_in_use(command_buffer.0) {
            state.violation(Violation::CommandBufferInUse(command_buffer));
        }
        state.objects.remove(&command_buffer.0);
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle, FrameError> {
        let id = self
            .shared
            .state
            .lock()
            .insert(Object::Semaphore { signaled: false });
        Ok(SemaphoreHandle(id))
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle, FrameError> {
        let id = self.shared.state.lock().insert(Object::Fence { signaled });
        Ok(FenceHandle(id))
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<bool, FrameError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.state.lock();
        loop {
            match state.objects.get(&fence.0) {
                Some(Object::Fence { signaled: true }) => return Ok(true),
                Some(Object::Fence { signaled: false }) => {}
                _ => return Err(unknown(ObjectKind::Fence, fence.0)),
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .work_done
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return Ok(matches!(
                            state.objects.get(&fence.0),
                            Some(Object::Fence { signaled: true })
                        ));
                    }
                }
                None => self.shared.work_done.wait(&mut state),
            }
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), FrameError> {
        let mut state = self.shared.state.lock();
        if state.is_in_use(fence.0) {
            state.violation(Violation::FenceResetWhilePending(fence));
        }
        match state.objects.get_mut(&fence.0) {
            Some(Object::Fence { signaled }) => {
                *signaled = false;
                Ok(())
            }
            _ => Err(unknown(ObjectKind::Fence, fence.0)),
        }
    }

    fn begin_commands(&self, command_buffer: CommandBufferHandle) -> Result<(), FrameError> {
        let mut state = self.shared.state.lock();
        let pending = *state.command_buffer_mut(command_buffer)?.0 == CommandBufferState::Pending;
        if pending {
            state.violation(Violation::CommandBufferInUse(command_buffer));
        }
        let (cb_state, commands) = state.command_buffer_mut(command_buffer)?;
        *cb_state = CommandBufferState::Recording;
        commands.clear();
        Ok(())
    }

    fn end_commands(&self, command_buffer: CommandBufferHandle) -> Result<(), FrameError> {
        let mut state = self.shared.state.lock();
        let (cb_state, _) = state.command_buffer_mut(command_buffer)?;
        if *cb_state != CommandBufferState::Recording {
            return Err(FrameError::InvalidParameter(format!(
                "command buffer {:#x} is not recording",
                command_buffer.0
            )));
        }
        *cb_state = CommandBufferState::Executable;
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        source: BufferHandle,
        destination: BufferHandle,
        region: BufferCopyRegion,
    ) -> Result<(), FrameError> {
        let mut state = self.shared.state.lock();
        state.expect_kind(source.0, ObjectKind::Buffer)?;
        state.expect_kind(destination.0, ObjectKind::Buffer)?;
        state.record(
            command_buffer,
            Command::CopyBuffer {
                source: source.0,
                destination: destination.0,
                region,
            },
        )
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        command_buffer: CommandBufferHandle,
        source: BufferHandle,
        destination: TextureHandle,
        regions: &[BufferTextureCopyRegion],
    ) -> Result<(), FrameError> {
        let mut state = self.shared.state.lock();
        state.expect_kind(source.0, ObjectKind::Buffer)?;
        state.expect_kind(destination.0, ObjectKind::Texture)?;
        state.record(
            command_buffer,
            Command::CopyBufferToTexture {
                source: source.0,
                destination: destination.0,
                regions: regions.to_vec(),
            },
        )
    }

    fn cmd_transfer_barrier(&self, command_buffer: CommandBufferHandle) -> Result<(), FrameError> {
        self.shared
            .state
            .lock()
            .record(command_buffer, Command::TransferBarrier)
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: CommandBufferHandle,
        descriptor: &RenderPassDescriptor,
        binding: RenderPassBinding,
    ) -> Result<(), FrameError> {
        let mut state = self.shared.state.lock();
        let mut attachments = Vec::with_capacity(2);
        for target in descriptor.targets() {
            state.expect_kind(target.texture.0, ObjectKind::Texture)?;
            attachments.push(target.texture.0);
        }
        match binding {
            RenderPassBinding::Dynamic if !self.features.dynamic_rendering => {
                return Err(FrameError::InvalidParameter(
                    "dynamic rendering is not supported".to_string(),
                ));
            }
            RenderPassBinding::Dynamic => {}
            RenderPassBinding::Cached {
                render_pass,
                framebuffer,
            } => {
                state.expect_kind(render_pass.0, ObjectKind::RenderPass)?;
                state.expect_kind(framebuffer.0, ObjectKind::Framebuffer)?;
            }
        }
        state.record(
            command_buffer,
            Command::BeginRenderPass {
                attachments,
                binding,
            },
        )
    }

    fn cmd_end_render_pass(
        &self,
        command_buffer: CommandBufferHandle,
        _binding: RenderPassBinding,
    ) -> Result<(), FrameError> {
        self.shared
            .state
            .lock()
            .record(command_buffer, Command::EndRenderPass)
    }

    fn submit(&self, submission: &Submission<'_>) -> Result<(), FrameError> {
        let mut state = self.shared.state.lock();

        for semaphore in submission
            .wait_semaphores
            .iter()
            .chain(submission.signal_semaphores)
        {
            state.expect_kind(semaphore.0, ObjectKind::Semaphore)?;
        }
        if let Some(fence) = submission.signal_fence {
            state.expect_kind(fence.0, ObjectKind::Fence)?;
        }

        let mut commands = Vec::new();
        let mut references = HashSet::new();
        for &command_buffer in submission.command_buffers {
            let (cb_state, recorded) = state.command_buffer_mut(command_buffer)?;
            match *cb_state {
                CommandBufferState::Executable => {}
                CommandBufferState::Pending => {
                    state.violation(Violation::CommandBufferInUse(command_buffer));
                    continue;
                }
                CommandBufferState::Initial | CommandBufferState::Recording => {
                    return Err(FrameError::InvalidParameter(format!(
                        "command buffer {:#x} was submitted without being ended",
                        command_buffer.0
                    )));
                }
            }
            *cb_state = CommandBufferState::Pending;
            for command in recorded.iter() {
                references.extend(command.resources());
            }
            commands.extend(recorded.iter().cloned());
            references.insert(command_buffer.0);
        }
        references.extend(submission.wait_semaphores.iter().map(|s| s.0));
        references.extend(submission.signal_semaphores.iter().map(|s| s.0));
        references.extend(submission.signal_fence.map(|f| f.0));

        let record = SubmissionRecord {
            command_buffers: submission.command_buffers.to_vec(),
            wait_semaphores: submission.wait_semaphores.to_vec(),
            signal_semaphores: submission.signal_semaphores.to_vec(),
            signal_fence: submission.signal_fence,
        };
        state.submissions.push(record.clone());
        state.queue.push_back(QueuedSubmission {
            record,
            commands,
            references,
        });
        self.shared.work_available.notify_one();
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), FrameError> {
        let mut state = self.shared.state.lock();
        if state.paused && !state.queue.is_empty() {
            log::warn!("DummyBackend: wait_idle while paused blocks until resume");
        }
        while !state.queue.is_empty() {
            self.shared.work_done.wait(&mut state);
        }
        Ok(())
    }

    fn destroy(&self, object: GpuObject) {
        let raw = object.raw();
        let mut state = self.shared.state.lock();
        let exists = state
            .objects
            .get(&raw)
            .is_some_and(|o| o.kind() == object.kind());
        if !exists {
            state.violation(Violation::UnknownObject(object));
            return;
        }
        if state.is_in_use(raw) {
            state.violation(Violation::DestroyedWhileInUse(object));
        }
        log::trace!("DummyBackend: destroying {} {:#x}", object.kind(), raw);
        state.objects.remove(&raw);
        state.destroyed.push(object);
    }

    fn create_render_pass(&self, key: &RenderPassKey) -> Result<RenderPassHandle, FrameError> {
        log::trace!("DummyBackend: creating render pass {:?}", key);
        let id = self
            .shared
            .state
            .lock()
            .insert(Object::Opaque(ObjectKind::RenderPass));
        Ok(RenderPassHandle(id))
    }

    fn create_framebuffer(&self, key: &FramebufferKey) -> Result<FramebufferHandle, FrameError> {
        let mut state = self.shared.state.lock();
        state.expect_kind(key.render_pass.0, ObjectKind::RenderPass)?;
        let id = state.insert(Object::Opaque(ObjectKind::Framebuffer));
        Ok(FramebufferHandle(id))
    }
}
