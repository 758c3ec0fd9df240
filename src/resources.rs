//! Owning wrappers for GPU resources.
//!
//! Dropping a wrapper never destroys the underlying object directly; it hands the
//! object to the frame core's [`DeletionSink`], which destroys it once no
//! submitted work can reference it any more.

use crate::backend::{BufferHandle, GpuObject, TextureHandle};
use crate::frame::DeletionSink;
use crate::types::{BufferDescriptor, BufferUsage, MemoryLocation, TextureInfo};

/// A GPU buffer with deferred destruction.
#[derive(Debug)]
pub struct Buffer {
    handle: BufferHandle,
    label: Option<String>,
    size: u64,
    usage: BufferUsage,
    location: MemoryLocation,
    sink: DeletionSink,
}

impl Buffer {
    pub(crate) fn new(
        handle: BufferHandle,
        descriptor: &BufferDescriptor,
        sink: DeletionSink,
    ) -> Self {
        Self {
            handle,
            label: descriptor.label.clone(),
            size: descriptor.size,
            usage: descriptor.usage,
            location: descriptor.location,
            sink,
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.sink.queue_object_deletion(GpuObject::Buffer(self.handle));
    }
}

/// A GPU texture with deferred destruction.
#[derive(Debug)]
pub struct Texture {
    handle: TextureHandle,
    info: TextureInfo,
    sink: DeletionSink,
}

impl Texture {
    pub(crate) fn new(handle: TextureHandle, info: TextureInfo, sink: DeletionSink) -> Self {
        Self { handle, info, sink }
    }

    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn info(&self) -> &TextureInfo {
        &self.info
    }

    /// Bytes needed to upload the whole mip chain.
    pub fn upload_size(&self) -> u64 {
        self.info.upload_size(self.info.mip_level_count)
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.sink.queue_object_deletion(GpuObject::Texture(self.handle));
    }
}
