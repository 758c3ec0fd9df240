//! Render pass and framebuffer cache.
//!
//! Devices without dynamic rendering need a render pass object for every
//! attachment configuration a pipeline or a draw uses. The cache compiles
//! each distinct [`RenderPassKey`] once and hands out the same handle for
//! every structurally equal key afterwards. Imageless framebuffers are
//! cached the same way by [`FramebufferKey`].
//!
//! Entries are never invalidated while the device lives. The cache is owned
//! by [`crate::FrameCore`] and releases every entry when the core is dropped,
//! after the device has gone idle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{FramebufferHandle, GpuBackend, GpuObject, RenderPassHandle};
use crate::error::FrameError;
use crate::types::{LoadOp, StoreOp, TextureFormat, TextureUsage};

/// Format, sample count and load/store behavior of one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDescriptor {
    pub format: TextureFormat,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub samples: u32,
}

impl AttachmentDescriptor {
    /// Single-sampled attachment.
    pub fn new(format: TextureFormat, load_op: LoadOp, store_op: StoreOp) -> Self {
        Self {
            format,
            load_op,
            store_op,
            samples: 1,
        }
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }
}

/// Identity of a render pass: one optional color and one optional depth attachment
/// rendered with the given multiview mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RenderPassKey {
    /// Bit `i` set renders view `i`. Zero disables multiview.
    pub view_mask: u32,
    pub color: Option<AttachmentDescriptor>,
    pub depth: Option<AttachmentDescriptor>,
}

/// Image properties of one imageless framebuffer attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferAttachment {
    pub format: TextureFormat,
    pub usage: TextureUsage,
    /// Raw image creation flags of the images that will be bound.
    pub flags: u32,
}

/// Identity of an imageless framebuffer.
///
/// Attachments are bound in the render pass's order: depth first, then color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub width: u32,
    pub height: u32,
    pub layer_count: u32,
    pub render_pass: RenderPassHandle,
    pub color: Option<FramebufferAttachment>,
    pub depth: Option<FramebufferAttachment>,
}

impl FramebufferKey {
    /// Attachments in binding order.
    pub fn attachments(&self) -> impl Iterator<Item = &FramebufferAttachment> {
        self.depth.iter().chain(self.color.iter())
    }
}

/// Key-to-handle cache of compiled render passes and framebuffers.
pub struct RenderPassCache {
    backend: Arc<dyn GpuBackend>,
    passes: Mutex<HashMap<RenderPassKey, RenderPassHandle>>,
    framebuffers: Mutex<HashMap<FramebufferKey, FramebufferHandle>>,
}

impl std::fmt::Debug for RenderPassCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPassCache")
            .field("passes", &self.passes.lock().len())
            .field("framebuffers", &self.framebuffers.lock().len())
            .finish()
    }
}

impl RenderPassCache {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            backend,
            passes: Mutex::new(HashMap::new()),
            framebuffers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the render pass for `key`, compiling it on first use.
    ///
    /// Structurally equal keys always return the same handle.
    pub fn get_pass(&self, key: &RenderPassKey) -> Result<RenderPassHandle, FrameError> {
        let mut passes = self.passes.lock();
        if let Some(&pass) = passes.get(key) {
            return Ok(pass);
        }

        let pass = self.backend.create_render_pass(key)?;
        log::debug!(
            "Compiled render pass {:#x} (view mask {:#b}, color: {}, depth: {})",
            pass.raw(),
            key.view_mask,
            key.color.is_some(),
            key.depth.is_some()
        );
        passes.insert(*key, pass);
        Ok(pass)
    }

    /// Get the imageless framebuffer for `key`, creating it on first use.
    pub fn get_framebuffer(&self, key: &FramebufferKey) -> Result<FramebufferHandle, FrameError> {
        let mut framebuffers = self.framebuffers.lock();
        if let Some(&framebuffer) = framebuffers.get(key) {
            return Ok(framebuffer);
        }

        let framebuffer = self.backend.create_framebuffer(key)?;
        log::debug!(
            "Created framebuffer {:#x} ({}x{}, {} layer(s))",
            framebuffer.raw(),
            key.width,
            key.height,
            key.layer_count
        );
        framebuffers.insert(*key, framebuffer);
        Ok(framebuffer)
    }

    /// Number of compiled render passes.
    pub fn pass_count(&self) -> usize {
        self.passes.lock().len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.lock().len()
    }
}

impl Drop for RenderPassCache {
    fn drop(&mut self) {
        for (_, framebuffer) in self.framebuffers.get_mut().drain() {
            self.backend.destroy(GpuObject::Framebuffer(framebuffer));
        }
        for (_, pass) in self.passes.get_mut().drain() {
            self.backend.destroy(GpuObject::RenderPass(pass));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::ObjectKind;

    fn color_key(format: TextureFormat) -> RenderPassKey {
        RenderPassKey {
            view_mask: 0,
            color: Some(AttachmentDescriptor::new(
                format,
                LoadOp::Clear,
                StoreOp::Store,
            )),
            depth: None,
        }
    }

    #[test]
    fn test_equal_keys_share_a_pass() {
        let dummy = Arc::new(DummyBackend::new());
        let cache = RenderPassCache::new(dummy.clone());

        let first = cache.get_pass(&color_key(TextureFormat::Rgba8Unorm)).unwrap();
        let second = cache.get_pass(&color_key(TextureFormat::Rgba8Unorm)).unwrap();
        let other = cache.get_pass(&color_key(TextureFormat::Bgra8Unorm)).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(cache.pass_count(), 2);
        assert_eq!(dummy.created_count(ObjectKind::RenderPass), 2);
    }

    #[test]
    fn test_keys_differ_by_every_field() {
        let dummy = Arc::new(DummyBackend::new());
        let cache = RenderPassCache::new(dummy.clone());
        let base = color_key(TextureFormat::Rgba8Unorm);

        let multiview = RenderPassKey {
            view_mask: 0b11,
            ..base
        };
        let with_depth = RenderPassKey {
            depth: Some(AttachmentDescriptor::new(
                TextureFormat::Depth32Float,
                LoadOp::Clear,
                StoreOp::DontCare,
            )),
            ..base
        };
        let msaa = RenderPassKey {
            color: base.color.map(|c| c.with_samples(4)),
            ..base
        };

        let load = RenderPassKey {
            color: base.color.map(|c| AttachmentDescriptor {
                load_op: LoadOp::Load,
                ..c
            }),
            ..base
        };
        let discard = RenderPassKey {
            color: base.color.map(|c| AttachmentDescriptor {
                store_op: StoreOp::DontCare,
                ..c
            }),
            ..base
        };
        let other_format = color_key(TextureFormat::Rgba16Float);
        let depth_only = RenderPassKey {
            color: None,
            ..with_depth
        };

        let keys = [
            base,
            multiview,
            with_depth,
            msaa,
            load,
            discard,
            other_format,
            depth_only,
        ];
        let handles = keys
            .iter()
            .map(|key| cache.get_pass(key).unwrap())
            .collect::<std::collections::HashSet<_>>();
        assert_eq!(handles.len(), 8);
    }

    #[test]
    fn test_framebuffers_are_cached_and_released_on_drop() {
        let dummy = Arc::new(DummyBackend::new());
        let cache = RenderPassCache::new(dummy.clone());
        let pass = cache.get_pass(&color_key(TextureFormat::Rgba8Unorm)).unwrap();

        let key = FramebufferKey {
            width: 640,
            height: 480,
            layer_count: 1,
            render_pass: pass,
            color: Some(FramebufferAttachment {
                format: TextureFormat::Rgba8Unorm,
                usage: TextureUsage::RENDER_ATTACHMENT,
                flags: 0,
            }),
            depth: None,
        };
        let framebuffer = cache.get_framebuffer(&key).unwrap();
        assert_eq!(cache.get_framebuffer(&key).unwrap(), framebuffer);
        assert_eq!(key.attachments().count(), 1);

        drop(cache);
        assert_eq!(dummy.live_count(ObjectKind::RenderPass), 0);
        assert_eq!(dummy.live_count(ObjectKind::Framebuffer), 0);
        let destroyed = dummy.destroyed_objects();
        assert_eq!(
            destroyed,
            vec![GpuObject::Framebuffer(framebuffer), GpuObject::RenderPass(pass)]
        );
        assert!(dummy.violations().is_empty());
    }
}
