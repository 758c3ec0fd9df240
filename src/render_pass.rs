//! Render pass recording.
//!
//! A [`RenderPassDescriptor`] names one optional color target and one optional
//! depth target, how each is loaded and stored, and the multiview mask.
//! [`FrameCore::begin_render_pass`](crate::FrameCore::begin_render_pass) records
//! it into the frame's command buffer:
//!
//! - with dynamic rendering the attachments are bound directly
//! - otherwise the compiled pass and imageless framebuffer come from the
//!   [`RenderPassCache`](crate::RenderPassCache), keyed by the targets' formats,
//!   sample counts and load/store operations
//!
//! Render targets are expected in their attachment layout for the whole pass.

use crate::backend::{CommandBufferHandle, FramebufferHandle, RenderPassHandle, TextureHandle};
use crate::error::FrameError;
use crate::render_pass_cache::{
    AttachmentDescriptor, FramebufferAttachment, FramebufferKey, RenderPassKey,
};
use crate::types::{LoadOp, StoreOp, TextureInfo, TextureUsage};

/// Value an attachment is cleared to when its load operation is [`LoadOp::Clear`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// One attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTarget {
    pub texture: TextureHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: ClearValue,
}

/// Attachments and render area of one render pass.
///
/// ```
/// use gpu_frames::{LoadOp, RenderPassDescriptor, StoreOp, TextureHandle};
///
/// let color = TextureHandle::from_raw(1);
/// let depth = TextureHandle::from_raw(2);
/// let pass = RenderPassDescriptor::new(1280, 720)
///     .with_color(color, LoadOp::Clear, StoreOp::Store)
///     .with_color_clear([0.1, 0.1, 0.1, 1.0])
///     .with_depth(depth, LoadOp::Clear, StoreOp::DontCare);
/// assert!(pass.color.is_some() && pass.depth.is_some());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPassDescriptor {
    pub width: u32,
    pub height: u32,
    /// Bit `i` set renders view `i` into array layer `i`. Zero disables multiview.
    pub view_mask: u32,
    pub color: Option<RenderTarget>,
    pub depth: Option<RenderTarget>,
}

impl RenderPassDescriptor {
    /// A render pass covering `width` x `height` with no attachments yet.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            view_mask: 0,
            color: None,
            depth: None,
        }
    }

    /// Set the color target, cleared to transparent black.
    pub fn with_color(
        mut self,
        texture: TextureHandle,
        load_op: LoadOp,
        store_op: StoreOp,
    ) -> Self {
        self.color = Some(RenderTarget {
            texture,
            load_op,
            store_op,
            clear_value: ClearValue::Color([0.0; 4]),
        });
        self
    }

    /// Clear color of the color target. No effect before [`Self::with_color`].
    pub fn with_color_clear(mut self, color: [f32; 4]) -> Self {
        if let Some(target) = self.color.as_mut() {
            target.clear_value = ClearValue::Color(color);
        }
        self
    }

    /// Set the depth target, cleared to 1.0.
    pub fn with_depth(
        mut self,
        texture: TextureHandle,
        load_op: LoadOp,
        store_op: StoreOp,
    ) -> Self {
        self.depth = Some(RenderTarget {
            texture,
            load_op,
            store_op,
            clear_value: ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            },
        });
        self
    }

    /// Clear depth of the depth target. No effect before [`Self::with_depth`].
    pub fn with_depth_clear(mut self, depth: f32) -> Self {
        if let Some(target) = self.depth.as_mut() {
            target.clear_value = ClearValue::DepthStencil { depth, stencil: 0 };
        }
        self
    }

    pub fn with_view_mask(mut self, view_mask: u32) -> Self {
        self.view_mask = view_mask;
        self
    }

    /// Attachments in binding order: depth first, then color.
    pub fn targets(&self) -> impl Iterator<Item = &RenderTarget> {
        self.depth.iter().chain(self.color.iter())
    }

    /// Check the targets against the properties of their textures.
    pub(crate) fn validate(
        &self,
        color: Option<&TextureInfo>,
        depth: Option<&TextureInfo>,
    ) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::InvalidParameter(format!(
                "render area {}x{} is empty",
                self.width, self.height
            )));
        }
        if color.is_none() && depth.is_none() {
            return Err(FrameError::InvalidParameter(
                "render pass has no attachments".to_string(),
            ));
        }
        if let Some(info) = color {
            self.validate_target("color", info, false)?;
        }
        if let Some(info) = depth {
            self.validate_target("depth", info, true)?;
        }
        if let (Some(color), Some(depth)) = (color, depth) {
            if color.sample_count != depth.sample_count {
                return Err(FrameError::InvalidParameter(format!(
                    "color target has {} samples, depth target has {}",
                    color.sample_count, depth.sample_count
                )));
            }
        }
        Ok(())
    }

    fn validate_target(
        &self,
        name: &str,
        info: &TextureInfo,
        expect_depth: bool,
    ) -> Result<(), FrameError> {
        if !info.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            return Err(FrameError::InvalidParameter(format!(
                "{} target was not created with RENDER_ATTACHMENT usage",
                name
            )));
        }
        if info.format.is_depth_stencil() != expect_depth {
            return Err(FrameError::InvalidParameter(format!(
                "{:?} cannot be used as the {} target",
                info.format, name
            )));
        }
        if info.size.width < self.width || info.size.height < self.height {
            return Err(FrameError::InvalidParameter(format!(
                "{} target {}x{} is smaller than the render area {}x{}",
                name, info.size.width, info.size.height, self.width, self.height
            )));
        }
        let views = u32::BITS - self.view_mask.leading_zeros();
        if views > info.array_layer_count {
            return Err(FrameError::InvalidParameter(format!(
                "view mask {:#b} needs {} layers, {} target has {}",
                self.view_mask, views, name, info.array_layer_count
            )));
        }
        Ok(())
    }

    /// Cache key of the compiled render pass for these targets.
    pub(crate) fn render_pass_key(
        &self,
        color: Option<&TextureInfo>,
        depth: Option<&TextureInfo>,
    ) -> RenderPassKey {
        let attachment = |target: &RenderTarget, info: &TextureInfo| {
            AttachmentDescriptor::new(info.format, target.load_op, target.store_op)
                .with_samples(info.sample_count)
        };
        RenderPassKey {
            view_mask: self.view_mask,
            color: self.color.as_ref().zip(color).map(|(t, i)| attachment(t, i)),
            depth: self.depth.as_ref().zip(depth).map(|(t, i)| attachment(t, i)),
        }
    }

    /// Cache key of the imageless framebuffer for these targets.
    pub(crate) fn framebuffer_key(
        &self,
        render_pass: RenderPassHandle,
        color: Option<&TextureInfo>,
        depth: Option<&TextureInfo>,
    ) -> FramebufferKey {
        let attachment = |info: &TextureInfo| FramebufferAttachment {
            format: info.format,
            usage: info.usage,
            flags: 0,
        };
        let layer_count = color.or(depth).map_or(1, |info| info.array_layer_count);
        FramebufferKey {
            width: self.width,
            height: self.height,
            layer_count,
            render_pass,
            color: color.map(attachment),
            depth: depth.map(attachment),
        }
    }
}

/// How a render pass is bound on the command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPassBinding {
    /// Dynamic rendering; no render pass object.
    Dynamic,
    /// A cached render pass with an imageless framebuffer.
    Cached {
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
    },
}

/// A render pass begun on a frame's command buffer.
///
/// End it with [`FrameCore::end_render_pass`](crate::FrameCore::end_render_pass)
/// before the frame ends.
#[derive(Debug)]
#[must_use = "a begun render pass must be ended"]
pub struct ActiveRenderPass {
    pub(crate) command_buffer: CommandBufferHandle,
    pub(crate) binding: RenderPassBinding,
}

impl ActiveRenderPass {
    pub fn command_buffer(&self) -> CommandBufferHandle {
        self.command_buffer
    }

    pub fn binding(&self) -> RenderPassBinding {
        self.binding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TextureDescriptor, TextureFormat};

    fn target_info(format: TextureFormat, usage: TextureUsage) -> TextureInfo {
        TextureDescriptor::new_2d(64, 64, format, usage).info()
    }

    fn color_info() -> TextureInfo {
        target_info(TextureFormat::Rgba8Unorm, TextureUsage::RENDER_ATTACHMENT)
    }

    fn depth_info() -> TextureInfo {
        target_info(TextureFormat::Depth32Float, TextureUsage::RENDER_ATTACHMENT)
    }

    fn descriptor() -> RenderPassDescriptor {
        RenderPassDescriptor::new(64, 64)
            .with_color(TextureHandle::from_raw(1), LoadOp::Clear, StoreOp::Store)
            .with_depth(TextureHandle::from_raw(2), LoadOp::Clear, StoreOp::DontCare)
    }

    #[test]
    fn test_targets_bind_depth_first() {
        let order: Vec<_> = descriptor().targets().map(|t| t.texture.raw()).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn test_clear_values_follow_builder() {
        let pass = descriptor()
            .with_color_clear([1.0, 0.0, 0.0, 1.0])
            .with_depth_clear(0.0);
        assert_eq!(
            pass.color.map(|t| t.clear_value),
            Some(ClearValue::Color([1.0, 0.0, 0.0, 1.0]))
        );
        assert_eq!(
            pass.depth.map(|t| t.clear_value),
            Some(ClearValue::DepthStencil {
                depth: 0.0,
                stencil: 0
            })
        );
    }

    #[test]
    fn test_valid_targets_pass() {
        descriptor()
            .validate(Some(&color_info()), Some(&depth_info()))
            .unwrap();
    }

    #[test]
    fn test_invalid_targets_are_rejected() {
        let pass = descriptor();
        let not_attachment = target_info(TextureFormat::Rgba8Unorm, TextureUsage::TEXTURE_BINDING);
        let small = TextureDescriptor::new_2d(
            32,
            32,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT,
        )
        .info();
        let msaa_depth = TextureDescriptor::new_2d(
            64,
            64,
            TextureFormat::Depth32Float,
            TextureUsage::RENDER_ATTACHMENT,
        )
        .with_sample_count(4)
        .info();

        for (color, depth) in [
            (Some(not_attachment), None),
            (Some(depth_info()), None),
            (None, Some(color_info())),
            (Some(small), None),
            (Some(color_info()), Some(msaa_depth)),
            (None, None),
        ] {
            let err = pass.validate(color.as_ref(), depth.as_ref()).unwrap_err();
            assert!(matches!(err, FrameError::InvalidParameter(_)), "{err}");
        }

        let empty_area = RenderPassDescriptor { width: 0, ..pass };
        assert!(empty_area.validate(Some(&color_info()), None).is_err());

        let multiview = pass.with_view_mask(0b11);
        assert!(multiview.validate(Some(&color_info()), None).is_err());
    }

    #[test]
    fn test_keys_reflect_targets() {
        let pass = descriptor().with_view_mask(0);
        let msaa = TextureDescriptor::new_2d(
            64,
            64,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT,
        )
        .with_sample_count(4)
        .info();

        let key = pass.render_pass_key(Some(&msaa), Some(&depth_info()));
        assert_eq!(key.color.map(|c| c.samples), Some(4));
        assert_eq!(key.color.map(|c| c.load_op), Some(LoadOp::Clear));
        assert_eq!(key.depth.map(|d| d.format), Some(TextureFormat::Depth32Float));

        let framebuffer =
            pass.framebuffer_key(RenderPassHandle::from_raw(7), Some(&msaa), Some(&depth_info()));
        assert_eq!((framebuffer.width, framebuffer.height), (64, 64));
        assert_eq!(framebuffer.layer_count, 1);
        assert_eq!(framebuffer.attachments().count(), 2);
    }
}
