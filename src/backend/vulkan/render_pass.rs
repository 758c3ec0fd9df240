//! Render pass and imageless framebuffer compilation.

use ash::vk;

use crate::error::FrameError;
use crate::render_pass_cache::{AttachmentDescriptor, FramebufferKey, RenderPassKey};

use super::conversion::{
    attachment_layout, convert_load_op, convert_sample_count, convert_store_op,
    convert_texture_format, convert_texture_usage,
};
use super::VkResultExt;

fn attachment_description(attachment: &AttachmentDescriptor) -> vk::AttachmentDescription {
    let layout = attachment_layout(attachment.format);
    vk::AttachmentDescription::default()
        .format(convert_texture_format(attachment.format))
        .samples(convert_sample_count(attachment.samples))
        .load_op(convert_load_op(attachment.load_op))
        .store_op(convert_store_op(attachment.store_op))
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(layout)
        .final_layout(layout)
}

/// Compile a single-subpass render pass for `key`.
///
/// Attachments are ordered depth first, then color. Both stay in their
/// attachment-optimal layout for the whole pass.
pub fn create_render_pass(
    device: &ash::Device,
    key: &RenderPassKey,
) -> Result<vk::RenderPass, FrameError> {
    let mut attachments = Vec::with_capacity(2);
    let mut depth_reference = None;
    let mut color_references = Vec::with_capacity(1);

    if let Some(depth) = &key.depth {
        depth_reference = Some(
            vk::AttachmentReference::default()
                .attachment(attachments.len() as u32)
                .layout(attachment_layout(depth.format)),
        );
        attachments.push(attachment_description(depth));
    }
    if let Some(color) = &key.color {
        color_references.push(
            vk::AttachmentReference::default()
                .attachment(attachments.len() as u32)
                .layout(attachment_layout(color.format)),
        );
        attachments.push(attachment_description(color));
    }

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_references);
    if let Some(depth_reference) = depth_reference.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_reference);
    }
    let subpasses = [subpass];

    let view_masks = [key.view_mask];
    let correlation_masks = [key.view_mask];
    let mut multiview = vk::RenderPassMultiviewCreateInfo::default()
        .view_masks(&view_masks)
        .correlation_masks(&correlation_masks);

    let mut create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses);
    if key.view_mask != 0 {
        create_info = create_info.push_next(&mut multiview);
    }

    unsafe { device.create_render_pass(&create_info, None) }.check("vkCreateRenderPass")
}

/// Create an imageless framebuffer for `key`; views are supplied at render pass begin.
pub fn create_framebuffer(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    key: &FramebufferKey,
) -> Result<vk::Framebuffer, FrameError> {
    let view_formats: Vec<[vk::Format; 1]> = key
        .attachments()
        .map(|attachment| [convert_texture_format(attachment.format)])
        .collect();

    let image_infos: Vec<vk::FramebufferAttachmentImageInfo> = key
        .attachments()
        .zip(&view_formats)
        .map(|(attachment, formats)| {
            vk::FramebufferAttachmentImageInfo::default()
                .flags(vk::ImageCreateFlags::from_raw(attachment.flags))
                .usage(convert_texture_usage(attachment.usage, attachment.format))
                .width(key.width)
                .height(key.height)
                .layer_count(key.layer_count)
                .view_formats(formats)
        })
        .collect();

    let mut attachments_info =
        vk::FramebufferAttachmentsCreateInfo::default().attachment_image_infos(&image_infos);

    let mut create_info = vk::FramebufferCreateInfo::default()
        .flags(vk::FramebufferCreateFlags::IMAGELESS)
        .render_pass(render_pass)
        .width(key.width)
        .height(key.height)
        .layers(1)
        .push_next(&mut attachments_info);
    create_info.attachment_count = image_infos.len() as u32;

    unsafe { device.create_framebuffer(&create_info, None) }.check("vkCreateFramebuffer")
}
