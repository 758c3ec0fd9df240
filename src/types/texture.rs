//! Texture types, descriptors and mip-chain copy layout.

use bitflags::bitflags;

use super::Extent3d;

/// Texture pixel formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFormat {
    // 8-bit formats
    /// 8-bit red channel, unsigned normalized.
    R8Unorm,

    // 16-bit formats
    /// 8-bit RG channels, unsigned normalized.
    Rg8Unorm,
    /// 16-bit red channel, float.
    R16Float,

    // 32-bit formats
    /// 32-bit red channel, float.
    R32Float,
    /// 32-bit red channel, unsigned integer.
    R32Uint,
    /// 16-bit RG channels, float.
    Rg16Float,
    /// 8-bit RGBA channels, unsigned normalized.
    #[default]
    Rgba8Unorm,
    /// 8-bit RGBA channels, sRGB.
    Rgba8UnormSrgb,
    /// 8-bit BGRA channels, unsigned normalized.
    Bgra8Unorm,
    /// 8-bit BGRA channels, sRGB.
    Bgra8UnormSrgb,

    // 64-bit formats
    /// 16-bit RGBA channels, float.
    Rgba16Float,
    /// 32-bit RG channels, float.
    Rg32Float,

    // 128-bit formats
    /// 32-bit RGBA channels, float.
    Rgba32Float,

    // Depth/stencil formats
    /// 16-bit depth.
    Depth16Unorm,
    /// 32-bit depth, float.
    Depth32Float,
    /// 24-bit depth with 8-bit stencil.
    Depth24PlusStencil8,
    /// 32-bit depth float with 8-bit stencil.
    Depth32FloatStencil8,

    // Block-compressed formats (4x4 blocks)
    /// BC1 RGBA, unsigned normalized.
    Bc1RgbaUnorm,
    /// BC3 RGBA, unsigned normalized.
    Bc3RgbaUnorm,
    /// BC5 RG, unsigned normalized.
    Bc5RgUnorm,
    /// BC7 RGBA, unsigned normalized.
    Bc7RgbaUnorm,
    /// BC7 RGBA, sRGB.
    Bc7RgbaUnormSrgb,
}

impl TextureFormat {
    /// Returns true if this is a depth or stencil format.
    pub fn is_depth_stencil(&self) -> bool {
        matches!(
            self,
            Self::Depth16Unorm
                | Self::Depth32Float
                | Self::Depth24PlusStencil8
                | Self::Depth32FloatStencil8
        )
    }

    /// Returns true if this format has a stencil component.
    pub fn has_stencil(&self) -> bool {
        matches!(self, Self::Depth24PlusStencil8 | Self::Depth32FloatStencil8)
    }

    /// Returns true for block-compressed formats.
    pub fn is_compressed(&self) -> bool {
        self.block_dimensions() != (1, 1)
    }

    /// Width and height of one texel block.
    pub fn block_dimensions(&self) -> (u32, u32) {
        match self {
            Self::Bc1RgbaUnorm
            | Self::Bc3RgbaUnorm
            | Self::Bc5RgUnorm
            | Self::Bc7RgbaUnorm
            | Self::Bc7RgbaUnormSrgb => (4, 4),
            _ => (1, 1),
        }
    }

    /// Returns the size in bytes per pixel/block.
    pub fn block_size(&self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm | Self::R16Float | Self::Depth16Unorm => 2,
            Self::R32Float
            | Self::R32Uint
            | Self::Rg16Float
            | Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::Depth24PlusStencil8
            | Self::Depth32Float => 4,
            Self::Rgba16Float
            | Self::Rg32Float
            | Self::Depth32FloatStencil8
            | Self::Bc1RgbaUnorm => 8,
            Self::Rgba32Float
            | Self::Bc3RgbaUnorm
            | Self::Bc5RgUnorm
            | Self::Bc7RgbaUnorm
            | Self::Bc7RgbaUnormSrgb => 16,
        }
    }
}

bitflags! {
    /// Usage flags for textures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// Texture can be copied from.
        const COPY_SRC = 1 << 0;
        /// Texture can be copied to.
        const COPY_DST = 1 << 1;
        /// Texture can be sampled in a shader.
        const TEXTURE_BINDING = 1 << 2;
        /// Texture can be used as a storage texture.
        const STORAGE_BINDING = 1 << 3;
        /// Texture can be used as a render attachment.
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

impl Default for TextureUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating a texture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    /// Debug label for the texture.
    pub label: Option<String>,
    /// Size of the texture.
    pub size: Extent3d,
    /// Mip level count.
    pub mip_level_count: u32,
    /// Array layer count.
    pub array_layer_count: u32,
    /// Sample count for multisampling.
    pub sample_count: u32,
    /// Texture format.
    pub format: TextureFormat,
    /// Usage flags.
    pub usage: TextureUsage,
}

impl TextureDescriptor {
    /// Create a new 2D texture descriptor.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            size: Extent3d::new_2d(width, height),
            mip_level_count: 1,
            array_layer_count: 1,
            sample_count: 1,
            format,
            usage,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the mip level count.
    pub fn with_mip_levels(mut self, count: u32) -> Self {
        self.mip_level_count = count;
        self
    }

    /// Set the array layer count.
    pub fn with_array_layers(mut self, count: u32) -> Self {
        self.array_layer_count = count;
        self
    }

    /// Set the sample count for multisampling.
    pub fn with_sample_count(mut self, count: u32) -> Self {
        self.sample_count = count;
        self
    }

    /// Immutable properties of a texture created from this descriptor.
    pub fn info(&self) -> TextureInfo {
        TextureInfo {
            size: self.size,
            mip_level_count: self.mip_level_count,
            array_layer_count: self.array_layer_count,
            sample_count: self.sample_count,
            format: self.format,
            usage: self.usage,
        }
    }
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self::new_2d(1, 1, TextureFormat::default(), TextureUsage::empty())
    }
}

/// Properties of an existing texture, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureInfo {
    pub size: Extent3d,
    pub mip_level_count: u32,
    pub array_layer_count: u32,
    pub sample_count: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureInfo {
    /// Bytes occupied by one mip level (all array layers), tightly packed in blocks.
    pub fn mip_level_size(&self, level: u32) -> u64 {
        let extent = self.size.mip_level(level);
        let (block_w, block_h) = self.format.block_dimensions();
        let blocks_x = u64::from(extent.width.div_ceil(block_w));
        let blocks_y = u64::from(extent.height.div_ceil(block_h));
        blocks_x
            * blocks_y
            * u64::from(extent.depth)
            * u64::from(self.array_layer_count)
            * u64::from(self.format.block_size())
    }

    /// Bytes needed for the first `mip_count` levels laid out back to back.
    pub fn upload_size(&self, mip_count: u32) -> u64 {
        (0..mip_count).map(|level| self.mip_level_size(level)).sum()
    }

    /// Copy regions for the first `mip_count` levels read from a buffer at `buffer_offset`.
    pub fn copy_regions(&self, buffer_offset: u64, mip_count: u32) -> Vec<BufferTextureCopyRegion> {
        let mut offset = buffer_offset;
        (0..mip_count)
            .map(|level| {
                let region = BufferTextureCopyRegion {
                    buffer_offset: offset,
                    mip_level: level,
                    base_array_layer: 0,
                    array_layer_count: self.array_layer_count,
                    extent: self.size.mip_level(level),
                };
                offset += self.mip_level_size(level);
                region
            })
            .collect()
    }
}

/// One region of a buffer-to-texture copy, covering a whole mip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTextureCopyRegion {
    pub buffer_offset: u64,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
    pub extent: Extent3d,
}
