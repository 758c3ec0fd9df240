//! Small value types shared across descriptors.

/// 3D extent for textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent3d {
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Depth in texels (1 for 2D textures).
    pub depth: u32,
}

impl Extent3d {
    /// Create a new 2D extent.
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }

    /// Create a new 3D extent.
    pub fn new_3d(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Extent of the given mip level. Each axis halves and clamps at 1.
    pub fn mip_level(&self, level: u32) -> Self {
        let shrink = |v: u32| v.checked_shr(level).unwrap_or(0).max(1);
        Self {
            width: shrink(self.width),
            height: shrink(self.height),
            depth: shrink(self.depth),
        }
    }

    /// Number of mip levels in a full chain for this extent.
    pub fn max_mip_levels(&self) -> u32 {
        let largest = self.width.max(self.height).max(self.depth).max(1);
        32 - largest.leading_zeros()
    }
}

/// What happens to an attachment's contents when a pass begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadOp {
    /// Preserve the existing contents.
    Load,
    /// Clear to the pass's clear value.
    Clear,
    /// Contents are undefined.
    #[default]
    DontCare,
}

/// What happens to an attachment's contents when a pass ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreOp {
    /// Write results back to memory.
    Store,
    /// Results may be discarded.
    #[default]
    DontCare,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_level_extent() {
        let extent = Extent3d::new_2d(256, 64);
        assert_eq!(extent.mip_level(0), Extent3d::new_2d(256, 64));
        assert_eq!(extent.mip_level(2), Extent3d::new_2d(64, 16));
        assert_eq!(extent.mip_level(7), Extent3d::new_2d(2, 1));
        assert_eq!(extent.mip_level(8), Extent3d::new_2d(1, 1));
        assert_eq!(extent.mip_level(40), Extent3d::new_2d(1, 1));
    }

    #[test]
    fn test_max_mip_levels() {
        assert_eq!(Extent3d::new_2d(1, 1).max_mip_levels(), 1);
        assert_eq!(Extent3d::new_2d(256, 64).max_mip_levels(), 9);
        assert_eq!(Extent3d::new_2d(300, 10).max_mip_levels(), 9);
        assert_eq!(Extent3d::new_3d(4, 4, 16).max_mip_levels(), 5);
    }
}
