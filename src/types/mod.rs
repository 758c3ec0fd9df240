//! Common types and descriptors for GPU resources.
//!
//! Format enums, usage flags, descriptors and copy regions shared by the
//! frame core and its backends.

mod buffer;
mod common;
mod texture;

pub use buffer::{BufferCopyRegion, BufferDescriptor, BufferUsage, MemoryLocation};
pub use common::{Extent3d, LoadOp, StoreOp};
pub use texture::{
    BufferTextureCopyRegion, TextureDescriptor, TextureFormat, TextureInfo, TextureUsage,
};
