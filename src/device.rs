//! Seam between the cache and the host GPU backend.
//!
//! The cache never talks to a graphics API directly. It borrows textures
//! from a [`Device`] and hands them back through [`recycle_texture`]
//! (Device::recycle_texture) when content ages out, so the backend is free
//! to pool them. Decoded texels reach the texture either through a mapped
//! staging region or through an explicit [`update`](HostTexture::update),
//! whichever the backend supports.

use std::fmt;

/// A writable view of a mapped texture region. `pixels` must hold at least
/// `(height - 1) * stride + width` RGBA8 values for the mapped rectangle;
/// `stride` is in pixels, not bytes.
pub struct MappedRect<'a> {
    pub pixels: &'a mut [u32],
    pub stride: usize,
}

/// A sampleable RGBA8 texture owned by the host GPU backend.
pub trait HostTexture {
    /// Map a sub-rectangle for writing. Backends that can't expose a
    /// mapping return `None`, in which case the caller falls back to
    /// [`update`](Self::update).
    fn map(&mut self, x: u32, y: u32, width: u32, height: u32) -> Option<MappedRect<'_>>;

    /// Finish a write started with [`map`](Self::map).
    fn unmap(&mut self);

    /// Upload a block of pixels to a sub-rectangle. `stride` is the row
    /// pitch of `pixels`, in pixels.
    fn update(&mut self, x: u32, y: u32, width: u32, height: u32, pixels: &[u32], stride: usize);
}

pub trait Device {
    type Texture: HostTexture;
    type Error: fmt::Display;

    /// Allocate or reuse a texture of the given size. Failure is surfaced
    /// to the draw pipeline as a missing source, never a panic.
    fn fetch_texture(&mut self, width: u32, height: u32) -> Result<Self::Texture, Self::Error>;

    /// Return a texture for reuse.
    fn recycle_texture(&mut self, texture: Self::Texture);
}
