//! Texture cache for a hardware accelerated Playstation 1 renderer.
//!
//! The console samples textures straight out of VRAM, decoding texels
//! on-the-fly through one of three pixel formats, two of which go through a
//! color lookup table stored elsewhere in the same VRAM. A hardware renderer
//! can't do that; it needs real RGBA8 textures on the host GPU. This crate
//! sits between the draw stream and the host device: given the draw state
//! `(page, mode, palette)` it hands back a ready-to-sample texture, reusing
//! previously decoded content where possible and invalidating entries when
//! the game writes into VRAM.

#[macro_use]
extern crate log;

mod util;

pub mod cache;
pub mod device;
pub mod rect;
pub mod vram;

#[cfg(test)]
mod test;

pub use cache::{PaletteReg, SourceId, SourceKey, TextureCache, TextureMode};
pub use device::{Device, HostTexture, MappedRect};
pub use rect::Rect;
pub use vram::Vram;
