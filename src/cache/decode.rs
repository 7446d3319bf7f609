//! VRAM to RGBA8 conversion for the three texture modes.
//!
//! A texture page is always 256x256 output texels, but its VRAM footprint
//! narrows with the mode: a 16 bit cell holds one texel directly, two 8 bit
//! palette indices, or four 4 bit ones. Decoding goes straight into a mapped
//! texture region when the backend offers one, otherwise through the cache's
//! staging buffer and an explicit upload.

use super::{page_start_x, page_start_y, SourceKey, TextureMode, PaletteReg};
use super::{TEXTURE_PAGE_HEIGHT, TEXTURE_PAGE_WIDTH};
use crate::device::HostTexture;
use crate::util::Bit;
use crate::vram::Vram;

/// Expand a 1-5-5-5 VRAM cell to an RGBA8 pixel. Channels are widened so
/// full intensity maps to 255. Cell 0 is the invisible color and decodes to
/// alpha 0; everything else samples opaque.
pub(super) fn cell_to_rgba8(cell: u16) -> u32 {
    fn expand(c: u32) -> u32 {
        (c << 3) | (c >> 2)
    }

    let r = expand(cell.bit_range(0, 4).into());
    let g = expand(cell.bit_range(5, 9).into());
    let b = expand(cell.bit_range(10, 14).into());
    let a = if cell == 0 { 0x0 } else { 0xff };

    r | (g << 8) | (b << 16) | (a << 24)
}

/// Decode the page selected by `key` into `texture`.
pub(super) fn decode_page<T: HostTexture>(
    vram: &Vram,
    key: SourceKey,
    texture: &mut T,
    staging: &mut [u32],
) {
    let mapped = match texture.map(0, 0, TEXTURE_PAGE_WIDTH, TEXTURE_PAGE_HEIGHT) {
        Some(view) => {
            decode_page_into(vram, key, view.pixels, view.stride);
            true
        }
        None => {
            decode_page_into(vram, key, staging, TEXTURE_PAGE_WIDTH as usize);
            false
        }
    };

    if mapped {
        texture.unmap();
    } else {
        texture.update(
            0,
            0,
            TEXTURE_PAGE_WIDTH,
            TEXTURE_PAGE_HEIGHT,
            staging,
            TEXTURE_PAGE_WIDTH as usize,
        );
    }
}

/// Decode into a pixel buffer with the given row stride (in pixels).
fn decode_page_into(vram: &Vram, key: SourceKey, dest: &mut [u32], stride: usize) {
    let base = (page_start_y(key.page.into()) * Vram::WIDTH + page_start_x(key.page.into())) as usize;

    match key.mode {
        TextureMode::Palette4 => {
            let clut = fetch_clut(vram, key.palette, 16);
            decode_4bit(vram, base, &clut, dest, stride);
        }
        TextureMode::Palette8 => {
            let clut = fetch_clut(vram, key.palette, 256);
            decode_8bit(vram, base, &clut, dest, stride);
        }
        TextureMode::Direct16 | TextureMode::Reserved16 => {
            decode_16bit(vram, base, dest, stride);
        }
    }
}

/// Copy the CLUT row into a local buffer so texel loops index a plain array.
fn fetch_clut(vram: &Vram, palette: PaletteReg, len: usize) -> [u16; 256] {
    let base = palette.base_offset();
    let mut clut = [0x0; 256];
    for (i, entry) in clut[..len].iter_mut().enumerate() {
        *entry = vram.load_offset(base + i);
    }
    clut
}

fn decode_4bit(vram: &Vram, base: usize, clut: &[u16; 256], dest: &mut [u32], stride: usize) {
    for y in 0..TEXTURE_PAGE_HEIGHT as usize {
        let row = &mut dest[y * stride..][..TEXTURE_PAGE_WIDTH as usize];
        let line = base + y * Vram::WIDTH as usize;

        for (x, texels) in row.chunks_exact_mut(4).enumerate() {
            let cell = vram.load_offset(line + x);
            texels[0] = cell_to_rgba8(clut[(cell & 0xf) as usize]);
            texels[1] = cell_to_rgba8(clut[(cell >> 4) as usize & 0xf]);
            texels[2] = cell_to_rgba8(clut[(cell >> 8) as usize & 0xf]);
            texels[3] = cell_to_rgba8(clut[(cell >> 12) as usize]);
        }
    }
}

fn decode_8bit(vram: &Vram, base: usize, clut: &[u16; 256], dest: &mut [u32], stride: usize) {
    for y in 0..TEXTURE_PAGE_HEIGHT as usize {
        let row = &mut dest[y * stride..][..TEXTURE_PAGE_WIDTH as usize];
        let line = base + y * Vram::WIDTH as usize;

        for (x, texels) in row.chunks_exact_mut(2).enumerate() {
            let cell = vram.load_offset(line + x);
            texels[0] = cell_to_rgba8(clut[(cell & 0xff) as usize]);
            texels[1] = cell_to_rgba8(clut[(cell >> 8) as usize]);
        }
    }
}

fn decode_16bit(vram: &Vram, base: usize, dest: &mut [u32], stride: usize) {
    for y in 0..TEXTURE_PAGE_HEIGHT as usize {
        let row = &mut dest[y * stride..][..TEXTURE_PAGE_WIDTH as usize];
        let line = base + y * Vram::WIDTH as usize;

        for (x, texel) in row.iter_mut().enumerate() {
            *texel = cell_to_rgba8(vram.load_offset(line + x));
        }
    }
}
