//! End-to-end scenarios against an in-memory device.

use crate::cache::{MAX_HASH_CACHE_AGE, MAX_HASH_CACHE_SIZE, MAX_PAGE_REFS_PER_SOURCE};
use crate::device::{Device, HostTexture, MappedRect};
use crate::rect::Rect;
use crate::vram::Vram;
use crate::{PaletteReg, SourceKey, TextureCache, TextureMode};

use std::cell::Cell;
use std::rc::Rc;

/// Texture backed by plain memory.
struct TestTexture {
    pixels: Vec<u32>,
    width: u32,
    mappable: bool,
    mapped: bool,
    updates: usize,
}

impl HostTexture for TestTexture {
    fn map(&mut self, x: u32, y: u32, width: u32, height: u32) -> Option<MappedRect<'_>> {
        if !self.mappable {
            return None;
        }
        // Only whole texture mappings are exercised here.
        assert_eq!((x, y), (0, 0));
        assert_eq!((width, height), (self.width, self.pixels.len() as u32 / self.width));
        self.mapped = true;
        Some(MappedRect {
            pixels: &mut self.pixels,
            stride: self.width as usize,
        })
    }

    fn unmap(&mut self) {
        assert!(self.mapped);
        self.mapped = false;
    }

    fn update(&mut self, x: u32, y: u32, width: u32, height: u32, pixels: &[u32], stride: usize) {
        self.updates += 1;
        for row in 0..height as usize {
            let src = &pixels[row * stride..][..width as usize];
            let base = (y as usize + row) * self.width as usize + x as usize;
            self.pixels[base..base + width as usize].copy_from_slice(src);
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("out of texture memory")]
struct OutOfTextures;

struct TestDevice {
    mappable: bool,
    fail: bool,
    fetched: usize,
    recycled: Rc<Cell<usize>>,
}

impl TestDevice {
    fn new() -> Self {
        Self {
            mappable: true,
            fail: false,
            fetched: 0,
            recycled: Rc::new(Cell::new(0)),
        }
    }

    fn unmappable() -> Self {
        Self { mappable: false, ..Self::new() }
    }

    fn failing() -> Self {
        Self { fail: true, ..Self::new() }
    }
}

impl Device for TestDevice {
    type Texture = TestTexture;
    type Error = OutOfTextures;

    fn fetch_texture(&mut self, width: u32, height: u32) -> Result<TestTexture, OutOfTextures> {
        if self.fail {
            return Err(OutOfTextures);
        }
        self.fetched += 1;
        Ok(TestTexture {
            pixels: vec![0x0; (width * height) as usize],
            width,
            mappable: self.mappable,
            mapped: false,
            updates: 0,
        })
    }

    fn recycle_texture(&mut self, _: TestTexture) {
        self.recycled.set(self.recycled.get() + 1);
    }
}

fn cache() -> TextureCache<TestDevice> {
    TextureCache::new(TestDevice::new())
}

/// 4 bit page 0 with its CLUT row at `(0, 256)`.
fn paletted_key() -> SourceKey {
    SourceKey::new(0, TextureMode::Palette4, PaletteReg::new(256 << 6))
}

fn direct_key(page: u8) -> SourceKey {
    SourceKey::new(page, TextureMode::Direct16, PaletteReg::default())
}

#[test]
fn simple_16bit_lookup() {
    let mut cache = cache();
    let mut vram = Vram::new();
    vram.fill_rect(Rect::from_extents(0, 0, 1024, 512), 0x7fff);

    let id = cache.lookup_source(direct_key(0), &vram).unwrap();
    let texture = cache.source_texture(id);
    assert!(texture.pixels.iter().all(|&pixel| pixel == 0xffff_ffff));
}

#[test]
fn repeated_lookup_returns_the_same_source() {
    let mut cache = cache();
    let vram = Vram::new();

    let first = cache.lookup_source(direct_key(0), &vram).unwrap();
    let second = cache.lookup_source(direct_key(0), &vram).unwrap();

    assert_eq!(first, second);
    assert_eq!(cache.device().fetched, 1);
    assert_eq!(cache.live_sources(), 1);
}

#[test]
fn write_outside_footprint_keeps_source() {
    let mut cache = cache();
    let mut vram = Vram::new();

    let first = cache.lookup_source(paletted_key(), &vram).unwrap();

    // Outside both the 4 bit footprint (0..64, 0..256) and the CLUT row.
    let write = Rect::from_extents(100, 0, 4, 4);
    vram.fill_rect(write, 0xdead);
    cache.invalidate_from_write(write);

    let second = cache.lookup_source(paletted_key(), &vram).unwrap();
    assert_eq!(first, second);
    assert_eq!(cache.device().fetched, 1);
    assert_eq!(cache.live_sources(), 1);
}

#[test]
fn palette_change_creates_new_entry() {
    let mut cache = cache();
    let mut vram = Vram::new();

    cache.lookup_source(paletted_key(), &vram).unwrap();
    assert_eq!(cache.hash_cache_len(), 1);

    let clut = Rect::from_extents(0, 256, 16, 1);
    vram.fill_rect(clut, 0x7fff);
    cache.invalidate_pages(clut);
    assert_eq!(cache.live_sources(), 0);

    cache.lookup_source(paletted_key(), &vram).unwrap();
    assert_eq!(cache.hash_cache_len(), 2);
    assert_eq!(cache.live_sources(), 1);
}

#[test]
fn content_addressing_survives_invalidation() {
    let mut cache = cache();
    let mut vram = Vram::new();
    vram.fill_rect(Rect::from_extents(0, 0, 256, 256), 0x1234);

    let first = cache.lookup_source(direct_key(0), &vram).unwrap();
    let texture: *const TestTexture = cache.source_texture(first);

    cache.invalidate_page(0);
    assert_eq!(cache.live_sources(), 0);

    // Same VRAM bytes, so the same decoded texture comes back.
    let second = cache.lookup_source(direct_key(0), &vram).unwrap();
    assert!(std::ptr::eq(texture, cache.source_texture(second)));
    assert_eq!(cache.device().fetched, 1);
}

#[test]
fn identical_cluts_share_an_entry() {
    let mut cache = cache();
    let mut vram = Vram::new();

    for i in 0..16 {
        vram.store_16(i, 256, 0x100 + i as u16);
        vram.store_16(32 + i, 256, 0x100 + i as u16);
    }

    let pal_a = PaletteReg::new(256 << 6);
    let pal_b = PaletteReg::new((256 << 6) | 2);
    assert_eq!(pal_b.x_base(), 32);

    let a = cache
        .lookup_source(SourceKey::new(0, TextureMode::Palette4, pal_a), &vram)
        .unwrap();
    let b = cache
        .lookup_source(SourceKey::new(0, TextureMode::Palette4, pal_b), &vram)
        .unwrap();

    assert_ne!(a, b);
    assert_eq!(cache.live_sources(), 2);
    assert_eq!(cache.device().fetched, 1);
    assert_eq!(cache.source_ref_count(a), 2);
    assert!(std::ptr::eq(cache.source_texture(a), cache.source_texture(b)));
}

#[test]
fn self_modifying_draw_invalidates_drawn_area() {
    let mut cache = cache();
    let vram = Vram::new();

    cache.lookup_source(direct_key(0), &vram).unwrap();

    cache.update_drawn_rect(Rect::from_extents(0, 0, 128, 128));
    cache.invalidate_from_write(Rect::from_extents(64, 64, 128, 128));

    assert_eq!(cache.drawn_rect(), Rect::new(0, 0, 192, 192));
    assert_eq!(cache.live_sources(), 0);
}

#[test]
fn drawn_rect_accumulates_until_a_write_overlaps() {
    let mut cache = cache();
    let vram = Vram::new();

    cache.update_drawn_rect(Rect::from_extents(0, 0, 64, 64));
    cache.update_drawn_rect(Rect::from_extents(0, 0, 32, 32));
    assert_eq!(cache.drawn_rect(), Rect::new(0, 0, 64, 64));

    // A write clear of the drawn area invalidates only itself.
    cache.lookup_source(direct_key(24), &vram).unwrap();
    cache.invalidate_from_write(Rect::from_extents(512, 256, 16, 16));
    assert_eq!(cache.drawn_rect(), Rect::new(0, 0, 64, 64));
    assert_eq!(cache.live_sources(), 0);
}

#[test]
fn aging_bounds_the_hash_cache() {
    let mut cache = cache();
    let mut vram = Vram::new();

    for i in 0..250u16 {
        vram.store_16(0, 0, i);
        cache.lookup_source(direct_key(0), &vram).unwrap();
        cache.invalidate_page(0);
    }

    assert_eq!(cache.hash_cache_len(), 250);
    assert_eq!(cache.live_sources(), 0);

    cache.age_hash_cache();
    assert_eq!(cache.hash_cache_len(), MAX_HASH_CACHE_SIZE);
    assert_eq!(cache.device().recycled.get(), 50);
}

#[test]
fn unreferenced_entries_expire() {
    let mut cache = cache();
    let vram = Vram::new();

    cache.lookup_source(direct_key(0), &vram).unwrap();
    cache.invalidate_page(0);

    for _ in 0..MAX_HASH_CACHE_AGE {
        cache.age_hash_cache();
    }
    assert_eq!(cache.hash_cache_len(), 1);

    cache.age_hash_cache();
    assert_eq!(cache.hash_cache_len(), 0);
    assert_eq!(cache.device().recycled.get(), 1);
}

#[test]
fn referenced_entries_never_age_out() {
    let mut cache = cache();
    let vram = Vram::new();

    let id = cache.lookup_source(direct_key(0), &vram).unwrap();
    for _ in 0..MAX_HASH_CACHE_AGE + 1 {
        cache.age_hash_cache();
    }

    assert_eq!(cache.hash_cache_len(), 1);
    assert_eq!(cache.source_ref_count(id), 1);
}

#[test]
fn invalidate_page_is_idempotent() {
    let mut cache = cache();
    let vram = Vram::new();

    cache.lookup_source(direct_key(0), &vram).unwrap();
    cache.invalidate_page(0);
    cache.invalidate_page(0);
    cache.invalidate_page(9);

    assert_eq!(cache.live_sources(), 0);
}

#[test]
fn bottom_right_write_invalidates_the_last_page() {
    let mut cache = cache();
    let vram = Vram::new();

    // Page 28's 16 bit footprint spans the last four page columns.
    cache.lookup_source(direct_key(28), &vram).unwrap();
    cache.invalidate_from_write(Rect::from_extents(1020, 508, 4, 4));

    assert_eq!(cache.live_sources(), 0);
}

#[test]
fn write_past_a_4bit_footprint_misses_it() {
    let mut cache = cache();
    let vram = Vram::new();

    let id = cache.lookup_source(paletted_key(), &vram).unwrap();
    cache.invalidate_from_write(Rect::from_extents(64, 0, 1, 1));

    assert_eq!(cache.live_sources(), 1);
    assert_eq!(cache.source(id).key, paletted_key());
}

#[test]
fn clut_inside_the_footprint_page_dedups() {
    let mut cache = cache();
    let vram = Vram::new();

    let key = SourceKey::new(0, TextureMode::Palette4, PaletteReg::new(100 << 6));
    let id = cache.lookup_source(key, &vram).unwrap();

    assert_eq!(cache.source(id).num_page_refs(), 1);
}

#[test]
fn page_refs_reach_but_never_exceed_the_limit() {
    let mut cache = cache();
    let vram = Vram::new();

    // 8 bit footprint on pages 14..=15, CLUT row crossing pages 28..=31.
    let pal = PaletteReg::new((511 << 6) | 48);
    assert_eq!((pal.x_base(), pal.y_base()), (768, 511));

    let key = SourceKey::new(14, TextureMode::Palette8, pal);
    let id = cache.lookup_source(key, &vram).unwrap();

    assert_eq!(cache.source(id).num_page_refs(), MAX_PAGE_REFS_PER_SOURCE);
    cache.invalidate_page(31);
    assert_eq!(cache.live_sources(), 0);
}

#[test]
fn allocation_failure_surfaces_as_no_source() {
    let mut cache = TextureCache::new(TestDevice::failing());
    let vram = Vram::new();

    assert!(cache.lookup_source(direct_key(0), &vram).is_none());
    assert_eq!(cache.hash_cache_len(), 0);
    assert_eq!(cache.live_sources(), 0);
}

#[test]
fn staging_upload_matches_mapped_decode() {
    let mut mapped = TextureCache::new(TestDevice::new());
    let mut staged = TextureCache::new(TestDevice::unmappable());

    let mut vram = Vram::new();
    for i in 0..256 {
        vram.store_16(i, i / 2, 0x0400 + i as u16);
    }

    let a = mapped.lookup_source(direct_key(0), &vram).unwrap();
    let b = staged.lookup_source(direct_key(0), &vram).unwrap();

    let a = mapped.source_texture(a);
    let b = staged.source_texture(b);
    assert_eq!(a.pixels, b.pixels);
    assert_eq!(a.updates, 0);
    assert_eq!(b.updates, 1);
}

#[test]
fn clear_empties_every_page() {
    let mut cache = cache();
    let vram = Vram::new();

    cache.lookup_source(direct_key(0), &vram).unwrap();
    cache.lookup_source(paletted_key(), &vram).unwrap();
    cache.lookup_source(direct_key(20), &vram).unwrap();

    let entries = cache.hash_cache_len();
    cache.clear();

    assert_eq!(cache.live_sources(), 0);
    // The hash cache is left to aging.
    assert_eq!(cache.hash_cache_len(), entries);
}

#[test]
fn dropping_the_cache_recycles_outstanding_textures() {
    let cache = {
        let mut cache = cache();
        let mut vram = Vram::new();
        // Distinct page contents, so the entries don't content-alias.
        vram.store_16(0, 0, 1);
        vram.store_16(0, 256, 2);
        cache.lookup_source(direct_key(0), &vram).unwrap();
        cache.lookup_source(direct_key(16), &vram).unwrap();
        cache
    };

    let recycled = cache.device().recycled.clone();
    assert_eq!(recycled.get(), 0);

    drop(cache);
    assert_eq!(recycled.get(), 2);
}
