//! The texture cache itself.
//!
//! Lookup is keyed by draw state: the texture page, the texel mode and the
//! palette register. Each live [`Source`] is linked onto the list of every
//! VRAM page its footprint or CLUT row touches, so invalidating a page
//! destroys exactly the sources that sampled from it, in one list walk.
//! Decoded texel data lives behind a second, content-addressed table that
//! survives source invalidation and absorbs re-uploads.

mod decode;
mod hash;
mod source;

pub use source::{Source, SourceId};

use crate::device::Device;
use crate::rect::Rect;
use crate::util::Bit;
use crate::vram::Vram;

use hash::{HashCacheEntry, HashCacheKey};
use source::SourceTable;

use rustc_hash::FxHashMap;
use std::fmt;

/// VRAM pages are 64x256 cells, giving a 16x2 grid.
pub const VRAM_PAGE_WIDTH: u32 = 64;
pub const VRAM_PAGE_HEIGHT: u32 = 256;
pub const VRAM_PAGES_WIDE: u32 = Vram::WIDTH / VRAM_PAGE_WIDTH;
pub const VRAM_PAGES_HIGH: u32 = Vram::HEIGHT / VRAM_PAGE_HEIGHT;
pub const NUM_PAGES: usize = (VRAM_PAGES_WIDE * VRAM_PAGES_HIGH) as usize;

/// A texture page is always 256x256 output texels.
pub const TEXTURE_PAGE_WIDTH: u32 = 256;
pub const TEXTURE_PAGE_HEIGHT: u32 = 256;

/// 4 pages in 16 bit mode, 2 + 4 in 8 bit mode, 1 + 1 in 4 bit mode.
pub const MAX_PAGE_REFS_PER_SOURCE: usize = 6;

/// Frames an unreferenced hash cache entry survives before eviction.
pub const MAX_HASH_CACHE_AGE: u32 = 600;

/// Entries permitted in the hash cache at the end of a frame.
pub const MAX_HASH_CACHE_SIZE: usize = 200;

pub fn page_index(px: u32, py: u32) -> u32 {
    py * VRAM_PAGES_WIDE + px
}

/// The page containing the VRAM cell at `(x, y)`.
pub fn page_at(x: u32, y: u32) -> u32 {
    page_index(x / VRAM_PAGE_WIDTH, y / VRAM_PAGE_HEIGHT)
}

pub fn page_start_x(page: u32) -> u32 {
    (page % VRAM_PAGES_WIDE) * VRAM_PAGE_WIDTH
}

pub fn page_start_y(page: u32) -> u32 {
    (page / VRAM_PAGES_WIDE) * VRAM_PAGE_HEIGHT
}

/// Every page intersecting the given cell rectangle, in row-major order.
/// The rectangle must lie within VRAM: cell loads wrap at the edge of
/// memory, page bookkeeping does not.
fn pages_covering(x: u32, y: u32, width: u32, height: u32) -> impl Iterator<Item = u32> {
    debug_assert!(width > 0 && height > 0);
    debug_assert!(x + width <= Vram::WIDTH && y + height <= Vram::HEIGHT);

    let start_x = x / VRAM_PAGE_WIDTH;
    let start_y = y / VRAM_PAGE_HEIGHT;
    let end_x = (x + width - 1) / VRAM_PAGE_WIDTH;
    let end_y = (y + height - 1) / VRAM_PAGE_HEIGHT;

    (start_y..=end_y)
        .flat_map(move |py| (start_x..=end_x).map(move |px| page_index(px, py)))
}

/// Number of bits used to represent a single texel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TextureMode {
    Palette4 = 0,
    Palette8 = 1,
    Direct16 = 2,
    /// Behaves exactly like [`Direct16`](Self::Direct16) on the console.
    Reserved16 = 3,
}

impl TextureMode {
    /// From the texture depth field of the draw mode setting.
    pub fn from_value(value: u32) -> Self {
        match value & 3 {
            0 => TextureMode::Palette4,
            1 => TextureMode::Palette8,
            2 => TextureMode::Direct16,
            3 => TextureMode::Reserved16,
            _ => unreachable!("masked to two bits"),
        }
    }

    pub fn is_paletted(self) -> bool {
        matches!(self, TextureMode::Palette4 | TextureMode::Palette8)
    }

    /// Width of the page's VRAM footprint in cells. One cell packs four
    /// 4 bit texels, two 8 bit texels or a single 16 bit texel.
    pub fn vram_width(self) -> u32 {
        match self {
            TextureMode::Palette4 => TEXTURE_PAGE_WIDTH / 4,
            TextureMode::Palette8 => TEXTURE_PAGE_WIDTH / 2,
            TextureMode::Direct16 | TextureMode::Reserved16 => TEXTURE_PAGE_WIDTH,
        }
    }

    fn normalized(self) -> Self {
        match self {
            TextureMode::Reserved16 => TextureMode::Direct16,
            mode => mode,
        }
    }
}

impl fmt::Display for TextureMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", match *self {
            TextureMode::Palette4 => "4 bit",
            TextureMode::Palette8 => "8 bit",
            TextureMode::Direct16 | TextureMode::Reserved16 => "16 bit",
        })
    }
}

/// The CLUT attribute of a textured draw command: a VRAM cell coordinate
/// where the palette row starts, packed into 16 bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct PaletteReg(u16);

impl PaletteReg {
    pub fn new(bits: u16) -> Self {
        Self(bits)
    }

    /// From the upper half word of a textured polygon's first vertex
    /// attribute.
    pub fn from_cmd(val: u32) -> Self {
        Self((val >> 16) as u16)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    /// CLUT x base coordinate. N * 16.
    pub fn x_base(self) -> u32 {
        u32::from(self.0.bit_range(0, 5)) * 16
    }

    /// CLUT y base coordinate.
    pub fn y_base(self) -> u32 {
        u32::from(self.0.bit_range(6, 14))
    }

    /// Number of VRAM cells the CLUT row occupies.
    pub fn width(mode: TextureMode) -> u32 {
        match mode {
            TextureMode::Palette4 => 16,
            TextureMode::Palette8 => 256,
            _ => unreachable!("direct modes have no palette"),
        }
    }

    /// Linear cell offset of the first CLUT entry.
    pub(crate) fn base_offset(self) -> usize {
        (self.y_base() * Vram::WIDTH + self.x_base()) as usize
    }
}

/// The draw state a source is cached under. 32 bits, compared bytewise.
///
/// Construction canonicalizes: the reserved direct mode collapses to
/// [`TextureMode::Direct16`] and the palette is zeroed for direct modes, so
/// derived equality never misses on semantically equal states.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SourceKey {
    page: u8,
    mode: TextureMode,
    palette: PaletteReg,
}

impl SourceKey {
    /// The texture footprint implied by `page` and `mode`, and the CLUT row
    /// for paletted modes, must not overrun the edge of VRAM.
    pub fn new(page: u8, mode: TextureMode, palette: PaletteReg) -> Self {
        debug_assert!((page as usize) < NUM_PAGES);

        let mode = mode.normalized();
        let palette = match mode.is_paletted() {
            true => palette,
            false => PaletteReg::default(),
        };

        Self { page, mode, palette }
    }

    pub fn page(self) -> u8 {
        self.page
    }

    pub fn mode(self) -> TextureMode {
        self.mode
    }

    pub fn palette(self) -> PaletteReg {
        self.palette
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.mode.is_paletted() {
            write!(
                f,
                "{} page {} clut ({}, {})",
                self.mode, self.page,
                self.palette.x_base(), self.palette.y_base(),
            )
        } else {
            write!(f, "{} page {}", self.mode, self.page)
        }
    }
}

/// See the [module docs](self).
pub struct TextureCache<D: Device> {
    device: D,
    table: SourceTable,
    hash_cache: FxHashMap<HashCacheKey, HashCacheEntry<D::Texture>>,
    /// Reused per-frame buffer of eviction candidates. See
    /// [`age_hash_cache`](Self::age_hash_cache).
    purge_list: Vec<(HashCacheKey, u32)>,
    /// Union of all draw target rectangles, used to widen write triggered
    /// invalidations when a game samples its own rendered output.
    drawn_rect: Rect,
    /// Decode target when the device can't map textures.
    staging: Box<[u32]>,
}

impl<D: Device> TextureCache<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            table: SourceTable::new(),
            hash_cache: FxHashMap::default(),
            purge_list: Vec::new(),
            drawn_rect: Rect::default(),
            staging: vec![0x0; (TEXTURE_PAGE_WIDTH * TEXTURE_PAGE_HEIGHT) as usize]
                .into_boxed_slice(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Find or create the source for a draw state. The returned handle and
    /// its texture stay valid until an invalidation touches any page the
    /// source references. `None` only on texture allocation failure; the
    /// caller is expected to skip the draw.
    pub fn lookup_source(&mut self, key: SourceKey, vram: &Vram) -> Option<SourceId> {
        let mut cur = self.table.head(key.page);
        while let Some(nref) = cur {
            let node = self.table.node(nref);
            if self.table.get(SourceId(nref.source)).key == key {
                trace!("source hit {key}");
                self.table.move_to_front(nref);
                return Some(SourceId(nref.source));
            }
            cur = node.next;
        }

        self.create_source(key, vram)
    }

    pub fn source(&self, id: SourceId) -> &Source {
        self.table.get(id)
    }

    /// The sampleable texture of a live source.
    pub fn source_texture(&self, id: SourceId) -> &D::Texture {
        match self.hash_cache.get(&self.table.get(id).hash_key) {
            Some(entry) => &entry.texture,
            None => unreachable!("source without hash cache entry"),
        }
    }

    fn create_source(&mut self, key: SourceKey, vram: &Vram) -> Option<SourceId> {
        trace!("create source {key}");

        let hash_key = self.lookup_hash_cache(key, vram)?;
        match self.hash_cache.get_mut(&hash_key) {
            Some(entry) => {
                entry.ref_count += 1;
                entry.age = 0;
            }
            None => unreachable!("source without hash cache entry"),
        }

        let id = self.table.insert(Source::new(key, hash_key));

        let pages = pages_covering(
            page_start_x(key.page.into()),
            page_start_y(key.page.into()),
            key.mode.vram_width(),
            TEXTURE_PAGE_HEIGHT,
        );
        for page in pages {
            self.table.link_front(page as u8, id);
        }

        if key.mode.is_paletted() {
            let pages = pages_covering(
                key.palette.x_base(),
                key.palette.y_base(),
                PaletteReg::width(key.mode),
                1,
            );
            for page in pages {
                self.table.link_back(page as u8, id);
            }
        }

        trace!("source {key} registered in {} pages", self.table.get(id).num_page_refs());
        Some(id)
    }

    /// Destroy every source referencing this page, including their
    /// registrations on other page lists.
    pub fn invalidate_page(&mut self, page: u32) {
        debug_assert!((page as usize) < NUM_PAGES);

        if self.table.head(page as u8).is_some() {
            trace!("invalidate page {page}");
        }

        while let Some(nref) = self.table.head(page as u8) {
            let id = SourceId(nref.source);
            trace!("invalidate source {}", self.table.get(id).key);

            self.table.unlink_all(id);
            let src = self.table.remove(id);

            match self.hash_cache.get_mut(&src.hash_key) {
                Some(entry) => {
                    debug_assert!(entry.ref_count > 0);
                    entry.ref_count -= 1;
                }
                None => unreachable!("source without hash cache entry"),
            }
        }
    }

    /// Invalidate every page intersecting the cell rectangle. Both end
    /// edges are inclusive of partially covered pages.
    pub fn invalidate_pages(&mut self, rect: Rect) {
        debug_assert!(!rect.is_empty());
        for page in pages_covering(rect.left, rect.top, rect.width(), rect.height()) {
            self.invalidate_page(page);
        }
    }

    /// Record a rectangle the renderer has drawn into.
    pub fn update_drawn_rect(&mut self, rect: Rect) {
        if self.drawn_rect.contains_rect(rect) {
            return;
        }
        self.drawn_rect = self.drawn_rect.union(rect);
    }

    /// Invalidate for a VRAM write. A write overlapping an area we drew
    /// into may be feeding rendered output back in as a texture, so the
    /// whole accumulated drawn area is tossed, not just the write.
    pub fn invalidate_from_write(&mut self, rect: Rect) {
        if self.drawn_rect.intersects(rect) {
            self.drawn_rect = self.drawn_rect.union(rect);
            trace!("write {rect} overlaps drawn area, invalidating {}", self.drawn_rect);
            let drawn = self.drawn_rect;
            self.invalidate_pages(drawn);
        } else {
            trace!("invalidate from write {rect}");
            self.invalidate_pages(rect);
        }
    }

    /// Destroy all sources. The hash cache is left to
    /// [`age_hash_cache`](Self::age_hash_cache); its entries are all
    /// unreferenced afterwards.
    pub fn clear(&mut self) {
        for page in 0..NUM_PAGES as u32 {
            self.invalidate_page(page);
        }

        debug_assert!((0..NUM_PAGES).all(|page| self.table.head(page as u8).is_none()));
    }

    pub fn hash_cache_len(&self) -> usize {
        self.hash_cache.len()
    }

    pub fn live_sources(&self) -> usize {
        self.table.live_count()
    }

    pub fn drawn_rect(&self) -> Rect {
        self.drawn_rect
    }

    #[cfg(test)]
    pub(crate) fn source_ref_count(&self, id: SourceId) -> u32 {
        self.hash_cache[&self.table.get(id).hash_key].ref_count
    }
}

impl<D: Device> Drop for TextureCache<D> {
    /// Outstanding textures go back to the device; aging doesn't get a
    /// chance to reclaim them past this point.
    fn drop(&mut self) {
        for (_, entry) in self.hash_cache.drain() {
            self.device.recycle_texture(entry.texture);
        }
    }
}
