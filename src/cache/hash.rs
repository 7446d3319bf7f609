//! Content-addressed table of decoded textures.
//!
//! Sources come and go with every VRAM write, but the underlying texel data
//! rarely changes: games re-upload the same sprite sheets and swap the same
//! palettes back and forth. Keying the decoded output by content hash lets a
//! re-created source pick up its texture without another decode, and lets
//! two draw states with identical bytes share one host texture.

use super::{decode, SourceKey, TextureCache, TextureMode, PaletteReg};
use super::{page_start_x, page_start_y, TEXTURE_PAGE_HEIGHT, TEXTURE_PAGE_WIDTH, VRAM_PAGE_HEIGHT};
use super::{MAX_HASH_CACHE_AGE, MAX_HASH_CACHE_SIZE};
use crate::device::Device;
use crate::vram::Vram;

use xxhash_rust::xxh3::{xxh3_64, Xxh3};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub(super) struct HashCacheKey {
    pub texture_hash: u64,
    pub palette_hash: u64,
    /// Kept in the key so a 4 bit and an 8 bit read of coincidentally
    /// identical bytes don't alias.
    pub mode: u64,
}

impl HashCacheKey {
    pub fn of(key: SourceKey, vram: &Vram) -> Self {
        Self {
            texture_hash: hash_page(vram, key.page, key.mode),
            palette_hash: match key.mode.is_paletted() {
                true => hash_palette(vram, key.palette, key.mode),
                false => 0,
            },
            mode: key.mode as u64,
        }
    }
}

pub(super) struct HashCacheEntry<T> {
    pub texture: T,
    /// Number of live sources borrowing `texture`.
    pub ref_count: u32,
    /// Frames since a source last used this entry. Only ticks at zero
    /// refcount.
    pub age: u32,
}

/// Hash the VRAM footprint of a page. Rows aren't contiguous in memory, so
/// the hash is built up row by row instead of through a staging copy.
fn hash_page(vram: &Vram, page: u8, mode: TextureMode) -> u64 {
    let base = (page_start_y(page.into()) * Vram::WIDTH + page_start_x(page.into())) as usize;
    let width = mode.vram_width() as usize;

    let mut state = Xxh3::new();
    for y in 0..VRAM_PAGE_HEIGHT as usize {
        hash_span(&mut state, vram, base + y * Vram::WIDTH as usize, width);
    }
    state.digest()
}

/// Hash the CLUT row: 16 or 256 contiguous cells.
fn hash_palette(vram: &Vram, palette: PaletteReg, mode: TextureMode) -> u64 {
    let start = palette.base_offset();
    let len = PaletteReg::width(mode) as usize;

    if start + len <= Vram::SIZE {
        xxh3_64(bytemuck::cast_slice(&vram.raw_data()[start..start + len]))
    } else {
        let mut state = Xxh3::new();
        hash_span(&mut state, vram, start, len);
        state.digest()
    }
}

/// Feed `len` cells starting at `start` to the hasher, wrapping at the end
/// of VRAM like the console's linear addressing does.
fn hash_span(state: &mut Xxh3, vram: &Vram, start: usize, len: usize) {
    let data = vram.raw_data();
    let start = start & (Vram::SIZE - 1);
    let end = start + len;
    if end <= Vram::SIZE {
        state.update(bytemuck::cast_slice(&data[start..end]));
    } else {
        state.update(bytemuck::cast_slice(&data[start..]));
        state.update(bytemuck::cast_slice(&data[..end - Vram::SIZE]));
    }
}

impl<D: Device> TextureCache<D> {
    /// Find or create the hash cache entry for a draw state. `None` only
    /// when the device can't produce a texture.
    pub(super) fn lookup_hash_cache(&mut self, key: SourceKey, vram: &Vram) -> Option<HashCacheKey> {
        let hkey = HashCacheKey::of(key, vram);

        if self.hash_cache.contains_key(&hkey) {
            trace!("hash cache hit {:016x} {:016x}", hkey.texture_hash, hkey.palette_hash);
            return Some(hkey);
        }

        trace!("hash cache miss {:016x} {:016x}", hkey.texture_hash, hkey.palette_hash);

        let mut texture = match self.device.fetch_texture(TEXTURE_PAGE_WIDTH, TEXTURE_PAGE_HEIGHT) {
            Ok(texture) => texture,
            Err(err) => {
                error!("failed to allocate a texture page: {err}");
                return None;
            }
        };

        decode::decode_page(vram, key, &mut texture, &mut self.staging);

        let entry = HashCacheEntry { texture, ref_count: 0, age: 0 };
        self.hash_cache.insert(hkey, entry);

        Some(hkey)
    }

    /// Age unreferenced entries and evict stale ones. Called once per frame
    /// after submission.
    ///
    /// Entries first get [`MAX_HASH_CACHE_AGE`] frames of grace. If the
    /// table is still over [`MAX_HASH_CACHE_SIZE`] after those expire, the
    /// oldest of the remaining unreferenced entries are purged down to the
    /// limit. Candidates are gathered into a reused buffer during the aging
    /// walk so overflow costs one sort instead of a second pass over the
    /// table.
    pub fn age_hash_cache(&mut self) {
        let mut purge = std::mem::take(&mut self.purge_list);
        purge.clear();

        let mut expired = Vec::new();
        for (&hkey, entry) in self.hash_cache.iter_mut() {
            if entry.ref_count > 0 {
                debug_assert_eq!(entry.age, 0);
                continue;
            }

            entry.age += 1;
            if entry.age > MAX_HASH_CACHE_AGE {
                expired.push(hkey);
            } else {
                purge.push((hkey, entry.age));
            }
        }

        for hkey in expired {
            self.remove_from_hash_cache(hkey);
        }

        let len = self.hash_cache.len();
        if len > MAX_HASH_CACHE_SIZE {
            purge.sort_unstable_by(|a, b| b.1.cmp(&a.1));
            for &(hkey, _) in purge.iter().take(len - MAX_HASH_CACHE_SIZE) {
                self.remove_from_hash_cache(hkey);
            }
        }

        purge.clear();
        self.purge_list = purge;
    }

    pub(super) fn remove_from_hash_cache(&mut self, hkey: HashCacheKey) {
        match self.hash_cache.remove(&hkey) {
            Some(entry) => {
                debug_assert_eq!(entry.ref_count, 0);
                self.device.recycle_texture(entry.texture);
            }
            None => unreachable!("evicting hash cache entry twice"),
        }
    }
}
