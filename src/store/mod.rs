//! The process-wide image store: §9 "Global state" encapsulated in a single
//! context object passed to every entry point. Tests instantiate independent
//! `Store`s rather than sharing one process-wide singleton.

mod frame_store;
mod placement_store;

use std::collections::HashMap;

use crate::cache_dir::CacheDir;
use crate::limits::CacheLimits;
use crate::model::{Image, ImageRect};

/// Maximum pending draw rectangles per draw cycle (§3, `ImageRect` cap).
pub const MAX_PENDING_RECTS: usize = 20;

pub struct Store {
    pub images: HashMap<u32, Image>,
    pub limits: CacheLimits,
    pub cache_dir: CacheDir,

    /// Σ `image.total_disk_size`, maintained incrementally (invariant P1/P2).
    pub disk_bytes: u64,
    /// Σ decoded bitmaps + Σ pixmaps, maintained incrementally (invariant P2/P3).
    pub ram_bytes: u64,

    pub next_global_command_index: u64,

    /// Pending draw rectangles accumulated by `append_imagerect` (§4.J).
    pub pending_rects: Vec<ImageRect>,
    /// Per-row next-redraw deadlines registered during the current draw cycle (§4.K).
    pub row_next_redraw: HashMap<u32, i64>,
    /// Cell pixel size as of the last `start_drawing` call; 0 means unknown.
    pub cell_w: u32,
    pub cell_h: u32,
    /// Anchor timestamp for the current draw cycle, so every placement of
    /// the same image drawn in one cycle shows the same frame (§5).
    pub drawing_start_time: i64,
    /// Images already advanced this draw cycle (first-touch-per-cycle rule, §4.J).
    pub(crate) advanced_this_cycle: std::collections::HashSet<u32>,
}

impl Store {
    pub fn new(limits: CacheLimits, cache_dir: CacheDir) -> Self {
        Store {
            images: HashMap::new(),
            limits,
            cache_dir,
            disk_bytes: 0,
            ram_bytes: 0,
            next_global_command_index: 1,
            pending_rects: Vec::new(),
            row_next_redraw: HashMap::new(),
            cell_w: 0,
            cell_h: 0,
            drawing_start_time: 0,
            advanced_this_cycle: std::collections::HashSet::new(),
        }
    }

    pub fn next_command_index(&mut self) -> u64 {
        let idx = self.next_global_command_index;
        self.next_global_command_index += 1;
        idx
    }

    pub fn image(&self, id: u32) -> Option<&Image> {
        self.images.get(&id)
    }

    pub fn image_mut(&mut self, id: u32) -> Option<&mut Image> {
        self.images.get_mut(&id)
    }

    /// Find an image by its user-facing `image_number`, tie-broken by the
    /// most recently created (highest `global_command_index`).
    pub fn find_by_number(&self, number: u32) -> Option<&Image> {
        self.images
            .values()
            .filter(|img| img.image_number == Some(number))
            .max_by_key(|img| img.global_command_index)
    }

    pub fn find_by_number_id(&self, number: u32) -> Option<u32> {
        self.find_by_number(number).map(|img| img.image_id)
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> Store {
    let tmp = tempfile::tempdir().unwrap();
    // Leak the tempdir so it outlives the CacheDir's own cleanup in tests;
    // CacheDir::drop removes its own subdirectory regardless.
    let base = tmp.into_path();
    Store::new(CacheLimits::default(), CacheDir::new(Some(&base)).unwrap())
}

/// A `Surface` for tests that exercise the store's bookkeeping and don't
/// care what becomes of pixmap handles, only that something implementing
/// the trait was threaded through.
#[cfg(test)]
pub(crate) struct NullSurface;

#[cfg(test)]
impl crate::surface::Surface for NullSurface {
    fn allocate_pixmap(&mut self, _w: u32, _h: u32) -> crate::surface::PixmapHandle {
        1
    }
    fn upload_rgba_premultiplied(&mut self, _pixmap: crate::surface::PixmapHandle, _bytes: &[u8], _w: u32, _h: u32) {}
    fn composite(
        &mut self,
        _src: crate::surface::PixmapHandle,
        _src_rect: crate::surface::PixelRect,
        _dst_rect: crate::surface::PixelRect,
        _op: crate::surface::CompositeOp,
    ) {
    }
    fn invert_copy(&mut self, _src: crate::surface::PixmapHandle, _w: u32, _h: u32) -> crate::surface::PixmapHandle {
        1
    }
    fn free_pixmap(&mut self, _pixmap: crate::surface::PixmapHandle) {}
}
