//! Component D: placement lifecycle and the deferred size-inference rule.

use super::frame_store::random_reserved_id;
use super::Store;
use crate::error::CoreError;
use crate::model::{Millis, Placement, ScaleMode, SrcRect};
use crate::surface::Surface;

/// The effective (width, height) of a placement's source rect, after the
/// zero-means-full-image default and bounds clipping of §4.D, floored at 1 to
/// keep downstream ratio math well-defined.
fn resolved_src_extent(rect: SrcRect, image_w: u32, image_h: u32) -> (u32, u32) {
    let x = rect.x.min(image_w);
    let y = rect.y.min(image_h);
    let w = if rect.w == 0 { image_w } else { rect.w }.min(image_w.saturating_sub(x));
    let h = if rect.h == 0 { image_h } else { rect.h }.min(image_h.saturating_sub(y));
    (w.max(1), h.max(1))
}

impl Store {
    /// §4.D `new_placement`: attach a placement to `image_id`, returning its id.
    /// `id = 0` generates a fresh reserved random id (same rule as `new_image`).
    pub fn new_placement(
        &mut self,
        image_id: u32,
        id: u32,
        now: Millis,
        virtual_placement: bool,
        cols: u32,
        rows: u32,
        surface: &mut impl Surface,
    ) -> Result<u32, CoreError> {
        if !self.images.contains_key(&image_id) {
            return Err(CoreError::not_found(format!("no image with id {image_id}")));
        }

        let placement_id = if id == 0 {
            let mut rng = rand::thread_rng();
            loop {
                let candidate = random_reserved_id(&mut rng);
                let taken = self
                    .images
                    .get(&image_id)
                    .map(|img| img.placements.contains_key(&candidate))
                    .unwrap_or(false);
                if !taken {
                    break candidate;
                }
            }
        } else {
            id
        };

        let mut placement = Placement::new(placement_id, now, virtual_placement);
        placement.cols = cols;
        placement.rows = rows;
        placement.scale_mode = ScaleMode::default_for(virtual_placement, cols != 0, rows != 0);

        let image = self.images.get_mut(&image_id).unwrap();
        if image.default_placement_id == 0 {
            image.default_placement_id = placement_id;
        }
        if image.initial_placement_id == 0 {
            image.initial_placement_id = placement_id;
        }
        self.enforce_placement_count_budget(surface);
        let image = self.images.get_mut(&image_id).unwrap();
        image.placements.insert(placement_id, placement);
        Ok(placement_id)
    }

    /// §4.D `delete_placement`: frees pixmap RAM accounting and, if this was
    /// the default/initial placement, clears those pointers (no reassignment;
    /// §9 leaves successor choice host-defined, so the core just clears it).
    /// Each surviving pixmap's handle is returned to `surface` before its
    /// accounting is dropped (§9).
    pub fn delete_placement(&mut self, image_id: u32, placement_id: u32, surface: &mut impl Surface) {
        let Some(image) = self.images.get_mut(&image_id) else {
            return;
        };
        if let Some(placement) = image.placements.remove(&placement_id) {
            for pixmap in placement.pixmaps.values() {
                surface.free_pixmap(pixmap.handle);
            }
            self.ram_bytes = self.ram_bytes.saturating_sub(placement.ram_bytes() as u64);
        }
        if image.default_placement_id == placement_id {
            image.default_placement_id = 0;
        }
        if image.initial_placement_id == placement_id {
            image.initial_placement_id = 0;
        }
    }

    /// §4.D `infer_size_if_needed`: when a placement specifies neither `cols`
    /// nor `rows`, its cell extent depends on the image's pixel size and the
    /// host's current cell size. Per the documented Decision for this open
    /// question: if cell size isn't known yet (`cell_w`/`cell_h == 0`), mark
    /// the placement as deferred rather than guessing, and retry here on
    /// every call until it resolves (called before each pixmap build).
    pub fn infer_size_if_needed(&mut self, image_id: u32, placement_id: u32) {
        let (pix_w, pix_h) = match self.images.get(&image_id) {
            Some(img) => (img.pix_width, img.pix_height),
            None => return,
        };
        if self.cell_w == 0 || self.cell_h == 0 || pix_w == 0 || pix_h == 0 {
            if let Some(image) = self.images.get_mut(&image_id) {
                if let Some(p) = image.placements.get_mut(&placement_id) {
                    p.inference_deferred = true;
                }
            }
            return;
        }

        let (cell_w, cell_h) = (self.cell_w, self.cell_h);
        if let Some(image) = self.images.get_mut(&image_id) {
            if let Some(p) = image.placements.get_mut(&placement_id) {
                let (src_w, src_h) = resolved_src_extent(p.src_rect, pix_w, pix_h);
                if p.cols == 0 && p.rows == 0 {
                    p.cols = (src_w + cell_w - 1) / cell_w;
                    p.rows = (src_h + cell_h - 1) / cell_h;
                } else if p.cols == 0 {
                    // §4.D: `contain` preserves aspect ratio; other modes derive
                    // the missing dimension from src pixel size alone.
                    p.cols = if p.scale_mode == ScaleMode::Contain {
                        let avail_h_px = p.rows * cell_h;
                        (src_w as u64 * avail_h_px as u64 / src_h.max(1) as u64).div_ceil(cell_w as u64) as u32
                    } else {
                        (src_w + cell_w - 1) / cell_w
                    };
                } else if p.rows == 0 {
                    p.rows = if p.scale_mode == ScaleMode::Contain {
                        let avail_w_px = p.cols * cell_w;
                        (src_h as u64 * avail_w_px as u64 / src_w.max(1) as u64).div_ceil(cell_h as u64) as u32
                    } else {
                        (src_h + cell_h - 1) / cell_h
                    };
                }
                p.inference_deferred = false;
            }
        }
    }

    pub(crate) fn enforce_placement_count_budget(&mut self, surface: &mut impl Surface) {
        let limit = self.limits.enforced_count(self.limits.max_placements);
        let total_placements: usize = self.images.values().map(|img| img.placements.len()).sum();
        if total_placements < limit {
            return;
        }
        let victim = self
            .images
            .iter()
            .flat_map(|(&img_id, img)| img.placements.values().map(move |p| (img_id, p.placement_id, p.atime)))
            .min_by_key(|&(_, _, atime)| atime);
        if let Some((victim_image, victim_placement, _)) = victim {
            self.delete_placement(victim_image, victim_placement, surface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{test_store, NullSurface};
    use crate::surface::{CompositeOp, PixelRect, PixmapHandle};

    #[test]
    fn new_placement_requires_existing_image() {
        let mut store = test_store();
        let err = store.new_placement(1, 0, 0, false, 0, 0, &mut NullSurface).unwrap_err();
        assert_eq!(err.kind.code(), "ENOENT");
    }

    #[test]
    fn new_placement_zero_id_generates_reserved_id() {
        let mut store = test_store();
        let image_id = store.new_image(1, 0, &mut NullSurface);
        let pid = store.new_placement(image_id, 0, 0, false, 0, 0, &mut NullSurface).unwrap();
        assert_ne!(pid, 0);
        assert!(store.image(image_id).unwrap().placements.contains_key(&pid));
    }

    #[test]
    fn first_placement_becomes_default_and_initial() {
        let mut store = test_store();
        let image_id = store.new_image(1, 0, &mut NullSurface);
        let pid = store.new_placement(image_id, 0, 0, false, 0, 0, &mut NullSurface).unwrap();
        let image = store.image(image_id).unwrap();
        assert_eq!(image.default_placement_id, pid);
        assert_eq!(image.initial_placement_id, pid);
    }

    #[test]
    fn delete_placement_clears_default_pointer() {
        let mut store = test_store();
        let image_id = store.new_image(1, 0, &mut NullSurface);
        let pid = store.new_placement(image_id, 0, 0, false, 0, 0, &mut NullSurface).unwrap();
        store.delete_placement(image_id, pid, &mut NullSurface);
        let image = store.image(image_id).unwrap();
        assert_eq!(image.default_placement_id, 0);
        assert!(!image.placements.contains_key(&pid));
    }

    struct FakeSurface {
        freed: Vec<PixmapHandle>,
    }

    impl crate::surface::Surface for FakeSurface {
        fn allocate_pixmap(&mut self, _w: u32, _h: u32) -> PixmapHandle {
            1
        }
        fn upload_rgba_premultiplied(&mut self, _pixmap: PixmapHandle, _bytes: &[u8], _w: u32, _h: u32) {}
        fn composite(&mut self, _src: PixmapHandle, _src_rect: PixelRect, _dst_rect: PixelRect, _op: CompositeOp) {}
        fn invert_copy(&mut self, _src: PixmapHandle, _w: u32, _h: u32) -> PixmapHandle {
            999
        }
        fn free_pixmap(&mut self, pixmap: PixmapHandle) {
            self.freed.push(pixmap);
        }
    }

    #[test]
    fn delete_placement_frees_its_pixmaps_on_the_surface() {
        let mut store = test_store();
        let mut surface = FakeSurface { freed: Vec::new() };
        let image_id = store.new_image(1, 0, &mut surface);
        let pid = store.new_placement(image_id, 0, 0, false, 2, 2, &mut surface).unwrap();
        store
            .image_mut(image_id)
            .unwrap()
            .placements
            .get_mut(&pid)
            .unwrap()
            .pixmaps
            .insert(1, crate::model::Pixmap { handle: 42, pix_width: 2, pix_height: 2 });
        store.ram_bytes += 2 * 2 * 4;

        store.delete_placement(image_id, pid, &mut surface);

        assert_eq!(surface.freed, vec![42]);
        assert_eq!(store.ram_bytes, 0);
    }

    #[test]
    fn infer_size_defers_until_cell_size_known() {
        let mut store = test_store();
        let image_id = store.new_image(1, 0, &mut NullSurface);
        {
            let image = store.image_mut(image_id).unwrap();
            image.pix_width = 100;
            image.pix_height = 40;
        }
        let pid = store.new_placement(image_id, 0, 0, false, 0, 0, &mut NullSurface).unwrap();

        store.infer_size_if_needed(image_id, pid);
        assert!(store.image(image_id).unwrap().placements[&pid].inference_deferred);

        store.cell_w = 10;
        store.cell_h = 20;
        store.infer_size_if_needed(image_id, pid);
        let placement = &store.image(image_id).unwrap().placements[&pid];
        assert!(!placement.inference_deferred);
        assert_eq!((placement.cols, placement.rows), (10, 2));
    }
}
