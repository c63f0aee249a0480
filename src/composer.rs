//! Component E: builds the surface-side pixmap for one (placement, frame)
//! pair, scaling the decoded bitmap per the placement's scale mode.

use crate::error::CoreError;
use crate::model::{Millis, Pixmap, ScaleMode};
use crate::raw_loader::ArgbBuffer;
use crate::store::Store;
use crate::surface::Surface;

impl Store {
    /// §4.E `build_pixmap`: returns the handle to composite for this frame,
    /// building and caching it if necessary.
    pub fn build_pixmap(
        &mut self,
        surface: &mut impl Surface,
        image_id: u32,
        placement_id: u32,
        frame_index: u32,
        cw: u32,
        ch: u32,
        now: Millis,
    ) -> Result<u64, CoreError> {
        self.rescale_placement_if_cell_size_changed(surface, image_id, placement_id, cw, ch);

        if let Some(handle) = self.existing_pixmap_handle(image_id, placement_id, frame_index) {
            return Ok(handle);
        }

        self.ensure_decoded(image_id, frame_index)?;
        self.infer_size_if_needed(image_id, placement_id);

        let (canvas_w, canvas_h, scale_mode, src_rect) = {
            let image = self
                .images
                .get(&image_id)
                .ok_or_else(|| CoreError::not_found("no such image"))?;
            let placement = image
                .placements
                .get(&placement_id)
                .ok_or_else(|| CoreError::not_found("no such placement"))?;
            let src = resolved_src_rect(placement.src_rect, image.pix_width, image.pix_height);
            (placement.cols * cw, placement.rows * ch, placement.scale_mode, src)
        };

        let budget = self.limits.max_ram_bytes_per_image as usize;
        if (canvas_w as usize) * (canvas_h as usize) * 4 > budget {
            return Err(CoreError::too_big("pixmap would exceed per-image RAM limit"));
        }

        let source_bitmap = {
            let image = self.images.get(&image_id).unwrap();
            image
                .frame(frame_index)
                .and_then(|f| f.decoded_bitmap.as_ref())
                .ok_or_else(|| CoreError::not_found("frame has no decoded bitmap"))?
        };

        let mut canvas = vec![0u32; canvas_w as usize * canvas_h as usize];
        blit_scaled(&mut canvas, canvas_w, canvas_h, source_bitmap, src_rect, scale_mode);
        premultiply(&mut canvas);

        let bytes = argb_to_rgba_bytes(&canvas);
        let handle = surface.allocate_pixmap(canvas_w, canvas_h);
        surface.upload_rgba_premultiplied(handle, &bytes, canvas_w, canvas_h);

        self.ram_bytes += (canvas_w as u64) * (canvas_h as u64) * 4;

        if let Some(image) = self.images.get_mut(&image_id) {
            if let Some(placement) = image.placements.get_mut(&placement_id) {
                placement.pixmaps.insert(
                    frame_index,
                    Pixmap {
                        handle,
                        pix_width: canvas_w,
                        pix_height: canvas_h,
                    },
                );
                placement.protected_frame = Some(frame_index);
            }
        }

        self.run_eviction(surface, now);

        if let Some(image) = self.images.get_mut(&image_id) {
            if let Some(placement) = image.placements.get_mut(&placement_id) {
                placement.protected_frame = None;
            }
        }

        Ok(handle)
    }

    fn existing_pixmap_handle(&self, image_id: u32, placement_id: u32, frame_index: u32) -> Option<u64> {
        self.images
            .get(&image_id)?
            .placements
            .get(&placement_id)?
            .pixmaps
            .get(&frame_index)
            .map(|p| p.handle)
    }

    /// Step 1 of §4.E: a cell-size change invalidates the placement's *entire*
    /// pixmap set, since mixed sizes within one placement are incoherent.
    fn rescale_placement_if_cell_size_changed(
        &mut self,
        surface: &mut impl Surface,
        image_id: u32,
        placement_id: u32,
        cw: u32,
        ch: u32,
    ) {
        let needs_clear = self
            .images
            .get(&image_id)
            .and_then(|img| img.placements.get(&placement_id))
            .map(|p| p.scaled_cell_w != cw || p.scaled_cell_h != ch)
            .unwrap_or(false);
        if !needs_clear {
            return;
        }

        let stale: Vec<(u32, u64)> = self
            .images
            .get(&image_id)
            .and_then(|img| img.placements.get(&placement_id))
            .map(|p| p.pixmaps.iter().map(|(&idx, pm)| (idx, pm.handle)).collect())
            .unwrap_or_default();

        for (_, handle) in &stale {
            surface.free_pixmap(*handle);
        }

        if let Some(image) = self.images.get_mut(&image_id) {
            if let Some(placement) = image.placements.get_mut(&placement_id) {
                let freed: u64 = stale
                    .iter()
                    .filter_map(|(idx, _)| placement.pixmaps.get(idx))
                    .map(|pm| pm.pix_width as u64 * pm.pix_height as u64 * 4)
                    .sum();
                placement.pixmaps.clear();
                placement.scaled_cell_w = cw;
                placement.scaled_cell_h = ch;
                self.ram_bytes = self.ram_bytes.saturating_sub(freed);
            }
        }
    }
}

fn resolved_src_rect(raw: crate::model::SrcRect, image_w: u32, image_h: u32) -> crate::model::SrcRect {
    let mut rect = raw;
    if rect.w == 0 {
        rect.w = image_w;
    }
    if rect.h == 0 {
        rect.h = image_h;
    }
    rect.x = rect.x.min(image_w);
    rect.y = rect.y.min(image_h);
    rect.w = rect.w.min(image_w.saturating_sub(rect.x));
    rect.h = rect.h.min(image_h.saturating_sub(rect.y));
    rect
}

/// Blits `src_rect` of `source` into `dst` per `mode` (§4.E step 5).
fn blit_scaled(
    dst: &mut [u32],
    dst_w: u32,
    dst_h: u32,
    source: &ArgbBuffer,
    src_rect: crate::model::SrcRect,
    mode: ScaleMode,
) {
    if src_rect.w == 0 || src_rect.h == 0 || dst_w == 0 || dst_h == 0 {
        return;
    }

    let mode = if mode == ScaleMode::NoneOrContain {
        if dst_w < src_rect.w || dst_h < src_rect.h {
            ScaleMode::Contain
        } else {
            ScaleMode::None
        }
    } else {
        mode
    };

    match mode {
        ScaleMode::Fill => stretch_blit(dst, dst_w, dst_h, source, src_rect, 0, 0, dst_w, dst_h),
        ScaleMode::None => {
            let w = src_rect.w.min(dst_w);
            let h = src_rect.h.min(dst_h);
            copy_blit(dst, dst_w, source, src_rect, w, h, 0, 0);
        }
        ScaleMode::NoneOrContain => unreachable!("resolved above"),
        ScaleMode::Contain => {
            // §4.E: `scaled_w · src_h > src_w · scaled_h` selects fit-height vs fit-width.
            let fit_height = dst_w as u64 * src_rect.h as u64 > src_rect.w as u64 * dst_h as u64;
            let (out_w, out_h) = if fit_height {
                let out_h = dst_h;
                let out_w = (src_rect.w as u64 * out_h as u64 / src_rect.h as u64) as u32;
                (out_w, out_h)
            } else {
                let out_w = dst_w;
                let out_h = (src_rect.h as u64 * out_w as u64 / src_rect.w as u64) as u32;
                (out_w, out_h)
            };
            let off_x = (dst_w.saturating_sub(out_w)) / 2;
            let off_y = (dst_h.saturating_sub(out_h)) / 2;
            stretch_blit(dst, dst_w, dst_h, source, src_rect, off_x as i32, off_y as i32, out_w, out_h);
        }
    }
}

fn copy_blit(
    dst: &mut [u32],
    dst_w: u32,
    source: &ArgbBuffer,
    src_rect: crate::model::SrcRect,
    w: u32,
    h: u32,
    off_x: i32,
    off_y: i32,
) {
    for row in 0..h {
        for col in 0..w {
            let sx = src_rect.x + col;
            let sy = src_rect.y + row;
            if sx >= source.width || sy >= source.height {
                continue;
            }
            let px = source.pixels[(sy * source.width + sx) as usize];
            let dx = off_x + col as i32;
            let dy = off_y + row as i32;
            if dx < 0 || dy < 0 {
                continue;
            }
            dst[(dy as u32 * dst_w + dx as u32) as usize] = px;
        }
    }
}

fn stretch_blit(
    dst: &mut [u32],
    dst_w: u32,
    dst_h: u32,
    source: &ArgbBuffer,
    src_rect: crate::model::SrcRect,
    off_x: i32,
    off_y: i32,
    out_w: u32,
    out_h: u32,
) {
    let _ = dst_h;
    if out_w == 0 || out_h == 0 {
        return;
    }
    for dy in 0..out_h {
        let sy = src_rect.y + (dy as u64 * src_rect.h as u64 / out_h as u64) as u32;
        for dx in 0..out_w {
            let sx = src_rect.x + (dx as u64 * src_rect.w as u64 / out_w as u64) as u32;
            if sx >= source.width || sy >= source.height {
                continue;
            }
            let px = source.pixels[(sy * source.width + sx) as usize];
            let tx = off_x + dx as i32;
            let ty = off_y + dy as i32;
            if tx < 0 || ty < 0 || tx as u32 >= dst_w {
                continue;
            }
            let idx = ty as u32 * dst_w + tx as u32;
            if (idx as usize) < dst.len() {
                dst[idx as usize] = px;
            }
        }
    }
}

fn premultiply(pixels: &mut [u32]) {
    for p in pixels.iter_mut() {
        let a = (*p >> 24) & 0xFF;
        if a == 0xFF || a == 0 {
            continue;
        }
        let r = (*p >> 16) & 0xFF;
        let g = (*p >> 8) & 0xFF;
        let b = *p & 0xFF;
        let r = r * a / 255;
        let g = g * a / 255;
        let b = b * a / 255;
        *p = (a << 24) | (r << 16) | (g << 8) | b;
    }
}

fn argb_to_rgba_bytes(pixels: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len() * 4);
    for &p in pixels {
        let a = (p >> 24) & 0xFF;
        let r = (p >> 16) & 0xFF;
        let g = (p >> 8) & 0xFF;
        let b = p & 0xFF;
        out.extend_from_slice(&[r as u8, g as u8, b as u8, a as u8]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Compression, FrameFormat, FrameStatus, SrcRect};
    use crate::store::test_store;
    use crate::surface::{CompositeOp, PixelRect, PixmapHandle};
    use std::io::Write;

    struct FakeSurface {
        next_handle: u64,
        allocations: Vec<(u32, u32)>,
    }

    impl FakeSurface {
        fn new() -> Self {
            FakeSurface {
                next_handle: 1,
                allocations: Vec::new(),
            }
        }
    }

    impl Surface for FakeSurface {
        fn allocate_pixmap(&mut self, w: u32, h: u32) -> PixmapHandle {
            let handle = self.next_handle;
            self.next_handle += 1;
            self.allocations.push((w, h));
            handle
        }
        fn upload_rgba_premultiplied(&mut self, _pixmap: PixmapHandle, _bytes: &[u8], _w: u32, _h: u32) {}
        fn composite(&mut self, _src: PixmapHandle, _src_rect: PixelRect, _dst_rect: PixelRect, _op: CompositeOp) {}
        fn invert_copy(&mut self, _src: PixmapHandle, _w: u32, _h: u32) -> PixmapHandle {
            999
        }
        fn free_pixmap(&mut self, _pixmap: PixmapHandle) {}
    }

    fn uploaded_image(store: &mut crate::store::Store, surface: &mut impl Surface, w: u32, h: u32) -> u32 {
        let id = store.new_image(1, 0, surface);
        store.append_frame(id, 0).unwrap();
        {
            let mut f = store.cache_dir.open_for_write(id, 1).unwrap();
            f.write_all(&vec![0xFFu8; (w * h * 3) as usize]).unwrap();
        }
        store.record_disk_size(id, 1, (w * h * 3) as u64);
        {
            let image = store.image_mut(id).unwrap();
            let frame = image.frame_mut(1).unwrap();
            frame.format = FrameFormat::Raw24;
            frame.compression = Compression::None;
            frame.data_pix_width = w;
            frame.data_pix_height = h;
            frame.status = FrameStatus::UploadSuccess;
        }
        id
    }

    #[test]
    fn build_pixmap_caches_result_per_frame() {
        let mut store = test_store();
        let mut surface = FakeSurface::new();
        let image_id = uploaded_image(&mut store, &mut surface, 4, 2);
        let placement_id = store.new_placement(image_id, 0, 0, false, 2, 2, &mut surface).unwrap();

        let h1 = store
            .build_pixmap(&mut surface, image_id, placement_id, 1, 10, 10, 0)
            .unwrap();
        let h2 = store
            .build_pixmap(&mut surface, image_id, placement_id, 1, 10, 10, 0)
            .unwrap();
        assert_eq!(h1, h2);
        assert_eq!(surface.allocations.len(), 1);
    }

    #[test]
    fn cell_size_change_invalidates_all_pixmaps() {
        let mut store = test_store();
        let mut surface = FakeSurface::new();
        let image_id = uploaded_image(&mut store, &mut surface, 4, 2);
        let placement_id = store.new_placement(image_id, 0, 0, false, 2, 2, &mut surface).unwrap();

        store
            .build_pixmap(&mut surface, image_id, placement_id, 1, 10, 10, 0)
            .unwrap();
        store
            .build_pixmap(&mut surface, image_id, placement_id, 1, 20, 20, 0)
            .unwrap();
        assert_eq!(surface.allocations.len(), 2);
        assert_eq!(surface.allocations[1], (40, 40));
    }

    #[test]
    fn resolved_src_rect_defaults_to_full_image() {
        let rect = resolved_src_rect(SrcRect::default(), 10, 20);
        assert_eq!(rect, SrcRect { x: 0, y: 0, w: 10, h: 20 });
    }

    #[test]
    fn fit_height_selection_matches_spec_inequality() {
        let mut dst = vec![0u32; 4 * 2];
        let src = ArgbBuffer {
            width: 2,
            height: 1,
            pixels: vec![0xFFFFFFFF, 0xFF000000],
        };
        blit_scaled(
            &mut dst,
            4,
            2,
            &src,
            SrcRect { x: 0, y: 0, w: 2, h: 1 },
            ScaleMode::Contain,
        );
        // dst_w(4)*src_h(1)=4 > src_w(2)*dst_h(2)=4 is false, so fit-width wins:
        // full width used, centered vertically with a letterboxed band.
        assert!(dst.iter().any(|&p| p != 0));
    }
}
