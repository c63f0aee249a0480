//! Components J and K: the rect coalescer and the draw loop.
//!
//! The host calls `start_drawing` once per draw cycle, then `append_imagerect`
//! for every visible placement sub-range it wants composited, then
//! `finish_drawing` to flush. `mark_dirty_animations` is called right after
//! `start_drawing`, using the row deadlines the *previous* cycle registered,
//! so the host can decide which rows to re-request this cycle before any new
//! rect is appended.
//!
//! Row bookkeeping decision (spec silent on the exact row numbering): a
//! rect's `start_row..end_row` are placement-local cell rows; the absolute
//! grid row registered for dirty-tracking is derived from `screen_y_pix`
//! (`screen_y_pix / cell_h`, offset by the rect's own local row), so two
//! rects covering different screen regions of the same image don't collide
//! in `row_next_redraw`.

use std::collections::HashSet;

use crate::model::ImageRect;
use crate::store::Store;
use crate::surface::{CompositeOp, PixelRect, Surface};

impl Store {
    /// Begin a draw cycle: records the cell size and the anchor timestamp
    /// (so every placement of the same image drawn this cycle advances to
    /// the same frame, §5), and clears the pending-rect queue.
    pub fn start_drawing(&mut self, cell_w: u32, cell_h: u32, now: crate::model::Millis) {
        self.cell_w = cell_w;
        self.cell_h = cell_h;
        self.drawing_start_time = now;
        self.pending_rects.clear();
        self.advanced_this_cycle.clear();
    }

    /// For every row whose registered next-redraw deadline (from the
    /// previous cycle) has arrived, mark it dirty so the host re-requests
    /// its rects this cycle.
    pub fn mark_dirty_animations(&self, dirty_rows: &mut HashSet<u32>) {
        let now = self.drawing_start_time;
        for (&row, &deadline) in &self.row_next_redraw {
            if deadline != 0 && deadline <= now {
                dirty_rows.insert(row);
            }
        }
    }

    /// Queue one rect for compositing this cycle (§4.J). Merges into an
    /// existing pending rect when it's a vertically adjacent extension of
    /// the same (image, placement, cell size, reverse) group; otherwise
    /// takes a free slot, or evicts-by-draw the pending rect with the lowest
    /// bottom coordinate when the queue is already at `MAX_PENDING_RECTS`.
    pub fn append_imagerect(&mut self, surface: &mut impl Surface, rect: ImageRect) {
        for existing in self.pending_rects.iter_mut() {
            if can_merge(existing, &rect) {
                existing.end_row = rect.end_row;
                return;
            }
        }

        if self.pending_rects.len() >= crate::store::MAX_PENDING_RECTS {
            if let Some(victim_idx) = self
                .pending_rects
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| bottom_pixel(r))
                .map(|(i, _)| i)
            {
                let victim = self.pending_rects.remove(victim_idx);
                self.draw_rect(surface, &victim);
            }
        }

        self.pending_rects.push(rect);
    }

    /// Render all pending rects and clear the queue (§4.K).
    pub fn finish_drawing(&mut self, surface: &mut impl Surface) {
        let rects = std::mem::take(&mut self.pending_rects);
        for rect in &rects {
            self.draw_rect(surface, rect);
        }
    }

    fn draw_rect(&mut self, surface: &mut impl Surface, rect: &ImageRect) {
        let now = self.drawing_start_time;

        if self.advanced_this_cycle.insert(rect.image_id) {
            self.advance(rect.image_id, now);
        }

        let Some(image) = self.image(rect.image_id) else {
            return;
        };
        let next_redraw = image.next_redraw;
        let current_frame = image.current_frame.max(1);

        let base_row = if rect.cell_h > 0 {
            rect.screen_y_pix / rect.cell_h as i32
        } else {
            0
        };
        for local_row in rect.start_row..rect.end_row {
            let absolute_row = base_row + (local_row as i32 - rect.start_row as i32);
            if absolute_row >= 0 {
                self.row_next_redraw.insert(absolute_row as u32, next_redraw);
            }
        }

        let handle = match self.build_pixmap(
            surface,
            rect.image_id,
            rect.placement_id,
            current_frame,
            rect.cell_w,
            rect.cell_h,
            now,
        ) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("draw: no pixmap for image {} placement {}: {e}", rect.image_id, rect.placement_id);
                return;
            }
        };

        let (pixmap_w, pixmap_h) = self
            .image(rect.image_id)
            .and_then(|i| i.placements.get(&rect.placement_id))
            .and_then(|p| p.pixmaps.values().next().map(|pm| (pm.pix_width, pm.pix_height)))
            .unwrap_or((0, 0));

        let w = (rect.end_col - rect.start_col) * rect.cell_w;
        let h = (rect.end_row - rect.start_row) * rect.cell_h;
        let src_rect = PixelRect {
            x: (rect.start_col * rect.cell_w) as i32,
            y: (rect.start_row * rect.cell_h) as i32,
            w,
            h,
        };
        let dst_rect = PixelRect {
            x: rect.screen_x_pix,
            y: rect.screen_y_pix,
            w,
            h,
        };

        if rect.reverse {
            let inverted = surface.invert_copy(handle, pixmap_w, pixmap_h);
            surface.composite(inverted, src_rect, dst_rect, CompositeOp::Src);
            surface.free_pixmap(inverted);
        } else {
            surface.composite(handle, src_rect, dst_rect, CompositeOp::Over);
        }
    }
}

fn can_merge(existing: &ImageRect, new: &ImageRect) -> bool {
    existing.image_id == new.image_id
        && existing.placement_id == new.placement_id
        && existing.cell_w == new.cell_w
        && existing.cell_h == new.cell_h
        && existing.reverse == new.reverse
        && existing.start_col == new.start_col
        && existing.end_col == new.end_col
        && existing.screen_x_pix == new.screen_x_pix
        && existing.end_row == new.start_row
        && bottom_pixel(existing) == new.screen_y_pix
}

/// The pixel y-coordinate of a rect's bottom edge, used both for the
/// vertically-adjacent merge check and for picking the eviction victim.
fn bottom_pixel(rect: &ImageRect) -> i32 {
    rect.screen_y_pix + (rect.end_row - rect.start_row) as i32 * rect.cell_h as i32
}
