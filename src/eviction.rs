//! Component F: the four independent eviction budgets of §4.F — image
//! count, placement count, disk bytes, and RAM bytes — each enforced with
//! the tolerance ratio from `CacheLimits`.
//!
//! Count and disk budgets are plain atime LRU. RAM is scored: a frame or
//! pixmap belonging to an image that is actively animating *and* was
//! touched within its own recency window (`2 * total_duration + 1000` ms)
//! is treated as hot and left alone until every cold object is gone;
//! everything else is evicted oldest-atime-first. A placement's
//! `protected_frame` (set for the duration of `build_pixmap`, see
//! composer.rs) is never a candidate, so the pixmap `build_pixmap` just
//! built can't be evicted by the pass it triggers.

use crate::model::{AnimationState, FrameStatus, Millis};
use crate::store::Store;
use crate::surface::Surface;

impl Store {
    /// Runs all four budgets in turn. Called after every operation that can
    /// grow a count or byte total: `new_image`, `new_placement`, frame
    /// decode, and pixmap build.
    pub fn run_eviction(&mut self, surface: &mut impl Surface, now: Millis) {
        self.enforce_image_count_budget(surface);
        self.enforce_placement_count_budget(surface);
        self.enforce_disk_budget();
        self.enforce_ram_budget(surface, now);
    }

    fn enforce_disk_budget(&mut self) {
        let limit = self.limits.enforced(self.limits.max_disk_bytes);
        while self.disk_bytes > limit {
            let victim = self
                .images
                .iter()
                .flat_map(|(&image_id, img)| {
                    img.frames
                        .iter()
                        .enumerate()
                        .filter(|(_, f)| f.disk_size > 0)
                        .map(move |(i, f)| (image_id, i as u32 + 1, f.atime))
                })
                .min_by_key(|&(_, _, atime)| atime);
            let Some((image_id, frame_index, _)) = victim else {
                break;
            };
            self.cache_dir.remove_frame(image_id, frame_index);
            self.record_disk_size(image_id, frame_index, 0);
        }
    }

    fn enforce_ram_budget(&mut self, surface: &mut impl Surface, now: Millis) {
        let limit = self.limits.enforced(self.limits.max_ram_bytes);
        while self.ram_bytes > limit {
            match self.coldest_ram_candidate(now) {
                Some(RamCandidate::Bitmap { image_id, frame_index }) => {
                    self.evict_bitmap(image_id, frame_index);
                }
                Some(RamCandidate::Pixmap {
                    image_id,
                    placement_id,
                    frame_index,
                }) => {
                    self.evict_pixmap(surface, image_id, placement_id, frame_index);
                }
                None => break,
            }
        }
    }

    /// Coldest non-hot candidate, or (only if every remaining candidate is
    /// hot) the coldest hot one: budgets must eventually be enforceable even
    /// if every live image happens to be animating.
    fn coldest_ram_candidate(&self, now: Millis) -> Option<RamCandidate> {
        self.ram_candidate(now, false).or_else(|| self.ram_candidate(now, true))
    }

    fn ram_candidate(&self, now: Millis, allow_hot: bool) -> Option<RamCandidate> {
        let mut best: Option<(i64, RamCandidate)> = None;
        for (&image_id, image) in &self.images {
            let hot = is_hot(image, now);
            if hot && !allow_hot {
                continue;
            }

            for (i, frame) in image.frames.iter().enumerate() {
                if frame.decoded_bitmap.is_none() {
                    continue;
                }
                let score = frame.atime;
                let candidate = RamCandidate::Bitmap {
                    image_id,
                    frame_index: i as u32 + 1,
                };
                if best.as_ref().map(|(s, _)| score < *s).unwrap_or(true) {
                    best = Some((score, candidate));
                }
            }

            for placement in image.placements.values() {
                for (&frame_index, _) in &placement.pixmaps {
                    if placement.protected_frame == Some(frame_index) {
                        continue;
                    }
                    let score = placement.atime;
                    let candidate = RamCandidate::Pixmap {
                        image_id,
                        placement_id: placement.placement_id,
                        frame_index,
                    };
                    if best.as_ref().map(|(s, _)| score < *s).unwrap_or(true) {
                        best = Some((score, candidate));
                    }
                }
            }
        }
        best.map(|(_, candidate)| candidate)
    }

    fn evict_bitmap(&mut self, image_id: u32, frame_index: u32) {
        if let Some(image) = self.images.get_mut(&image_id) {
            if let Some(frame) = image.frame_mut(frame_index) {
                if let Some(bitmap) = frame.decoded_bitmap.take() {
                    let bytes = bitmap.pixels.len() as u64 * 4;
                    self.ram_bytes = self.ram_bytes.saturating_sub(bytes);
                }
                // Revert to UploadSuccess (not Uninit) so `ensure_decoded`
                // redecodes from the still-present disk file on next use.
                if frame.status == FrameStatus::RamLoadingSuccess {
                    frame.status = FrameStatus::UploadSuccess;
                }
            }
        }
    }

    fn evict_pixmap(&mut self, surface: &mut impl Surface, image_id: u32, placement_id: u32, frame_index: u32) {
        if let Some(image) = self.images.get_mut(&image_id) {
            if let Some(placement) = image.placements.get_mut(&placement_id) {
                if let Some(pixmap) = placement.pixmaps.remove(&frame_index) {
                    surface.free_pixmap(pixmap.handle);
                    let bytes = pixmap.pix_width as u64 * pixmap.pix_height as u64 * 4;
                    self.ram_bytes = self.ram_bytes.saturating_sub(bytes);
                }
            }
        }
    }
}

enum RamCandidate {
    Bitmap { image_id: u32, frame_index: u32 },
    Pixmap { image_id: u32, placement_id: u32, frame_index: u32 },
}

/// An image counts as "hot" (protected from RAM eviction) while it is
/// actively animating and was touched within its own recency window.
fn is_hot(image: &crate::model::Image, now: Millis) -> bool {
    if !matches!(image.animation_state, AnimationState::Looping | AnimationState::Loading) {
        return false;
    }
    let window = 2 * image.total_duration + 1000;
    now.saturating_sub(image.atime) < window
}
