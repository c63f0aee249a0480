//! Component C: image/frame lifecycle, disk bookkeeping, and the decoded
//! bitmap loader with its recursion guard.

use rand::Rng;

use super::Store;
use crate::error::CoreError;
use crate::model::{
    Blend, FrameStatus, Image, ImageFrame, Millis,
};
use crate::raw_loader::{self, ArgbBuffer, RawFormat};
use crate::surface::Surface;

/// Random ID generation per §9 Design Notes: high byte non-zero, both
/// middle bytes non-zero (so the id never collides with the Unicode
/// placeholder diacritic encoding's reserved ranges). Used for both
/// `new_image(0)` and `new_placement(0)`.
pub(super) fn random_reserved_id(rng: &mut impl Rng) -> u32 {
    loop {
        let candidate: u32 = rng.gen();
        let high = (candidate >> 24) & 0xFF;
        let mid1 = (candidate >> 16) & 0xFF;
        let mid2 = (candidate >> 8) & 0xFF;
        if high != 0 && mid1 != 0 && mid2 != 0 {
            return candidate;
        }
    }
}

impl Store {
    /// §4.C `new_image`: create (or replace) an image and return its id.
    /// `id = 0` generates a fresh random id, retrying on collision.
    pub fn new_image(&mut self, id: u32, now: Millis, surface: &mut impl Surface) -> u32 {
        let id = if id == 0 {
            let mut rng = rand::thread_rng();
            loop {
                let candidate = random_reserved_id(&mut rng);
                if !self.images.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            if self.images.contains_key(&id) {
                self.delete_image(id, surface);
            }
            id
        };

        let command_index = self.next_command_index();
        let image = Image::new(id, command_index, now);
        self.enforce_image_count_budget(surface);
        self.images.insert(id, image);
        id
    }

    /// §4.C `append_frame`: O(1) append; returns the new 1-based frame index.
    pub fn append_frame(&mut self, image_id: u32, quiet: u8) -> Result<u32, CoreError> {
        let image = self
            .images
            .get_mut(&image_id)
            .ok_or_else(|| CoreError::not_found(format!("no image with id {image_id}")))?;
        image.frames.push(ImageFrame::new(quiet));
        Ok(image.frames.len() as u32)
    }

    /// §4.C `delete_image`: removes files, decoded bitmaps, placements, and
    /// the map entry, keeping the global counters in sync (invariants P1-P3).
    /// Per §9, every placement pixmap being destroyed returns its handle to
    /// `surface` before its RAM accounting is dropped.
    pub fn delete_image(&mut self, id: u32, surface: &mut impl Surface) {
        let Some(image) = self.images.remove(&id) else {
            return;
        };

        self.disk_bytes = self.disk_bytes.saturating_sub(image.total_disk_size);

        for frame in &image.frames {
            if let Some(bitmap) = &frame.decoded_bitmap {
                self.ram_bytes = self
                    .ram_bytes
                    .saturating_sub(bitmap_ram_bytes(bitmap) as u64);
            }
        }
        for (frame_index, _) in image.frames.iter().enumerate() {
            self.cache_dir.remove_frame(id, frame_index as u32 + 1);
        }
        for placement in image.placements.values() {
            for pixmap in placement.pixmaps.values() {
                surface.free_pixmap(pixmap.handle);
            }
            self.ram_bytes = self.ram_bytes.saturating_sub(placement.ram_bytes() as u64);
        }
    }

    pub fn get_frame(&self, image_id: u32, index: u32) -> Option<&ImageFrame> {
        self.images.get(&image_id).and_then(|img| img.frame(index))
    }

    /// §4.C `touch_frame`: propagate atime up to the owning image.
    pub fn touch_frame(&mut self, image_id: u32, frame_index: u32, now: Millis) {
        if let Some(image) = self.images.get_mut(&image_id) {
            image.atime = now;
            if let Some(frame) = image.frame_mut(frame_index) {
                frame.atime = now;
            }
        }
    }

    pub(crate) fn enforce_image_count_budget(&mut self, surface: &mut impl Surface) {
        let limit = self.limits.enforced_count(self.limits.max_images);
        if self.images.len() < limit {
            return;
        }
        if let Some((&victim, _)) = self
            .images
            .iter()
            .min_by_key(|(_, img)| (img.atime, img.global_command_index))
        {
            self.delete_image(victim, surface);
        }
    }

    /// Record a frame's uploaded byte count into both the frame and the
    /// global disk-byte counters (the only path allowed to mutate `disk_bytes`).
    pub fn record_disk_size(&mut self, image_id: u32, frame_index: u32, size: u64) {
        if let Some(image) = self.images.get_mut(&image_id) {
            if let Some(frame) = image.frame_mut(frame_index) {
                let previous = frame.disk_size;
                frame.disk_size = size;
                image.total_disk_size = image.total_disk_size - previous + size;
                self.disk_bytes = self.disk_bytes - previous + size;
            }
        }
    }

    /// §4.C `ensure_decoded`: idempotent decode+compose of a frame's bitmap.
    ///
    /// Fails fast if the frame's status hasn't reached `UploadSuccess` or its
    /// disk file was evicted (`disk_size == 0`). Uses the transient
    /// `RamLoadingInProgress` status as a cycle guard against background
    /// frame references that form a loop.
    pub fn ensure_decoded(&mut self, image_id: u32, frame_index: u32) -> Result<(), CoreError> {
        let already_loaded = {
            let frame = self.require_frame(image_id, frame_index)?;
            matches!(frame.status, FrameStatus::RamLoadingSuccess)
        };
        if already_loaded {
            return Ok(());
        }

        {
            let frame = self.require_frame(image_id, frame_index)?;
            if !frame.status.at_least_upload_success() {
                return Err(CoreError::not_found("frame has not finished uploading"));
            }
            if frame.disk_size == 0 {
                return Err(CoreError::bad_file("frame data was evicted from disk"));
            }
            if matches!(frame.status, FrameStatus::RamLoadingInProgress) {
                return Err(CoreError::invalid("recursive loading: background frame cycle"));
            }
        }

        self.set_frame_status(image_id, frame_index, FrameStatus::RamLoadingInProgress);

        let result = self.decode_and_compose(image_id, frame_index);

        match &result {
            Ok(bitmap_bytes) => {
                self.ram_bytes += *bitmap_bytes as u64;
                self.set_frame_status(image_id, frame_index, FrameStatus::RamLoadingSuccess);
            }
            Err(_) => {
                self.set_frame_status(image_id, frame_index, FrameStatus::RamLoadingError);
            }
        }
        result.map(|_| ())
    }

    fn require_frame(&self, image_id: u32, frame_index: u32) -> Result<&ImageFrame, CoreError> {
        self.get_frame(image_id, frame_index)
            .ok_or_else(|| CoreError::not_found("no such frame"))
    }

    fn set_frame_status(&mut self, image_id: u32, frame_index: u32, status: FrameStatus) {
        if let Some(image) = self.images.get_mut(&image_id) {
            if let Some(frame) = image.frame_mut(frame_index) {
                frame.status = status;
            }
        }
    }

    /// Loads the frame's raw pixels, establishes the canonical image size if
    /// this is the first decoded frame, and composes background + offset
    /// blitting per §4.C. Returns the decoded bitmap's RAM footprint in bytes.
    fn decode_and_compose(&mut self, image_id: u32, frame_index: u32) -> Result<usize, CoreError> {
        let (format, data_w, data_h, compressed, bg_color, bg_frame_idx, offset_x, offset_y, blend) = {
            let frame = self.require_frame(image_id, frame_index)?;
            let format = match frame.format {
                crate::model::FrameFormat::Raw24 => RawFormat::Rgb24,
                crate::model::FrameFormat::Raw32 => RawFormat::Rgba32,
                _ => {
                    return Err(CoreError::invalid(
                        "container-format decoding is the host decoder's job, not the core's",
                    ))
                }
            };
            (
                format,
                frame.data_pix_width,
                frame.data_pix_height,
                matches!(frame.compression, crate::model::Compression::Zlib),
                frame.background_color,
                frame.background_frame_index,
                frame.offset_x,
                frame.offset_y,
                frame.blend,
            )
        };

        let per_image_budget = self.limits.max_ram_bytes_per_image as usize;
        let file = self.cache_dir.open_for_read(image_id, frame_index)?;
        let source = raw_loader::load_raw(&file, format, data_w, data_h, compressed, per_image_budget)?;

        let image = self
            .images
            .get_mut(&image_id)
            .ok_or_else(|| CoreError::not_found("no such image"))?;

        if image.pix_width == 0 && image.pix_height == 0 {
            image.pix_width = data_w;
            image.pix_height = data_h;
        }
        let (canvas_w, canvas_h) = (image.pix_width, image.pix_height);

        let needs_canvas = bg_color != 0
            || bg_frame_idx != 0
            || data_w != canvas_w
            || data_h != canvas_h;

        let bitmap = if !needs_canvas {
            source
        } else {
            let mut canvas = vec![0u32; canvas_w as usize * canvas_h as usize];
            if bg_frame_idx != 0 {
                if bg_frame_idx == frame_index {
                    return Err(CoreError::invalid("frame cannot use itself as background"));
                }
                self.ensure_decoded(image_id, bg_frame_idx)?;
                let image = self.images.get(&image_id).unwrap();
                if let Some(bg_frame) = image.frame(bg_frame_idx) {
                    if let Some(bg_bitmap) = &bg_frame.decoded_bitmap {
                        canvas.copy_from_slice(&bg_bitmap.pixels[..canvas.len().min(bg_bitmap.pixels.len())]);
                    }
                }
            } else if bg_color != 0 {
                let argb = rgba_to_argb(bg_color);
                canvas.iter_mut().for_each(|p| *p = argb);
            }

            blit(&mut canvas, canvas_w, canvas_h, &source, offset_x, offset_y, blend);
            ArgbBuffer {
                width: canvas_w,
                height: canvas_h,
                pixels: canvas,
            }
        };

        let ram_bytes = bitmap.pixels.len() * 4;
        let image = self.images.get_mut(&image_id).unwrap();
        if let Some(frame) = image.frame_mut(frame_index) {
            frame.decoded_bitmap = Some(bitmap);
        }
        Ok(ram_bytes)
    }
}

fn bitmap_ram_bytes(bitmap: &ArgbBuffer) -> usize {
    bitmap.pixels.len() * 4
}

/// `0xRRGGBBAA` -> canonical little-endian ARGB32 (`0xAARRGGBB`).
fn rgba_to_argb(rgba: u32) -> u32 {
    let r = (rgba >> 24) & 0xFF;
    let g = (rgba >> 16) & 0xFF;
    let b = (rgba >> 8) & 0xFF;
    let a = rgba & 0xFF;
    (a << 24) | (r << 16) | (g << 8) | b
}

/// Porter-duff OVER/SRC blit of `src` onto `dst` at `(offset_x, offset_y)`,
/// clipped to `dst`'s bounds.
fn blit(
    dst: &mut [u32],
    dst_w: u32,
    dst_h: u32,
    src: &ArgbBuffer,
    offset_x: i32,
    offset_y: i32,
    blend: Blend,
) {
    for sy in 0..src.height {
        let dy = offset_y + sy as i32;
        if dy < 0 || dy as u32 >= dst_h {
            continue;
        }
        for sx in 0..src.width {
            let dx = offset_x + sx as i32;
            if dx < 0 || dx as u32 >= dst_w {
                continue;
            }
            let src_px = src.pixels[(sy * src.width + sx) as usize];
            let dst_idx = (dy as u32 * dst_w + dx as u32) as usize;
            dst[dst_idx] = match blend {
                Blend::Replace => src_px,
                Blend::Over => porter_duff_over(src_px, dst[dst_idx]),
            };
        }
    }
}

fn porter_duff_over(src: u32, dst: u32) -> u32 {
    let sa = (src >> 24) & 0xFF;
    if sa == 0xFF {
        return src;
    }
    if sa == 0 {
        return dst;
    }
    let sr = (src >> 16) & 0xFF;
    let sg = (src >> 8) & 0xFF;
    let sb = src & 0xFF;
    let da = (dst >> 24) & 0xFF;
    let dr = (dst >> 16) & 0xFF;
    let dg = (dst >> 8) & 0xFF;
    let db = dst & 0xFF;

    let blend_channel = |s: u32, d: u32| -> u32 { (s * sa + d * (255 - sa)) / 255 };
    let out_a = sa + (da * (255 - sa)) / 255;
    let out_r = blend_channel(sr, dr);
    let out_g = blend_channel(sg, dg);
    let out_b = blend_channel(sb, db);
    (out_a << 24) | (out_r << 16) | (out_g << 8) | out_b
}
