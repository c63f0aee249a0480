//! Core data model: images, frames, placements, and their enums.

use std::collections::HashMap;

use crate::raw_loader::ArgbBuffer;

/// Monotonic milliseconds, as supplied by the host's clock.
pub type Millis = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationState {
    Unset,
    Stopped,
    Loading,
    Looping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Generic container (PNG/JPEG/...), decoded by the host's decoder.
    AutoWithDecoder,
    Raw24,
    Raw32,
    /// Container format with no raw fallback.
    DecoderOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Uninit,
    Uploading,
    UploadError,
    UploadSuccess,
    RamLoadingInProgress,
    RamLoadingError,
    RamLoadingSuccess,
}

impl FrameStatus {
    /// §4.C: only a frame whose status is at least `UploadSuccess` may be
    /// decoded or composed.
    pub fn at_least_upload_success(self) -> bool {
        !matches!(self, FrameStatus::Uninit | FrameStatus::Uploading | FrameStatus::UploadError)
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameStatus::Uninit => "uninit",
            FrameStatus::Uploading => "uploading",
            FrameStatus::UploadError => "upload-error",
            FrameStatus::UploadSuccess => "upload-success",
            FrameStatus::RamLoadingInProgress => "ram-loading-in-progress",
            FrameStatus::RamLoadingError => "ram-loading-error",
            FrameStatus::RamLoadingSuccess => "ram-loading-success",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFailure {
    None,
    OverSizeLimit,
    CannotOpenCache,
    UnexpectedSize,
    CannotCopyFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blend {
    Over,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMode {
    Fill,
    Contain,
    None,
    NoneOrContain,
}

impl ScaleMode {
    /// §9: default derived at placement-creation time from which of
    /// rows/cols were specified, and whether the placement is virtual.
    pub fn default_for(virtual_placement: bool, has_cols: bool, has_rows: bool) -> Self {
        if virtual_placement {
            return ScaleMode::Contain;
        }
        match (has_cols, has_rows) {
            (true, true) => ScaleMode::Fill,
            (true, false) | (false, true) => ScaleMode::Contain,
            (false, false) => ScaleMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SrcRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// A single frame belonging to an `Image`, 1-indexed within `Image::frames`.
pub struct ImageFrame {
    pub atime: Millis,
    /// 0 = default gap, <0 = gapless (always skipped by the scheduler).
    pub gap_ms: i32,
    pub expected_size: Option<u64>,
    pub format: FrameFormat,
    pub compression: Compression,
    pub data_pix_width: u32,
    pub data_pix_height: u32,
    pub offset_x: i32,
    pub offset_y: i32,
    /// 0xRRGGBBAA, or 0 to mean "no background color".
    pub background_color: u32,
    /// 1-based; 0 = use `background_color` instead.
    pub background_frame_index: u32,
    pub blend: Blend,
    pub status: FrameStatus,
    pub uploading_failure: UploadFailure,
    pub quiet: u8,
    pub disk_size: u64,
    /// Present only while `status == Uploading`.
    pub open_upload_handle: Option<std::fs::File>,
    /// Present iff `status == RamLoadingSuccess`; ARGB32 at canonical image size.
    pub decoded_bitmap: Option<ArgbBuffer>,
}

impl ImageFrame {
    pub fn new(quiet: u8) -> Self {
        ImageFrame {
            atime: 0,
            gap_ms: 0,
            expected_size: None,
            format: FrameFormat::Raw24,
            compression: Compression::None,
            data_pix_width: 0,
            data_pix_height: 0,
            offset_x: 0,
            offset_y: 0,
            background_color: 0,
            background_frame_index: 0,
            blend: Blend::Over,
            status: FrameStatus::Uninit,
            uploading_failure: UploadFailure::None,
            quiet,
            disk_size: 0,
            open_upload_handle: None,
            decoded_bitmap: None,
        }
    }

    pub fn effective_gap(&self) -> i64 {
        self.gap_ms.max(0) as i64
    }

    pub fn is_gapless(&self) -> bool {
        self.gap_ms < 0
    }
}

/// A single pixmap slot, keyed by frame index, on a `Placement`.
pub struct Pixmap {
    pub handle: u64,
    pub pix_width: u32,
    pub pix_height: u32,
}

pub struct Placement {
    pub placement_id: u32,
    pub atime: Millis,
    pub virtual_placement: bool,
    pub scale_mode: ScaleMode,
    pub rows: u32,
    pub cols: u32,
    pub src_rect: SrcRect,
    pub do_not_move_cursor: bool,
    pub scaled_cell_w: u32,
    pub scaled_cell_h: u32,
    /// Sparse, keyed by 1-based frame index.
    pub pixmaps: HashMap<u32, Pixmap>,
    /// Guards a just-built pixmap from the eviction pass that immediately follows it.
    pub protected_frame: Option<u32>,
    /// Set when size inference was deferred because the host had not yet
    /// called `start_drawing` (cell size unknown). See §9 open questions.
    pub inference_deferred: bool,
}

impl Placement {
    pub fn new(placement_id: u32, atime: Millis, virtual_placement: bool) -> Self {
        Placement {
            placement_id,
            atime,
            virtual_placement,
            scale_mode: ScaleMode::None,
            rows: 0,
            cols: 0,
            src_rect: SrcRect::default(),
            do_not_move_cursor: false,
            scaled_cell_w: 0,
            scaled_cell_h: 0,
            pixmaps: HashMap::new(),
            protected_frame: None,
            inference_deferred: false,
        }
    }

    pub fn ram_bytes(&self) -> usize {
        self.pixmaps
            .values()
            .map(|p| p.pix_width as usize * p.pix_height as usize * 4)
            .sum()
    }
}

pub struct Image {
    pub image_id: u32,
    pub image_number: Option<u32>,
    pub query_id: u32,
    pub atime: Millis,
    pub pix_width: u32,
    pub pix_height: u32,
    /// 1-based; 0 = uninitialised.
    pub current_frame: u32,
    pub current_frame_time: Millis,
    pub next_redraw: Millis,
    pub last_redraw: Millis,
    pub animation_state: AnimationState,
    /// Parsed but, per spec, never enforced — looping is always infinite.
    pub loop_count: u32,
    pub total_duration: i64,
    pub total_disk_size: u64,
    pub frames: Vec<ImageFrame>,
    pub placements: HashMap<u32, Placement>,
    pub default_placement_id: u32,
    pub initial_placement_id: u32,
    pub global_command_index: u64,
    /// Placements created by `put` before this image had any successfully
    /// uploaded frame; realized (via `create_placeholder`) once frame 1
    /// finishes uploading. See §4.I "creates all placement placeholders
    /// previously registered by put commands".
    pub pending_placeholders: Vec<u32>,
}

impl Image {
    pub fn new(image_id: u32, global_command_index: u64, now: Millis) -> Self {
        Image {
            image_id,
            image_number: None,
            query_id: 0,
            atime: now,
            pix_width: 0,
            pix_height: 0,
            current_frame: 0,
            current_frame_time: now,
            next_redraw: 0,
            last_redraw: 0,
            animation_state: AnimationState::Unset,
            loop_count: 0,
            total_duration: 0,
            total_disk_size: 0,
            frames: Vec::new(),
            placements: HashMap::new(),
            default_placement_id: 0,
            initial_placement_id: 0,
            global_command_index,
            pending_placeholders: Vec::new(),
        }
    }

    pub fn frame(&self, index: u32) -> Option<&ImageFrame> {
        if index == 0 {
            return None;
        }
        self.frames.get(index as usize - 1)
    }

    pub fn frame_mut(&mut self, index: u32) -> Option<&mut ImageFrame> {
        if index == 0 {
            return None;
        }
        self.frames.get_mut(index as usize - 1)
    }

    pub fn last_frame_index(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Excludes a trailing frame whose status hasn't reached `UploadSuccess`.
    pub fn last_uploaded_frame_index(&self) -> u32 {
        let mut idx = self.frames.len() as u32;
        while idx > 0 {
            if self.frames[idx as usize - 1].status.at_least_upload_success() {
                return idx;
            }
            idx -= 1;
        }
        0
    }

    pub fn recompute_total_duration(&mut self) {
        self.total_duration = self.frames.iter().map(|f| f.effective_gap()).sum();
    }
}

/// Ephemeral, per draw-cycle rectangle describing a sub-range of a placement
/// queued for compositing. Capped at `MAX_PENDING_RECTS` by the draw loop.
#[derive(Debug, Clone, Copy)]
pub struct ImageRect {
    pub image_id: u32,
    pub placement_id: u32,
    pub start_col: u32,
    pub end_col: u32,
    pub start_row: u32,
    pub end_row: u32,
    pub screen_x_pix: i32,
    pub screen_y_pix: i32,
    pub cell_w: u32,
    pub cell_h: u32,
    pub reverse: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_mode_defaults_match_spec_table() {
        assert_eq!(ScaleMode::default_for(true, false, false), ScaleMode::Contain);
        assert_eq!(ScaleMode::default_for(false, true, true), ScaleMode::Fill);
        assert_eq!(ScaleMode::default_for(false, true, false), ScaleMode::Contain);
        assert_eq!(ScaleMode::default_for(false, false, true), ScaleMode::Contain);
        assert_eq!(ScaleMode::default_for(false, false, false), ScaleMode::None);
    }

    #[test]
    fn last_uploaded_frame_index_excludes_pending_trailing_frame() {
        let mut img = Image::new(1, 0, 0);
        let mut f1 = ImageFrame::new(0);
        f1.status = FrameStatus::UploadSuccess;
        let mut f2 = ImageFrame::new(0);
        f2.status = FrameStatus::Uploading;
        img.frames.push(f1);
        img.frames.push(f2);
        assert_eq!(img.last_uploaded_frame_index(), 1);
        assert_eq!(img.last_frame_index(), 2);
    }

    #[test]
    fn total_duration_sums_gaps_treating_negative_as_zero() {
        let mut img = Image::new(1, 0, 0);
        for gap in [100, -1, 200] {
            let mut f = ImageFrame::new(0);
            f.gap_ms = gap;
            img.frames.push(f);
        }
        img.recompute_total_duration();
        assert_eq!(img.total_duration, 300);
    }
}
