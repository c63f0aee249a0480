//! Host-provided capabilities (§6.1): pixel surface and placeholder grid.
//!
//! The core never draws glyphs or owns the cell grid; it calls back into
//! the host through these two small trait seams.

/// Opaque handle to a pixmap living on the host's display surface.
pub type PixmapHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOp {
    Over,
    Src,
}

#[derive(Debug, Clone, Copy)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

/// The pixel surface and blitter the host exposes to the core (§6.1).
pub trait Surface {
    /// Allocate a 32-bit RGBA canvas of the given pixel size.
    fn allocate_pixmap(&mut self, w: u32, h: u32) -> PixmapHandle;

    /// Upload a premultiplied RGBA buffer into a previously allocated pixmap.
    fn upload_rgba_premultiplied(&mut self, pixmap: PixmapHandle, bytes: &[u8], w: u32, h: u32);

    /// Composite a sub-rect of `src` onto a rect of the output surface.
    fn composite(&mut self, src: PixmapHandle, src_rect: PixelRect, dst_rect: PixelRect, op: CompositeOp);

    /// Produce a bitwise-inverted copy of `src`, used for reverse-video draws.
    fn invert_copy(&mut self, src: PixmapHandle, w: u32, h: u32) -> PixmapHandle;

    /// Release a pixmap back to the surface.
    fn free_pixmap(&mut self, pixmap: PixmapHandle);
}

/// Host callback invoked whenever a placement needs a grid placeholder
/// reserved (placement creation, or the first successful frame upload that
/// realizes a deferred placeholder).
pub trait PlaceholderHost {
    fn create_placeholder(&mut self, image_id: u32, placement_id: u32, cols: u32, rows: u32);
}
