//! Raw pixel loader: streams RGB/RGBA frame data from disk into a canonical
//! ARGB32 buffer, with optional zlib inflation.

use crate::error::CoreError;
use flate2::Status;
use std::fs::File;
use std::io::Read;

/// Declared on-disk pixel format for a frame transmitted without a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFormat {
    /// 3 bytes per pixel, alpha implicitly opaque.
    Rgb24,
    /// 4 bytes per pixel, alpha carried explicitly.
    Rgba32,
}

impl RawFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            RawFormat::Rgb24 => 3,
            RawFormat::Rgba32 => 4,
        }
    }
}

/// A decoded pixel buffer in canonical little-endian ARGB32 (`0xAARRGGBB`).
pub struct ArgbBuffer {
    pub width: u32,
    pub height: u32,
    /// `width * height` ARGB32 pixels.
    pub pixels: Vec<u32>,
}

const INPUT_WINDOW: usize = 4 * 1024;
const OUTPUT_WINDOW: usize = 16 * 1024;

/// Load `width x height` pixels of `format` from `file`, optionally
/// zlib-inflating the stream first.
///
/// The per-image RAM budget is checked (at 4 bytes/pixel, uniformly for both
/// raw-24 and raw-32 sources) *before* any allocation happens.
pub fn load_raw(
    mut file: &File,
    format: RawFormat,
    width: u32,
    height: u32,
    zlib_compressed: bool,
    ram_budget_remaining: usize,
) -> Result<ArgbBuffer, CoreError> {
    let total_pixels = width as usize * height as usize;
    let required_bytes = total_pixels
        .checked_mul(4)
        .ok_or_else(|| CoreError::invalid("declared frame dimensions overflow"))?;
    if required_bytes > ram_budget_remaining {
        return Err(CoreError::too_big(
            "declared frame size exceeds per-image RAM limit",
        ));
    }

    let raw_bytes = if zlib_compressed {
        inflate_from(&mut file, total_pixels * format.bytes_per_pixel())?
    } else {
        let mut buf = vec![0u8; total_pixels * format.bytes_per_pixel()];
        let mut cursor = &mut buf[..];
        let _ = std::io::copy(&mut file.take(buf.len() as u64), &mut cursor);
        buf
    };

    let mut pixels = vec![0u32; total_pixels];
    let bpp = format.bytes_per_pixel();
    for (i, px) in pixels.iter_mut().enumerate() {
        let offset = i * bpp;
        if offset + bpp > raw_bytes.len() {
            break;
        }
        let r = raw_bytes[offset];
        let g = raw_bytes[offset + 1];
        let b = raw_bytes[offset + 2];
        let a = if format == RawFormat::Rgba32 {
            raw_bytes[offset + 3]
        } else {
            0xFF
        };
        *px = ((a as u32) << 24) | ((r as u32) << 16) | ((g as u32) << 8) | (b as u32);
    }

    Ok(ArgbBuffer {
        width,
        height,
        pixels,
    })
}

/// Stream-inflate up to `max_bytes` of decompressed output from `reader`,
/// truncating any excess. Terminates on stream end, or when input is
/// exhausted and the decompressor made no further progress.
fn inflate_from(reader: &mut impl Read, max_bytes: usize) -> Result<Vec<u8>, CoreError> {
    let mut decompressor = flate2::Decompress::new(true);
    let mut input_buf = vec![0u8; INPUT_WINDOW];
    let mut output_buf = vec![0u8; OUTPUT_WINDOW];
    let mut result = Vec::with_capacity(max_bytes.min(OUTPUT_WINDOW));

    loop {
        let read = reader
            .read(&mut input_buf)
            .map_err(|e| CoreError::bad_file(format!("reading compressed frame: {e}")))?;

        let before_in = decompressor.total_in();
        let before_out = decompressor.total_out();

        let status = decompressor
            .decompress(&input_buf[..read], &mut output_buf, flate2::FlushDecompress::None)
            .map_err(|e| CoreError::bad_file(format!("zlib error: {e}")))?;

        let produced = (decompressor.total_out() - before_out) as usize;
        result.extend_from_slice(&output_buf[..produced.min(output_buf.len())]);
        if result.len() >= max_bytes {
            result.truncate(max_bytes);
            return Ok(result);
        }

        let consumed = decompressor.total_in() - before_in;
        let made_progress = produced > 0 || consumed > 0;

        match status {
            Status::StreamEnd => return Ok(result),
            Status::BufError => {
                return Err(CoreError::bad_file("zlib buffer error"));
            }
            Status::Ok => {
                if read == 0 && !made_progress {
                    // Input exhausted and no progress: stream ended short.
                    return Ok(result);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn write_temp(bytes: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(bytes).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    #[test]
    fn raw24_round_trip_sets_opaque_alpha() {
        let pixels = [255u8, 0, 0, 0, 255, 0]; // two RGB pixels: red, green
        let file = write_temp(&pixels);
        let buf = load_raw(&file, RawFormat::Rgb24, 2, 1, false, usize::MAX).unwrap();
        assert_eq!(buf.pixels, vec![0xFFFF0000, 0xFF00FF00]);
    }

    #[test]
    fn raw32_round_trip_preserves_alpha() {
        let pixels = [10u8, 20, 30, 128];
        let file = write_temp(&pixels);
        let buf = load_raw(&file, RawFormat::Rgba32, 1, 1, false, usize::MAX).unwrap();
        assert_eq!(buf.pixels[0], 0x800A141E);
    }

    #[test]
    fn budget_check_rejects_before_allocating() {
        let file = write_temp(&[]);
        let err = load_raw(&file, RawFormat::Rgb24, 1000, 1000, false, 16).unwrap_err();
        assert_eq!(err.kind.code(), "EFBIG");
    }

    #[test]
    fn zlib_round_trip() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;

        let pixels = [1u8, 2, 3, 4, 5, 6, 7, 8, 9]; // three RGB pixels
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&pixels).unwrap();
        let compressed = encoder.finish().unwrap();

        let file = write_temp(&compressed);
        let buf = load_raw(&file, RawFormat::Rgb24, 3, 1, true, usize::MAX).unwrap();
        assert_eq!(buf.pixels, vec![0xFF010203, 0xFF040506, 0xFF070809]);
    }
}
