//! Photo decoding — file bytes to RGB8 pixel buffers.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions the pipeline treats as photos (case-insensitive).
pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp"];

#[derive(Error, Debug)]
pub enum ImageIoError {
    #[error("unreadable image {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("empty image file: {path}")]
    Empty { path: PathBuf },
}

/// A decoded photo: 8-bit RGB, row-major, no padding.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PixelBuffer {
    /// RGB triple at (x, y). Out-of-bounds reads return black; callers
    /// doing interpolation clamp before asking.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let i = ((y * self.width + x) * 3) as usize;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }
}

/// True if the path carries a supported photo extension.
pub fn is_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.iter().any(|s| *s == lower)
        })
        .unwrap_or(false)
}

/// Decode a photo file into an RGB8 buffer.
///
/// Fails per-file: I/O errors, truncated or unsupported content, and
/// zero-byte files all come back as [`ImageIoError`]. Deterministic for
/// fixed file contents.
pub fn load(path: &Path) -> Result<PixelBuffer, ImageIoError> {
    let meta = std::fs::metadata(path).map_err(|e| ImageIoError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if meta.len() == 0 {
        return Err(ImageIoError::Empty {
            path: path.to_path_buf(),
        });
    }

    let decoded = image::open(path).map_err(|e| ImageIoError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(PixelBuffer {
        data: rgb.into_raw(),
        width,
        height,
    })
}
