//! Raw frame geometry.

use serde::{Deserialize, Serialize};

/// Pixel format used for raw frame outputs when none is requested.
pub const DEFAULT_RAW_PIXEL_FORMAT: &str = "rgb24";

/// Bytes per pixel for a raw frame of the given pixel format.
///
/// Single-channel formats use one byte, everything else is treated as
/// three-channel.
pub fn bytes_per_pixel(pixel_format: &str) -> usize {
    match pixel_format {
        "monob" | "monow" | "gray" | "gray8" => 1,
        _ => 3,
    }
}

/// Parse a `WIDTHxHEIGHT` video size.
pub fn parse_video_size(size: &str) -> Option<(usize, usize)> {
    let (width, height) = size.trim().split_once(['x', 'X'])?;
    Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
}

/// Size of a single raw frame as emitted by a raw frame output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrameInfo {
    /// Bytes per frame
    pub chunk_size: usize,
    pub width: usize,
    pub height: usize,
    /// Bytes per pixel
    pub depth: usize,
}

impl RawFrameInfo {
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            chunk_size: width * height * depth,
            width,
            height,
            depth,
        }
    }

    /// Frame geometry for a `WIDTHxHEIGHT` size in the given pixel format.
    pub fn from_video_size(size: &str, pixel_format: &str) -> Option<Self> {
        let (width, height) = parse_video_size(size)?;
        Some(Self::new(width, height, bytes_per_pixel(pixel_format)))
    }
}
