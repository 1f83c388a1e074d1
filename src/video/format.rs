//! Pixel format and frame geometry definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel formats exchanged with the encode device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// YUV420 planar format (camera output)
    Yuv420,
    /// NV12 semi-planar format (Y plane + interleaved UV), device native
    Nv12,
    /// H.264 elementary stream
    H264,
    /// H.265/HEVC elementary stream
    Hevc,
}

impl PixelFormat {
    /// V4L2 FourCC code
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Yuv420 => *b"YU12",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::H264 => *b"H264",
            PixelFormat::Hevc => *b"HEVC",
        }
    }

    /// FourCC packed little-endian, as the kernel expects it
    pub fn fourcc_u32(&self) -> u32 {
        u32::from_le_bytes(self.fourcc())
    }

    /// Check if format is a compressed bitstream
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::H264 | PixelFormat::Hevc)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::H264 => "H264",
            PixelFormat::Hevc => "HEVC",
        };
        write!(f, "{}", name)
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if resolution is usable by the encoder (non-zero, even dimensions)
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.width % 2 == 0 && self.height % 2 == 0
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
    /// AR0231 road/driver camera sensor output
    pub const AR0231: Resolution = Resolution {
        width: 1928,
        height: 1208,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

const fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

/// Plane geometry of an NV12 buffer as laid out by the video core.
///
/// Strides are padded to 128 bytes, luma scanlines to 32 rows and chroma
/// scanlines to 16 rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nv12Layout {
    pub resolution: Resolution,
    pub y_stride: usize,
    pub y_scanlines: usize,
    pub uv_stride: usize,
    pub uv_scanlines: usize,
}

impl Nv12Layout {
    pub fn venus(resolution: Resolution) -> Self {
        Self {
            resolution,
            y_stride: align_up(resolution.width, 128) as usize,
            y_scanlines: align_up(resolution.height, 32) as usize,
            uv_stride: align_up(resolution.width, 128) as usize,
            uv_scanlines: align_up((resolution.height + 1) / 2, 16) as usize,
        }
    }

    /// Offset of the interleaved UV plane
    pub fn uv_offset(&self) -> usize {
        self.y_stride * self.y_scanlines
    }

    /// Minimum buffer size holding both planes
    pub fn buffer_size(&self) -> usize {
        self.uv_offset() + self.uv_stride * self.uv_scanlines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc() {
        assert_eq!(&PixelFormat::Nv12.fourcc(), b"NV12");
        assert_eq!(PixelFormat::H264.fourcc_u32(), 0x3436_3248);
        assert!(PixelFormat::Hevc.is_compressed());
        assert!(!PixelFormat::Yuv420.is_compressed());
    }

    #[test]
    fn test_resolution_validity() {
        assert!(Resolution::AR0231.is_valid());
        assert!(!Resolution::new(0, 1208).is_valid());
        assert!(!Resolution::new(1927, 1208).is_valid());
        assert_eq!(Resolution::HD1080.to_string(), "1920x1080");
    }

    #[test]
    fn test_venus_layout() {
        let layout = Nv12Layout::venus(Resolution::AR0231);
        assert_eq!(layout.y_stride, 2048);
        assert_eq!(layout.y_scanlines, 1216);
        assert_eq!(layout.uv_stride, 2048);
        assert_eq!(layout.uv_scanlines, 608);
        assert_eq!(layout.uv_offset(), 2048 * 1216);
        assert_eq!(layout.buffer_size(), 2048 * 1216 + 2048 * 608);
    }

    #[test]
    fn test_small_layout() {
        let layout = Nv12Layout::venus(Resolution::new(4, 2));
        assert_eq!(layout.y_stride, 128);
        assert_eq!(layout.y_scanlines, 32);
        assert_eq!(layout.uv_scanlines, 16);
    }
}
