//! Raw camera frame data structures

use serde::{Deserialize, Serialize};

use super::format::Resolution;

/// Per-frame metadata supplied by the camera pipeline.
///
/// The device loses this context while encoding; it is correlated back to
/// each completed packet through the frame metadata queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameExtra {
    /// Camera frame id
    pub frame_id: u32,
    /// Start-of-frame timestamp (nanoseconds, monotonic)
    pub timestamp_sof: u64,
    /// End-of-frame timestamp (nanoseconds, monotonic)
    pub timestamp_eof: u64,
}

impl FrameExtra {
    pub fn new(frame_id: u32, timestamp_sof: u64, timestamp_eof: u64) -> Self {
        Self {
            frame_id,
            timestamp_sof,
            timestamp_eof,
        }
    }

    /// End-of-frame time at the microsecond precision the device keeps
    pub fn eof_micros(&self) -> u64 {
        self.timestamp_eof / 1000
    }
}

/// Borrowed view of a planar I420 frame (tightly packed planes)
#[derive(Debug, Clone, Copy)]
pub struct I420Frame<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub resolution: Resolution,
}

impl<'a> I420Frame<'a> {
    pub fn new(y: &'a [u8], u: &'a [u8], v: &'a [u8], resolution: Resolution) -> Self {
        Self {
            y,
            u,
            v,
            resolution,
        }
    }

    /// Split a contiguous I420 buffer into its planes
    pub fn from_contiguous(data: &'a [u8], resolution: Resolution) -> Option<Self> {
        let y_size = (resolution.width * resolution.height) as usize;
        let uv_size = i420_chroma_size(resolution);
        if data.len() < y_size + 2 * uv_size {
            return None;
        }
        let (y, rest) = data.split_at(y_size);
        let (u, rest) = rest.split_at(uv_size);
        Some(Self::new(y, u, &rest[..uv_size], resolution))
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Stride of the chroma planes
    pub fn chroma_stride(&self) -> usize {
        ((self.resolution.width + 1) / 2) as usize
    }
}

/// Size of one chroma plane of an I420 frame
pub fn i420_chroma_size(resolution: Resolution) -> usize {
    (((resolution.width + 1) / 2) * ((resolution.height + 1) / 2)) as usize
}

/// Calculate YUV420P buffer size for a given resolution
pub fn i420_buffer_size(resolution: Resolution) -> usize {
    (resolution.width * resolution.height) as usize + 2 * i420_chroma_size(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_micros() {
        let extra = FrameExtra::new(7, 1_000_000, 1_234_567_890);
        assert_eq!(extra.eof_micros(), 1_234_567);
    }

    #[test]
    fn test_from_contiguous() {
        let res = Resolution::new(4, 4);
        let data: Vec<u8> = (0..24).collect();
        let frame = I420Frame::from_contiguous(&data, res).unwrap();
        assert_eq!(frame.y.len(), 16);
        assert_eq!(frame.u, &[16, 17, 18, 19]);
        assert_eq!(frame.v, &[20, 21, 22, 23]);
        assert_eq!(frame.chroma_stride(), 2);
    }

    #[test]
    fn test_from_contiguous_too_short() {
        let data = vec![0u8; 10];
        assert!(I420Frame::from_contiguous(&data, Resolution::new(4, 4)).is_none());
    }

    #[test]
    fn test_buffer_size() {
        assert_eq!(i420_buffer_size(Resolution::new(1928, 1208)), 1928 * 1208 * 3 / 2);
    }
}
