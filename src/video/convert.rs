//! Pixel format conversion utilities
//!
//! The camera pipeline hands over I420 (three tightly packed planes); the
//! encode device consumes NV12 with padded strides and scanlines. The
//! conversion copies luma rows and interleaves the two chroma planes.

use crate::error::{EncoderError, Result};
use crate::video::format::Nv12Layout;
use crate::video::frame::I420Frame;

/// Convert an I420 frame into a device-native NV12 buffer.
///
/// Padding bytes in `dst` are left untouched.
pub fn i420_to_nv12(src: &I420Frame<'_>, dst: &mut [u8], layout: &Nv12Layout) -> Result<()> {
    let width = src.width() as usize;
    let height = src.height() as usize;
    let chroma_width = src.chroma_stride();
    let chroma_height = (height + 1) / 2;

    if src.resolution != layout.resolution {
        return Err(EncoderError::GeometryMismatch {
            expected: layout.resolution.to_string(),
            actual: src.resolution.to_string(),
        });
    }
    if src.y.len() < width * height
        || src.u.len() < chroma_width * chroma_height
        || src.v.len() < chroma_width * chroma_height
    {
        return Err(EncoderError::GeometryMismatch {
            expected: format!("{} I420 planes", layout.resolution),
            actual: format!(
                "planes of {}/{}/{} bytes",
                src.y.len(),
                src.u.len(),
                src.v.len()
            ),
        });
    }
    if dst.len() < layout.buffer_size() {
        return Err(EncoderError::device(
            "convert",
            format!(
                "input buffer too small: {} < {}",
                dst.len(),
                layout.buffer_size()
            ),
        ));
    }

    let (y_plane, uv_plane) = dst.split_at_mut(layout.uv_offset());

    for (row, src_row) in src.y.chunks_exact(width).take(height).enumerate() {
        let start = row * layout.y_stride;
        y_plane[start..start + width].copy_from_slice(src_row);
    }

    for row in 0..chroma_height {
        let u_row = &src.u[row * chroma_width..(row + 1) * chroma_width];
        let v_row = &src.v[row * chroma_width..(row + 1) * chroma_width];
        let dst_row = &mut uv_plane[row * layout.uv_stride..row * layout.uv_stride + 2 * chroma_width];
        for (pair, (u, v)) in dst_row.chunks_exact_mut(2).zip(u_row.iter().zip(v_row)) {
            pair[0] = *u;
            pair[1] = *v;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;

    #[test]
    fn test_i420_to_nv12_layout() {
        let res = Resolution::new(4, 2);
        let layout = Nv12Layout::venus(res);
        let y: Vec<u8> = (1..=8).collect();
        let u = vec![100, 101];
        let v = vec![200, 201];
        let frame = I420Frame::new(&y, &u, &v, res);

        let mut dst = vec![0u8; layout.buffer_size()];
        i420_to_nv12(&frame, &mut dst, &layout).unwrap();

        assert_eq!(&dst[0..4], &[1, 2, 3, 4]);
        assert_eq!(&dst[layout.y_stride..layout.y_stride + 4], &[5, 6, 7, 8]);
        // Stride padding untouched
        assert_eq!(dst[4], 0);
        let uv = layout.uv_offset();
        assert_eq!(&dst[uv..uv + 4], &[100, 200, 101, 201]);
    }

    #[test]
    fn test_rejects_wrong_resolution() {
        let layout = Nv12Layout::venus(Resolution::new(8, 8));
        let y = vec![0u8; 16];
        let c = vec![0u8; 4];
        let frame = I420Frame::new(&y, &c, &c, Resolution::new(4, 4));
        let mut dst = vec![0u8; layout.buffer_size()];
        assert!(matches!(
            i420_to_nv12(&frame, &mut dst, &layout),
            Err(EncoderError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_small_destination() {
        let res = Resolution::new(4, 4);
        let layout = Nv12Layout::venus(res);
        let y = vec![0u8; 16];
        let c = vec![0u8; 4];
        let frame = I420Frame::new(&y, &c, &c, res);
        let mut dst = vec![0u8; 64];
        assert!(i420_to_nv12(&frame, &mut dst, &layout).is_err());
    }
}
