//! Software pixel conversion.
//! Packs strided planes into tight frame buffers and converts planar YUV 4:2:0
//! (BT.601, limited range) into packed BGR24.

use crate::core::time::Millis;
use crate::decode::error::{DecodeError, FatalError};
use crate::decode::frame::{DecodedFrame, PixelLayout};

/// A raw planar YUV 4:2:0 picture as produced by a decoder
#[derive(Debug, Clone)]
pub struct YuvPicture {
    pub width: u32,
    pub height: u32,
    pub pts_ms: Option<Millis>,
    pub keyframe: bool,
    pub planes: [Vec<u8>; 3],
    pub strides: [usize; 3],
}

impl YuvPicture {
    /// Allocate a tightly packed picture
    pub fn new(width: u32, height: u32) -> Self {
        let layout = PixelLayout::PlanarYuv420;
        let sizes = layout.plane_sizes(width, height);
        Self {
            width,
            height,
            pts_ms: None,
            keyframe: false,
            planes: [vec![0; sizes[0]], vec![0; sizes[1]], vec![0; sizes[2]]],
            strides: layout.strides(width),
        }
    }
}

/// Copy `rows` rows of `row_bytes` from a strided source into a packed destination
pub fn pack_plane(dst: &mut [u8], src: &[u8], src_stride: usize, row_bytes: usize, rows: usize) {
    if src_stride == row_bytes {
        let len = row_bytes * rows;
        dst[..len].copy_from_slice(&src[..len]);
        return;
    }
    for (row, out) in dst.chunks_exact_mut(row_bytes).take(rows).enumerate() {
        let start = row * src_stride;
        out.copy_from_slice(&src[start..start + row_bytes]);
    }
}

/// Every plane must hold `rows` rows of at least the packed row width at its stride
fn check_planes(picture: &YuvPicture) -> Result<(), DecodeError> {
    let layout = PixelLayout::PlanarYuv420;
    let row_bytes = layout.strides(picture.width);
    let rows = layout.plane_rows(picture.height);
    for plane in 0..3 {
        let stride = picture.strides[plane];
        if rows[plane] == 0 {
            continue;
        }
        let needed = stride * (rows[plane] - 1) + row_bytes[plane];
        if stride < row_bytes[plane] || picture.planes[plane].len() < needed {
            return Err(DecodeError::Transient(format!(
                "plane {} holds {} bytes at stride {}, {} needed",
                plane,
                picture.planes[plane].len(),
                stride,
                needed
            )));
        }
    }
    Ok(())
}

#[inline]
fn clip(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Converter cached for the lifetime of a stream.
/// Holds the BT.601 lookup tables and the geometry it was built for.
pub struct SoftwareConverter {
    width: u32,
    height: u32,
    luma: [i32; 256],
    v_to_r: [i32; 256],
    u_to_g: [i32; 256],
    v_to_g: [i32; 256],
    u_to_b: [i32; 256],
}

impl SoftwareConverter {
    pub fn new(width: u32, height: u32) -> Self {
        let mut converter = Self {
            width,
            height,
            luma: [0; 256],
            v_to_r: [0; 256],
            u_to_g: [0; 256],
            v_to_g: [0; 256],
            u_to_b: [0; 256],
        };
        for i in 0..256 {
            let c = i as i32 - 16;
            let d = i as i32 - 128;
            converter.luma[i] = 298 * c;
            converter.v_to_r[i] = 409 * d;
            converter.u_to_g[i] = -100 * d;
            converter.v_to_g[i] = -208 * d;
            converter.u_to_b[i] = 516 * d;
        }
        converter
    }

    /// Whether this converter was built for the given geometry
    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// Convert one picture into a freshly allocated frame of `layout`
    pub fn convert(
        &self,
        picture: &YuvPicture,
        layout: PixelLayout,
        timestamp_ms: Millis,
    ) -> Result<DecodedFrame, DecodeError> {
        if !self.matches(picture.width, picture.height) {
            return Err(DecodeError::Transient(format!(
                "picture {}x{} does not match converter {}x{}",
                picture.width, picture.height, self.width, self.height
            )));
        }

        check_planes(picture)?;

        let mut frame = DecodedFrame::allocate(layout, self.width, self.height, timestamp_ms)?;
        match layout {
            PixelLayout::PlanarYuv420 => {
                let strides = layout.strides(self.width);
                let rows = layout.plane_rows(self.height);
                for plane in 0..3 {
                    let dst = frame
                        .plane_mut(plane)
                        .ok_or_else(|| FatalError::Decoder(format!("missing plane {}", plane)))?;
                    pack_plane(dst, &picture.planes[plane], picture.strides[plane], strides[plane], rows[plane]);
                }
            }
            PixelLayout::PackedBgr24 => self.yuv_to_bgr(picture, frame.data_mut()),
        }
        Ok(frame)
    }

    fn yuv_to_bgr(&self, picture: &YuvPicture, dst: &mut [u8]) {
        let width = self.width as usize;
        let [y_plane, u_plane, v_plane] = &picture.planes;
        let [y_stride, u_stride, v_stride] = picture.strides;

        for (row, out) in dst.chunks_exact_mut(width * 3).enumerate() {
            let y_row = &y_plane[row * y_stride..];
            let u_row = &u_plane[(row / 2) * u_stride..];
            let v_row = &v_plane[(row / 2) * v_stride..];
            for (col, px) in out.chunks_exact_mut(3).enumerate() {
                let c = self.luma[y_row[col] as usize];
                let u = u_row[col / 2] as usize;
                let v = v_row[col / 2] as usize;
                px[0] = clip((c + self.u_to_b[u] + 128) >> 8);
                px[1] = clip((c + self.u_to_g[u] + self.v_to_g[v] + 128) >> 8);
                px[2] = clip((c + self.v_to_r[v] + 128) >> 8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, y: u8, u: u8, v: u8) -> YuvPicture {
        let mut picture = YuvPicture::new(width, height);
        picture.planes[0].fill(y);
        picture.planes[1].fill(u);
        picture.planes[2].fill(v);
        picture
    }

    #[test]
    fn test_pack_plane_strips_padding() {
        let src = [1, 2, 0, 0, 3, 4, 0, 0];
        let mut dst = [0u8; 4];
        pack_plane(&mut dst, &src, 4, 2, 2);
        assert_eq!(dst, [1, 2, 3, 4]);
    }

    #[test]
    fn test_black_and_white() {
        let converter = SoftwareConverter::new(4, 2);
        let black = converter
            .convert(&solid(4, 2, 16, 128, 128), PixelLayout::PackedBgr24, 0)
            .unwrap();
        assert!(black.data().iter().all(|b| *b == 0));

        let white = converter
            .convert(&solid(4, 2, 235, 128, 128), PixelLayout::PackedBgr24, 0)
            .unwrap();
        assert!(white.data().iter().all(|b| *b == 255));
    }

    #[test]
    fn test_pure_red() {
        // BT.601 limited-range red
        let converter = SoftwareConverter::new(2, 2);
        let frame = converter
            .convert(&solid(2, 2, 81, 90, 240), PixelLayout::PackedBgr24, 0)
            .unwrap();
        let px = &frame.data()[..3];
        assert!(px[0] < 5, "blue {}", px[0]);
        assert!(px[1] < 5, "green {}", px[1]);
        assert!(px[2] > 250, "red {}", px[2]);
    }

    #[test]
    fn test_planar_passthrough() {
        let converter = SoftwareConverter::new(3, 3);
        let picture = solid(3, 3, 10, 20, 30);
        let frame = converter
            .convert(&picture, PixelLayout::PlanarYuv420, 80)
            .unwrap();
        assert_eq!(frame.plane(0).unwrap(), &[10; 9]);
        assert_eq!(frame.plane(1).unwrap(), &[20; 4]);
        assert_eq!(frame.plane(2).unwrap(), &[30; 4]);
        assert_eq!(frame.timestamp_ms(), 80);
    }

    #[test]
    fn test_geometry_mismatch_is_transient() {
        let converter = SoftwareConverter::new(4, 4);
        let err = converter
            .convert(&solid(2, 2, 0, 0, 0), PixelLayout::PackedBgr24, 0)
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_short_planes_are_transient() {
        let converter = SoftwareConverter::new(4, 4);
        let mut picture = solid(4, 4, 16, 128, 128);
        picture.planes[1].truncate(1);
        for layout in [PixelLayout::PackedBgr24, PixelLayout::PlanarYuv420] {
            let err = converter.convert(&picture, layout, 0).unwrap_err();
            assert!(matches!(err, DecodeError::Transient(_)));
        }

        let mut picture = solid(4, 4, 16, 128, 128);
        picture.strides[0] = 8;
        assert!(converter.convert(&picture, PixelLayout::PackedBgr24, 0).is_err());
    }
}
