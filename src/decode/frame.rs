//! Decoded frame: an owned picture buffer plus layout and timing metadata.
//! Frames are move-only; ownership goes worker -> queue -> consumer and the
//! buffer is freed when the last owner drops it.

use serde::{Deserialize, Serialize};

use crate::core::time::Millis;
use crate::decode::error::FatalError;

/// Memory arrangement of the samples handed to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelLayout {
    /// Y plane followed by quarter-size U and V planes
    PlanarYuv420,
    /// Interleaved B, G, R bytes
    #[default]
    PackedBgr24,
}

impl PixelLayout {
    pub fn plane_count(&self) -> usize {
        match self {
            PixelLayout::PlanarYuv420 => 3,
            PixelLayout::PackedBgr24 => 1,
        }
    }

    /// Row length in bytes of each plane (unused planes are 0)
    pub fn strides(&self, width: u32) -> [usize; 3] {
        let w = width as usize;
        match self {
            PixelLayout::PlanarYuv420 => {
                let cw = w.div_ceil(2);
                [w, cw, cw]
            }
            PixelLayout::PackedBgr24 => [w * 3, 0, 0],
        }
    }

    /// Number of rows of each plane (unused planes are 0)
    pub fn plane_rows(&self, height: u32) -> [usize; 3] {
        let h = height as usize;
        match self {
            PixelLayout::PlanarYuv420 => {
                let ch = h.div_ceil(2);
                [h, ch, ch]
            }
            PixelLayout::PackedBgr24 => [h, 0, 0],
        }
    }

    /// Byte size of each plane
    pub fn plane_sizes(&self, width: u32, height: u32) -> [usize; 3] {
        let strides = self.strides(width);
        let rows = self.plane_rows(height);
        [strides[0] * rows[0], strides[1] * rows[1], strides[2] * rows[2]]
    }

    /// Total buffer size for a `width` x `height` picture
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        self.plane_sizes(width, height).iter().sum()
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelLayout::PlanarYuv420 => "yuv420p",
            PixelLayout::PackedBgr24 => "bgr24",
        }
    }
}

/// Frame construction error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Buffer holds {actual} bytes, {layout:?} {width}x{height} needs {expected}")]
    SizeMismatch {
        layout: PixelLayout,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// One converted picture ready for the consumer
#[derive(Debug)]
pub struct DecodedFrame {
    layout: PixelLayout,
    width: u32,
    height: u32,
    timestamp_ms: Millis,
    data: Vec<u8>,
    strides: [usize; 3],
}

impl DecodedFrame {
    /// Wrap an existing buffer; its length must match the layout size
    pub fn new(
        layout: PixelLayout,
        width: u32,
        height: u32,
        timestamp_ms: Millis,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        let expected = layout.frame_size(width, height);
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                layout,
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            layout,
            width,
            height,
            timestamp_ms,
            data,
            strides: layout.strides(width),
        })
    }

    /// Allocate a zeroed frame; allocation failure is fatal for the session
    pub fn allocate(
        layout: PixelLayout,
        width: u32,
        height: u32,
        timestamp_ms: Millis,
    ) -> Result<Self, FatalError> {
        let bytes = layout.frame_size(width, height);
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| FatalError::Allocation { bytes })?;
        data.resize(bytes, 0);
        Ok(Self {
            layout,
            width,
            height,
            timestamp_ms,
            data,
            strides: layout.strides(width),
        })
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn timestamp_ms(&self) -> Millis {
        self.timestamp_ms
    }

    pub(crate) fn set_timestamp_ms(&mut self, timestamp_ms: Millis) {
        self.timestamp_ms = timestamp_ms;
    }

    /// Stride of every plane in use
    pub fn strides(&self) -> &[usize] {
        &self.strides[..self.layout.plane_count()]
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    fn plane_range(&self, index: usize) -> Option<std::ops::Range<usize>> {
        if index >= self.layout.plane_count() {
            return None;
        }
        let sizes = self.layout.plane_sizes(self.width, self.height);
        let start: usize = sizes[..index].iter().sum();
        Some(start..start + sizes[index])
    }

    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        self.plane_range(index).map(|range| &self.data[range])
    }

    pub fn plane_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.plane_range(index).map(move |range| &mut self.data[range])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(PixelLayout::PackedBgr24.frame_size(320, 240), 320 * 240 * 3);
        assert_eq!(PixelLayout::PlanarYuv420.frame_size(320, 240), 320 * 240 * 3 / 2);
        // odd dimensions round chroma up
        assert_eq!(PixelLayout::PlanarYuv420.frame_size(3, 3), 9 + 4 + 4);
        assert_eq!(PixelLayout::PlanarYuv420.strides(5), [5, 3, 3]);
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        let err = DecodedFrame::new(PixelLayout::PackedBgr24, 2, 2, 0, vec![0; 11]).unwrap_err();
        assert_eq!(
            err,
            FrameError::SizeMismatch {
                layout: PixelLayout::PackedBgr24,
                width: 2,
                height: 2,
                expected: 12,
                actual: 11,
            }
        );
    }

    #[test]
    fn test_planes() {
        let mut frame = DecodedFrame::allocate(PixelLayout::PlanarYuv420, 4, 2, 40).unwrap();
        assert_eq!(frame.strides(), &[4, 2, 2]);
        assert_eq!(frame.plane(0).map(<[u8]>::len), Some(8));
        assert_eq!(frame.plane(1).map(<[u8]>::len), Some(2));
        assert_eq!(frame.plane(2).map(<[u8]>::len), Some(2));
        assert!(frame.plane(3).is_none());

        frame.plane_mut(2).unwrap().fill(7);
        assert_eq!(&frame.data()[10..], &[7, 7]);
        assert_eq!(frame.timestamp_ms(), 40);
    }

    #[test]
    fn test_packed_has_single_plane() {
        let frame = DecodedFrame::allocate(PixelLayout::PackedBgr24, 2, 2, 0).unwrap();
        assert_eq!(frame.strides(), &[6]);
        assert_eq!(frame.into_data().len(), 12);
    }
}
