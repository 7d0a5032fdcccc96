//! Stream metadata probed when a source is opened.

use crate::core::time::{self, Millis};

/// Probe results for the selected video stream.
/// Immutable for the lifetime of an open session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeInfo {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_ms: Millis, // 0 when unknown (live sources)
    pub codec_name: String,
    pub decoder_name: String, // the candidate that actually opened
    pub pixel_format: String, // native format before conversion
}

impl ProbeInfo {
    /// Nominal frame spacing in milliseconds
    pub fn frame_interval_ms(&self) -> Millis {
        time::frame_interval(self.fps)
    }

    /// Expected number of frames for a finite source
    pub fn expected_frames(&self) -> Option<u64> {
        if self.duration_ms <= 0 || self.fps <= 0.0 {
            return None;
        }
        Some((time::to_seconds(self.duration_ms) * self.fps).round() as u64)
    }
}
