//! Source session contract.
//!
//! A source owns the open container, the selected video stream, the decoder
//! and the pixel converter. It is driven by exactly one thread at a time
//! (the decode worker once started), so implementations need `Send` only.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::time::Millis;
use crate::decode::error::{DecodeError, OpenError, SeekError};
use crate::decode::frame::{DecodedFrame, PixelLayout};
use crate::decode::guard::IoGuard;
use crate::decode::select::DecodePreference;
use crate::decode::stream_info::ProbeInfo;

/// Kind of input; selects the input driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    File,
    Network,
    Capture,
}

/// Everything a backend needs to open a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub source: String,
    pub media_type: MediaType,
    pub decode_preference: DecodePreference,
    pub capture_framerate: u32,
}

impl OpenRequest {
    pub fn new(source: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            source: source.into(),
            media_type,
            decode_preference: DecodePreference::default(),
            capture_framerate: 30,
        }
    }
}

/// Open/probe/read/decode/convert/seek primitives of one media source
pub trait Source: Send + Sized + 'static {
    /// Decoded picture in the decoder's native format
    type Picture: Send;

    /// One-time process-wide library initialization. Idempotent.
    fn initialize() -> Result<(), OpenError> {
        Ok(())
    }

    /// Open the container, select the first video stream and open a decoder.
    /// `guard` must be consulted by every blocking call the source makes.
    fn open(request: &OpenRequest, guard: Arc<IoGuard>) -> Result<Self, OpenError>;

    /// Probe results of the selected stream
    fn probe(&self) -> &ProbeInfo;

    /// Read one compressed unit and decode it.
    ///
    /// Returns the pictures the decoder emitted for this unit (possibly none,
    /// rarely more than one) or `Ok(None)` at end of stream.
    fn read_and_decode_one(&mut self) -> Result<Option<Vec<Self::Picture>>, DecodeError>;

    /// Presentation timestamp of a decoded picture, if the stream carries one
    fn picture_timestamp_ms(&self, picture: &Self::Picture) -> Option<Millis>;

    /// Convert a picture into the requested layout
    fn convert(
        &mut self,
        picture: &Self::Picture,
        layout: PixelLayout,
    ) -> Result<DecodedFrame, DecodeError>;

    /// Reposition to the nearest sync point at or before `timestamp_ms` and
    /// flush pictures buffered inside the decoder
    fn seek(&mut self, timestamp_ms: Millis) -> Result<(), SeekError>;

    /// Release converter, decoder and container, in that order. Idempotent.
    fn close(&mut self);
}
