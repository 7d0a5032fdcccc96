//! Decode layer: source sessions, decoded frames and pixel conversion.

pub mod convert;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod frame;
pub mod guard;
pub mod select;
pub mod source;
pub mod stream_info;
pub mod synthetic;

pub use error::{DecodeError, FatalError, OpenError, SeekError};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegSource;
pub use frame::{DecodedFrame, FrameError, PixelLayout};
pub use guard::{AbortReason, IoGuard};
pub use select::{DecodePreference, DecoderCandidate};
pub use source::{MediaType, OpenRequest, Source};
pub use stream_info::ProbeInfo;
pub use synthetic::TestPatternSource;
