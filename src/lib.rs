//! Threaded media decode pipeline.
//!
//! A [`PipelineController`] opens a source (file, network stream or capture
//! device), runs a background decode worker that converts every decoded
//! picture into the requested [`PixelLayout`], and hands frames to the
//! consumer through a bounded queue. Seek and stop stay responsive while the
//! worker is blocked in I/O.
//!
//! The FFmpeg backend is behind the `ffmpeg` feature; the deterministic
//! [`TestPatternSource`] is always available.

pub mod core;
pub mod decode;
pub mod pipeline;

pub use crate::core::time::Millis;
pub use decode::{
    DecodeError, DecodePreference, DecodedFrame, MediaType, OpenError, PixelLayout, ProbeInfo,
    Source, TestPatternSource,
};
#[cfg(feature = "ffmpeg")]
pub use decode::FfmpegSource;
#[cfg(feature = "ffmpeg")]
pub use pipeline::FfmpegPipeline;
pub use pipeline::{
    ConfigError, PipelineConfig, PipelineController, PipelineState, StartError,
    TestPatternPipeline,
};
