//! Threaded decode pipeline: configuration, state machine, frame queue,
//! decode worker and the controller that ties them together.

pub mod config;
pub mod controller;
pub mod queue;
pub mod state;
mod worker;

pub use config::{ConfigError, PipelineConfig};
#[cfg(feature = "ffmpeg")]
pub use controller::FfmpegPipeline;
pub use controller::{PipelineController, StartError, TestPatternPipeline};
pub use queue::{FrameQueue, PushError};
pub use state::PipelineState;
