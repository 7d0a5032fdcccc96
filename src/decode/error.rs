//! Error taxonomy for opening, decoding and seeking a source.
//! Open errors are terminal for the attempt; decode errors are split into
//! transient (skip the unit) and fatal (end the session).

use crate::decode::guard::AbortReason;

/// Failure while opening and probing a source
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    #[error("Source not found: {0}")]
    NotFound(String),
    #[error("No video stream found")]
    NoVideoStream,
    #[error("No usable decoder for codec {codec} (tried: {tried})")]
    DecoderUnavailable { codec: String, tried: String },
    #[error("Invalid stream dimensions {width}x{height}")]
    InvalidDimensions { width: i32, height: i32 },
    #[error("Open interrupted: {0}")]
    Interrupted(AbortReason),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Codec library error: {0}")]
    Backend(String),
}

impl OpenError {
    /// Stable non-zero code reported through `error_code()`
    pub fn code(&self) -> i32 {
        match self {
            OpenError::NotFound(_) => 1,
            OpenError::NoVideoStream => 2,
            OpenError::DecoderUnavailable { .. } => 3,
            OpenError::InvalidDimensions { .. } => 4,
            OpenError::Interrupted(_) => 5,
            OpenError::InvalidConfig(_) => 6,
            OpenError::Backend(_) => 7,
        }
    }
}

/// Unrecoverable decode-time failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    #[error("Blocking read aborted ({0})")]
    Interrupted(AbortReason),
    #[error("Decoder failure: {0}")]
    Decoder(String),
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("Failed to allocate {bytes} bytes for a frame")]
    Allocation { bytes: usize },
}

/// Failure while reading, decoding or converting one unit
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// One corrupt or unreadable unit; the loop skips it
    #[error("Transient decode error: {0}")]
    Transient(String),
    /// The session cannot continue
    #[error("Fatal decode error: {0}")]
    Fatal(#[from] FatalError),
}

impl DecodeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Fatal(_))
    }

    /// Stable non-zero code reported through `error_code()`
    pub fn code(&self) -> i32 {
        match self {
            DecodeError::Transient(_) => 20,
            DecodeError::Fatal(FatalError::Interrupted(AbortReason::Timeout)) => 30,
            DecodeError::Fatal(FatalError::Interrupted(AbortReason::Quit)) => 31,
            DecodeError::Fatal(FatalError::Decoder(_)) => 32,
            DecodeError::Fatal(FatalError::Io(_)) => 33,
            DecodeError::Fatal(FatalError::Allocation { .. }) => 34,
        }
    }
}

/// Failed reposition; always absorbed by the worker
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeekError {
    #[error("Seek to {target_ms}ms failed: {reason}")]
    Failed { target_ms: i64, reason: String },
    #[error("Source is not seekable")]
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_non_zero_and_distinct() {
        let codes = [
            OpenError::NotFound("x".into()).code(),
            OpenError::NoVideoStream.code(),
            OpenError::DecoderUnavailable { codec: "h264".into(), tried: "h264".into() }.code(),
            OpenError::InvalidDimensions { width: 0, height: 0 }.code(),
            OpenError::Interrupted(AbortReason::Timeout).code(),
            OpenError::InvalidConfig("x".into()).code(),
            OpenError::Backend("x".into()).code(),
            DecodeError::Transient("x".into()).code(),
            DecodeError::from(FatalError::Interrupted(AbortReason::Timeout)).code(),
            DecodeError::from(FatalError::Interrupted(AbortReason::Quit)).code(),
            DecodeError::from(FatalError::Decoder("x".into())).code(),
            DecodeError::from(FatalError::Io("x".into())).code(),
            DecodeError::from(FatalError::Allocation { bytes: 1 }).code(),
        ];
        let mut sorted = codes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn test_fatal_conversion() {
        let err: DecodeError = FatalError::Io("peer reset".into()).into();
        assert!(err.is_fatal());
        assert!(!DecodeError::Transient("bad unit".into()).is_fatal());
    }
}
