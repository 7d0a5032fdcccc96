//! Pipeline state machine.

use std::fmt;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipelineState {
    /// Idle - nothing opened yet
    #[default]
    Idle,
    /// Opened - source probed, worker not started
    Opened,
    /// Running - worker decoding into the queue
    Running,
    /// Seeking - a seek was requested and the worker has not applied it yet
    Seeking,
    /// Stopped - worker joined, source closed; may be opened or started again
    Stopped,
    /// Eof - end of stream delivered; terminal for this open
    Eof,
    /// Error - fatal decode or reopen failure; terminal for this open
    Error,
}

impl PipelineState {
    /// Worker thread alive and producing
    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running | PipelineState::Seeking)
    }

    pub fn is_seeking(&self) -> bool {
        matches!(self, PipelineState::Seeking)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, PipelineState::Eof)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PipelineState::Error)
    }

    /// No more frames will be produced for this open
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Eof | PipelineState::Error)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Idle | Stopped, Opened) => true,
            (Opened | Stopped, Running) => true,
            (Running, Seeking) | (Seeking, Seeking) | (Seeking, Running) => true,
            (Running | Seeking, Eof | Error) => true,
            // reopen on the worker after a stop can fail
            (Stopped, Error) => true,
            (Opened | Running | Seeking | Eof | Error, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Opened => "opened",
            PipelineState::Running => "running",
            PipelineState::Seeking => "seeking",
            PipelineState::Stopped => "stopped",
            PipelineState::Eof => "eof",
            PipelineState::Error => "error",
        };
        f.write_str(name)
    }
}
