//! Cancellable I/O guard.
//!
//! A quit flag plus a block-start timestamp. The source refreshes the
//! timestamp right before every blocking call; the blocking primitive polls
//! [`IoGuard::check`] from the blocked thread itself and gives up once quit is
//! set or the call has been blocked for longer than the configured timeout.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Marker for "no blocking call in progress"
const DISARMED: u64 = u64::MAX;

/// Why a blocking call was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// The owner asked the session to stop
    Quit,
    /// The call stayed blocked longer than the timeout
    Timeout,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Quit => f.write_str("quit requested"),
            AbortReason::Timeout => f.write_str("blocking call timed out"),
        }
    }
}

/// Quit flag and deadline consulted by blocking reads
#[derive(Debug)]
pub struct IoGuard {
    quit: AtomicBool,
    origin: Instant,
    block_start: AtomicU64, // nanoseconds since `origin`
    timeout: Duration,
}

impl IoGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            quit: AtomicBool::new(false),
            origin: Instant::now(),
            block_start: AtomicU64::new(DISARMED),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Refresh the block start; call immediately before a blocking call
    pub fn arm(&self) {
        let now = self.origin.elapsed().as_nanos() as u64;
        self.block_start.store(now, Ordering::Release);
    }

    /// Mark that no blocking call is in progress
    pub fn disarm(&self) {
        self.block_start.store(DISARMED, Ordering::Release);
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    pub fn is_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Time spent in the current blocking call, if one is armed
    pub fn blocked_for(&self) -> Option<Duration> {
        let start = self.block_start.load(Ordering::Acquire);
        if start == DISARMED {
            return None;
        }
        let now = self.origin.elapsed().as_nanos() as u64;
        Some(Duration::from_nanos(now.saturating_sub(start)))
    }

    /// The abort predicate polled from inside blocking calls
    pub fn check(&self) -> Option<AbortReason> {
        if self.is_quit() {
            return Some(AbortReason::Quit);
        }
        match self.blocked_for() {
            Some(elapsed) if elapsed > self.timeout => Some(AbortReason::Timeout),
            _ => None,
        }
    }

    pub fn should_abort(&self) -> bool {
        self.check().is_some()
    }
}
