//! Bounded frame queue between the decode worker and the consumer.
//!
//! One mutex guards the frames and the flags; `not_full` wakes a producer
//! blocked on a full queue, `not_empty` wakes a consumer blocked on an empty
//! one. Every push carries the epoch it was decoded in. `clear()` advances
//! the epoch, so a producer that was blocked across a seek cannot slip a
//! stale frame in after the clear.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::decode::frame::DecodedFrame;

/// Rejected push; the frame is handed back to the producer
#[derive(Debug)]
pub enum PushError {
    /// The queue was cleared since the frame's epoch began
    Stale(DecodedFrame),
    /// The queue was shut down
    Closed(DecodedFrame),
}

impl PushError {
    pub fn into_frame(self) -> DecodedFrame {
        match self {
            PushError::Stale(frame) | PushError::Closed(frame) => frame,
        }
    }
}

#[derive(Debug)]
struct Inner {
    frames: VecDeque<DecodedFrame>,
    epoch: u64,
    finished: bool, // producer is done for this run
    shutdown: bool,
}

/// Thread-safe FIFO of decoded frames with a hard capacity
#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    not_full: Condvar,
    not_empty: Condvar,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                epoch: 0,
                finished: false,
                shutdown: false,
            }),
            capacity,
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Append a frame decoded in `epoch`, blocking while the queue is full.
    pub fn push(&self, frame: DecodedFrame, epoch: u64) -> Result<(), PushError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.shutdown {
                return Err(PushError::Closed(frame));
            }
            if inner.epoch != epoch {
                return Err(PushError::Stale(frame));
            }
            if inner.frames.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut inner);
        }

        inner.frames.push_back(frame);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest frame.
    ///
    /// With `blocking`, waits until a frame arrives, production finishes or
    /// the queue shuts down. Without it, returns `None` when empty.
    pub fn pop(&self, blocking: bool) -> Option<DecodedFrame> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                self.not_full.notify_one();
                return Some(frame);
            }
            if !blocking || inner.finished || inner.shutdown {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Like a blocking [`pop`](Self::pop) but gives up after `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<DecodedFrame> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                self.not_full.notify_one();
                return Some(frame);
            }
            if inner.finished || inner.shutdown {
                return None;
            }
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                let frame = inner.frames.pop_front();
                if frame.is_some() {
                    self.not_full.notify_one();
                }
                return frame;
            }
        }
    }

    /// Drop every queued frame and start a new epoch. Returns the new epoch.
    pub fn clear(&self) -> u64 {
        let mut inner = self.inner.lock();
        let dropped = inner.frames.len();
        inner.frames.clear();
        inner.epoch += 1;
        let epoch = inner.epoch;
        drop(inner);

        tracing::debug!("Frame queue cleared ({} frames dropped), epoch {}", dropped, epoch);
        self.not_full.notify_all();
        self.not_empty.notify_all();
        epoch
    }

    /// Mark the end of production; consumers drain what is left, then get `None`
    pub fn finish(&self) {
        self.inner.lock().finished = true;
        self.not_empty.notify_all();
    }

    /// Reject all further pushes, drop queued frames and wake both sides
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        inner.frames.clear();
        inner.epoch += 1;
        drop(inner);

        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Prepare for a new run after `shutdown` or `finish`. Returns the epoch
    /// the next producer must push with.
    pub fn reset(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.frames.clear();
        inner.finished = false;
        inner.shutdown = false;
        inner.epoch += 1;
        inner.epoch
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }
}
