//! Decode worker: the background thread that drives a source.
//!
//! read -> decode -> stamp -> convert -> push, until end of stream, a fatal
//! error or quit. Seek requests are observed between iterations. Errors never
//! unwind across the thread boundary; they end the loop as a state change
//! plus a recorded error code.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::core::time::{self, Millis};
use crate::decode::error::{DecodeError, OpenError};
use crate::decode::frame::PixelLayout;
use crate::decode::guard::IoGuard;
use crate::decode::source::{OpenRequest, Source};
use crate::decode::stream_info::ProbeInfo;
use crate::pipeline::queue::{FrameQueue, PushError};
use crate::pipeline::state::PipelineState;

/// Latest requested seek; newer requests overwrite older ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SeekRequest {
    pub target_ms: Millis,
    pub epoch: u64, // queue epoch started by the clear that accompanied it
}

/// State shared between the controller and its worker
pub(crate) struct Shared {
    pub state: Mutex<PipelineState>,
    pub wake: Condvar, // parked worker: pause lifted, seek or stop
    pub pending_seek: AtomicCell<Option<SeekRequest>>,
    pub error_code: AtomicI32,
    pub paused: AtomicBool,
    pub position_ms: AtomicI64,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState::Idle),
            wake: Condvar::new(),
            pending_seek: AtomicCell::new(None),
            error_code: AtomicI32::new(0),
            paused: AtomicBool::new(false),
            position_ms: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Apply a transition on a held state lock; illegal ones are refused
    pub fn transition(state: &mut MutexGuard<'_, PipelineState>, next: PipelineState) -> bool {
        let current = **state;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            tracing::warn!("Refusing state transition {} -> {}", current, next);
            return false;
        }
        tracing::debug!("Pipeline state {} -> {}", current, next);
        **state = next;
        true
    }

    pub fn set_state(&self, next: PipelineState) -> bool {
        let mut state = self.state.lock();
        Self::transition(&mut state, next)
    }

    pub fn has_pending_seek(&self) -> bool {
        self.pending_seek.load().is_some()
    }

    /// Wake a parked worker. Taken under the state lock so the wake-up
    /// cannot slip between the worker's check and its wait.
    pub fn notify(&self) {
        let _state = self.state.lock();
        self.wake.notify_all();
    }

    fn park_while_paused(&self, guard: &IoGuard) {
        let mut state = self.state.lock();
        while self.paused.load(Ordering::Acquire) && !guard.is_quit() && !self.has_pending_seek() {
            self.wake.wait(&mut state);
        }
    }

    /// Seek applied: back to Running unless a newer one is already waiting
    fn seek_applied(&self) {
        let mut state = self.state.lock();
        if state.is_seeking() && !self.has_pending_seek() {
            Self::transition(&mut state, PipelineState::Running);
        }
    }

    /// End of stream reached. Returns false if a seek arrived in the
    /// meantime and decoding must continue.
    fn reached_eof(&self) -> bool {
        let mut state = self.state.lock();
        if self.has_pending_seek() {
            return false;
        }
        Self::transition(&mut state, PipelineState::Eof)
    }

    fn fail(&self, code: i32) {
        self.error_code.store(code, Ordering::Release);
        self.set_state(PipelineState::Error);
    }
}

/// How the worker obtains its source
pub(crate) enum Launch<S: Source> {
    /// Opened by `init` on the caller's thread
    Ready(S),
    /// Reopen on the worker after a stop; the outcome goes back on `reply`
    Reopen {
        request: OpenRequest,
        reply: Sender<Result<ProbeInfo, OpenError>>,
    },
}

pub(crate) struct WorkerContext {
    pub shared: Arc<Shared>,
    pub queue: Arc<FrameQueue>,
    pub guard: Arc<IoGuard>,
    pub layout: PixelLayout,
    pub epoch: u64,
}

/// Assigns each picture its output timestamp.
/// Falls back to last + interval when the stream carries none and never
/// goes backwards within one epoch.
#[derive(Debug)]
struct PtsClock {
    last: Option<Millis>,
    base: Millis,
    interval: Millis,
}

impl PtsClock {
    fn new(interval: Millis) -> Self {
        Self {
            last: None,
            base: 0,
            interval,
        }
    }

    fn reset(&mut self, base: Millis) {
        self.last = None;
        self.base = base;
    }

    fn stamp(&mut self, pts: Option<Millis>) -> Millis {
        let ts = match (pts, self.last) {
            (Some(pts), Some(last)) => pts.max(last),
            (Some(pts), None) => pts,
            (None, Some(last)) => last + self.interval,
            (None, None) => self.base,
        };
        self.last = Some(ts);
        ts
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Thread entry point. Hands the source back for closing on join.
pub(crate) fn run<S: Source>(ctx: WorkerContext, launch: Launch<S>) -> Option<S> {
    let mut source = match launch {
        Launch::Ready(source) => source,
        Launch::Reopen { request, reply } => match S::open(&request, Arc::clone(&ctx.guard)) {
            Ok(source) => {
                let _ = reply.send(Ok(source.probe().clone()));
                source
            }
            Err(err) => {
                tracing::error!("Reopen of {} failed: {}", request.source, err);
                ctx.shared.fail(err.code());
                ctx.queue.finish();
                let _ = reply.send(Err(err));
                return None;
            }
        },
    };

    tracing::debug!("Decode worker started (epoch {})", ctx.epoch);
    decode_loop(&ctx, &mut source);
    tracing::debug!("Decode worker exiting");
    Some(source)
}

fn decode_loop<S: Source>(ctx: &WorkerContext, source: &mut S) {
    let interval = source.probe().frame_interval_ms();
    let mut clock = PtsClock::new(interval);
    let mut epoch = ctx.epoch;
    let mut skip_until: Option<Millis> = None;

    loop {
        if ctx.guard.is_quit() {
            return;
        }

        if let Some(request) = ctx.shared.pending_seek.swap(None) {
            skip_until = match source.seek(request.target_ms) {
                Ok(()) => Some(request.target_ms),
                Err(err) => {
                    tracing::warn!("{}; continuing from the current position", err);
                    None
                }
            };
            epoch = request.epoch;
            clock.reset(request.target_ms);
            ctx.shared.seek_applied();
        }

        if ctx.shared.paused.load(Ordering::Acquire) {
            ctx.shared.park_while_paused(&ctx.guard);
            continue;
        }

        let pictures = match source.read_and_decode_one() {
            Ok(Some(pictures)) => pictures,
            Ok(None) => {
                if ctx.shared.reached_eof() {
                    tracing::info!("End of stream");
                    ctx.queue.finish();
                    return;
                }
                continue;
            }
            Err(DecodeError::Transient(reason)) => {
                tracing::warn!("Skipping unit: {}", reason);
                continue;
            }
            Err(err) => return fatal(ctx, err),
        };

        for picture in pictures {
            match emit(ctx, source, &mut clock, &mut skip_until, picture, epoch) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => return,
                Err(err) => return fatal(ctx, err),
            }
        }
    }
}

/// End the session on an unrecoverable error, unless stop caused it
fn fatal(ctx: &WorkerContext, err: DecodeError) {
    if ctx.guard.is_quit() {
        tracing::debug!("Decode interrupted by stop");
        return;
    }
    tracing::error!("{}", err);
    ctx.shared.fail(err.code());
    ctx.queue.finish();
}

/// Stamp, convert and enqueue one decoded picture
fn emit<S: Source>(
    ctx: &WorkerContext,
    source: &mut S,
    clock: &mut PtsClock,
    skip_until: &mut Option<Millis>,
    picture: S::Picture,
    epoch: u64,
) -> Result<Flow, DecodeError> {
    let timestamp = clock.stamp(source.picture_timestamp_ms(&picture));

    // after a seek, decode from the keyframe but only deliver from the target on
    if let Some(target) = *skip_until {
        if timestamp + clock.interval / 2 < target {
            tracing::trace!("Dropping pre-roll frame at {}ms (target {}ms)", timestamp, target);
            return Ok(Flow::Continue);
        }
        *skip_until = None;
    }

    let mut frame = match source.convert(&picture, ctx.layout) {
        Ok(frame) => frame,
        Err(DecodeError::Transient(reason)) => {
            tracing::warn!("Dropping frame at {}ms: {}", timestamp, reason);
            return Ok(Flow::Continue);
        }
        Err(err) => return Err(err),
    };
    drop(picture);
    frame.set_timestamp_ms(timestamp);

    match ctx.queue.push(frame, epoch) {
        Ok(()) => {
            tracing::trace!("Queued frame {}", time::format_time(timestamp));
            Ok(Flow::Continue)
        }
        Err(PushError::Stale(_)) => {
            tracing::trace!("Discarded stale frame at {}ms", timestamp);
            Ok(Flow::Continue)
        }
        Err(PushError::Closed(_)) => Ok(Flow::Exit),
    }
}
