//! Pipeline controller: the only object a consumer talks to.
//! Owns the source session until start, the frame queue and the decode
//! worker's lifecycle (init/start/seek/pause/stop).
//!
//! Every method takes `&self`, so one controller can be shared through an
//! `Arc` between a consumer blocked in `get_frame` and a thread calling
//! `stop` or `seek`. Lifecycle calls (`init`, `start`, `stop`) are serialized
//! by the session lock; `get_frame` only snapshots the current queue and
//! never holds a controller lock while it waits.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel;
use parking_lot::Mutex;

use crate::core::time::{self, Millis};
use crate::decode::error::OpenError;
use crate::decode::frame::DecodedFrame;
use crate::decode::guard::IoGuard;
use crate::decode::source::Source;
use crate::decode::stream_info::ProbeInfo;
use crate::decode::synthetic::TestPatternSource;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::state::PipelineState;
use crate::pipeline::worker::{self, Launch, SeekRequest, Shared, WorkerContext};

/// Error type for starting the decode worker
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("Pipeline was never initialized")]
    NotInitialized,
    #[error("Pipeline is already running")]
    AlreadyRunning,
    #[error("Reopen failed: {0}")]
    Open(#[from] OpenError),
    #[error("Failed to spawn decode worker: {0}")]
    Spawn(String),
}

/// Code recorded when the worker thread cannot be created
const SPAWN_FAILED: i32 = 40;

/// Lifecycle-owned parts, touched only under the session lock
struct Session<S: Source> {
    config: Option<PipelineConfig>,
    source: Option<S>, // between init and start
    worker: Option<JoinHandle<Option<S>>>,
}

/// Threaded decode pipeline over a [`Source`]
pub struct PipelineController<S: Source> {
    session: Mutex<Session<S>>,
    probe: Mutex<Option<ProbeInfo>>,
    queue: Mutex<Arc<FrameQueue>>,
    guard: Mutex<Arc<IoGuard>>,
    shared: Arc<Shared>,
}

/// Pipeline over the built-in test-pattern source
pub type TestPatternPipeline = PipelineController<TestPatternSource>;

/// Pipeline over FFmpeg
#[cfg(feature = "ffmpeg")]
pub type FfmpegPipeline = PipelineController<crate::decode::ffmpeg::FfmpegSource>;

impl<S: Source> PipelineController<S> {
    /// Create an idle controller. Performs the backend's one-time
    /// initialization; a failure is reported again by `init`.
    pub fn new() -> Self {
        if let Err(err) = S::initialize() {
            tracing::warn!("Backend initialization failed: {}", err);
        }
        let config = PipelineConfig::default();
        Self {
            session: Mutex::new(Session {
                config: None,
                source: None,
                worker: None,
            }),
            probe: Mutex::new(None),
            queue: Mutex::new(Arc::new(FrameQueue::new(config.queue_capacity))),
            guard: Mutex::new(Arc::new(IoGuard::new(config.block_timeout()))),
            shared: Arc::new(Shared::new()),
        }
    }

    fn queue(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.queue.lock())
    }

    fn guard(&self) -> Arc<IoGuard> {
        Arc::clone(&self.guard.lock())
    }

    /// Open and probe a source. Any running session is stopped first.
    pub fn init(&self, config: PipelineConfig) -> Result<ProbeInfo, OpenError> {
        let mut session = self.session.lock();
        if !matches!(self.state(), PipelineState::Idle | PipelineState::Stopped) {
            self.stop_locked(&mut session);
        }

        session.config = None;
        *self.probe.lock() = None;

        let result = config
            .validate()
            .map_err(|e| OpenError::InvalidConfig(e.to_string()))
            .and_then(|()| S::initialize())
            .and_then(|()| {
                let guard = Arc::new(IoGuard::new(config.block_timeout()));
                S::open(&config.open_request(), Arc::clone(&guard)).map(|source| (source, guard))
            });

        let (source, guard) = match result {
            Ok(opened) => opened,
            Err(err) => {
                tracing::error!("Failed to open {}: {}", config.source, err);
                self.shared.error_code.store(err.code(), Ordering::Release);
                return Err(err);
            }
        };

        let probe = source.probe().clone();
        *self.guard.lock() = guard;
        *self.queue.lock() = Arc::new(FrameQueue::new(config.queue_capacity));
        self.shared.pending_seek.store(None);
        self.shared.error_code.store(0, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
        self.shared.position_ms.store(0, Ordering::Release);
        self.shared.set_state(PipelineState::Opened);

        tracing::info!(
            "Initialized {} ({:?}, {:?} -> {})",
            config.source,
            config.media_type,
            config.decode_preference,
            config.target_layout.name()
        );
        session.source = Some(source);
        session.config = Some(config);
        *self.probe.lock() = Some(probe.clone());
        Ok(probe)
    }

    /// Spawn the decode worker.
    ///
    /// After a `stop()`, the source is reopened on the worker thread and this
    /// call waits for the outcome. No-op once the stream ended or failed.
    pub fn start(&self) -> Result<(), StartError> {
        let mut session = self.session.lock();
        let mut state = self.shared.state.lock();
        match *state {
            PipelineState::Idle => Err(StartError::NotInitialized),
            PipelineState::Running | PipelineState::Seeking => Err(StartError::AlreadyRunning),
            PipelineState::Eof | PipelineState::Error => {
                tracing::debug!("start() ignored in state {}", *state);
                Ok(())
            }
            PipelineState::Opened => {
                let source = session.source.take().ok_or(StartError::NotInitialized)?;
                Shared::transition(&mut state, PipelineState::Running);
                drop(state);

                let epoch = self.queue().epoch();
                self.spawn(&mut session, Launch::Ready(source), epoch)
            }
            PipelineState::Stopped => {
                let config = session.config.clone().ok_or(StartError::NotInitialized)?;
                *self.guard.lock() = Arc::new(IoGuard::new(config.block_timeout()));
                let epoch = self.queue().reset();
                self.shared.error_code.store(0, Ordering::Release);
                self.shared.position_ms.store(0, Ordering::Release);
                Shared::transition(&mut state, PipelineState::Running);
                drop(state);

                let (reply_tx, reply_rx) = channel::bounded(1);
                self.spawn(
                    &mut session,
                    Launch::Reopen {
                        request: config.open_request(),
                        reply: reply_tx,
                    },
                    epoch,
                )?;

                match reply_rx.recv() {
                    Ok(Ok(probe)) => {
                        *self.probe.lock() = Some(probe);
                        Ok(())
                    }
                    Ok(Err(err)) => {
                        Self::join_worker(&mut session);
                        Err(StartError::Open(err))
                    }
                    Err(_) => {
                        Self::join_worker(&mut session);
                        Err(StartError::Open(OpenError::Backend(
                            "decode worker exited during open".to_string(),
                        )))
                    }
                }
            }
        }
    }

    fn spawn(&self, session: &mut Session<S>, launch: Launch<S>, epoch: u64) -> Result<(), StartError> {
        let queue = self.queue();
        let ctx = WorkerContext {
            shared: Arc::clone(&self.shared),
            queue: Arc::clone(&queue),
            guard: self.guard(),
            layout: session.config.as_ref().map(|c| c.target_layout).unwrap_or_default(),
            epoch,
        };

        let spawned = thread::Builder::new()
            .name("framepipe-decode".to_string())
            .spawn(move || worker::run(ctx, launch));

        match spawned {
            Ok(handle) => {
                session.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                tracing::error!("Failed to spawn decode worker: {}", err);
                self.shared.error_code.store(SPAWN_FAILED, Ordering::Release);
                self.shared.set_state(PipelineState::Error);
                queue.finish();
                Err(StartError::Spawn(err.to_string()))
            }
        }
    }

    /// Join the worker and close the source it hands back
    fn join_worker(session: &mut Session<S>) {
        if let Some(handle) = session.worker.take() {
            match handle.join() {
                Ok(Some(mut source)) => source.close(),
                Ok(None) => {}
                Err(_) => tracing::error!("Decode worker panicked"),
            }
        }
    }

    /// Pop the next frame.
    ///
    /// Blocking waits only while the worker can still produce; it returns
    /// `None` at end of stream, after an error and after `stop()`.
    pub fn get_frame(&self, blocking: bool) -> Option<DecodedFrame> {
        let queue = self.queue();
        let running = self.shared.state().is_running();
        let frame = queue.pop(blocking && running)?;
        self.shared
            .position_ms
            .store(frame.timestamp_ms(), Ordering::Release);
        Some(frame)
    }

    /// Request a reposition to `timestamp_ms`, clamped into `[0, duration]`.
    /// Returns immediately; repeated requests coalesce to the latest.
    pub fn seek(&self, timestamp_ms: Millis) {
        let target = time::clamp_to_duration(timestamp_ms, self.duration_ms());
        let queue = self.queue();
        let mut state = self.shared.state.lock();
        match *state {
            PipelineState::Running | PipelineState::Seeking => {
                let epoch = queue.clear();
                self.shared.pending_seek.store(Some(SeekRequest { target_ms: target, epoch }));
                self.shared.position_ms.store(target, Ordering::Release);
                Shared::transition(&mut state, PipelineState::Seeking);
                self.shared.wake.notify_all();
                tracing::debug!("Seek requested to {}", time::format_time(target));
            }
            PipelineState::Opened => {
                let epoch = queue.epoch();
                self.shared.pending_seek.store(Some(SeekRequest { target_ms: target, epoch }));
                self.shared.position_ms.store(target, Ordering::Release);
                tracing::debug!("Seek to {} deferred until start", time::format_time(target));
            }
            other => tracing::debug!("seek() ignored in state {}", other),
        }
    }

    /// Park or resume the worker between iterations
    pub fn pause(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Release);
        self.shared.notify();
        tracing::debug!("Pipeline {}", if paused { "paused" } else { "resumed" });
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Stop the worker and release the source. Blocks until the worker has
    /// exited. Safe to call in any state and from any thread, including while
    /// another thread is blocked in `get_frame`; repeated calls are no-ops.
    pub fn stop(&self) {
        if matches!(self.state(), PipelineState::Idle | PipelineState::Stopped) {
            return;
        }
        // unblock the worker and any waiting consumer before queueing
        // behind a lifecycle call that may itself wait on the worker
        self.interrupt();

        let mut session = self.session.lock();
        self.stop_locked(&mut session);
    }

    fn interrupt(&self) {
        self.guard().request_quit();
        self.queue().shutdown();
        self.shared.notify();
    }

    fn stop_locked(&self, session: &mut Session<S>) {
        if matches!(self.state(), PipelineState::Idle | PipelineState::Stopped) {
            return;
        }

        self.interrupt();
        Self::join_worker(session);

        if let Some(mut source) = session.source.take() {
            source.close();
        }
        self.shared.pending_seek.store(None);
        self.shared.paused.store(false, Ordering::Release);
        self.shared.set_state(PipelineState::Stopped);
        tracing::info!("Pipeline stopped");
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_eof(&self) -> bool {
        self.state().is_eof()
    }

    /// 0 while healthy, otherwise the code of the last open or decode failure
    pub fn error_code(&self) -> i32 {
        self.shared.error_code.load(Ordering::Acquire)
    }

    pub fn probe(&self) -> Option<ProbeInfo> {
        self.probe.lock().clone()
    }

    pub fn width(&self) -> u32 {
        self.probe.lock().as_ref().map_or(0, |p| p.width)
    }

    pub fn height(&self) -> u32 {
        self.probe.lock().as_ref().map_or(0, |p| p.height)
    }

    pub fn fps(&self) -> f64 {
        self.probe.lock().as_ref().map_or(0.0, |p| p.fps)
    }

    pub fn duration_ms(&self) -> Millis {
        self.probe.lock().as_ref().map_or(0, |p| p.duration_ms)
    }

    /// Timestamp of the last frame handed out (or the last seek target)
    pub fn position_ms(&self) -> Millis {
        self.shared.position_ms.load(Ordering::Acquire)
    }

    /// Configuration of the current session. Waits while a lifecycle call
    /// is in progress.
    pub fn config(&self) -> Option<PipelineConfig> {
        self.session.lock().config.clone()
    }

    /// Frames currently buffered
    pub fn queued_frames(&self) -> usize {
        self.queue().len()
    }
}

impl<S: Source> Default for PipelineController<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Source> Drop for PipelineController<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
