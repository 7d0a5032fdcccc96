//! Deterministic test-pattern source.
//!
//! Addressed as `testsrc` or `testsrc=key=value:key=value`, e.g.
//! `testsrc=duration=10:rate=25:size=320x240`. Produces planar YUV 4:2:0
//! pictures in memory and models the behaviours of a real container/decoder
//! pair: keyframe-aligned seeking, decoder buffering, interleaved non-video
//! units, corrupt units, fatal decoder failures and reads that never return.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::core::time::{self, Millis};
use crate::decode::convert::{SoftwareConverter, YuvPicture};
use crate::decode::error::{DecodeError, FatalError, OpenError, SeekError};
use crate::decode::frame::{DecodedFrame, PixelLayout};
use crate::decode::guard::{AbortReason, IoGuard};
use crate::decode::select::{select_decoder, DecoderCandidate, DecodePreference};
use crate::decode::source::{MediaType, OpenRequest, Source};
use crate::decode::stream_info::ProbeInfo;

pub const SCHEME: &str = "testsrc";

/// How often a stalled call polls the guard
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Which blocking call never completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stall {
    Open,
    Read,
}

/// Parsed `testsrc` parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TestPattern {
    pub duration_ms: Millis,
    pub rate: Option<f64>,
    pub width: i32,
    pub height: i32,
    pub gop: u64,
    pub delay: usize,
    pub audio: u32,
    pub corrupt_every: Option<u64>,
    pub fail_at: Option<u64>,
    pub stall: Option<Stall>,
    pub hardware: Option<DecodePreference>,
    pub has_video: bool,
    pub codec: String,
}

impl Default for TestPattern {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            rate: None,
            width: 320,
            height: 240,
            gop: 25,
            delay: 0,
            audio: 0,
            corrupt_every: None,
            fail_at: None,
            stall: None,
            hardware: None,
            has_video: true,
            codec: SCHEME.to_string(),
        }
    }
}

fn bad_param(key: &str, value: &str) -> OpenError {
    OpenError::InvalidConfig(format!("bad {} parameter {}={}", SCHEME, key, value))
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, OpenError> {
    value.parse().map_err(|_| bad_param(key, value))
}

impl TestPattern {
    /// Whether `source` addresses this backend
    pub fn matches(source: &str) -> bool {
        source == SCHEME || source.starts_with("testsrc=")
    }

    pub fn parse(source: &str) -> Result<Self, OpenError> {
        if !Self::matches(source) {
            return Err(OpenError::NotFound(source.to_string()));
        }

        let mut pattern = TestPattern::default();
        let params = source.strip_prefix("testsrc=").unwrap_or("");
        for param in params.split(':').filter(|p| !p.is_empty()) {
            let (key, value) = param.split_once('=').ok_or_else(|| bad_param(param, ""))?;
            match key {
                "duration" => {
                    let seconds: f64 = parse_num(key, value)?;
                    pattern.duration_ms = time::from_seconds(seconds);
                }
                "rate" => {
                    let rate: f64 = parse_num(key, value)?;
                    if rate <= 0.0 {
                        return Err(bad_param(key, value));
                    }
                    pattern.rate = Some(rate);
                }
                "size" => {
                    let (w, h) = value.split_once('x').ok_or_else(|| bad_param(key, value))?;
                    pattern.width = parse_num(key, w)?;
                    pattern.height = parse_num(key, h)?;
                }
                "gop" => pattern.gop = parse_num::<u64>(key, value)?.max(1),
                "delay" => pattern.delay = parse_num(key, value)?,
                "audio" => pattern.audio = parse_num(key, value)?,
                "corrupt" => pattern.corrupt_every = Some(parse_num::<u64>(key, value)?.max(1)),
                "fail_at" => pattern.fail_at = Some(parse_num(key, value)?),
                "stall" => {
                    pattern.stall = match value {
                        "open" => Some(Stall::Open),
                        "read" => Some(Stall::Read),
                        _ => return Err(bad_param(key, value)),
                    }
                }
                "hw" => {
                    pattern.hardware = match value {
                        "a" => Some(DecodePreference::HardwareA),
                        "b" => Some(DecodePreference::HardwareB),
                        _ => return Err(bad_param(key, value)),
                    }
                }
                "video" => pattern.has_video = value != "0",
                "codec" => pattern.codec = value.to_string(),
                _ => return Err(bad_param(key, value)),
            }
        }
        Ok(pattern)
    }

    /// Whether a decoder candidate "is installed" for this pattern
    fn has_decoder(&self, candidate: &DecoderCandidate) -> bool {
        if self.codec == "none" {
            return false;
        }
        match candidate {
            DecoderCandidate::Generic => true,
            DecoderCandidate::Named(name) => self
                .hardware
                .and_then(|hw| hw.hardware_suffix())
                .map_or(false, |suffix| *name == format!("{}_{}", self.codec, suffix)),
        }
    }
}

/// Sleep in small steps until `duration` elapses or the guard fires
fn wait_guarded(guard: &IoGuard, duration: Duration) -> Result<(), AbortReason> {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if let Some(reason) = guard.check() {
            return Err(reason);
        }
        let step = remaining.min(POLL_INTERVAL);
        thread::sleep(step);
        remaining -= step;
    }
    Ok(())
}

/// Block until the guard fires; models a peer that never answers
fn block_forever(guard: &IoGuard) -> AbortReason {
    loop {
        if let Some(reason) = guard.check() {
            return reason;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// In-memory source generating a moving gradient
pub struct TestPatternSource {
    pattern: TestPattern,
    probe: ProbeInfo,
    guard: Arc<IoGuard>,
    live: bool,
    total_frames: Option<u64>, // None for endless live sources
    next_frame: u64,
    decoder_queue: VecDeque<YuvPicture>,
    drained: bool,
    converter: Option<SoftwareConverter>,
    units_read: u64,
    closed: bool,
}

impl TestPatternSource {
    pub fn pattern(&self) -> &TestPattern {
        &self.pattern
    }

    /// Compressed units consumed so far, including discarded non-video units
    pub fn units_read(&self) -> u64 {
        self.units_read
    }

    fn render(&self, index: u64) -> YuvPicture {
        let width = self.probe.width;
        let height = self.probe.height;
        let mut picture = YuvPicture::new(width, height);
        picture.pts_ms = Some(time::frame_timestamp(index, self.probe.fps));
        picture.keyframe = index % self.pattern.gop == 0;

        let shift = index as usize;
        let luma_stride = picture.strides[0];
        for (row, line) in picture.planes[0].chunks_exact_mut(luma_stride).enumerate() {
            for (col, px) in line.iter_mut().enumerate() {
                *px = 16 + ((col + row + shift) % 220) as u8;
            }
        }
        picture.planes[1].fill(128u8.wrapping_add((index % 64) as u8));
        picture.planes[2].fill(128u8.wrapping_sub((index % 64) as u8));
        picture
    }

    fn at_end(&self) -> bool {
        self.total_frames.map_or(false, |total| self.next_frame >= total)
    }

    /// Return up to one buffered picture once the decoder delay is filled
    fn emit_ready(&mut self) -> Vec<YuvPicture> {
        if self.decoder_queue.len() > self.pattern.delay {
            self.decoder_queue.pop_front().into_iter().collect()
        } else {
            Vec::new()
        }
    }
}

impl Source for TestPatternSource {
    type Picture = YuvPicture;

    fn open(request: &OpenRequest, guard: Arc<IoGuard>) -> Result<Self, OpenError> {
        let pattern = TestPattern::parse(&request.source)?;

        if pattern.stall == Some(Stall::Open) {
            guard.arm();
            let reason = block_forever(&guard);
            guard.disarm();
            tracing::warn!("Open of {} aborted: {}", request.source, reason);
            return Err(OpenError::Interrupted(reason));
        }
        if !pattern.has_video {
            return Err(OpenError::NoVideoStream);
        }
        if pattern.width <= 0 || pattern.height <= 0 {
            return Err(OpenError::InvalidDimensions {
                width: pattern.width,
                height: pattern.height,
            });
        }

        let candidates = request.decode_preference.candidates(&pattern.codec);
        let selected = select_decoder(&pattern.codec, &candidates, |candidate| {
            if pattern.has_decoder(candidate) {
                Ok(())
            } else {
                Err("not installed".to_string())
            }
        })?;

        let live = request.media_type == MediaType::Capture;
        let fps = match (pattern.rate, live) {
            (Some(rate), _) => rate,
            (None, true) => request.capture_framerate.max(1) as f64,
            (None, false) => 25.0,
        };
        let total_frames = if live {
            None
        } else {
            Some((time::to_seconds(pattern.duration_ms) * fps).round() as u64)
        };

        let probe = ProbeInfo {
            stream_index: 0,
            width: pattern.width as u32,
            height: pattern.height as u32,
            fps,
            duration_ms: if live { 0 } else { pattern.duration_ms },
            codec_name: pattern.codec.clone(),
            decoder_name: selected.name,
            pixel_format: PixelLayout::PlanarYuv420.name().to_string(),
        };

        tracing::info!(
            "Opened {}: {}x{} @ {:.2}fps, duration {}, decoder {}",
            request.source,
            probe.width,
            probe.height,
            probe.fps,
            time::format_time(probe.duration_ms),
            probe.decoder_name
        );

        Ok(Self {
            pattern,
            probe,
            guard,
            live,
            total_frames,
            next_frame: 0,
            decoder_queue: VecDeque::new(),
            drained: false,
            converter: None,
            units_read: 0,
            closed: false,
        })
    }

    fn probe(&self) -> &ProbeInfo {
        &self.probe
    }

    fn read_and_decode_one(&mut self) -> Result<Option<Vec<YuvPicture>>, DecodeError> {
        if self.closed {
            return Err(FatalError::Decoder("source is closed".to_string()).into());
        }

        if self.at_end() {
            if self.drained {
                return Ok(None);
            }
            // flush pictures still buffered inside the decoder
            self.drained = true;
            let rest: Vec<YuvPicture> = self.decoder_queue.drain(..).collect();
            return Ok(if rest.is_empty() { None } else { Some(rest) });
        }

        self.guard.arm();
        if self.pattern.stall == Some(Stall::Read) {
            let reason = block_forever(&self.guard);
            self.guard.disarm();
            return Err(FatalError::Interrupted(reason).into());
        }
        if self.live {
            let interval = Duration::from_millis(self.probe.frame_interval_ms() as u64);
            if let Err(reason) = wait_guarded(&self.guard, interval) {
                self.guard.disarm();
                return Err(FatalError::Interrupted(reason).into());
            }
        }
        self.guard.disarm();

        // non-selected units sit between video units and are discarded
        self.units_read += 1 + self.pattern.audio as u64;

        let index = self.next_frame;
        self.next_frame += 1;

        if self.pattern.fail_at == Some(index) {
            return Err(FatalError::Decoder(format!("decoder rejected unit {}", index)).into());
        }
        if let Some(every) = self.pattern.corrupt_every {
            if (index + 1) % every == 0 {
                return Err(DecodeError::Transient(format!("corrupt unit {}", index)));
            }
        }

        let picture = self.render(index);
        self.decoder_queue.push_back(picture);
        Ok(Some(self.emit_ready()))
    }

    fn picture_timestamp_ms(&self, picture: &YuvPicture) -> Option<Millis> {
        picture.pts_ms
    }

    fn convert(
        &mut self,
        picture: &YuvPicture,
        layout: PixelLayout,
    ) -> Result<DecodedFrame, DecodeError> {
        let rebuild = self
            .converter
            .as_ref()
            .map_or(true, |c| !c.matches(picture.width, picture.height));
        if rebuild {
            tracing::debug!("Creating converter for {}x{}", picture.width, picture.height);
            self.converter = Some(SoftwareConverter::new(picture.width, picture.height));
        }
        let converter = self
            .converter
            .as_ref()
            .ok_or_else(|| FatalError::Decoder("converter missing".to_string()))?;
        converter.convert(picture, layout, picture.pts_ms.unwrap_or(0))
    }

    fn seek(&mut self, timestamp_ms: Millis) -> Result<(), SeekError> {
        if self.live {
            return Err(SeekError::Unsupported);
        }
        if self.closed {
            return Err(SeekError::Failed {
                target_ms: timestamp_ms,
                reason: "source is closed".to_string(),
            });
        }

        let total = self.total_frames.unwrap_or(0);
        let target = ((time::to_seconds(timestamp_ms.max(0)) * self.probe.fps).floor() as u64).min(total);
        // backward-biased: land on the keyframe at or before the target
        let keyframe = (target / self.pattern.gop) * self.pattern.gop;

        tracing::debug!(
            "Seek to {}ms: target frame {}, keyframe {}",
            timestamp_ms,
            target,
            keyframe
        );

        self.next_frame = keyframe;
        self.decoder_queue.clear();
        self.drained = false;
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.converter = None;
        self.decoder_queue.clear();
        self.closed = true;
        tracing::debug!("Closed {} source", SCHEME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(source: &str) -> Result<TestPatternSource, OpenError> {
        let request = OpenRequest::new(source, MediaType::File);
        TestPatternSource::open(&request, Arc::new(IoGuard::new(Duration::from_secs(1))))
    }

    fn decode_all(source: &mut TestPatternSource) -> Vec<Millis> {
        let mut stamps = Vec::new();
        while let Some(pictures) = source.read_and_decode_one().unwrap() {
            stamps.extend(pictures.iter().filter_map(|p| p.pts_ms));
        }
        stamps
    }

    #[test]
    fn test_parse_defaults_and_params() {
        assert_eq!(TestPattern::parse("testsrc").unwrap(), TestPattern::default());

        let pattern = TestPattern::parse("testsrc=duration=2.5:rate=30:size=64x48:gop=10:stall=read").unwrap();
        assert_eq!(pattern.duration_ms, 2_500);
        assert_eq!(pattern.rate, Some(30.0));
        assert_eq!((pattern.width, pattern.height), (64, 48));
        assert_eq!(pattern.gop, 10);
        assert_eq!(pattern.stall, Some(Stall::Read));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(TestPattern::parse("clip.mp4"), Err(OpenError::NotFound(_))));
        assert!(matches!(
            TestPattern::parse("testsrc=bogus=1"),
            Err(OpenError::InvalidConfig(_))
        ));
        assert!(matches!(
            TestPattern::parse("testsrc=rate=abc"),
            Err(OpenError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_open_errors() {
        assert_eq!(open("testsrc=video=0").err(), Some(OpenError::NoVideoStream));
        assert_eq!(
            open("testsrc=size=0x240").err(),
            Some(OpenError::InvalidDimensions { width: 0, height: 240 })
        );
        assert!(matches!(
            open("testsrc=codec=none").err(),
            Some(OpenError::DecoderUnavailable { .. })
        ));
    }

    #[test]
    fn test_hardware_preference_falls_back() {
        let mut request = OpenRequest::new("testsrc", MediaType::File);
        request.decode_preference = DecodePreference::HardwareA;
        let guard = Arc::new(IoGuard::new(Duration::from_secs(1)));
        let source = TestPatternSource::open(&request, Arc::clone(&guard)).unwrap();
        assert_eq!(source.probe().decoder_name, "testsrc");

        request.source = "testsrc=hw=a".to_string();
        let source = TestPatternSource::open(&request, guard).unwrap();
        assert_eq!(source.probe().decoder_name, "testsrc_cuvid");
    }

    #[test]
    fn test_probe() {
        let source = open("testsrc=duration=10:rate=25").unwrap();
        let probe = source.probe();
        assert_eq!((probe.width, probe.height), (320, 240));
        assert_eq!(probe.duration_ms, 10_000);
        assert_eq!(probe.expected_frames(), Some(250));
    }

    #[test]
    fn test_decodes_every_frame_in_order() {
        let mut source = open("testsrc=duration=2:rate=25:size=32x16").unwrap();
        let stamps = decode_all(&mut source);
        assert_eq!(stamps.len(), 50);
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(stamps[0], 0);
        assert_eq!(*stamps.last().unwrap(), 1_960);
    }

    #[test]
    fn test_decoder_delay_is_drained_at_end() {
        let mut source = open("testsrc=duration=1:rate=10:size=8x8:delay=3").unwrap();
        let mut empty_calls = 0;
        let mut batch_sizes = Vec::new();
        while let Some(pictures) = source.read_and_decode_one().unwrap() {
            if pictures.is_empty() {
                empty_calls += 1;
            }
            batch_sizes.push(pictures.len());
        }
        assert_eq!(empty_calls, 3);
        assert_eq!(batch_sizes.iter().sum::<usize>(), 10);
        assert_eq!(*batch_sizes.last().unwrap(), 3);
    }

    #[test]
    fn test_non_video_units_are_discarded() {
        let mut source = open("testsrc=duration=1:rate=10:size=8x8:audio=2").unwrap();
        let stamps = decode_all(&mut source);
        assert_eq!(stamps.len(), 10);
        assert_eq!(source.units_read(), 30);
    }

    #[test]
    fn test_corrupt_units_are_transient() {
        let mut source = open("testsrc=duration=1:rate=10:size=8x8:corrupt=5").unwrap();
        let mut transient = 0;
        let mut frames = 0;
        loop {
            match source.read_and_decode_one() {
                Ok(Some(pictures)) => frames += pictures.len(),
                Ok(None) => break,
                Err(err) => {
                    assert!(!err.is_fatal());
                    transient += 1;
                }
            }
        }
        assert_eq!(transient, 2);
        assert_eq!(frames, 8);
    }

    #[test]
    fn test_fail_at_is_fatal() {
        let mut source = open("testsrc=duration=1:rate=10:size=8x8:fail_at=3").unwrap();
        for _ in 0..3 {
            source.read_and_decode_one().unwrap();
        }
        assert!(source.read_and_decode_one().unwrap_err().is_fatal());
    }

    #[test]
    fn test_seek_lands_on_preceding_keyframe() {
        let mut source = open("testsrc=duration=10:rate=25:size=8x8:gop=25").unwrap();
        source.read_and_decode_one().unwrap();
        source.seek(5_500).unwrap();
        let pictures = source.read_and_decode_one().unwrap().unwrap();
        assert_eq!(pictures[0].pts_ms, Some(5_000));
        assert!(pictures[0].keyframe);
    }

    #[test]
    fn test_stalled_read_is_aborted_by_guard() {
        let request = OpenRequest::new("testsrc=stall=read", MediaType::Network);
        let guard = Arc::new(IoGuard::new(Duration::from_millis(30)));
        let mut source = TestPatternSource::open(&request, guard).unwrap();
        let err = source.read_and_decode_one().unwrap_err();
        assert_eq!(err, DecodeError::Fatal(FatalError::Interrupted(AbortReason::Timeout)));
    }

    #[test]
    fn test_stalled_open_is_aborted_by_quit() {
        let request = OpenRequest::new("testsrc=stall=open", MediaType::Network);
        let guard = Arc::new(IoGuard::new(Duration::from_secs(60)));
        let quitter = Arc::clone(&guard);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            quitter.request_quit();
        });
        let err = TestPatternSource::open(&request, guard).err();
        handle.join().unwrap();
        assert_eq!(err, Some(OpenError::Interrupted(AbortReason::Quit)));
    }

    #[test]
    fn test_convert_caches_converter_and_close_is_idempotent() {
        let mut source = open("testsrc=duration=1:rate=10:size=8x8").unwrap();
        let pictures = source.read_and_decode_one().unwrap().unwrap();
        let frame = source.convert(&pictures[0], PixelLayout::PackedBgr24).unwrap();
        assert_eq!(frame.data().len(), 8 * 8 * 3);
        assert!(source.converter.is_some());

        source.close();
        source.close();
        assert!(source.converter.is_none());
        assert!(source.read_and_decode_one().unwrap_err().is_fatal());
    }
}
