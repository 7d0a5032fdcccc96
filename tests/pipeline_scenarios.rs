//! End-to-end scenarios driving the controller against the test-pattern source.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use framepipe::decode::{AbortReason, FatalError};
use framepipe::{
    DecodeError, DecodePreference, MediaType, PipelineConfig, PipelineState, PixelLayout,
    TestPatternPipeline,
};

fn clip(params: &str) -> PipelineConfig {
    PipelineConfig::new(format!("testsrc={}", params))
        .with_target_layout(PixelLayout::PackedBgr24)
        .with_queue_capacity(5)
}

fn drain(pipeline: &TestPatternPipeline) -> Vec<i64> {
    let mut stamps = Vec::new();
    while let Some(frame) = pipeline.get_frame(true) {
        stamps.push(frame.timestamp_ms());
    }
    stamps
}

#[test]
fn ten_second_clip_yields_250_frames() {
    let pipeline = TestPatternPipeline::new();
    let probe = pipeline.init(clip("duration=10:rate=25")).unwrap();
    assert_eq!(probe.expected_frames(), Some(250));

    pipeline.start().unwrap();
    let stamps = drain(&pipeline);

    assert_eq!(stamps.len(), 250);
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    assert!(pipeline.is_eof());
    assert_eq!(pipeline.error_code(), 0);
}

#[test]
fn frames_have_layout_size() {
    let pipeline = TestPatternPipeline::new();
    pipeline
        .init(clip("duration=1:rate=10:size=33x17").with_target_layout(PixelLayout::PlanarYuv420))
        .unwrap();
    pipeline.start().unwrap();

    let frame = pipeline.get_frame(true).unwrap();
    assert_eq!(frame.layout(), PixelLayout::PlanarYuv420);
    assert_eq!(frame.data().len(), PixelLayout::PlanarYuv420.frame_size(33, 17));
    assert_eq!(frame.strides(), &[33, 17, 17]);
}

#[test]
fn seek_mid_playback_lands_within_one_frame() {
    let pipeline = TestPatternPipeline::new();
    pipeline.init(clip("duration=10:rate=25")).unwrap();
    pipeline.start().unwrap();

    for _ in 0..10 {
        assert!(pipeline.get_frame(true).is_some());
    }
    pipeline.seek(5_000);

    let frame = pipeline.get_frame(true).unwrap();
    assert!(
        (4_960..=5_040).contains(&frame.timestamp_ms()),
        "first frame after seek at {}ms",
        frame.timestamp_ms()
    );

    // nothing from before the seek shows up afterwards
    let rest = drain(&pipeline);
    assert!(rest.iter().all(|ts| *ts >= 5_000));
    assert_eq!(rest.len(), 124);
}

#[test]
fn repeated_seeks_coalesce_to_the_latest() {
    let pipeline = TestPatternPipeline::new();
    pipeline.init(clip("duration=10:rate=25:gop=50")).unwrap();
    pipeline.start().unwrap();
    assert!(pipeline.get_frame(true).is_some());

    pipeline.seek(2_000);
    pipeline.seek(8_000);
    pipeline.seek(6_000);

    let frame = pipeline.get_frame(true).unwrap();
    assert!((5_960..=6_040).contains(&frame.timestamp_ms()), "{}", frame.timestamp_ms());
}

#[test]
fn seek_after_end_of_stream_is_ignored() {
    let pipeline = TestPatternPipeline::new();
    pipeline.init(clip("duration=0.4:rate=25")).unwrap();
    pipeline.start().unwrap();
    assert_eq!(drain(&pipeline).len(), 10);

    pipeline.seek(0);
    assert_eq!(pipeline.state(), PipelineState::Eof);
    assert!(pipeline.get_frame(true).is_none());
}

#[test]
fn stalled_read_times_out() {
    let pipeline = TestPatternPipeline::new();
    pipeline
        .init(clip("stall=read").with_media_type(MediaType::Network).with_block_timeout_seconds(1))
        .unwrap();
    pipeline.start().unwrap();

    let started = Instant::now();
    assert!(pipeline.get_frame(true).is_none());
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(900), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "returned after {:?}", elapsed);
    assert_eq!(pipeline.state(), PipelineState::Error);
    assert_eq!(
        pipeline.error_code(),
        DecodeError::from(FatalError::Interrupted(AbortReason::Timeout)).code()
    );
}

#[test]
fn stop_interrupts_stalled_read_promptly() {
    let pipeline = TestPatternPipeline::new();
    pipeline
        .init(clip("stall=read").with_block_timeout_seconds(60))
        .unwrap();
    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    pipeline.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.error_code(), 0);
}

#[test]
fn stalled_open_times_out() {
    let pipeline = TestPatternPipeline::new();
    let started = Instant::now();
    let err = pipeline
        .init(clip("stall=open").with_block_timeout_seconds(1))
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(pipeline.error_code(), err.code());
    assert_eq!(pipeline.state(), PipelineState::Idle);
}

#[test]
fn slow_consumer_loses_no_frames() {
    let pipeline = TestPatternPipeline::new();
    pipeline
        .init(clip("duration=2:rate=25:size=16x16").with_queue_capacity(2))
        .unwrap();
    pipeline.start().unwrap();

    let mut received = 0;
    while let Some(_frame) = pipeline.get_frame(true) {
        assert!(pipeline.queued_frames() <= 2);
        received += 1;
        if received % 10 == 0 {
            thread::sleep(Duration::from_millis(20));
        }
    }
    assert_eq!(received, 50);
}

#[test]
fn corrupt_units_are_skipped_silently() {
    let pipeline = TestPatternPipeline::new();
    pipeline
        .init(clip("duration=1:rate=25:size=16x16:corrupt=5"))
        .unwrap();
    pipeline.start().unwrap();

    assert_eq!(drain(&pipeline).len(), 20);
    assert!(pipeline.is_eof());
    assert_eq!(pipeline.error_code(), 0);
}

#[test]
fn fatal_decode_error_behaves_like_eof_with_code() {
    let pipeline = TestPatternPipeline::new();
    pipeline
        .init(clip("duration=2:rate=25:size=16x16:fail_at=12"))
        .unwrap();
    pipeline.start().unwrap();

    assert_eq!(drain(&pipeline).len(), 12);
    assert!(!pipeline.is_eof());
    assert_eq!(pipeline.state(), PipelineState::Error);
    assert_ne!(pipeline.error_code(), 0);
}

#[test]
fn buffered_decoder_and_interleaved_streams() {
    let pipeline = TestPatternPipeline::new();
    pipeline
        .init(clip("duration=1:rate=25:size=16x16:delay=4:audio=2"))
        .unwrap();
    pipeline.start().unwrap();

    let stamps = drain(&pipeline);
    assert_eq!(stamps.len(), 25);
    assert_eq!(stamps.last().copied(), Some(960));
}

#[test]
fn hardware_preference_falls_back_to_software() {
    let pipeline = TestPatternPipeline::new();
    let probe = pipeline
        .init(clip("duration=1").with_decode_preference(DecodePreference::HardwareB))
        .unwrap();
    assert_eq!(probe.decoder_name, "testsrc");

    let probe = pipeline
        .init(clip("duration=1:hw=b").with_decode_preference(DecodePreference::HardwareB))
        .unwrap();
    assert_eq!(probe.decoder_name, "testsrc_qsv");
}

#[test]
fn stop_is_safe_from_every_state() {
    // Idle
    let pipeline = TestPatternPipeline::new();
    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Idle);

    // Opened
    pipeline.init(clip("duration=1")).unwrap();
    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    // Running, with the worker blocked on a full queue
    pipeline.init(clip("duration=10").with_queue_capacity(1)).unwrap();
    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(30));
    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    // Seeking
    pipeline.init(clip("duration=10")).unwrap();
    pipeline.start().unwrap();
    pipeline.pause(true);
    pipeline.seek(3_000);
    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    // Eof
    pipeline.init(clip("duration=0.2")).unwrap();
    pipeline.start().unwrap();
    drain(&pipeline);
    assert!(pipeline.is_eof());
    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    // Error
    pipeline.init(clip("duration=1:fail_at=0")).unwrap();
    pipeline.start().unwrap();
    drain(&pipeline);
    assert_eq!(pipeline.state(), PipelineState::Error);
    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn stop_twice_and_get_frame_after_stop() {
    let pipeline = TestPatternPipeline::new();
    pipeline.init(clip("duration=10")).unwrap();
    pipeline.start().unwrap();
    assert!(pipeline.get_frame(true).is_some());

    pipeline.stop();
    pipeline.stop();
    assert!(pipeline.get_frame(true).is_none());
    assert!(pipeline.get_frame(false).is_none());
    assert!(!pipeline.is_running());
}

#[test]
fn non_blocking_get_frame_never_waits() {
    let pipeline = TestPatternPipeline::new();
    pipeline.init(clip("stall=read")).unwrap();
    pipeline.start().unwrap();

    let started = Instant::now();
    assert!(pipeline.get_frame(false).is_none());
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn stop_from_another_thread_wakes_blocked_consumer() {
    let pipeline = Arc::new(TestPatternPipeline::new());
    pipeline
        .init(clip("stall=read").with_block_timeout_seconds(30))
        .unwrap();
    pipeline.start().unwrap();

    let consumer = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || pipeline.get_frame(true))
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!consumer.is_finished());

    let started = Instant::now();
    pipeline.stop();
    assert!(started.elapsed() < Duration::from_secs(1), "stop took {:?}", started.elapsed());

    assert!(consumer.join().unwrap().is_none());
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.error_code(), 0);
}

#[test]
fn seek_from_another_thread_while_consumer_waits() {
    let pipeline = Arc::new(TestPatternPipeline::new());
    pipeline
        .init(clip("duration=10:rate=25:size=16x16"))
        .unwrap();
    pipeline.pause(true);
    pipeline.start().unwrap();

    let consumer = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || pipeline.get_frame(true).map(|f| f.timestamp_ms()))
    };
    thread::sleep(Duration::from_millis(50));

    pipeline.seek(7_000);
    pipeline.pause(false);
    let ts = consumer.join().unwrap().unwrap();
    assert!((6_960..=7_040).contains(&ts), "{}", ts);
    pipeline.stop();
}

#[test]
fn seek_while_paused_is_applied_at_once() {
    let pipeline = TestPatternPipeline::new();
    pipeline.init(clip("duration=10:rate=25")).unwrap();
    pipeline.start().unwrap();
    assert!(pipeline.get_frame(true).is_some());

    pipeline.pause(true);
    pipeline.seek(5_000);
    let deadline = Instant::now() + Duration::from_secs(2);
    while pipeline.state() != PipelineState::Running && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pipeline.state(), PipelineState::Running);
    assert_eq!(pipeline.queued_frames(), 0);

    pipeline.pause(false);
    let frame = pipeline.get_frame(true).unwrap();
    assert!((4_960..=5_040).contains(&frame.timestamp_ms()), "{}", frame.timestamp_ms());
}
