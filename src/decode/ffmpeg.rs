//! FFmpeg-backed source session.
//! All unsafe FFmpeg code is isolated in this module.
//!
//! The I/O guard is installed as the format context's interrupt callback, so
//! blocking reads inside libavformat poll it on the blocked thread and return
//! `AVERROR_EXIT` once quit is requested or the block timeout is exceeded.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_int;
use std::path::Path;
use std::ptr;
use std::sync::{Arc, OnceLock};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use crate::core::time::{self, Millis};
use crate::decode::error::{DecodeError, FatalError, OpenError, SeekError};
use crate::decode::frame::{DecodedFrame, PixelLayout};
use crate::decode::guard::{AbortReason, IoGuard};
use crate::decode::select::{select_decoder, DecoderCandidate};
use crate::decode::source::{MediaType, OpenRequest, Source};
use crate::decode::stream_info::ProbeInfo;

/// Device name that selects the screen-grab driver
pub const DESKTOP_DEVICE: &str = "desktop";

/// Frame rate assumed when the container reports none
const DEFAULT_FPS: f64 = 30.0;

#[cfg(target_os = "windows")]
mod platform {
    pub const CAPTURE_DRIVER: &str = "dshow";
    pub const SCREEN_DRIVER: &str = "gdigrab";
    pub const SCREEN_URL: &str = "desktop";
    pub const DEVICE_PREFIX: &str = "video=";
}

#[cfg(target_os = "macos")]
mod platform {
    pub const CAPTURE_DRIVER: &str = "avfoundation";
    pub const SCREEN_DRIVER: &str = "avfoundation";
    pub const SCREEN_URL: &str = "Capture screen 0";
    pub const DEVICE_PREFIX: &str = "";
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
mod platform {
    pub const CAPTURE_DRIVER: &str = "v4l2";
    pub const SCREEN_DRIVER: &str = "x11grab";
    pub const SCREEN_URL: &str = ":0.0";
    pub const DEVICE_PREFIX: &str = "";
}

static RUNTIME: OnceLock<Result<(), String>> = OnceLock::new();

/// Initialize libavformat/libavdevice once per process
pub fn init_runtime() -> Result<(), OpenError> {
    RUNTIME
        .get_or_init(|| {
            ffmpeg::init().map_err(|e| format!("FFmpeg init failed: {}", e))?;
            tracing::info!("FFmpeg runtime initialized");
            Ok(())
        })
        .clone()
        .map_err(OpenError::Backend)
}

/// What to hand to `avformat_open_input`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub url: String,
    pub driver: Option<&'static str>,
    pub options: Vec<(&'static str, String)>,
}

/// Map a request onto a URL, input driver and driver options
pub fn resolve_input(request: &OpenRequest) -> InputSpec {
    match request.media_type {
        MediaType::File | MediaType::Network => InputSpec {
            url: request.source.clone(),
            driver: None,
            options: Vec::new(),
        },
        MediaType::Capture => {
            let framerate = request.capture_framerate.to_string();
            if request.source == DESKTOP_DEVICE {
                InputSpec {
                    url: platform::SCREEN_URL.to_string(),
                    driver: Some(platform::SCREEN_DRIVER),
                    options: vec![("framerate", framerate), ("draw_mouse", "1".to_string())],
                }
            } else {
                InputSpec {
                    url: format!("{}{}", platform::DEVICE_PREFIX, request.source),
                    driver: Some(platform::CAPTURE_DRIVER),
                    options: vec![("framerate", framerate)],
                }
            }
        }
    }
}

/// Interrupt callback polled by libavformat during blocking I/O
unsafe extern "C" fn interrupt_callback(opaque: *mut c_void) -> c_int {
    if opaque.is_null() {
        return 0;
    }
    // SAFETY: opaque is `Arc::as_ptr` of the guard owned by the source, which
    // outlives the format context it is installed on.
    let guard = &*(opaque as *const IoGuard);
    guard.should_abort() as c_int
}

fn cstring(value: &str) -> Result<CString, OpenError> {
    CString::new(value).map_err(|e| OpenError::InvalidConfig(format!("Invalid string {:?}: {}", value, e)))
}

fn error_string(ret: c_int) -> String {
    ffmpeg::Error::from(ret).to_string()
}

/// Map an `avformat_open_input` failure; a source that does not exist
/// (missing path, HTTP 404) is `NotFound` for every media type
fn open_failure(url: &str, ret: c_int) -> OpenError {
    match ffmpeg::Error::from(ret) {
        ffmpeg::Error::HttpNotFound => OpenError::NotFound(url.to_string()),
        ffmpeg::Error::Other { errno } if errno == ffmpeg::error::ENOENT => OpenError::NotFound(url.to_string()),
        err => OpenError::Backend(format!("Failed to open {}: {}", url, err)),
    }
}

/// Owned decoder context
struct CodecContext(*mut ffi::AVCodecContext);

impl Drop for CodecContext {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { ffi::avcodec_free_context(&mut self.0) };
        }
    }
}

/// Owned decoded picture in the decoder's native pixel format
pub struct NativeFrame(*mut ffi::AVFrame);

// SAFETY: an AVFrame has no thread affinity; ownership moves with the value.
unsafe impl Send for NativeFrame {}

impl NativeFrame {
    fn alloc() -> Result<Self, FatalError> {
        let frame = unsafe { ffi::av_frame_alloc() };
        if frame.is_null() {
            return Err(FatalError::Allocation {
                bytes: std::mem::size_of::<ffi::AVFrame>(),
            });
        }
        Ok(Self(frame))
    }

    pub fn width(&self) -> i32 {
        unsafe { (*self.0).width }
    }

    pub fn height(&self) -> i32 {
        unsafe { (*self.0).height }
    }

    /// Pixel format the picture was actually produced in; `None` if unset
    pub fn pixel_format(&self) -> Option<ffi::AVPixelFormat> {
        let raw = unsafe { (*self.0).format };
        if raw < 0 {
            return None;
        }
        // SAFETY: a non-negative `format` on a video frame is an AVPixelFormat value
        Some(unsafe { std::mem::transmute::<c_int, ffi::AVPixelFormat>(raw) })
    }
}

impl Drop for NativeFrame {
    fn drop(&mut self) {
        unsafe { ffi::av_frame_free(&mut self.0) };
    }
}

/// swscale context cached for one input geometry and output layout
struct Scaler {
    ctx: *mut ffi::SwsContext,
    width: i32,
    height: i32,
    format: ffi::AVPixelFormat,
    layout: PixelLayout,
}

impl Scaler {
    fn matches(&self, width: i32, height: i32, format: ffi::AVPixelFormat, layout: PixelLayout) -> bool {
        self.width == width && self.height == height && self.format == format && self.layout == layout
    }
}

impl Drop for Scaler {
    fn drop(&mut self) {
        unsafe { ffi::sws_freeContext(self.ctx) };
    }
}

fn target_format(layout: PixelLayout) -> ffi::AVPixelFormat {
    match layout {
        PixelLayout::PlanarYuv420 => ffi::AVPixelFormat::AV_PIX_FMT_YUV420P,
        PixelLayout::PackedBgr24 => ffi::AVPixelFormat::AV_PIX_FMT_BGR24,
    }
}

/// Open container, selected video stream, decoder and converter
pub struct FfmpegSource {
    format_ctx: *mut ffi::AVFormatContext,
    codec: Option<CodecContext>,
    packet: *mut ffi::AVPacket,
    scaler: Option<Scaler>,
    stream_index: usize,
    time_base: (i32, i32),
    start_time: i64, // stream ticks, 0 when unknown
    probe: ProbeInfo,
    draining: bool,
    drained: bool,
    guard: Arc<IoGuard>, // referenced by the interrupt callback; dropped last
}

// SAFETY: the FFmpeg contexts are only ever touched by the thread that owns
// the source; the session is moved between threads, never shared.
unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    fn codec_ptr(&self) -> Result<*mut ffi::AVCodecContext, DecodeError> {
        self.codec
            .as_ref()
            .map(|c| c.0)
            .ok_or_else(|| FatalError::Decoder("source is closed".to_string()).into())
    }

    /// The I/O context reported end of file
    fn eof_reached(&self) -> bool {
        unsafe {
            let pb = (*self.format_ctx).pb;
            !pb.is_null() && (*pb).eof_reached != 0
        }
    }

    unsafe fn open_input(
        request: &OpenRequest,
        guard: &Arc<IoGuard>,
    ) -> Result<*mut ffi::AVFormatContext, OpenError> {
        let input = resolve_input(request);
        let url = cstring(&input.url)?;

        let mut format_ctx = ffi::avformat_alloc_context();
        if format_ctx.is_null() {
            return Err(OpenError::Backend("Failed to allocate format context".to_string()));
        }
        (*format_ctx).interrupt_callback.callback = Some(interrupt_callback);
        (*format_ctx).interrupt_callback.opaque = Arc::as_ptr(guard) as *mut c_void;

        let mut input_format: *const ffi::AVInputFormat = ptr::null();
        if let Some(driver) = input.driver {
            let name = cstring(driver)?;
            input_format = ffi::av_find_input_format(name.as_ptr());
            if input_format.is_null() {
                ffi::avformat_free_context(format_ctx);
                return Err(OpenError::Backend(format!("Input driver {} unavailable", driver)));
            }
        }

        let mut options: *mut ffi::AVDictionary = ptr::null_mut();
        for (key, value) in &input.options {
            let key = cstring(key)?;
            let value = cstring(value)?;
            ffi::av_dict_set(&mut options, key.as_ptr(), value.as_ptr(), 0);
        }

        guard.arm();
        let ret = ffi::avformat_open_input(&mut format_ctx, url.as_ptr(), input_format, &mut options);
        let aborted = guard.check();
        guard.disarm();
        ffi::av_dict_free(&mut options);

        // avformat_open_input frees the context on failure
        if ret < 0 {
            if let Some(reason) = aborted {
                return Err(OpenError::Interrupted(reason));
            }
            return Err(open_failure(&input.url, ret));
        }

        guard.arm();
        let ret = ffi::avformat_find_stream_info(format_ctx, ptr::null_mut());
        let aborted = guard.check();
        guard.disarm();
        if ret < 0 {
            ffi::avformat_close_input(&mut format_ctx);
            if let Some(reason) = aborted {
                return Err(OpenError::Interrupted(reason));
            }
            return Err(OpenError::Backend(format!("Failed to find stream info: {}", error_string(ret))));
        }

        Ok(format_ctx)
    }

    unsafe fn open_codec(
        candidate: &DecoderCandidate,
        codecpar: *const ffi::AVCodecParameters,
    ) -> Result<CodecContext, String> {
        let codec = match candidate {
            DecoderCandidate::Named(name) => {
                let name = CString::new(name.as_str()).map_err(|e| e.to_string())?;
                ffi::avcodec_find_decoder_by_name(name.as_ptr())
            }
            DecoderCandidate::Generic => ffi::avcodec_find_decoder((*codecpar).codec_id),
        };
        if codec.is_null() {
            return Err("not installed".to_string());
        }

        let ctx = CodecContext(ffi::avcodec_alloc_context3(codec));
        if ctx.0.is_null() {
            return Err("failed to allocate codec context".to_string());
        }
        let ret = ffi::avcodec_parameters_to_context(ctx.0, codecpar);
        if ret < 0 {
            return Err(error_string(ret));
        }
        let ret = ffi::avcodec_open2(ctx.0, codec, ptr::null_mut());
        if ret < 0 {
            return Err(error_string(ret));
        }
        Ok(ctx)
    }

    /// Pull every picture the decoder is ready to emit
    fn receive_frames(&self, codec: *mut ffi::AVCodecContext) -> Result<Vec<NativeFrame>, DecodeError> {
        let mut pictures = Vec::new();
        loop {
            let frame = NativeFrame::alloc()?;
            let ret = unsafe { ffi::avcodec_receive_frame(codec, frame.0) };
            if ret >= 0 {
                pictures.push(frame);
                continue;
            }
            match ffmpeg::Error::from(ret) {
                ffmpeg::Error::Eof => break,
                ffmpeg::Error::Other { errno } if errno == ffmpeg::error::EAGAIN => break,
                e => return Err(DecodeError::Transient(format!("receive_frame: {}", e))),
            }
        }
        Ok(pictures)
    }

    /// Signal end of input to the decoder and collect what it still holds
    fn drain(&mut self, codec: *mut ffi::AVCodecContext) -> Result<Option<Vec<NativeFrame>>, DecodeError> {
        if self.drained {
            return Ok(None);
        }
        if !self.draining {
            self.draining = true;
            unsafe { ffi::avcodec_send_packet(codec, ptr::null()) };
            tracing::debug!("End of stream reached, draining decoder");
        }
        let pictures = self.receive_frames(codec)?;
        self.drained = true;
        Ok(if pictures.is_empty() { None } else { Some(pictures) })
    }
}

impl Source for FfmpegSource {
    type Picture = NativeFrame;

    fn initialize() -> Result<(), OpenError> {
        init_runtime()
    }

    fn open(request: &OpenRequest, guard: Arc<IoGuard>) -> Result<Self, OpenError> {
        init_runtime()?;
        if request.media_type == MediaType::File && !Path::new(&request.source).exists() {
            return Err(OpenError::NotFound(request.source.clone()));
        }

        let format_ctx = unsafe { Self::open_input(request, &guard)? };

        // Owns the format context from here; early returns close it in Drop
        let mut source = FfmpegSource {
            format_ctx,
            codec: None,
            packet: ptr::null_mut(),
            scaler: None,
            stream_index: 0,
            time_base: (0, 1),
            start_time: 0,
            probe: ProbeInfo::default(),
            draining: false,
            drained: false,
            guard,
        };

        unsafe {
            let nb_streams = (*format_ctx).nb_streams as usize;
            let stream = (0..nb_streams)
                .map(|i| (i, *(*format_ctx).streams.add(i)))
                .find(|(_, s)| (*(**s).codecpar).codec_type == ffi::AVMediaType::AVMEDIA_TYPE_VIDEO);
            let (stream_index, stream) = stream.ok_or(OpenError::NoVideoStream)?;
            let codecpar = (*stream).codecpar;

            let width = (*codecpar).width;
            let height = (*codecpar).height;
            if width <= 0 || height <= 0 {
                return Err(OpenError::InvalidDimensions { width, height });
            }

            let codec_name = {
                let name = ffi::avcodec_get_name((*codecpar).codec_id);
                if name.is_null() {
                    "unknown".to_string()
                } else {
                    CStr::from_ptr(name).to_string_lossy().into_owned()
                }
            };

            let candidates = request.decode_preference.candidates(&codec_name);
            let selected = select_decoder(&codec_name, &candidates, |candidate| {
                Self::open_codec(candidate, codecpar)
            })?;

            let fps = [(*stream).avg_frame_rate, (*stream).r_frame_rate]
                .iter()
                .find(|r| r.num > 0 && r.den > 0)
                .map(|r| r.num as f64 / r.den as f64)
                .unwrap_or(DEFAULT_FPS);

            let duration = (*format_ctx).duration;
            let duration_ms = if duration > 0 && duration != ffi::AV_NOPTS_VALUE {
                time::micros_to_millis(duration)
            } else {
                0
            };

            let pixel_format = {
                let name = ffi::av_get_pix_fmt_name((*selected.decoder.0).pix_fmt);
                if name.is_null() {
                    "unknown".to_string()
                } else {
                    CStr::from_ptr(name).to_string_lossy().into_owned()
                }
            };

            let packet = ffi::av_packet_alloc();
            if packet.is_null() {
                return Err(OpenError::Backend("Failed to allocate packet".to_string()));
            }

            let time_base = (*stream).time_base;
            let start_time = (*stream).start_time;

            source.packet = packet;
            source.codec = Some(selected.decoder);
            source.stream_index = stream_index;
            source.time_base = (time_base.num, time_base.den);
            source.start_time = if start_time == ffi::AV_NOPTS_VALUE { 0 } else { start_time };
            source.probe = ProbeInfo {
                stream_index,
                width: width as u32,
                height: height as u32,
                fps,
                duration_ms,
                codec_name,
                decoder_name: selected.name,
                pixel_format,
            };
        }

        tracing::info!(
            "Opened {}: {}x{} @ {:.2}fps, duration {}, decoder {} ({})",
            request.source,
            source.probe.width,
            source.probe.height,
            source.probe.fps,
            time::format_time(source.probe.duration_ms),
            source.probe.decoder_name,
            source.probe.pixel_format
        );
        Ok(source)
    }

    fn probe(&self) -> &ProbeInfo {
        &self.probe
    }

    fn read_and_decode_one(&mut self) -> Result<Option<Vec<NativeFrame>>, DecodeError> {
        let codec = self.codec_ptr()?;
        if self.draining {
            return self.drain(codec);
        }

        loop {
            self.guard.arm();
            let ret = unsafe { ffi::av_read_frame(self.format_ctx, self.packet) };
            let aborted = self.guard.check();
            self.guard.disarm();

            if ret < 0 {
                return match ffmpeg::Error::from(ret) {
                    ffmpeg::Error::Eof => self.drain(codec),
                    ffmpeg::Error::Exit => Err(FatalError::Interrupted(aborted.unwrap_or(AbortReason::Timeout)).into()),
                    _ if self.eof_reached() => self.drain(codec),
                    _ if aborted.is_some() => Err(FatalError::Interrupted(aborted.unwrap_or(AbortReason::Quit)).into()),
                    ffmpeg::Error::Other { errno } if errno == ffmpeg::error::EAGAIN => {
                        Err(DecodeError::Transient("read would block".to_string()))
                    }
                    e => Err(FatalError::Io(e.to_string()).into()),
                };
            }

            let stream_index = unsafe { (*self.packet).stream_index };
            if stream_index != self.stream_index as c_int {
                unsafe { ffi::av_packet_unref(self.packet) };
                continue;
            }

            let ret = unsafe { ffi::avcodec_send_packet(codec, self.packet) };
            unsafe { ffi::av_packet_unref(self.packet) };
            if ret < 0 {
                match ffmpeg::Error::from(ret) {
                    ffmpeg::Error::Other { errno } if errno == ffmpeg::error::EAGAIN => {}
                    e => return Err(DecodeError::Transient(format!("send_packet: {}", e))),
                }
            }

            return self.receive_frames(codec).map(Some);
        }
    }

    fn picture_timestamp_ms(&self, picture: &NativeFrame) -> Option<Millis> {
        let raw = unsafe {
            let frame = picture.0;
            [(*frame).best_effort_timestamp, (*frame).pts, (*frame).pkt_dts]
        };
        let ticks = raw.into_iter().find(|t| *t != ffi::AV_NOPTS_VALUE)?;
        let (num, den) = self.time_base;
        Some(time::ticks_to_millis(ticks - self.start_time, num, den))
    }

    fn convert(&mut self, picture: &NativeFrame, layout: PixelLayout) -> Result<DecodedFrame, DecodeError> {
        let codec = self.codec_ptr()?;
        let width = picture.width();
        let height = picture.height();
        if width <= 0 || height <= 0 {
            return Err(DecodeError::Transient(format!("picture has no geometry ({}x{})", width, height)));
        }
        // the frame's own format wins; it can differ from the context's
        // after a mid-stream change or with hardware decoders
        let format = picture.pixel_format().unwrap_or(unsafe { (*codec).pix_fmt });

        let rebuild = self
            .scaler
            .as_ref()
            .map_or(true, |s| !s.matches(width, height, format, layout));
        if rebuild {
            self.scaler = None;
            let ctx = unsafe {
                ffi::sws_getContext(
                    width,
                    height,
                    format,
                    width,
                    height,
                    target_format(layout),
                    ffi::SWS_BILINEAR as c_int,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null(),
                )
            };
            if ctx.is_null() {
                return Err(FatalError::Decoder(format!("No converter from {:?} to {}", format, layout.name())).into());
            }
            tracing::debug!("Created converter {}x{} {:?} -> {}", width, height, format, layout.name());
            self.scaler = Some(Scaler {
                ctx,
                width,
                height,
                format,
                layout,
            });
        }
        let scaler = self
            .scaler
            .as_ref()
            .ok_or_else(|| FatalError::Decoder("converter missing".to_string()))?;

        let (w, h) = (width as u32, height as u32);
        let mut frame = DecodedFrame::allocate(layout, w, h, 0)?;
        let strides = layout.strides(w);
        let sizes = layout.plane_sizes(w, h);

        let mut dst: [*mut u8; 4] = [ptr::null_mut(); 4];
        let mut dst_stride: [c_int; 4] = [0; 4];
        let base = frame.data_mut().as_mut_ptr();
        let mut offset = 0;
        for plane in 0..layout.plane_count() {
            // SAFETY: offsets stay inside the buffer sized by plane_sizes
            dst[plane] = unsafe { base.add(offset) };
            dst_stride[plane] = strides[plane] as c_int;
            offset += sizes[plane];
        }

        let ret = unsafe {
            let src = picture.0;
            ffi::sws_scale(
                scaler.ctx,
                (*src).data.as_ptr() as *const *const u8,
                (*src).linesize.as_ptr(),
                0,
                height,
                dst.as_ptr(),
                dst_stride.as_ptr(),
            )
        };
        if ret <= 0 {
            return Err(DecodeError::Transient(format!("sws_scale: {}", error_string(ret))));
        }
        Ok(frame)
    }

    fn seek(&mut self, timestamp_ms: Millis) -> Result<(), SeekError> {
        let codec = self.codec_ptr().map_err(|e| SeekError::Failed {
            target_ms: timestamp_ms,
            reason: e.to_string(),
        })?;
        let (num, den) = self.time_base;
        let target = time::millis_to_ticks(timestamp_ms, num, den) + self.start_time;

        self.guard.arm();
        let ret = unsafe {
            ffi::av_seek_frame(
                self.format_ctx,
                self.stream_index as c_int,
                target,
                ffi::AVSEEK_FLAG_BACKWARD as c_int,
            )
        };
        self.guard.disarm();
        if ret < 0 {
            return Err(SeekError::Failed {
                target_ms: timestamp_ms,
                reason: error_string(ret),
            });
        }

        unsafe { ffi::avcodec_flush_buffers(codec) };
        self.draining = false;
        self.drained = false;
        tracing::debug!("Seeked to {} (stream ticks {})", time::format_time(timestamp_ms), target);
        Ok(())
    }

    fn close(&mut self) {
        self.scaler = None;
        self.codec = None;
        unsafe {
            if !self.packet.is_null() {
                ffi::av_packet_free(&mut self.packet);
            }
            if !self.format_ctx.is_null() {
                ffi::avformat_close_input(&mut self.format_ctx);
            }
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}
