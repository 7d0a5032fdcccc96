//! Millisecond timestamps and time-base arithmetic.
//! All public timestamps in the pipeline are milliseconds (i64); containers
//! express time in rational stream ticks which are converted here.

/// Time in milliseconds since the start of the stream
pub type Millis = i64;

/// Time constants for conversions
pub mod constants {
    use super::Millis;

    pub const MILLIS_PER_SECOND: Millis = 1_000;
    pub const MICROS_PER_MILLI: i64 = 1_000;
    /// Internal time base of the codec library (microseconds)
    pub const AV_TIME_BASE: i64 = 1_000_000;
}

/// Convert stream ticks to milliseconds.
/// A tick is `num/den` seconds: `ms = ticks * num * 1000 / den`
#[inline]
pub fn ticks_to_millis(ticks: i64, num: i32, den: i32) -> Millis {
    if den == 0 {
        return 0;
    }
    // i128 avoids overflow for 90kHz time bases on long streams
    let result = (ticks as i128 * num as i128 * constants::MILLIS_PER_SECOND as i128) / den as i128;
    result as Millis
}

/// Convert milliseconds to stream ticks (reverse of [`ticks_to_millis`])
#[inline]
pub fn millis_to_ticks(millis: Millis, num: i32, den: i32) -> i64 {
    if num == 0 {
        return 0;
    }
    let result = (millis as i128 * den as i128) / (num as i128 * constants::MILLIS_PER_SECOND as i128);
    result as i64
}

/// Convert an AV_TIME_BASE (microsecond) duration to milliseconds
#[inline]
pub fn micros_to_millis(micros: i64) -> Millis {
    micros / constants::MICROS_PER_MILLI
}

/// Convert seconds (f64) to milliseconds
#[inline]
pub fn from_seconds(seconds: f64) -> Millis {
    (seconds * constants::MILLIS_PER_SECOND as f64).round() as Millis
}

/// Convert milliseconds to seconds (f64)
#[inline]
pub fn to_seconds(millis: Millis) -> f64 {
    millis as f64 / constants::MILLIS_PER_SECOND as f64
}

/// Timestamp of frame `index` at a constant frame rate
#[inline]
pub fn frame_timestamp(index: u64, fps: f64) -> Millis {
    if fps <= 0.0 {
        return 0;
    }
    (index as f64 * constants::MILLIS_PER_SECOND as f64 / fps).round() as Millis
}

/// Nominal distance between two frames, at least 1ms
#[inline]
pub fn frame_interval(fps: f64) -> Millis {
    if fps <= 0.0 || !fps.is_finite() {
        return 1;
    }
    ((constants::MILLIS_PER_SECOND as f64 / fps).round() as Millis).max(1)
}

/// Clamp a requested position into `[0, duration]`.
/// An unknown duration (0) only clamps the lower bound.
#[inline]
pub fn clamp_to_duration(millis: Millis, duration: Millis) -> Millis {
    if duration > 0 {
        millis.clamp(0, duration)
    } else {
        millis.max(0)
    }
}

/// Format time as HH:MM:SS.mmm
pub fn format_time(millis: Millis) -> String {
    let sign = if millis < 0 { "-" } else { "" };
    let millis = millis.unsigned_abs();
    let hours = millis / 3_600_000;
    let minutes = (millis % 3_600_000) / 60_000;
    let seconds = (millis % 60_000) / 1_000;
    let rest = millis % 1_000;

    format!("{}{:02}:{:02}:{:02}.{:03}", sign, hours, minutes, seconds, rest)
}
