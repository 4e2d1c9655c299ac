//! Progress-line grammar for the external encode tool.
//!
//! A progress line carries an elapsed-time marker `time=HH:MM:SS.cc`,
//! optionally followed by a `speed=<factor>x` field. Anything else is
//! not a progress line and is ignored.

use regex::Regex;
use std::sync::LazyLock;

static TIME_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=\s*(\d+):([0-5]\d):([0-5]\d(?:\.\d+)?)").expect("time marker regex")
});

static SPEED_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*(\d+(?:\.\d+)?)x").expect("speed marker regex"));

/// Fields extracted from one progress line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressLine {
    /// Elapsed output time in seconds
    pub elapsed: f64,
    /// Encoding speed relative to realtime
    pub speed: Option<f64>,
}

/// Parse a line of tool output, `None` when it carries no elapsed marker
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let caps = TIME_MARKER.captures(line)?;
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;

    let speed = SPEED_MARKER
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|s| *s > 0.0);

    Some(ProgressLine {
        elapsed: hours * 3600.0 + minutes * 60.0 + seconds,
        speed,
    })
}

/// Whole percent of `duration` covered by `elapsed`, clamped to 0..=100.
/// `None` when the duration is unknown.
pub fn percentage(elapsed: f64, duration: f64) -> Option<u8> {
    if duration <= 0.0 || !duration.is_finite() {
        return None;
    }
    let percent = (elapsed / duration * 100.0).floor().clamp(0.0, 100.0);
    Some(percent as u8)
}

/// One progress observation handed to supervisor callers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub elapsed: f64,
    /// Duration hint the invocation was started with, 0 when unknown
    pub duration: f64,
    pub speed: Option<f64>,
}

impl ProgressSample {
    pub fn percentage(&self) -> Option<u8> {
        percentage(self.elapsed, self.duration)
    }

    /// Seconds left at the current speed
    pub fn eta(&self) -> Option<f64> {
        let speed = self.speed?;
        if self.duration <= 0.0 {
            return None;
        }
        Some(((self.duration - self.elapsed).max(0.0)) / speed)
    }
}
