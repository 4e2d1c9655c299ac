use crate::error::ProcessError;
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// What the pipeline needs to know about an input video
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    /// Seconds, 0 when unknown
    pub duration: f64,
}

impl MediaInfo {
    /// Width matching `height` at the source aspect ratio, rounded to even.
    /// `None` when the source dimensions are unknown.
    pub fn scaled_width(&self, height: u32) -> Option<u32> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let exact = self.width as f64 * height as f64 / self.height as f64;
        let even = ((exact / 2.0).round() as u32) * 2;
        Some(even.max(2))
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Parse `ffprobe -of json` output for the first video stream
pub fn parse_probe_output(json: &str) -> Result<MediaInfo, ProcessError> {
    let data: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| ProcessError::InvalidOutput(format!("ffprobe JSON: {}", e)))?;

    let stream = data
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| ProcessError::InvalidOutput("No video stream found".to_string()))?;

    let duration = data
        .format
        .and_then(|f| f.duration)
        .or(stream.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0);

    Ok(MediaInfo {
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        duration,
    })
}

/// Run ffprobe on `input`
pub async fn probe(ffprobe: &str, input: &Path) -> Result<MediaInfo, ProcessError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,duration",
            "-show_entries",
            "format=duration",
            "-of",
            "json",
        ])
        .arg(input)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ProcessError::Spawn {
            program: ffprobe.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(ProcessError::Exit {
            code: output.status.code().unwrap_or(-1),
            tail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let info = parse_probe_output(&String::from_utf8_lossy(&output.stdout))?;
    debug!(
        "Probed {}: {}x{}, {:.2}s",
        input.display(),
        info.width,
        info.height,
        info.duration
    );
    Ok(info)
}
