use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Working directories and the persisted job state file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub downloads: PathBuf,
    pub processing: PathBuf,
    pub outputs: PathBuf,
    pub logs: PathBuf,
    /// Defaults to `<logs>/jobs_state.json` when unset
    pub state_file: Option<PathBuf>,
}

impl PathsConfig {
    pub fn state_file(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.logs.join("jobs_state.json"))
    }

    pub fn thumbnails(&self) -> PathBuf {
        self.outputs.join("thumbnails")
    }

    pub fn all(&self) -> [&PathBuf; 4] {
        [&self.downloads, &self.processing, &self.outputs, &self.logs]
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("subforge");
        Self {
            downloads: base.join("downloads"),
            processing: base.join("processing"),
            outputs: base.join("outputs"),
            logs: base.join("logs"),
            state_file: None,
        }
    }
}

/// Target rendition settings for one named resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionPreset {
    pub height: u32,
    pub video_bitrate: String,
    pub audio_bitrate: String,
}

impl ResolutionPreset {
    fn new(height: u32, video_bitrate: &str, audio_bitrate: &str) -> Self {
        Self {
            height,
            video_bitrate: video_bitrate.to_string(),
            audio_bitrate: audio_bitrate.to_string(),
        }
    }

    /// Rate-control buffer size, twice the video bitrate
    pub fn buffer_size(&self) -> String {
        let digits: String = self
            .video_bitrate
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let suffix = &self.video_bitrate[digits.len()..];
        match digits.parse::<u64>() {
            Ok(value) => format!("{}{}", value * 2, suffix),
            Err(_) => self.video_bitrate.clone(),
        }
    }
}

pub fn default_resolutions() -> BTreeMap<String, ResolutionPreset> {
    BTreeMap::from([
        ("360p".to_string(), ResolutionPreset::new(360, "500k", "96k")),
        ("480p".to_string(), ResolutionPreset::new(480, "1000k", "128k")),
        ("720p".to_string(), ResolutionPreset::new(720, "2500k", "192k")),
        ("1080p".to_string(), ResolutionPreset::new(1080, "5000k", "192k")),
    ])
}

/// External encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub preset: String,
    /// Constant Rate Factor (0-51, lower = better quality)
    pub crf: u8,
    pub pixel_format: String,
    /// 0 = let the encoder decide
    pub threads: u32,
    /// Trade quality for a smaller memory footprint, see [`EncodeProfile`]
    pub low_memory: bool,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            preset: "medium".to_string(),
            crf: 23,
            pixel_format: "yuv420p".to_string(),
            threads: 0,
            low_memory: false,
        }
    }
}

/// Encoder knobs handed to every encode and burn invocation.
///
/// Low-memory mode switches to the `veryfast` preset, a single encoder
/// thread and a CRF two steps higher (capped at 51).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeProfile {
    pub preset: String,
    pub crf: u8,
    pub threads: u32,
}

impl EncodeProfile {
    pub fn resolve(config: &FfmpegConfig) -> Self {
        if config.low_memory {
            Self {
                preset: "veryfast".to_string(),
                crf: config.crf.saturating_add(2).min(51),
                threads: 1,
            }
        } else {
            Self {
                preset: config.preset.clone(),
                crf: config.crf,
                threads: config.threads,
            }
        }
    }
}

/// Styling for hard-burned subtitles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BurnStyle {
    pub font_name: String,
    pub font_size: u32,
    /// ASS colour, `&HBBGGRR`
    pub primary_colour: String,
    pub outline_colour: String,
    pub bold: bool,
}

impl BurnStyle {
    /// `force_style` argument for the ffmpeg `subtitles` filter
    pub fn force_style(&self) -> String {
        format!(
            "FontName={},FontSize={},PrimaryColour={},OutlineColour={},Bold={}",
            self.font_name,
            self.font_size,
            self.primary_colour,
            self.outline_colour,
            if self.bold { 1 } else { 0 }
        )
    }
}

impl Default for BurnStyle {
    fn default() -> Self {
        Self {
            font_name: "Arial".to_string(),
            font_size: 24,
            primary_colour: "&HFFFFFF".to_string(),
            outline_colour: "&H000000".to_string(),
            bold: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleConfig {
    /// Used when a submission does not choose a mode
    pub soft_by_default: bool,
    /// Subtitle codec for soft embedding into MP4
    pub codec: String,
    pub language: String,
    pub title: String,
    pub style: BurnStyle,
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            soft_by_default: true,
            codec: "mov_text".to_string(),
            language: "eng".to_string(),
            title: "English".to_string(),
            style: BurnStyle::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// First retry delay, doubled on every further attempt
    pub backoff_ms: u64,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            backoff_ms: 500,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Concurrent resolution encodes within one job (1 = sequential)
    pub encode_workers: usize,
    pub cleanup_temp_files: bool,
    pub keep_original_files: bool,
    /// Wait between graceful termination and force kill
    pub grace_period_ms: u64,
    pub thumbnail_offsets: Vec<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            encode_workers: 1,
            cleanup_temp_files: true,
            keep_original_files: true,
            grace_period_ms: 500,
            thumbnail_offsets: vec![
                "00:00:10".to_string(),
                "00:01:00".to_string(),
                "00:02:00".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_size_doubles_bitrate() {
        let preset = ResolutionPreset::new(720, "2500k", "192k");
        assert_eq!(preset.buffer_size(), "5000k");
    }

    #[test]
    fn test_low_memory_profile() {
        let config = FfmpegConfig {
            low_memory: true,
            crf: 50,
            ..Default::default()
        };
        let profile = EncodeProfile::resolve(&config);
        assert_eq!(profile.preset, "veryfast");
        assert_eq!(profile.threads, 1);
        assert_eq!(profile.crf, 51);

        let normal = EncodeProfile::resolve(&FfmpegConfig::default());
        assert_eq!(normal.preset, "medium");
        assert_eq!(normal.crf, 23);
        assert_eq!(normal.threads, 0);
    }

    #[test]
    fn test_force_style() {
        let style = BurnStyle::default();
        assert_eq!(
            style.force_style(),
            "FontName=Arial,FontSize=24,PrimaryColour=&HFFFFFF,OutlineColour=&H000000,Bold=0"
        );
    }
}
