use super::probe::{MediaInfo, probe};
use super::MediaPlanner;
use crate::config::{AppConfig, EncodeProfile, FfmpegConfig, ResolutionPreset};
use crate::error::{JobError, ProcessError};
use crate::supervisor::SupervisedCommand;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Builds ffmpeg invocations for renditions and thumbnails
#[derive(Debug, Clone)]
pub struct FfmpegPlanner {
    ffmpeg: FfmpegConfig,
    profile: EncodeProfile,
    resolutions: BTreeMap<String, ResolutionPreset>,
    outputs: PathBuf,
    thumbnails: PathBuf,
    thumbnail_offsets: Vec<String>,
}

impl FfmpegPlanner {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            profile: config.encode_profile(),
            resolutions: config.resolutions.clone(),
            outputs: config.paths.outputs.clone(),
            thumbnails: config.paths.thumbnails(),
            thumbnail_offsets: config.processing.thumbnail_offsets.clone(),
        }
    }

    /// `<outputs>/<resolution>/<job_id>_<stem>_<resolution>.mp4`
    pub fn rendition_path(&self, job_id: &str, input: &Path, resolution: &str) -> PathBuf {
        self.outputs.join(resolution).join(format!(
            "{}_{}_{}.mp4",
            job_id,
            base_stem(input),
            resolution
        ))
    }

    /// `<thumbnails>/<job_id>_<stem>_thumb_<n>.jpg`
    pub fn thumbnail_path(&self, job_id: &str, input: &Path, n: usize) -> PathBuf {
        self.thumbnails
            .join(format!("{}_{}_thumb_{}.jpg", job_id, base_stem(input), n))
    }
}

/// Input stem without the intermediate `_subtitled`/`_hardsubbed` suffix
fn base_stem(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "video".to_string());
    stem.strip_suffix("_subtitled")
        .or_else(|| stem.strip_suffix("_hardsubbed"))
        .map(str::to_string)
        .unwrap_or(stem)
}

/// Build the ffmpeg arguments for one rendition
pub fn build_rendition_args(
    input: &Path,
    output: &Path,
    info: &MediaInfo,
    preset: &ResolutionPreset,
    ffmpeg: &FfmpegConfig,
    profile: &EncodeProfile,
) -> Vec<String> {
    let width = info
        .scaled_width(preset.height)
        .map(|w| w.to_string())
        .unwrap_or_else(|| "-2".to_string());

    let mut args = vec![
        "-y".to_string(),
        "-nostdin".to_string(),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        // Keep the embedded subtitle track when there is one
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "0:a?".to_string(),
        "-map".to_string(),
        "0:s?".to_string(),
        "-vf".to_string(),
        format!("scale={}:{}", width, preset.height),
        "-c:v".to_string(),
        ffmpeg.video_codec.clone(),
        "-preset".to_string(),
        profile.preset.clone(),
        "-crf".to_string(),
        profile.crf.to_string(),
        "-b:v".to_string(),
        preset.video_bitrate.clone(),
        "-maxrate".to_string(),
        preset.video_bitrate.clone(),
        "-bufsize".to_string(),
        preset.buffer_size(),
        "-c:a".to_string(),
        ffmpeg.audio_codec.clone(),
        "-b:a".to_string(),
        preset.audio_bitrate.clone(),
        "-ac".to_string(),
        "2".to_string(),
        "-c:s".to_string(),
        "mov_text".to_string(),
        "-pix_fmt".to_string(),
        ffmpeg.pixel_format.clone(),
        "-movflags".to_string(),
        "+faststart".to_string(),
    ];

    if profile.threads > 0 {
        args.extend(["-threads".to_string(), profile.threads.to_string()]);
    }

    args.push(output.to_string_lossy().to_string());
    args
}

/// Seconds from `HH:MM:SS[.ff]`, `MM:SS` or plain seconds
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let mut total = 0.0;
    for part in raw.trim().split(':') {
        let value: f64 = part.parse().ok()?;
        if value < 0.0 {
            return None;
        }
        total = total * 60.0 + value;
    }
    Some(total)
}

/// Offsets that fall inside `duration`, or the first frame when none do.
/// All configured offsets are kept when the duration is unknown.
pub fn thumbnail_offsets(configured: &[String], duration: f64) -> Vec<String> {
    let inside: Vec<String> = configured
        .iter()
        .filter(|o| match parse_timestamp(o) {
            Some(secs) => duration <= 0.0 || secs < duration,
            None => false,
        })
        .cloned()
        .collect();

    if inside.is_empty() {
        vec!["00:00:00".to_string()]
    } else {
        inside
    }
}

#[async_trait]
impl MediaPlanner for FfmpegPlanner {
    async fn probe(&self, input: &Path) -> Result<MediaInfo, ProcessError> {
        probe(&self.ffmpeg.ffprobe, input).await
    }

    fn rendition(
        &self,
        job_id: &str,
        input: &Path,
        info: &MediaInfo,
        resolution: &str,
    ) -> Result<SupervisedCommand, JobError> {
        let preset = self
            .resolutions
            .get(resolution)
            .ok_or_else(|| JobError::encoding(format!("Unknown resolution {}", resolution)))?;
        let output = self.rendition_path(job_id, input, resolution);
        let args = build_rendition_args(input, &output, info, preset, &self.ffmpeg, &self.profile);

        Ok(SupervisedCommand::new(&self.ffmpeg.ffmpeg, format!("encode {}", resolution))
            .args(args)
            .output(output))
    }

    fn thumbnails(&self, job_id: &str, input: &Path, info: &MediaInfo) -> Vec<SupervisedCommand> {
        thumbnail_offsets(&self.thumbnail_offsets, info.duration)
            .into_iter()
            .enumerate()
            .map(|(i, offset)| {
                let output = self.thumbnail_path(job_id, input, i + 1);
                SupervisedCommand::new(&self.ffmpeg.ffmpeg, format!("thumbnail {}", i + 1))
                    .args([
                        "-y".to_string(),
                        "-nostdin".to_string(),
                        "-ss".to_string(),
                        offset,
                        "-i".to_string(),
                        input.to_string_lossy().to_string(),
                        "-frames:v".to_string(),
                        "1".to_string(),
                        "-q:v".to_string(),
                        "2".to_string(),
                        output.to_string_lossy().to_string(),
                    ])
                    .output(output)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(root: &Path) -> FfmpegPlanner {
        FfmpegPlanner::new(&AppConfig::for_tests(root))
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_rendition_command() {
        let root = Path::new("/data");
        let planner = planner(root);
        let info = MediaInfo {
            width: 1920,
            height: 1080,
            duration: 120.0,
        };
        let cmd = planner
            .rendition("job1", Path::new("/tmp/movie_subtitled.mp4"), &info, "720p")
            .unwrap();

        assert_eq!(cmd.program, "ffmpeg");
        assert_eq!(
            cmd.output.as_deref(),
            Some(Path::new("/data/outputs/720p/job1_movie_720p.mp4"))
        );
        assert_eq!(value_after(&cmd.args, "-vf"), Some("scale=1280:720"));
        assert_eq!(value_after(&cmd.args, "-b:v"), Some("2500k"));
        assert_eq!(value_after(&cmd.args, "-bufsize"), Some("5000k"));
        assert_eq!(value_after(&cmd.args, "-crf"), Some("23"));
        assert!(!cmd.args.contains(&"-threads".to_string()));
        assert_eq!(
            cmd.args.last().map(String::as_str),
            Some("/data/outputs/720p/job1_movie_720p.mp4")
        );
    }

    #[test]
    fn test_low_memory_profile_reaches_command() {
        let mut config = AppConfig::for_tests(Path::new("/data"));
        config.ffmpeg.low_memory = true;
        let planner = FfmpegPlanner::new(&config);
        let cmd = planner
            .rendition("job1", Path::new("/tmp/a.mp4"), &MediaInfo::default(), "480p")
            .unwrap();

        assert_eq!(value_after(&cmd.args, "-preset"), Some("veryfast"));
        assert_eq!(value_after(&cmd.args, "-crf"), Some("25"));
        assert_eq!(value_after(&cmd.args, "-threads"), Some("1"));
        assert_eq!(value_after(&cmd.args, "-vf"), Some("scale=-2:480"));
    }

    #[test]
    fn test_unknown_resolution() {
        let planner = planner(Path::new("/data"));
        let err = planner
            .rendition("job1", Path::new("/tmp/a.mp4"), &MediaInfo::default(), "4320p")
            .unwrap_err();
        assert!(matches!(err, JobError::Encoding { .. }));
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:01:00"), Some(60.0));
        assert_eq!(parse_timestamp("01:00:10.5"), Some(3610.5));
        assert_eq!(parse_timestamp("42"), Some(42.0));
        assert_eq!(parse_timestamp("ab:cd"), None);
    }

    #[test]
    fn test_thumbnail_offsets_inside_duration() {
        let configured: Vec<String> = ["00:00:10", "00:01:00", "00:02:00"]
            .map(String::from)
            .to_vec();
        assert_eq!(thumbnail_offsets(&configured, 90.0), vec!["00:00:10", "00:01:00"]);
        assert_eq!(thumbnail_offsets(&configured, 5.0), vec!["00:00:00"]);
        assert_eq!(thumbnail_offsets(&configured, 0.0).len(), 3);
    }

    #[test]
    fn test_thumbnail_commands() {
        let planner = planner(Path::new("/data"));
        let info = MediaInfo {
            width: 640,
            height: 360,
            duration: 600.0,
        };
        let cmds = planner.thumbnails("job1", Path::new("/tmp/clip_hardsubbed.mp4"), &info);
        assert_eq!(cmds.len(), 3);
        assert_eq!(
            cmds[1].output.as_deref(),
            Some(Path::new("/data/outputs/thumbnails/job1_clip_thumb_2.jpg"))
        );
        assert_eq!(value_after(&cmds[1].args, "-ss"), Some("00:01:00"));
    }

    #[test]
    fn test_jobs_over_one_source_never_share_files() {
        let planner = planner(Path::new("/data"));
        let info = MediaInfo {
            width: 1920,
            height: 1080,
            duration: 600.0,
        };
        let input = Path::new("/data/processing/v_subtitled.mp4");

        let first = planner.rendition("job_a", input, &info, "720p").unwrap();
        let second = planner.rendition("job_b", input, &info, "720p").unwrap();
        assert_ne!(first.output, second.output);

        let first = planner.thumbnails("job_a", input, &info);
        let second = planner.thumbnails("job_b", input, &info);
        assert!(first.iter().all(|a| second.iter().all(|b| a.output != b.output)));
    }
}
