//! Putting subtitles into the video: a selectable track or burned into frames.

use crate::config::{AppConfig, BurnStyle, EncodeProfile, FfmpegConfig, SubtitleConfig};
use crate::error::JobError;
use crate::supervisor::{ProcessSupervisor, ProgressSample, SupervisedCommand};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[async_trait]
pub trait SubtitleTranscoder: Send + Sync {
    /// Add `subtitle` as a default subtitle track, streams copied
    async fn embed(
        &self,
        video: &Path,
        subtitle: &Path,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError>;

    /// Render `subtitle` into the picture, full re-encode
    #[allow(clippy::too_many_arguments)]
    async fn burn(
        &self,
        video: &Path,
        subtitle: &Path,
        out_dir: &Path,
        style: &BurnStyle,
        duration_hint: f64,
        on_progress: &mut (dyn FnMut(ProgressSample) + Send),
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError>;
}

/// Subtitle stage backed by ffmpeg and the process supervisor
pub struct FfmpegSubtitles {
    supervisor: ProcessSupervisor,
    ffmpeg: FfmpegConfig,
    profile: EncodeProfile,
    subtitle: SubtitleConfig,
}

impl FfmpegSubtitles {
    pub fn new(supervisor: ProcessSupervisor, config: &AppConfig) -> Self {
        Self {
            supervisor,
            ffmpeg: config.ffmpeg.clone(),
            profile: config.encode_profile(),
            subtitle: config.subtitle.clone(),
        }
    }

    pub fn soft_command(&self, video: &Path, subtitle: &Path, out_dir: &Path) -> SupervisedCommand {
        let output = out_dir.join(format!("{}_subtitled.mp4", stem(video)));
        SupervisedCommand::new(&self.ffmpeg.ffmpeg, "soft subtitles")
            .args(["-y", "-nostdin", "-i"])
            .arg(video.to_string_lossy())
            .arg("-i")
            .arg(subtitle.to_string_lossy())
            .args([
                "-map", "0:v", "-map", "0:a?", "-map", "1:0", "-c:v", "copy", "-c:a", "copy", "-c:s",
            ])
            .arg(&self.subtitle.codec)
            .arg("-metadata:s:s:0")
            .arg(format!("language={}", self.subtitle.language))
            .arg("-metadata:s:s:0")
            .arg(format!("title={}", self.subtitle.title))
            .args(["-disposition:s:0", "default"])
            .arg(output.to_string_lossy())
            .output(output)
    }

    pub fn burn_command(
        &self,
        video: &Path,
        subtitle: &Path,
        out_dir: &Path,
        style: &BurnStyle,
    ) -> SupervisedCommand {
        let output = out_dir.join(format!("{}_hardsubbed.mp4", stem(video)));
        let filter = format!(
            "subtitles='{}':force_style='{}'",
            escape_filter_path(subtitle),
            style.force_style()
        );

        let mut command = SupervisedCommand::new(&self.ffmpeg.ffmpeg, "burn subtitles")
            .args(["-y", "-nostdin", "-i"])
            .arg(video.to_string_lossy())
            .arg("-vf")
            .arg(filter)
            .arg("-c:v")
            .arg(&self.ffmpeg.video_codec)
            .arg("-preset")
            .arg(&self.profile.preset)
            .arg("-crf")
            .arg(self.profile.crf.to_string())
            .arg("-pix_fmt")
            .arg(&self.ffmpeg.pixel_format);
        if self.profile.threads > 0 {
            command = command.arg("-threads").arg(self.profile.threads.to_string());
        }
        command
            .args(["-c:a", "copy"])
            .arg(output.to_string_lossy())
            .output(output)
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "video".to_string())
}

/// Path as a single-quoted argument of the ffmpeg `subtitles` filter.
/// A quote cannot appear inside quotes, so it closes the quoted run, is
/// escaped on its own and reopens it.
pub fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .replace(':', "\\:")
        .replace('\'', "'\\''")
}

/// Subtitle file must exist and have content
fn validate_subtitle(subtitle: &Path) -> Result<(), JobError> {
    match std::fs::metadata(subtitle) {
        Ok(m) if m.len() > 0 => Ok(()),
        Ok(_) => Err(JobError::subtitle(format!(
            "Subtitle file is empty: {}",
            subtitle.display()
        ))),
        Err(e) => Err(JobError::subtitle(format!(
            "Subtitle file {}: {}",
            subtitle.display(),
            e
        ))),
    }
}

#[async_trait]
impl SubtitleTranscoder for FfmpegSubtitles {
    async fn embed(
        &self,
        video: &Path,
        subtitle: &Path,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        validate_subtitle(subtitle)?;
        let command = self.soft_command(video, subtitle, out_dir);
        info!("Embedding soft subtitles into {}", video.display());

        self.supervisor
            .run(&command, 0.0, |_| {}, cancel)
            .await
            .map_err(JobError::from_subtitle_process)?;

        command
            .output
            .ok_or_else(|| JobError::subtitle("No output path for soft subtitles"))
    }

    async fn burn(
        &self,
        video: &Path,
        subtitle: &Path,
        out_dir: &Path,
        style: &BurnStyle,
        duration_hint: f64,
        on_progress: &mut (dyn FnMut(ProgressSample) + Send),
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        validate_subtitle(subtitle)?;
        let command = self.burn_command(video, subtitle, out_dir, style);
        info!(
            "Burning subtitles into {}, this re-encodes the whole video",
            video.display()
        );

        self.supervisor
            .run(&command, duration_hint, |sample| on_progress(sample), cancel)
            .await
            .map_err(JobError::from_subtitle_process)?;

        command
            .output
            .ok_or_else(|| JobError::subtitle("No output path for burned subtitles"))
    }
}
