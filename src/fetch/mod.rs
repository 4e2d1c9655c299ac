//! Materializing video and subtitle sources on local disk.

use crate::config::DownloadConfig;
use crate::error::{AppError, JobError};
use crate::queue::SourceRef;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Url};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a fetched file is expected to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Video,
    Subtitle,
}

impl FetchKind {
    pub fn supported_extensions(self) -> &'static [&'static str] {
        match self {
            FetchKind::Video => &["mp4", "mkv", "avi", "mov", "flv", "webm"],
            FetchKind::Subtitle => &["srt", "ass", "vtt", "sub", "ssa"],
        }
    }

    pub fn default_extension(self) -> &'static str {
        match self {
            FetchKind::Video => "mp4",
            FetchKind::Subtitle => "srt",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FetchKind::Video => "video",
            FetchKind::Subtitle => "subtitle",
        }
    }

    pub fn accepts(self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.supported_extensions().contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
    }
}

/// Byte-level download progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    /// Bytes per second
    pub speed: f64,
    /// Seconds remaining
    pub eta: Option<f64>,
}

impl FetchProgress {
    pub fn percentage(&self) -> Option<u8> {
        let total = self.total.filter(|t| *t > 0)?;
        Some(((self.downloaded as f64 / total as f64) * 100.0).floor().min(100.0) as u8)
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Make `source` available as a local file under `destination`.
    async fn fetch(
        &self,
        source: &SourceRef,
        destination: &Path,
        kind: FetchKind,
        on_progress: &mut (dyn FnMut(FetchProgress) + Send),
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError>;
}

/// Cheap checks done at submission time, before any job exists
pub fn validate_source(source: &SourceRef, kind: FetchKind) -> Result<(), JobError> {
    match source {
        SourceRef::Url(raw) => {
            let url = parse_url(raw)?;
            file_name_for(&url, kind).map(|_| ())
        }
        SourceRef::Local(path) => validate_local(path, kind),
    }
}

fn parse_url(raw: &str) -> Result<Url, JobError> {
    let url = Url::parse(raw).map_err(|e| JobError::validation(format!("Invalid URL {}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(JobError::validation(format!("Unsupported URL: {}", raw)));
    }
    Ok(url)
}

/// File name safe to join onto a directory: ASCII alphanumerics, `.`, `-`
/// and `_` only, no leading dots, directory components dropped
pub fn sanitize_file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

/// Local file name for a download: last path segment with unsafe characters
/// replaced, default extension appended when missing
fn file_name_for(url: &Url, kind: FetchKind) -> Result<String, JobError> {
    let segment = url
        .path_segments()
        .and_then(|s| s.last())
        .unwrap_or_default();

    let mut name = sanitize_file_name(segment);

    if name.is_empty() {
        name = format!("{}_download", kind.label());
    }
    if Path::new(&name).extension().is_none() {
        name = format!("{}.{}", name, kind.default_extension());
    }

    if !kind.accepts(Path::new(&name)) {
        return Err(JobError::validation(format!(
            "Unsupported {} format: {} (expected one of {})",
            kind.label(),
            name,
            kind.supported_extensions().join(", ")
        )));
    }
    Ok(name)
}

fn validate_local(path: &Path, kind: FetchKind) -> Result<(), JobError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        JobError::validation(format!("{} file {}: {}", kind.label(), path.display(), e))
    })?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(JobError::validation(format!(
            "{} file {} is empty or not a file",
            kind.label(),
            path.display()
        )));
    }
    if !kind.accepts(path) {
        return Err(JobError::validation(format!(
            "Unsupported {} format: {}",
            kind.label(),
            path.display()
        )));
    }
    Ok(())
}

/// One attempt's failure
enum AttemptError {
    /// Worth another try
    Transient(String),
    Fatal(JobError),
}

/// HTTP(S) fetcher with bounded retries
pub struct HttpFetcher {
    client: Client,
    config: DownloadConfig,
}

impl HttpFetcher {
    pub fn new(config: &DownloadConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Delay before retry number `attempt` (0-based)
    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.backoff_ms.saturating_mul(1u64 << attempt.min(16)))
    }

    async fn download_once(
        &self,
        url: &Url,
        target: &Path,
        on_progress: &mut (dyn FnMut(FetchProgress) + Send),
        cancel: &CancellationToken,
    ) -> Result<(), AttemptError> {
        let chunk_timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let part = target.with_extension(format!(
            "{}.part",
            target.extension().and_then(|e| e.to_str()).unwrap_or_default()
        ));

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AttemptError::Fatal(JobError::Cancelled)),
            response = tokio::time::timeout(chunk_timeout, self.client.get(url.clone()).send()) => response,
        };
        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(AttemptError::Transient(e.to_string())),
            Err(_) => return Err(AttemptError::Transient("request timed out".to_string())),
        };
        if !response.status().is_success() {
            return Err(AttemptError::Transient(format!(
                "server returned {}",
                response.status()
            )));
        }

        let total = response.content_length().filter(|l| *l > 0);
        let mut file = tokio::fs::File::create(&part).await.map_err(|e| {
            AttemptError::Fatal(JobError::download(format!(
                "Failed to create {}: {}",
                part.display(),
                e
            )))
        })?;

        let started = Instant::now();
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        let outcome: Result<(), AttemptError> = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(AttemptError::Fatal(JobError::Cancelled)),
                next = tokio::time::timeout(chunk_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => break Err(AttemptError::Transient(e.to_string())),
                Ok(None) => break Ok(()),
                Err(_) => break Err(AttemptError::Transient("read timed out".to_string())),
            };

            if let Err(e) = file.write_all(&chunk).await {
                break Err(AttemptError::Fatal(JobError::download(format!(
                    "Failed to write {}: {}",
                    part.display(),
                    e
                ))));
            }
            downloaded += chunk.len() as u64;

            let secs = started.elapsed().as_secs_f64();
            let speed = if secs > 0.0 { downloaded as f64 / secs } else { 0.0 };
            let eta = total
                .filter(|_| speed > 0.0)
                .map(|t| t.saturating_sub(downloaded) as f64 / speed);
            on_progress(FetchProgress {
                downloaded,
                total,
                speed,
                eta,
            });
        };

        let outcome = match outcome {
            Ok(()) => match file.flush().await {
                Ok(()) => match total {
                    Some(expected) if expected != downloaded => Err(AttemptError::Transient(format!(
                        "incomplete download, expected {} bytes, got {}",
                        expected, downloaded
                    ))),
                    _ => Ok(()),
                },
                Err(e) => Err(AttemptError::Fatal(JobError::download(e.to_string()))),
            },
            Err(e) => Err(e),
        };
        drop(file);

        match outcome {
            Ok(()) => tokio::fs::rename(&part, target).await.map_err(|e| {
                AttemptError::Fatal(JobError::download(format!(
                    "Failed to move {} into place: {}",
                    part.display(),
                    e
                )))
            }),
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        source: &SourceRef,
        destination: &Path,
        kind: FetchKind,
        on_progress: &mut (dyn FnMut(FetchProgress) + Send),
        cancel: &CancellationToken,
    ) -> Result<PathBuf, JobError> {
        let raw = match source {
            SourceRef::Local(path) => {
                validate_local(path, kind)?;
                debug!("Using local {} {}", kind.label(), path.display());
                return Ok(path.clone());
            }
            SourceRef::Url(raw) => raw,
        };

        let url = parse_url(raw)?;
        let target = destination.join(file_name_for(&url, kind)?);
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| JobError::download(format!("Failed to create {}: {}", destination.display(), e)))?;

        info!("Downloading {} from {}", kind.label(), url);

        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            match self.download_once(&url, &target, on_progress, cancel).await {
                Ok(()) => {
                    info!("Downloaded {}", target.display());
                    return Ok(target);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(e)) => {
                    warn!(
                        "Download attempt {}/{} for {} failed: {}",
                        attempt + 1,
                        attempts,
                        url,
                        e
                    );
                    last_error = e;
                }
            }

            if attempt + 1 < attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(JobError::Cancelled),
                    _ = tokio::time::sleep(self.backoff(attempt)) => {}
                }
            }
        }

        Err(JobError::download(format!(
            "Failed to download {} after {} attempts: {}",
            url, attempts, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_for(&url("http://x/media/v.mp4"), FetchKind::Video).unwrap(),
            "v.mp4"
        );
        assert_eq!(
            file_name_for(&url("http://x/media/clip"), FetchKind::Video).unwrap(),
            "clip.mp4"
        );
        assert_eq!(
            file_name_for(&url("http://x/"), FetchKind::Subtitle).unwrap(),
            "subtitle_download.srt"
        );
        assert_eq!(
            file_name_for(&url("http://x/my%20sub.vtt?x=1"), FetchKind::Subtitle).unwrap(),
            "my_20sub.vtt"
        );
    }

    #[test]
    fn test_sanitize_file_name_drops_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\subs\\ep 1.srt"), "ep_1.srt");
        assert_eq!(sanitize_file_name("..hidden.srt"), "hidden.srt");
        assert_eq!(sanitize_file_name("émission.srt"), "_mission.srt");
        assert_eq!(sanitize_file_name(".."), "");
    }

    #[test]
    fn test_unsupported_extension_is_validation_error() {
        let err = file_name_for(&url("http://x/v.exe"), FetchKind::Video).unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert!(file_name_for(&url("http://x/s.mp4"), FetchKind::Subtitle).is_err());
    }

    #[test]
    fn test_validate_source() {
        assert!(validate_source(&SourceRef::Url("ftp://x/v.mp4".into()), FetchKind::Video).is_err());
        assert!(validate_source(&SourceRef::Url("not a url".into()), FetchKind::Video).is_err());
        assert!(validate_source(&SourceRef::Url("https://x/v.MKV".into()), FetchKind::Video).is_ok());

        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.srt");
        std::fs::write(&empty, "").unwrap();
        let good = dir.path().join("good.srt");
        std::fs::write(&good, "1\n00:00:01,000 --> 00:00:02,000\nhi\n").unwrap();

        assert!(validate_source(&SourceRef::Local(empty), FetchKind::Subtitle).is_err());
        assert!(validate_source(&SourceRef::Local(good.clone()), FetchKind::Subtitle).is_ok());
        assert!(validate_source(&SourceRef::Local(good), FetchKind::Video).is_err());
        assert!(
            validate_source(
                &SourceRef::Local(dir.path().join("missing.mp4")),
                FetchKind::Video
            )
            .is_err()
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let fetcher = HttpFetcher::new(&DownloadConfig::default()).unwrap();
        assert_eq!(fetcher.backoff(0), Duration::from_millis(500));
        assert_eq!(fetcher.backoff(1), Duration::from_millis(1000));
        assert_eq!(fetcher.backoff(2), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_local_source_is_returned_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("v.mp4");
        std::fs::write(&video, b"data").unwrap();

        let fetcher = HttpFetcher::new(&DownloadConfig::default()).unwrap();
        let path = fetcher
            .fetch(
                &SourceRef::Local(video.clone()),
                dir.path(),
                FetchKind::Video,
                &mut |_: FetchProgress| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(path, video);
    }

    #[tokio::test]
    async fn test_unreachable_host_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let config = DownloadConfig {
            timeout_secs: 1,
            max_retries: 2,
            backoff_ms: 10,
            ..DownloadConfig::default()
        };
        let fetcher = HttpFetcher::new(&config).unwrap();
        let err = fetcher
            .fetch(
                &SourceRef::Url("http://127.0.0.1:9/v.mp4".into()),
                dir.path(),
                FetchKind::Video,
                &mut |_: FetchProgress| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Download(_)));
        assert!(!dir.path().join("v.mp4").exists());
        assert!(!dir.path().join("v.mp4.part").exists());
    }

    #[test]
    fn test_progress_percentage() {
        let progress = FetchProgress {
            downloaded: 512,
            total: Some(1024),
            speed: 1.0,
            eta: None,
        };
        assert_eq!(progress.percentage(), Some(50));
    }
}
