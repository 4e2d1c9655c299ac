use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::config::PathsConfig;
use crate::fetch::{FetchKind, sanitize_file_name};
use crate::queue::{Job, Rejected, SourceRef, SubmitRequest, SubtitleMode, SystemStatus, generate_job_id};
use axum::Json;
use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path as FsPath, PathBuf};
use tokio_util::io::ReaderStream;
use tracing::info;
use walkdir::WalkDir;

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub video_url: String,
    pub subtitle_url: String,
    #[serde(default)]
    pub resolutions: Vec<String>,
    /// Legacy flag, `subtitle_mode` wins when both are present
    #[serde(default)]
    pub soft_subtitle: Option<bool>,
    #[serde(default)]
    pub subtitle_mode: Option<SubtitleMode>,
}

impl SubmitBody {
    pub fn into_request(self) -> ApiResult<SubmitRequest> {
        let video = url_source("video_url", &self.video_url)?;
        let subtitle = url_source("subtitle_url", &self.subtitle_url)?;

        let subtitle_mode = self
            .subtitle_mode
            .or(self.soft_subtitle.map(SubtitleMode::from_soft_flag));

        Ok(SubmitRequest {
            video,
            subtitle,
            resolutions: self.resolutions,
            subtitle_mode,
            job_id: None,
        })
    }
}

/// Remote sources only; server-side files are never read on a client's say.
/// Subtitle files from the client arrive through `/api/submit_with_file`.
fn url_source(field: &str, raw: &str) -> ApiResult<SourceRef> {
    if raw.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{} is required", field)));
    }
    match SourceRef::parse(raw) {
        source @ SourceRef::Url(_) => Ok(source),
        SourceRef::Local(_) => Err(ApiError::bad_request(format!(
            "{} must be an http(s) URL",
            field
        ))),
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub job_id: String,
    pub message: String,
}

pub async fn submit(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<Json<SubmitResponse>> {
    let request = body.into_request()?;
    let job_id = state.scheduler.submit(request)?;
    Ok(Json(SubmitResponse {
        success: true,
        job_id,
        message: "Job submitted".to_string(),
    }))
}

/// Fields of the upload form, in whatever order the client sent them
#[derive(Default)]
struct UploadForm {
    video_url: Option<String>,
    subtitle: Option<(String, bytes::Bytes)>,
    resolutions: Option<String>,
    soft_subtitle: Option<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let invalid = |e: axum::extract::multipart::MultipartError| {
            ApiError::bad_request(format!("Invalid form data: {}", e))
        };

        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await.map_err(invalid)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "subtitle_file" => {
                    let name = field.file_name().unwrap_or_default().to_string();
                    let data = field.bytes().await.map_err(invalid)?;
                    form.subtitle = Some((name, data));
                }
                "video_url" => form.video_url = Some(field.text().await.map_err(invalid)?),
                "resolutions" => form.resolutions = Some(field.text().await.map_err(invalid)?),
                "soft_subtitle" => form.soft_subtitle = Some(field.text().await.map_err(invalid)?),
                _ => {}
            }
        }
        Ok(form)
    }

    /// JSON list; absent or blank means every configured resolution
    fn resolutions(&self) -> ApiResult<Vec<String>> {
        match self.resolutions.as_deref().map(str::trim) {
            None | Some("") => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                ApiError::bad_request(format!("resolutions must be a JSON list of names: {}", e))
            }),
        }
    }

    /// Soft unless the field says otherwise
    fn subtitle_mode(&self) -> SubtitleMode {
        let soft = self
            .soft_subtitle
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .is_none_or(|v| v.eq_ignore_ascii_case("true"));
        SubtitleMode::from_soft_flag(soft)
    }
}

/// Submit with the subtitle uploaded as `subtitle_file`. The file is stored
/// as `<downloads>/<job_id>_<name>` and used as a local source.
pub async fn submit_with_file(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<SubmitResponse>> {
    if let Some(running_job_id) = state.scheduler.running_job_id() {
        return Err(Rejected::Conflict { running_job_id }.into());
    }

    let form = UploadForm::read(multipart).await?;
    let video = url_source("video_url", form.video_url.as_deref().unwrap_or_default())?;
    let resolutions = form.resolutions()?;
    let subtitle_mode = form.subtitle_mode();
    let (raw_name, data) = form
        .subtitle
        .ok_or_else(|| ApiError::bad_request("subtitle_file is required"))?;

    let name = sanitize_file_name(&raw_name);
    if !FetchKind::Subtitle.accepts(FsPath::new(&name)) {
        return Err(ApiError::bad_request(format!(
            "Invalid file type. Allowed: {}",
            FetchKind::Subtitle.supported_extensions().join(", ")
        )));
    }

    let job_id = generate_job_id();
    let downloads = &state.config.paths.downloads;
    let path = downloads.join(format!("{}_{}", job_id, name));
    let io_err = |e: std::io::Error| ApiError::Internal(format!("Failed to store upload: {}", e));
    tokio::fs::create_dir_all(downloads).await.map_err(io_err)?;
    tokio::fs::write(&path, &data).await.map_err(io_err)?;
    info!("Subtitle upload saved to {}", path.display());

    let request = SubmitRequest {
        video,
        subtitle: SourceRef::Local(path.clone()),
        resolutions,
        subtitle_mode: Some(subtitle_mode),
        job_id: Some(job_id),
    };
    match state.scheduler.submit(request) {
        Ok(job_id) => Ok(Json(SubmitResponse {
            success: true,
            job_id,
            message: "Job submitted with uploaded subtitle file".to_string(),
        })),
        Err(e) => {
            let _ = tokio::fs::remove_file(&path).await;
            Err(e.into())
        }
    }
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.scheduler.status(&id)?))
}

#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<Job>,
    pub counts: BTreeMap<String, usize>,
}

pub async fn list_jobs(State(state): State<AppState>) -> Json<JobsResponse> {
    let jobs = state.scheduler.list();
    let counts = state.scheduler.system_status().counts;
    Json(JobsResponse { jobs, counts })
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub job_id: String,
    pub message: String,
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    state.scheduler.cancel(&id)?;
    Ok(Json(CancelResponse {
        success: true,
        message: "Cancellation requested".to_string(),
        job_id: id,
    }))
}

fn output_path(state: &AppState, id: &str, resolution: &str) -> ApiResult<PathBuf> {
    let job = state.scheduler.status(id)?;
    job.outputs
        .get(resolution)
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("No {} output for job {}", resolution, id)))
}

/// One rendition of a job as an attachment
pub async fn download(
    State(state): State<AppState>,
    Path((id, resolution)): Path<(String, String)>,
) -> ApiResult<Response> {
    let path = output_path(&state, &id, &resolution)?;
    file_response(&path, "video/mp4", true).await
}

/// One rendition of a job for in-browser playback
pub async fn stream(
    State(state): State<AppState>,
    Path((id, resolution)): Path<(String, String)>,
) -> ApiResult<Response> {
    let path = output_path(&state, &id, &resolution)?;
    file_response(&path, "video/mp4", false).await
}

/// Any browsable file by its `download_path`
pub async fn download_file(
    State(state): State<AppState>,
    Path(relative): Path<String>,
) -> ApiResult<Response> {
    let path = resolve_browsable(&state.config.paths, &relative).await?;
    file_response(&path, content_type_for(&path), true).await
}

/// Map `downloads/...` or `outputs/...` onto the configured directories.
/// Paths leaving those roots, symlinks included, are forbidden.
pub async fn resolve_browsable(paths: &PathsConfig, relative: &str) -> ApiResult<PathBuf> {
    let forbidden = || ApiError::forbidden("Invalid file path");
    let missing = || ApiError::not_found("File not found");

    let mut components = FsPath::new(relative).components();
    let root = match components.next() {
        Some(Component::Normal(first)) if first == "downloads" => &paths.downloads,
        Some(Component::Normal(first)) if first == "outputs" => &paths.outputs,
        _ => return Err(forbidden()),
    };
    let rest = components.as_path();
    if rest.as_os_str().is_empty() || rest.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(forbidden());
    }

    let root = tokio::fs::canonicalize(root).await.map_err(|_| missing())?;
    let resolved = tokio::fs::canonicalize(root.join(rest))
        .await
        .map_err(|_| missing())?;
    if !resolved.starts_with(&root) {
        return Err(forbidden());
    }
    match tokio::fs::metadata(&resolved).await {
        Ok(meta) if meta.is_file() => Ok(resolved),
        _ => Err(missing()),
    }
}

fn content_type_for(path: &FsPath) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "jpg" | "jpeg" => "image/jpeg",
        "srt" => "application/x-subrip",
        "vtt" => "text/vtt",
        "ass" | "ssa" | "sub" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Stream `path`, as an attachment or inline
async fn file_response(path: &FsPath, content_type: &str, attachment: bool) -> ApiResult<Response> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| ApiError::not_found(format!("File missing: {}", path.display())))?;
    let length = file.metadata().await.ok().map(|m| m.len());

    let mut response = (
        [(header::CONTENT_TYPE, content_type.to_string())],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response();

    let headers = response.headers_mut();
    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if attachment {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().replace('"', ""))
            .unwrap_or_else(|| "download".to_string());
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name)) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok(response)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub path: PathBuf,
    /// Relative path accepted by `/api/files/download/`
    pub download_path: String,
    pub size: u64,
    pub size_human: String,
}

#[derive(Debug, Serialize)]
pub struct BrowseResponse {
    /// Uploads plus each job's fetched sources
    pub downloads: Vec<FileEntry>,
    /// Files per resolution directory under the outputs root
    pub outputs: BTreeMap<String, Vec<FileEntry>>,
}

pub async fn browse_files(State(state): State<AppState>) -> ApiResult<Json<BrowseResponse>> {
    let config = state.config.clone();
    let listing = tokio::task::spawn_blocking(move || BrowseResponse {
        downloads: list_files(&config.paths.downloads, "downloads", 2),
        outputs: config
            .resolutions
            .keys()
            .map(|res| {
                let files = list_files(&config.paths.outputs.join(res), &format!("outputs/{}", res), 1);
                (res.clone(), files)
            })
            .filter(|(_, files)| !files.is_empty())
            .collect(),
    })
    .await
    .map_err(|e| ApiError::Internal(format!("File listing failed: {}", e)))?;
    Ok(Json(listing))
}

/// Regular files under `dir` up to `max_depth`, sorted by download path.
/// `prefix` names `dir` in the download paths.
pub fn list_files(dir: &FsPath, prefix: &str, max_depth: usize) -> Vec<FileEntry> {
    let mut files: Vec<FileEntry> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let size = entry.metadata().ok()?.len();
            let relative = entry.path().strip_prefix(dir).ok()?;
            let download_path = std::iter::once(prefix.to_string())
                .chain(relative.components().map(|c| c.as_os_str().to_string_lossy().to_string()))
                .collect::<Vec<_>>()
                .join("/");
            Some(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                path: entry.path().to_path_buf(),
                download_path,
                size,
                size_human: humansize::format_size(size, humansize::DECIMAL),
            })
        })
        .collect();
    files.sort_by(|a, b| a.download_path.cmp(&b.download_path));
    files
}

pub async fn system_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(state.scheduler.system_status())
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
