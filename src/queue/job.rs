use crate::error::ErrorDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const TASK_DOWNLOAD_VIDEO: &str = "Download Video";
pub const TASK_DOWNLOAD_SUBTITLE: &str = "Download Subtitle";
pub const TASK_PROCESS_SUBTITLES: &str = "Process Subtitles";
pub const TASK_ENCODE_VIDEOS: &str = "Encode Videos";
pub const TASK_GENERATE_THUMBNAILS: &str = "Generate Thumbnails";

/// Status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, worker not started yet
    Queued,
    /// Running through the stage pipeline
    Processing,
    /// Cancel requested, active stage still unwinding
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    /// Found active after a restart, never resumed
    Interrupted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Interrupted
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Allowed edges of the job state machine. Terminal states are absorbing.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Queued, Interrupted)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelling)
                | (Processing, Cancelled)
                | (Processing, Interrupted)
                | (Cancelling, Cancelled)
                | (Cancelling, Interrupted)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A named sub-task of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub status: TaskStatus,
}

/// Latest progress snapshot, overwritten on every update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub task: String,
    pub current: u64,
    pub total: u64,
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Seconds remaining
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
}

/// Where an input comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SourceRef {
    Url(String),
    Local(PathBuf),
}

impl SourceRef {
    /// `http://` and `https://` strings are URLs, anything else a local path
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceRef::Url(trimmed.to_string())
        } else {
            SourceRef::Local(PathBuf::from(trimmed))
        }
    }

    pub fn is_url(&self) -> bool {
        matches!(self, SourceRef::Url(_))
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceRef::Url(url) => write!(f, "{}", url),
            SourceRef::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sources {
    pub video: SourceRef,
    pub subtitle: SourceRef,
}

/// How subtitles end up in the output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleMode {
    /// Separate selectable track, stream copy
    #[default]
    Soft,
    /// Burned into the picture, full re-encode
    Hard,
}

impl SubtitleMode {
    /// Mode named by the HTTP `soft_subtitle` flag
    pub fn from_soft_flag(soft: bool) -> Self {
        if soft { SubtitleMode::Soft } else { SubtitleMode::Hard }
    }
}

/// A submitted pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub stage: String,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub progress: Option<Progress>,
    pub sources: Sources,
    pub subtitle_mode: SubtitleMode,
    pub resolutions_requested: Vec<String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub errors: BTreeMap<String, ErrorDescriptor>,
    #[serde(default)]
    pub thumbnails: Vec<PathBuf>,
    /// Video with subtitles embedded, input of the fan-out
    #[serde(default)]
    pub processed_video: Option<PathBuf>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a queued job. Duplicate resolutions are dropped, order kept.
    pub fn new(
        sources: Sources,
        subtitle_mode: SubtitleMode,
        resolutions: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut resolutions_requested: Vec<String> = Vec::new();
        for resolution in resolutions {
            if !resolutions_requested.contains(&resolution) {
                resolutions_requested.push(resolution);
            }
        }

        let tasks = [
            TASK_DOWNLOAD_VIDEO,
            TASK_DOWNLOAD_SUBTITLE,
            TASK_PROCESS_SUBTITLES,
            TASK_ENCODE_VIDEOS,
            TASK_GENERATE_THUMBNAILS,
        ]
        .into_iter()
        .map(|name| Task {
            name: name.to_string(),
            status: TaskStatus::Pending,
        })
        .collect();

        Self {
            id: generate_job_id(),
            status: JobStatus::Queued,
            stage: "Queued".to_string(),
            tasks,
            progress: None,
            sources,
            subtitle_mode,
            resolutions_requested,
            outputs: BTreeMap::new(),
            errors: BTreeMap::new(),
            thumbnails: Vec::new(),
            processed_video: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn set_task(&mut self, name: &str, status: TaskStatus) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.name == name) {
            task.status = status;
        }
    }

    pub fn task_status(&self, name: &str) -> Option<TaskStatus> {
        self.tasks.iter().find(|t| t.name == name).map(|t| t.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time spent in the pipeline so far, or in total once finished
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        Some(self.finished_at.unwrap_or_else(Utc::now) - start)
    }
}

/// `YYYYMMDD_HHMMSS_<8 hex>`, sortable by submission time
pub fn generate_job_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &random[..8])
}
