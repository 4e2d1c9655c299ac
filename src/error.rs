use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Startup and configuration failures
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Outcome of a supervised external process that did not succeed
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process was killed (exit code {code}), most likely out of memory")]
    OutOfMemory { code: i32 },

    #[error("Process exited with code {code}: {tail}")]
    Exit { code: i32, tail: String },

    #[error("Process cancelled")]
    Cancelled,

    #[error("Process succeeded but did not create {0}")]
    MissingOutput(PathBuf),

    #[error("Unexpected tool output: {0}")]
    InvalidOutput(String),

    #[error("IO error while supervising process: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Raw exit code, when the process got far enough to have one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::OutOfMemory { code } | ProcessError::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Job-level error taxonomy recorded on job records
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Subtitle processing failed: {message}")]
    Subtitle {
        message: String,
        out_of_memory: bool,
    },

    #[error("Encoding failed: {message}")]
    Encoding {
        message: String,
        exit_code: Option<i32>,
        out_of_memory: bool,
    },

    #[error("Job cancelled by user")]
    Cancelled,
}

impl JobError {
    pub fn download(message: impl Into<String>) -> Self {
        Self::Download(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn subtitle(message: impl Into<String>) -> Self {
        Self::Subtitle {
            message: message.into(),
            out_of_memory: false,
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
            exit_code: None,
            out_of_memory: false,
        }
    }

    /// Map a failed subtitle-stage process into the job taxonomy
    pub fn from_subtitle_process(err: ProcessError) -> Self {
        match err {
            ProcessError::Cancelled => Self::Cancelled,
            other => Self::Subtitle {
                out_of_memory: matches!(other, ProcessError::OutOfMemory { .. }),
                message: other.to_string(),
            },
        }
    }

    /// Map a failed encode process into the job taxonomy
    pub fn from_encode_process(err: ProcessError) -> Self {
        match err {
            ProcessError::Cancelled => Self::Cancelled,
            other => Self::Encoding {
                exit_code: other.exit_code(),
                out_of_memory: matches!(other, ProcessError::OutOfMemory { .. }),
                message: other.to_string(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Download(_) => ErrorKind::DownloadError,
            JobError::Validation(_) => ErrorKind::ValidationError,
            JobError::Subtitle { .. } => ErrorKind::SubtitleError,
            JobError::Encoding { .. } => ErrorKind::EncodingError,
            JobError::Cancelled => ErrorKind::CancellationError,
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            JobError::Subtitle {
                out_of_memory: true,
                ..
            } | JobError::Encoding {
                out_of_memory: true,
                ..
            }
        )
    }

    /// Serializable form stored on the job record
    pub fn descriptor(&self) -> ErrorDescriptor {
        let out_of_memory = self.is_out_of_memory();
        ErrorDescriptor {
            kind: self.kind(),
            subtype: out_of_memory.then_some(ErrorSubtype::OutOfMemory),
            message: self.to_string(),
            exit_code: match self {
                JobError::Encoding { exit_code, .. } => *exit_code,
                _ => None,
            },
            hint: out_of_memory.then(|| OOM_HINT.to_string()),
        }
    }
}

const OOM_HINT: &str = "The encoder ran out of memory. Enable ffmpeg.low_memory in the \
                        configuration or request fewer or smaller resolutions.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    DownloadError,
    ValidationError,
    SubtitleError,
    EncodingError,
    CancellationError,
    /// Written by startup reconciliation or when a worker dies unexpectedly
    InterruptedError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSubtype {
    OutOfMemory,
}

/// Error entry on a job record, keyed by resolution or stage name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<ErrorSubtype>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorDescriptor {
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InterruptedError,
            subtype: None,
            message: message.into(),
            exit_code: None,
            hint: None,
        }
    }
}

/// Job store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::queue::JobStatus,
        to: crate::queue::JobStatus,
    },

    #[error("Failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize job state: {0}")]
    Serde(#[from] serde_json::Error),
}
