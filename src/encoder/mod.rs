pub mod command_builder;
pub mod fanout;
pub mod probe;

pub use command_builder::FfmpegPlanner;
pub use fanout::{FanOutResult, RenditionProgress, ResolutionFanOut};
pub use probe::MediaInfo;

use crate::error::{JobError, ProcessError};
use crate::supervisor::SupervisedCommand;
use async_trait::async_trait;
use std::path::Path;

/// Turns pipeline intents into concrete external tool invocations
#[async_trait]
pub trait MediaPlanner: Send + Sync {
    /// Dimensions and duration of `input`
    async fn probe(&self, input: &Path) -> Result<MediaInfo, ProcessError>;

    /// Encode of `input` into one named resolution. Output names carry
    /// `job_id` so jobs over the same source never share a file.
    fn rendition(
        &self,
        job_id: &str,
        input: &Path,
        info: &MediaInfo,
        resolution: &str,
    ) -> Result<SupervisedCommand, JobError>;

    /// One command per thumbnail frame
    fn thumbnails(&self, job_id: &str, input: &Path, info: &MediaInfo) -> Vec<SupervisedCommand>;
}
