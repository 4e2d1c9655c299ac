//! Bounded parallel encode of every requested resolution.

use super::MediaPlanner;
use super::probe::MediaInfo;
use crate::error::JobError;
use crate::supervisor::{ProcessSupervisor, ProgressSample};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Per-resolution progress sink
pub type RenditionProgress = Arc<dyn Fn(&str, ProgressSample) + Send + Sync>;

/// Aggregated outcome of one fan-out
#[derive(Debug, Default)]
pub struct FanOutResult {
    pub outputs: BTreeMap<String, PathBuf>,
    pub errors: BTreeMap<String, JobError>,
    /// Cancellation was observed; resolutions it stopped are in neither map
    pub cancelled: bool,
}

impl FanOutResult {
    pub fn succeeded(&self) -> bool {
        !self.outputs.is_empty()
    }
}

/// Runs one supervised encode per resolution over a pool of `workers`
pub struct ResolutionFanOut {
    supervisor: ProcessSupervisor,
    planner: Arc<dyn MediaPlanner>,
    workers: usize,
}

impl ResolutionFanOut {
    pub fn new(supervisor: ProcessSupervisor, planner: Arc<dyn MediaPlanner>, workers: usize) -> Self {
        Self {
            supervisor,
            planner,
            workers: workers.max(1),
        }
    }

    /// Encode `input` into every resolution.
    ///
    /// Returns once each resolution has succeeded, failed or been stopped by
    /// `cancel`. A failing resolution never affects the others.
    /// `on_outcome` fires as each one finishes so callers can record outputs
    /// incrementally.
    pub async fn run<O>(
        &self,
        job_id: &str,
        input: &Path,
        info: &MediaInfo,
        resolutions: &[String],
        on_progress: RenditionProgress,
        mut on_outcome: O,
        cancel: &CancellationToken,
    ) -> FanOutResult
    where
        O: FnMut(&str, &Result<PathBuf, JobError>),
    {
        let mut result = FanOutResult::default();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        info!(
            "Encoding {} resolution(s) with {} worker(s)",
            resolutions.len(),
            self.workers
        );

        for resolution in resolutions {
            let command = match self.planner.rendition(job_id, input, info, resolution) {
                Ok(command) => command,
                Err(e) => {
                    let outcome = Err(e);
                    on_outcome(resolution, &outcome);
                    if let Err(e) = outcome {
                        result.errors.insert(resolution.clone(), e);
                    }
                    continue;
                }
            };

            let semaphore = semaphore.clone();
            let supervisor = self.supervisor.clone();
            let cancel = cancel.clone();
            let progress = on_progress.clone();
            let resolution = resolution.clone();
            let duration = info.duration;

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (resolution, Err(JobError::Cancelled)),
                    permit = semaphore.acquire_owned() => permit,
                };
                let _permit = match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            resolution,
                            Err(JobError::encoding("Encode pool closed unexpectedly")),
                        );
                    }
                };

                if let Some(parent) = command.output.as_deref().and_then(Path::parent)
                    && let Err(e) = tokio::fs::create_dir_all(parent).await
                {
                    return (
                        resolution,
                        Err(JobError::encoding(format!(
                            "Failed to create {}: {}",
                            parent.display(),
                            e
                        ))),
                    );
                }

                let name = resolution.clone();
                let outcome = supervisor
                    .run(
                        &command,
                        duration,
                        move |sample| progress(&name, sample),
                        &cancel,
                    )
                    .await
                    .map_err(JobError::from_encode_process)
                    .and_then(|_| {
                        command
                            .output
                            .clone()
                            .ok_or_else(|| JobError::encoding("Encode produced no output path"))
                    });

                (resolution, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (resolution, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!("Encode task ended abnormally: {}", e);
                    continue;
                }
            };

            on_outcome(&resolution, &outcome);
            match outcome {
                Ok(path) => {
                    info!("{} ready: {}", resolution, path.display());
                    result.outputs.insert(resolution, path);
                }
                Err(JobError::Cancelled) => {}
                Err(e) => {
                    warn!("{} failed: {}", resolution, e);
                    result.errors.insert(resolution, e);
                }
            }
        }

        result.cancelled = cancel.is_cancelled();

        // A task that panicked still needs a terminal outcome
        if !result.cancelled {
            for resolution in resolutions {
                if !result.outputs.contains_key(resolution) && !result.errors.contains_key(resolution)
                {
                    let outcome = Err(JobError::encoding("Encode task ended abnormally"));
                    on_outcome(resolution, &outcome);
                    if let Err(e) = outcome {
                        result.errors.insert(resolution.clone(), e);
                    }
                }
            }
        }

        result
    }
}
