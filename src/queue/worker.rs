use super::job::{
    Job, JobStatus, Progress, SourceRef, SubtitleMode, TASK_DOWNLOAD_SUBTITLE,
    TASK_DOWNLOAD_VIDEO, TASK_ENCODE_VIDEOS, TASK_GENERATE_THUMBNAILS, TASK_PROCESS_SUBTITLES,
    TaskStatus,
};
use super::store::JobStore;
use crate::config::AppConfig;
use crate::encoder::{FfmpegPlanner, MediaInfo, MediaPlanner, RenditionProgress, ResolutionFanOut};
use crate::error::{AppError, JobError, ProcessError, StoreError};
use crate::fetch::{FetchKind, FetchProgress, Fetcher, HttpFetcher};
use crate::subtitle::{FfmpegSubtitles, SubtitleTranscoder};
use crate::supervisor::{ProcessSupervisor, ProgressSample};
use crate::utils::disk_space;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Overall percentage bands per stage
const FETCH_VIDEO_BAND: (u8, u8) = (0, 8);
const FETCH_SUBTITLE_BAND: (u8, u8) = (8, 10);
const SUBTITLE_BAND: (u8, u8) = (10, 40);
const ENCODE_BAND: (u8, u8) = (40, 95);
const THUMBNAIL_BAND: (u8, u8) = (95, 99);

/// Everything a worker needs, shared by all jobs
#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<AppConfig>,
    pub store: Arc<JobStore>,
    pub supervisor: ProcessSupervisor,
    pub fetcher: Arc<dyn Fetcher>,
    pub subtitles: Arc<dyn SubtitleTranscoder>,
    pub planner: Arc<dyn MediaPlanner>,
}

impl Pipeline {
    /// Pipeline backed by reqwest and ffmpeg
    pub fn from_config(config: AppConfig, store: Arc<JobStore>) -> Result<Self, AppError> {
        let supervisor = ProcessSupervisor::from_config(&config.processing);
        let fetcher = HttpFetcher::new(&config.download)?;
        let subtitles = FfmpegSubtitles::new(supervisor.clone(), &config);
        let planner = FfmpegPlanner::new(&config);

        Ok(Self {
            config: Arc::new(config),
            store,
            supervisor,
            fetcher: Arc::new(fetcher),
            subtitles: Arc::new(subtitles),
            planner: Arc::new(planner),
        })
    }
}

/// Why the pipeline stopped early
#[derive(Debug)]
enum Abort {
    Cancelled,
    /// Fatal stage error, recorded under `key`
    Failed { key: &'static str, error: JobError },
    /// Fan-out finished without a single rendition
    NoOutputs,
}

/// Maps a stage-local 0-100 percentage into the stage's overall band
struct StageProgress {
    store: Arc<JobStore>,
    job_id: String,
    task: &'static str,
    band: (u8, u8),
}

impl StageProgress {
    fn overall(&self, percent: u8) -> u8 {
        let (start, end) = self.band;
        start + ((end - start) as u32 * percent.min(100) as u32 / 100) as u8
    }

    fn report(&self, percent: u8, current: u64, total: u64, speed: Option<f64>, eta: Option<f64>) {
        let overall = self.overall(percent);
        let task = self.task;
        let _ = self.store.update(&self.job_id, |job| {
            // Never move backwards within one stage
            let floor = job
                .progress
                .as_ref()
                .filter(|p| p.task == task)
                .map(|p| p.percentage)
                .unwrap_or(0);
            job.progress = Some(Progress {
                task: task.to_string(),
                current,
                total,
                percentage: overall.max(floor),
                speed,
                eta,
            });
        });
    }

    fn report_sample(&self, sample: ProgressSample) {
        self.report(
            sample.percentage().unwrap_or(0),
            sample.elapsed as u64,
            sample.duration as u64,
            sample.speed,
            sample.eta(),
        );
    }
}

/// Drives one job through fetch, subtitle, encode and thumbnail stages
pub struct JobWorker {
    pipeline: Pipeline,
    job_id: String,
    cancel: CancellationToken,
}

impl JobWorker {
    pub fn new(pipeline: Pipeline, job_id: String, cancel: CancellationToken) -> Self {
        Self {
            pipeline,
            job_id,
            cancel,
        }
    }

    /// Run the job to a terminal status and return it
    pub async fn run(self) -> JobStatus {
        let span = info_span!("job", id = %self.job_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> JobStatus {
        let store = self.pipeline.store.clone();

        if self.cancel.is_cancelled() {
            info!("Cancelled before start");
            let status = self.finish(Err(Abort::Cancelled));
            store.save().await;
            return status;
        }

        let job = match store.transition(&self.job_id, JobStatus::Processing, |job| {
            job.stage = "Starting".to_string();
        }) {
            Ok(job) => job,
            Err(e) => {
                error!("Cannot start job: {}", e);
                return store
                    .get(&self.job_id)
                    .map(|j| j.status)
                    .unwrap_or(JobStatus::Failed);
            }
        };
        store.save().await;
        info!(
            "Processing {} + {} into {:?}",
            job.sources.video, job.sources.subtitle, job.resolutions_requested
        );

        let watcher = tokio::spawn({
            let store = store.clone();
            let id = self.job_id.clone();
            let cancel = self.cancel.clone();
            async move {
                cancel.cancelled().await;
                match store.transition(&id, JobStatus::Cancelling, |job| {
                    job.stage = "Cancelling".to_string();
                }) {
                    Ok(_) => {
                        info!("Cancellation requested");
                        store.save().await;
                    }
                    Err(e) => debug!("Not marking cancelling: {}", e),
                }
            }
        });

        let mut artifacts = Artifacts::default();
        let outcome = self.execute(&job, &mut artifacts).await;
        watcher.abort();

        let status = self.finish(outcome);
        self.cleanup(&job, &artifacts).await;
        store.save().await;
        status
    }

    fn checkpoint(&self) -> Result<(), Abort> {
        if self.cancel.is_cancelled() {
            Err(Abort::Cancelled)
        } else {
            Ok(())
        }
    }

    fn begin(&self, task: &'static str, stage: &str) {
        let stage = stage.to_string();
        let _ = self.pipeline.store.update(&self.job_id, |job| {
            job.stage = stage;
            job.set_task(task, TaskStatus::InProgress);
        });
    }

    fn mark(&self, task: &'static str, status: TaskStatus) {
        if let Err(e) = self
            .pipeline
            .store
            .update(&self.job_id, |job| job.set_task(task, status))
        {
            warn!("Failed to record task {}: {}", task, e);
        }
    }

    /// Mark `task` done and persist, stage history must survive a crash
    async fn complete(&self, task: &'static str, status: TaskStatus) {
        self.mark(task, status);
        self.pipeline.store.save().await;
    }

    fn progress(&self, task: &'static str, band: (u8, u8)) -> StageProgress {
        StageProgress {
            store: self.pipeline.store.clone(),
            job_id: self.job_id.clone(),
            task,
            band,
        }
    }

    /// Stage failure: mark the task, classify the error. The terminal
    /// record persists it.
    fn fail(&self, task: &'static str, key: &'static str, error: JobError) -> Abort {
        self.mark(task, TaskStatus::Failed);
        match error {
            JobError::Cancelled => Abort::Cancelled,
            error => {
                warn!("{} failed: {}", task, error);
                Abort::Failed { key, error }
            }
        }
    }

    async fn execute(&self, job: &Job, artifacts: &mut Artifacts) -> Result<(), Abort> {
        let (video, subtitle) = self.fetch_stage(job, artifacts).await?;
        let (processed, info) = self.subtitle_stage(job, &video, &subtitle, artifacts).await?;
        self.encode_stage(job, &processed, &info).await?;
        self.thumbnail_stage(job, &processed, &info).await?;
        self.checkpoint()
    }

    async fn fetch_stage(
        &self,
        job: &Job,
        artifacts: &mut Artifacts,
    ) -> Result<(PathBuf, PathBuf), Abort> {
        let downloads = &scratch_dir(&self.pipeline.config.paths.downloads, &job.id);

        self.checkpoint()?;
        self.begin(TASK_DOWNLOAD_VIDEO, "Downloading video");
        let video = self
            .fetch_one(&job.sources.video, downloads, FetchKind::Video, TASK_DOWNLOAD_VIDEO, FETCH_VIDEO_BAND)
            .await?;
        if job.sources.video.is_url() {
            artifacts.downloads.push(video.clone());
        }
        self.complete(TASK_DOWNLOAD_VIDEO, TaskStatus::Completed).await;

        self.checkpoint()?;
        self.begin(TASK_DOWNLOAD_SUBTITLE, "Downloading subtitle");
        let subtitle = self
            .fetch_one(
                &job.sources.subtitle,
                downloads,
                FetchKind::Subtitle,
                TASK_DOWNLOAD_SUBTITLE,
                FETCH_SUBTITLE_BAND,
            )
            .await?;
        if job.sources.subtitle.is_url() {
            artifacts.downloads.push(subtitle.clone());
        }
        self.complete(TASK_DOWNLOAD_SUBTITLE, TaskStatus::Completed).await;

        Ok((video, subtitle))
    }

    async fn fetch_one(
        &self,
        source: &SourceRef,
        destination: &Path,
        kind: FetchKind,
        task: &'static str,
        band: (u8, u8),
    ) -> Result<PathBuf, Abort> {
        let reporter = self.progress(task, band);
        let mut on_progress = |p: FetchProgress| {
            reporter.report(
                p.percentage().unwrap_or(0),
                p.downloaded,
                p.total.unwrap_or(0),
                Some(p.speed),
                p.eta,
            )
        };

        let path = self
            .pipeline
            .fetcher
            .fetch(source, destination, kind, &mut on_progress, &self.cancel)
            .await
            .map_err(|e| self.fail(task, "fetch", e))?;
        reporter.report(100, 0, 0, None, None);
        Ok(path)
    }

    async fn subtitle_stage(
        &self,
        job: &Job,
        video: &Path,
        subtitle: &Path,
        artifacts: &mut Artifacts,
    ) -> Result<(PathBuf, MediaInfo), Abort> {
        self.checkpoint()?;
        self.begin(TASK_PROCESS_SUBTITLES, "Processing subtitles");
        let reporter = self.progress(TASK_PROCESS_SUBTITLES, SUBTITLE_BAND);
        reporter.report(0, 0, 0, None, None);

        let info = self
            .pipeline
            .planner
            .probe(video)
            .await
            .map_err(|e| self.fail(TASK_PROCESS_SUBTITLES, "subtitle", probe_error(e)))?;

        let out_dir = &scratch_dir(&self.pipeline.config.paths.processing, &job.id);
        tokio::fs::create_dir_all(out_dir).await.map_err(|e| {
            self.fail(
                TASK_PROCESS_SUBTITLES,
                "subtitle",
                JobError::subtitle(format!("Failed to create {}: {}", out_dir.display(), e)),
            )
        })?;

        let result = match job.subtitle_mode {
            SubtitleMode::Soft => {
                self.pipeline
                    .subtitles
                    .embed(video, subtitle, out_dir, &self.cancel)
                    .await
            }
            SubtitleMode::Hard => {
                let mut on_progress = |sample: ProgressSample| reporter.report_sample(sample);
                self.pipeline
                    .subtitles
                    .burn(
                        video,
                        subtitle,
                        out_dir,
                        &self.pipeline.config.subtitle.style,
                        info.duration,
                        &mut on_progress,
                        &self.cancel,
                    )
                    .await
            }
        };
        let processed = result.map_err(|e| self.fail(TASK_PROCESS_SUBTITLES, "subtitle", e))?;

        artifacts.processed = Some(processed.clone());
        let recorded = processed.clone();
        let _ = self
            .pipeline
            .store
            .update(&self.job_id, |job| job.processed_video = Some(recorded));
        reporter.report(100, 0, 0, None, None);
        self.complete(TASK_PROCESS_SUBTITLES, TaskStatus::Completed).await;

        Ok((processed, info))
    }

    async fn encode_stage(&self, job: &Job, input: &Path, info: &MediaInfo) -> Result<(), Abort> {
        self.checkpoint()?;
        self.begin(TASK_ENCODE_VIDEOS, "Encoding videos");
        self.warn_if_low_disk(input, job.resolutions_requested.len());

        let reporter = Arc::new(self.progress(TASK_ENCODE_VIDEOS, ENCODE_BAND));
        reporter.report(0, 0, job.resolutions_requested.len() as u64, None, None);

        // Highest percentage seen per resolution, finished ones count as 100
        let per_resolution: Arc<Mutex<BTreeMap<String, u8>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let requested = job.resolutions_requested.len().max(1) as u64;

        let on_progress: RenditionProgress = {
            let reporter = reporter.clone();
            let per_resolution = per_resolution.clone();
            Arc::new(move |resolution: &str, sample: ProgressSample| {
                let Some(percent) = sample.percentage() else {
                    return;
                };
                let (average, finished) = {
                    let mut seen = per_resolution.lock().unwrap_or_else(|e| e.into_inner());
                    let entry = seen.entry(resolution.to_string()).or_insert(0);
                    *entry = (*entry).max(percent);
                    aggregate(&seen, requested)
                };
                reporter.report(average, finished, requested, sample.speed, None);
            })
        };

        let store = self.pipeline.store.clone();
        let job_id = self.job_id.clone();
        let on_outcome = |resolution: &str, outcome: &Result<PathBuf, JobError>| {
            let resolution = resolution.to_string();
            match outcome {
                Ok(path) => {
                    let path = path.clone();
                    let _ = store.update(&job_id, |job| {
                        job.outputs.insert(resolution.clone(), path);
                    });
                }
                Err(JobError::Cancelled) => return,
                Err(e) => {
                    let descriptor = e.descriptor();
                    let _ = store.update(&job_id, |job| {
                        job.errors.insert(resolution.clone(), descriptor);
                    });
                }
            }
            store.save_in_background();
            let (average, finished) = {
                let mut seen = per_resolution.lock().unwrap_or_else(|e| e.into_inner());
                seen.insert(resolution, 100);
                aggregate(&seen, requested)
            };
            reporter.report(average, finished, requested, None, None);
        };

        let fan_out = ResolutionFanOut::new(
            self.pipeline.supervisor.clone(),
            self.pipeline.planner.clone(),
            self.pipeline.config.processing.encode_workers,
        );
        let result = fan_out
            .run(
                &job.id,
                input,
                info,
                &job.resolutions_requested,
                on_progress,
                on_outcome,
                &self.cancel,
            )
            .await;

        if result.cancelled {
            self.mark(TASK_ENCODE_VIDEOS, TaskStatus::Failed);
            return Err(Abort::Cancelled);
        }

        info!(
            "Encoded {}/{} resolution(s)",
            result.outputs.len(),
            job.resolutions_requested.len()
        );
        if result.succeeded() {
            self.complete(TASK_ENCODE_VIDEOS, TaskStatus::Completed).await;
            Ok(())
        } else {
            self.mark(TASK_ENCODE_VIDEOS, TaskStatus::Failed);
            Err(Abort::NoOutputs)
        }
    }

    /// Best effort; only cancellation escapes this stage
    async fn thumbnail_stage(&self, job: &Job, input: &Path, info: &MediaInfo) -> Result<(), Abort> {
        self.checkpoint()?;
        self.begin(TASK_GENERATE_THUMBNAILS, "Generating thumbnails");
        let reporter = self.progress(TASK_GENERATE_THUMBNAILS, THUMBNAIL_BAND);

        let commands = self.pipeline.planner.thumbnails(&job.id, input, info);
        let total = commands.len() as u64;
        let mut thumbnails = Vec::new();

        for (done, command) in commands.iter().enumerate() {
            if let Some(parent) = command.output.as_deref().and_then(Path::parent)
                && let Err(e) = tokio::fs::create_dir_all(parent).await
            {
                warn!("Cannot create thumbnail directory {}: {}", parent.display(), e);
                break;
            }

            match self
                .pipeline
                .supervisor
                .run(command, 0.0, |_| {}, &self.cancel)
                .await
            {
                Ok(()) => thumbnails.extend(command.output.clone()),
                Err(ProcessError::Cancelled) => {
                    self.mark(TASK_GENERATE_THUMBNAILS, TaskStatus::Failed);
                    return Err(Abort::Cancelled);
                }
                Err(e) => warn!("Thumbnail failed: {}", e),
            }

            let finished = done as u64 + 1;
            reporter.report((finished * 100 / total.max(1)) as u8, finished, total, None, None);
        }

        let status = if thumbnails.is_empty() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        let _ = self
            .pipeline
            .store
            .update(&self.job_id, |job| job.thumbnails = thumbnails);
        self.complete(TASK_GENERATE_THUMBNAILS, status).await;
        Ok(())
    }

    fn warn_if_low_disk(&self, input: &Path, renditions: usize) {
        let outputs = &self.pipeline.config.paths.outputs;
        let estimate = disk_space::estimate_rendition_bytes(input, renditions);
        if !disk_space::has_enough_space(outputs, estimate) {
            warn!(
                "Low disk space in {}: about {} needed for {} rendition(s)",
                outputs.display(),
                humansize::format_size(estimate, humansize::DECIMAL),
                renditions
            );
        }
    }

    /// Write the terminal record. Cancellation pre-empts success.
    fn finish(&self, outcome: Result<(), Abort>) -> JobStatus {
        let store = &self.pipeline.store;
        let outcome = match outcome {
            Ok(()) if self.cancel.is_cancelled() => Err(Abort::Cancelled),
            other => other,
        };

        let (status, stage) = match &outcome {
            Ok(()) => (JobStatus::Completed, "Completed"),
            Err(Abort::Cancelled) => (JobStatus::Cancelled, "Cancelled"),
            Err(Abort::NoOutputs) => (JobStatus::Failed, "Failed: no resolution could be encoded"),
            Err(Abort::Failed { .. }) => (JobStatus::Failed, "Failed"),
        };

        let apply = |job: &mut Job| {
            job.stage = stage.to_string();
            match &outcome {
                Ok(()) => {
                    job.progress = Some(Progress {
                        task: "Finalize".to_string(),
                        current: job.outputs.len() as u64,
                        total: job.resolutions_requested.len() as u64,
                        percentage: 100,
                        speed: None,
                        eta: None,
                    });
                }
                Err(Abort::Failed { key, error }) => {
                    job.errors.insert(key.to_string(), error.descriptor());
                }
                Err(_) => {}
            }
            for task in job.tasks.iter_mut() {
                if task.status == TaskStatus::InProgress {
                    task.status = TaskStatus::Failed;
                }
            }
        };

        let final_status = match store.transition(&self.job_id, status, apply) {
            Ok(_) => status,
            // The watcher got there first, the job can only end cancelled
            Err(StoreError::InvalidTransition {
                from: JobStatus::Cancelling,
                ..
            }) => match store.transition(&self.job_id, JobStatus::Cancelled, |job| {
                job.stage = "Cancelled".to_string();
            }) {
                Ok(_) => JobStatus::Cancelled,
                Err(e) => {
                    error!("Failed to record cancellation: {}", e);
                    JobStatus::Cancelled
                }
            },
            Err(e) => {
                error!("Failed to record final status {:?}: {}", status, e);
                store.get(&self.job_id).map(|j| j.status).unwrap_or(status)
            }
        };

        info!("Finished as {:?}", final_status);
        final_status
    }

    /// Remove intermediates according to the processing settings
    async fn cleanup(&self, job: &Job, artifacts: &Artifacts) {
        let processing = &self.pipeline.config.processing;
        let mut doomed: Vec<&PathBuf> = Vec::new();

        if processing.cleanup_temp_files
            && let Some(processed) = &artifacts.processed
            && !artifacts.downloads.contains(processed)
        {
            doomed.push(processed);
        }
        if !processing.keep_original_files {
            doomed.extend(artifacts.downloads.iter());
        }

        for path in doomed {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        if processing.cleanup_temp_files && artifacts.processed.is_some() {
            let _ = self.pipeline.store.update(&job.id, |job| {
                job.processed_video = None;
            });
        }

        // Only succeeds once the job's scratch directories are empty
        let paths = &self.pipeline.config.paths;
        for dir in [
            scratch_dir(&paths.downloads, &job.id),
            scratch_dir(&paths.processing, &job.id),
        ] {
            if tokio::fs::remove_dir(&dir).await.is_ok() {
                debug!("Removed {}", dir.display());
            }
        }
    }
}

/// Files a job created that cleanup may remove
#[derive(Debug, Default)]
struct Artifacts {
    /// Fetched from URLs; local sources are never touched
    downloads: Vec<PathBuf>,
    processed: Option<PathBuf>,
}

/// Per-job directory under `root`, so jobs over the same source never share
/// intermediates
pub fn scratch_dir(root: &Path, job_id: &str) -> PathBuf {
    root.join(job_id)
}

/// Average percent over every requested resolution, and how many are done
fn aggregate(seen: &BTreeMap<String, u8>, requested: u64) -> (u8, u64) {
    let sum: u64 = seen.values().map(|p| *p as u64).sum();
    let finished = seen.values().filter(|p| **p >= 100).count() as u64;
    ((sum / requested.max(1)).min(100) as u8, finished)
}

fn probe_error(err: ProcessError) -> JobError {
    match err {
        ProcessError::Cancelled => JobError::Cancelled,
        other => JobError::subtitle(format!("Failed to read video info: {}", other)),
    }
}
