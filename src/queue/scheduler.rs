use super::job::{Job, JobStatus, SourceRef, Sources, SubtitleMode};
use super::worker::{JobWorker, Pipeline};
use crate::error::{ErrorDescriptor, JobError, StoreError};
use crate::fetch::{FetchKind, validate_source};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A job submission
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub video: SourceRef,
    pub subtitle: SourceRef,
    /// Empty means every configured resolution
    pub resolutions: Vec<String>,
    /// `None` follows `subtitle.soft_by_default`
    pub subtitle_mode: Option<SubtitleMode>,
    /// Id reserved by the caller, e.g. to name an uploaded file
    pub job_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum Rejected {
    #[error("Another job is already running: {running_job_id}")]
    Conflict { running_job_id: String },

    #[error(transparent)]
    Invalid(JobError),
}

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} is not active ({status:?})")]
    NotActive { id: String, status: JobStatus },
}

/// Snapshot for the system status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running_job_id: Option<String>,
    pub can_submit: bool,
    pub counts: BTreeMap<String, usize>,
}

/// The job holding the pipeline, from acceptance until its terminal record
struct ActiveJob {
    id: String,
    cancel: CancellationToken,
}

/// Admission control: at most one job in the pipeline, others rejected
#[derive(Clone)]
pub struct JobScheduler {
    pipeline: Pipeline,
    active: Arc<Mutex<Option<ActiveJob>>>,
}

impl JobScheduler {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Validate and admit a job, returning its id before the worker runs.
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, request: SubmitRequest) -> Result<String, Rejected> {
        let config = &self.pipeline.config;

        let resolutions = if request.resolutions.is_empty() {
            config.default_resolutions()
        } else {
            request.resolutions
        };
        if let Some(unknown) = resolutions
            .iter()
            .find(|r| !config.resolutions.contains_key(*r))
        {
            return Err(Rejected::Invalid(JobError::validation(format!(
                "Unknown resolution {} (available: {})",
                unknown,
                config.default_resolutions().join(", ")
            ))));
        }
        validate_source(&request.video, FetchKind::Video).map_err(Rejected::Invalid)?;
        validate_source(&request.subtitle, FetchKind::Subtitle).map_err(Rejected::Invalid)?;

        let mode = request.subtitle_mode.unwrap_or(if config.subtitle.soft_by_default {
            SubtitleMode::Soft
        } else {
            SubtitleMode::Hard
        });

        let mut active = self.lock_active();
        let running = active
            .as_ref()
            .map(|a| a.id.clone())
            .or_else(|| self.pipeline.store.active_job_id());
        if let Some(running_job_id) = running {
            info!("Rejecting submission, job {} is running", running_job_id);
            return Err(Rejected::Conflict { running_job_id });
        }

        let mut job = Job::new(
            Sources {
                video: request.video,
                subtitle: request.subtitle,
            },
            mode,
            resolutions,
        );
        if let Some(id) = request.job_id {
            if self.pipeline.store.get(&id).is_ok() {
                return Err(Rejected::Invalid(JobError::validation(format!(
                    "Job id {} is already taken",
                    id
                ))));
            }
            job.id = id;
        }
        let id = job.id.clone();
        // In memory only; the supervising task persists it off this lock
        self.pipeline.store.put(job);

        let cancel = CancellationToken::new();
        *active = Some(ActiveJob {
            id: id.clone(),
            cancel: cancel.clone(),
        });
        drop(active);

        info!("Accepted job {}", id);
        self.spawn_worker(id.clone(), cancel);
        Ok(id)
    }

    fn spawn_worker(&self, id: String, cancel: CancellationToken) {
        let worker = JobWorker::new(self.pipeline.clone(), id.clone(), cancel);
        let store = self.pipeline.store.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            store.save().await;
            let handle = tokio::spawn(worker.run());
            if let Err(e) = handle.await {
                error!("Worker for job {} died: {}", id, e);
                record_crash(&store, &id, &e.to_string());
                store.save().await;
            }

            let mut active = active.lock().unwrap_or_else(|e| e.into_inner());
            if active.as_ref().is_some_and(|a| a.id == id) {
                *active = None;
            }
        });
    }

    /// Request cancellation of the running job
    pub fn cancel(&self, id: &str) -> Result<(), CancelError> {
        let job = self.pipeline.store.get(id).map_err(|e| match e {
            StoreError::NotFound(id) => CancelError::NotFound(id),
            other => CancelError::NotFound(other.to_string()),
        })?;
        if job.is_terminal() {
            return Err(CancelError::NotActive {
                id: id.to_string(),
                status: job.status,
            });
        }

        let active = self.lock_active();
        match active.as_ref() {
            Some(running) if running.id == id => {
                info!("Cancel requested for job {}", id);
                running.cancel.cancel();
                Ok(())
            }
            _ => Err(CancelError::NotActive {
                id: id.to_string(),
                status: job.status,
            }),
        }
    }

    pub fn status(&self, id: &str) -> Result<Job, StoreError> {
        self.pipeline.store.get(id)
    }

    pub fn list(&self) -> Vec<Job> {
        self.pipeline.store.list()
    }

    pub fn running_job_id(&self) -> Option<String> {
        self.lock_active().as_ref().map(|a| a.id.clone())
    }

    pub fn system_status(&self) -> SystemStatus {
        let running_job_id = self.running_job_id();
        SystemStatus {
            can_submit: running_job_id.is_none(),
            running_job_id,
            counts: self.pipeline.store.counts(),
        }
    }

    /// Poll until the job is terminal and its admission slot is released
    pub async fn wait_for(&self, id: &str, poll: Duration) -> Result<Job, StoreError> {
        loop {
            let job = self.pipeline.store.get(id)?;
            if job.is_terminal() && self.running_job_id().as_deref() != Some(id) {
                return Ok(job);
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Terminal record for a job whose worker panicked
fn record_crash(store: &super::store::JobStore, id: &str, reason: &str) {
    let descriptor = ErrorDescriptor::interrupted(format!("Worker stopped unexpectedly: {}", reason));
    let status = match store.get(id).map(|j| j.status) {
        Ok(JobStatus::Cancelling) => JobStatus::Cancelled,
        Ok(status) if status.is_terminal() => return,
        _ => JobStatus::Failed,
    };
    if let Err(e) = store.transition(id, status, |job| {
        job.stage = "Failed: worker crashed".to_string();
        job.errors.insert("worker".to_string(), descriptor);
    }) {
        warn!("Failed to record crash of job {}: {}", id, e);
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::config::{AppConfig, BurnStyle};
    use crate::encoder::fanout::tests::ScriptPlanner;
    use crate::error::ErrorKind;
    use crate::fetch::{FetchProgress, Fetcher};
    use crate::queue::job::{
        TASK_DOWNLOAD_VIDEO, TASK_ENCODE_VIDEOS, TASK_GENERATE_THUMBNAILS, TASK_PROCESS_SUBTITLES,
        TaskStatus,
    };
    use crate::queue::store::JobStore;
    use crate::subtitle::SubtitleTranscoder;
    use crate::supervisor::{ProcessSupervisor, ProgressSample};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    /// Writes a small file per fetch, optionally failing or stalling
    pub(crate) struct FakeFetcher {
        pub fail: bool,
        pub delay: Duration,
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(
            &self,
            source: &SourceRef,
            destination: &Path,
            kind: FetchKind,
            on_progress: &mut (dyn FnMut(FetchProgress) + Send),
            cancel: &CancellationToken,
        ) -> Result<PathBuf, JobError> {
            tokio::select! {
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
            if self.fail {
                return Err(JobError::download(format!("{} unreachable", source)));
            }
            for downloaded in [10, 5, 20] {
                on_progress(FetchProgress {
                    downloaded,
                    total: Some(20),
                    speed: 1.0,
                    eta: None,
                });
            }
            tokio::fs::create_dir_all(destination).await.unwrap();
            let path = destination.join(format!("fetched.{}", kind.default_extension()));
            tokio::fs::write(&path, b"data").await.unwrap();
            Ok(path)
        }
    }

    /// Copies the video instead of running ffmpeg. `delay` stalls before
    /// the copy, `unwind` is how long a cancelled run takes to stop.
    #[derive(Default)]
    pub(crate) struct FakeSubtitles {
        pub fail: bool,
        pub delay: Duration,
        pub unwind: Duration,
    }

    impl FakeSubtitles {
        async fn process(&self, video: &Path, out: PathBuf, cancel: &CancellationToken) -> Result<PathBuf, JobError> {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tokio::time::sleep(self.unwind).await;
                    return Err(JobError::Cancelled);
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
            if self.fail {
                return Err(JobError::subtitle("ffmpeg exited with code 1"));
            }
            tokio::fs::copy(video, &out).await.unwrap();
            Ok(out)
        }
    }

    #[async_trait]
    impl SubtitleTranscoder for FakeSubtitles {
        async fn embed(
            &self,
            video: &Path,
            _subtitle: &Path,
            out_dir: &Path,
            cancel: &CancellationToken,
        ) -> Result<PathBuf, JobError> {
            self.process(video, out_dir.join("fetched_subtitled.mp4"), cancel)
                .await
        }

        async fn burn(
            &self,
            video: &Path,
            _subtitle: &Path,
            out_dir: &Path,
            _style: &BurnStyle,
            duration_hint: f64,
            on_progress: &mut (dyn FnMut(ProgressSample) + Send),
            cancel: &CancellationToken,
        ) -> Result<PathBuf, JobError> {
            for elapsed in [2.0, 1.0, 8.0] {
                on_progress(ProgressSample {
                    elapsed,
                    duration: duration_hint,
                    speed: None,
                });
            }
            self.process(video, out_dir.join("fetched_hardsubbed.mp4"), cancel)
                .await
        }
    }

    pub(crate) struct Harness {
        _dir: tempfile::TempDir,
        pub root: PathBuf,
        pub scheduler: JobScheduler,
    }

    pub(crate) fn harness(planner: impl FnOnce(&Path) -> ScriptPlanner, fetcher: FakeFetcher) -> Harness {
        harness_with(planner, fetcher, FakeSubtitles::default())
    }

    pub(crate) fn harness_with(
        planner: impl FnOnce(&Path) -> ScriptPlanner,
        fetcher: FakeFetcher,
        subtitles: FakeSubtitles,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let config = AppConfig::for_tests(&root);
        let store = Arc::new(JobStore::new(config.paths.state_file()));
        let pipeline = Pipeline {
            supervisor: ProcessSupervisor::new(Duration::from_millis(200)),
            store,
            fetcher: Arc::new(fetcher),
            subtitles: Arc::new(subtitles),
            planner: Arc::new(planner(&root.join("outputs"))),
            config: Arc::new(config),
        };
        Harness {
            _dir: dir,
            root,
            scheduler: JobScheduler::new(pipeline),
        }
    }

    pub(crate) fn fetcher() -> FakeFetcher {
        FakeFetcher {
            fail: false,
            delay: Duration::ZERO,
        }
    }

    fn request(resolutions: &[&str]) -> SubmitRequest {
        SubmitRequest {
            video: SourceRef::parse("http://x/v.mp4"),
            subtitle: SourceRef::parse("http://x/s.srt"),
            resolutions: resolutions.iter().map(|r| r.to_string()).collect(),
            subtitle_mode: Some(SubtitleMode::Soft),
            job_id: None,
        }
    }

    async fn wait_for_task(h: &Harness, id: &str, task: &str) {
        for _ in 0..500 {
            if h.scheduler.status(id).unwrap().task_status(task) == Some(TaskStatus::InProgress) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never started", task);
    }

    pub(crate) async fn wait(h: &Harness, id: &str) -> Job {
        tokio::time::timeout(
            Duration::from_secs(20),
            h.scheduler.wait_for(id, Duration::from_millis(20)),
        )
        .await
        .expect("job did not finish in time")
        .unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_soft_subtitles() {
        let h = harness(ScriptPlanner::new, fetcher());
        let id = h.scheduler.submit(request(&["480p", "720p"])).unwrap();

        let job = wait(&h, &id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            job.outputs.keys().collect::<Vec<_>>(),
            vec!["480p", "720p"]
        );
        assert!(job.errors.is_empty());
        assert_eq!(job.progress.as_ref().map(|p| p.percentage), Some(100));
        assert!(job.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert_eq!(job.thumbnails.len(), 1);
        assert!(job.finished_at.is_some());

        // Persisted terminal record
        let reloaded = JobStore::load_and_reconcile(h.scheduler.pipeline().store.path()).unwrap();
        assert_eq!(reloaded.get(&id).unwrap().status, JobStatus::Completed);
        // Intermediate removed with its directory, originals kept
        assert!(!h.root.join("processing").join(&id).exists());
        assert!(h.root.join("downloads").join(&id).join("fetched.mp4").exists());
    }

    #[tokio::test]
    async fn test_partial_fan_out_failure_still_completes() {
        let h = harness(|out| ScriptPlanner::new(out).failing("1080p", 1), fetcher());
        let id = h.scheduler.submit(request(&["720p", "1080p"])).unwrap();

        let job = wait(&h, &id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.outputs.keys().collect::<Vec<_>>(), vec!["720p"]);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors["1080p"].kind, ErrorKind::EncodingError);
        assert_eq!(job.errors["1080p"].exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_every_resolution_failing_fails_job() {
        let h = harness(
            |out| ScriptPlanner::new(out).failing("720p", 137),
            fetcher(),
        );
        let id = h.scheduler.submit(request(&["720p"])).unwrap();

        let job = wait(&h, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.outputs.is_empty());
        assert!(job.errors["720p"].subtype.is_some());
        assert_eq!(job.task_status(TASK_ENCODE_VIDEOS), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn test_fetch_failure_fails_job() {
        let h = harness(
            ScriptPlanner::new,
            FakeFetcher {
                fail: true,
                delay: Duration::ZERO,
            },
        );
        let id = h.scheduler.submit(request(&["720p"])).unwrap();

        let job = wait(&h, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors["fetch"].kind, ErrorKind::DownloadError);
        assert!(job.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_second_submission_conflicts() {
        let h = harness(
            ScriptPlanner::new,
            FakeFetcher {
                fail: false,
                delay: Duration::from_millis(500),
            },
        );
        let first = h.scheduler.submit(request(&["720p"])).unwrap();

        match h.scheduler.submit(request(&["480p"])) {
            Err(Rejected::Conflict { running_job_id }) => assert_eq!(running_job_id, first),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(h.scheduler.list().len(), 1);
        assert!(!h.scheduler.system_status().can_submit);

        wait(&h, &first).await;
        let second = h.scheduler.submit(request(&["480p"])).unwrap();
        assert_ne!(first, second);
        wait(&h, &second).await;
    }

    #[tokio::test]
    async fn test_invalid_submissions() {
        let h = harness(ScriptPlanner::new, fetcher());
        assert!(matches!(
            h.scheduler.submit(request(&["4320p"])),
            Err(Rejected::Invalid(JobError::Validation(_)))
        ));

        let mut bad_url = request(&["720p"]);
        bad_url.video = SourceRef::Url("ftp://x/v.mp4".to_string());
        assert!(matches!(
            h.scheduler.submit(bad_url),
            Err(Rejected::Invalid(_))
        ));
        assert!(h.scheduler.list().is_empty());
        assert!(h.scheduler.running_job_id().is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_encode() {
        let h = harness(
            |out| {
                let mut planner = ScriptPlanner::new(out);
                planner.sleep_secs = 30.0;
                planner
            },
            fetcher(),
        );
        let id = h.scheduler.submit(request(&["480p", "720p"])).unwrap();

        wait_for_task(&h, &id, TASK_ENCODE_VIDEOS).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        h.scheduler.cancel(&id).unwrap();
        let job = wait(&h, &id).await;

        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.outputs.is_empty());
        assert!(!h.root.join("outputs/480p").join(format!("{}_out.mp4", id)).exists());
        assert!(matches!(
            h.scheduler.cancel(&id),
            Err(CancelError::NotActive { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let h = harness(ScriptPlanner::new, fetcher());
        assert!(matches!(
            h.scheduler.cancel("missing"),
            Err(CancelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hard_subtitle_mode_completes() {
        let h = harness(ScriptPlanner::new, fetcher());
        let mut req = request(&["360p"]);
        req.subtitle_mode = Some(SubtitleMode::Hard);
        let id = h.scheduler.submit(req).unwrap();

        let job = wait(&h, &id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.subtitle_mode, SubtitleMode::Hard);
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let h = harness(ScriptPlanner::new, fetcher());
        let id = h.scheduler.submit(request(&["720p"])).unwrap();
        // The worker task has not been polled yet
        assert_eq!(h.scheduler.status(&id).unwrap().status, JobStatus::Queued);
        h.scheduler.cancel(&id).unwrap();

        let job = wait(&h, &id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert!(job.outputs.is_empty());
        assert!(h.scheduler.system_status().can_submit);
    }

    #[tokio::test]
    async fn test_cancel_during_fetch() {
        let h = harness(
            ScriptPlanner::new,
            FakeFetcher {
                fail: false,
                delay: Duration::from_secs(30),
            },
        );
        let id = h.scheduler.submit(request(&["720p"])).unwrap();
        wait_for_task(&h, &id, TASK_DOWNLOAD_VIDEO).await;

        h.scheduler.cancel(&id).unwrap();
        let job = wait(&h, &id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.task_status(TASK_DOWNLOAD_VIDEO), Some(TaskStatus::Failed));
        assert_eq!(job.task_status(TASK_PROCESS_SUBTITLES), Some(TaskStatus::Pending));
        assert!(job.errors.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_subtitle_stage() {
        let h = harness_with(
            ScriptPlanner::new,
            fetcher(),
            FakeSubtitles {
                delay: Duration::from_secs(30),
                ..Default::default()
            },
        );
        let id = h.scheduler.submit(request(&["720p"])).unwrap();
        wait_for_task(&h, &id, TASK_PROCESS_SUBTITLES).await;

        h.scheduler.cancel(&id).unwrap();
        let job = wait(&h, &id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.task_status(TASK_PROCESS_SUBTITLES), Some(TaskStatus::Failed));
        assert_eq!(job.task_status(TASK_ENCODE_VIDEOS), Some(TaskStatus::Pending));
        assert!(job.outputs.is_empty());
        assert!(!h.root.join("processing").join(&id).exists());
    }

    #[tokio::test]
    async fn test_cancelling_holds_the_slot_while_a_stage_unwinds() {
        let h = harness_with(
            ScriptPlanner::new,
            fetcher(),
            FakeSubtitles {
                delay: Duration::from_secs(30),
                unwind: Duration::from_millis(500),
                ..Default::default()
            },
        );
        let id = h.scheduler.submit(request(&["720p"])).unwrap();
        wait_for_task(&h, &id, TASK_PROCESS_SUBTITLES).await;
        h.scheduler.cancel(&id).unwrap();

        let mut seen = false;
        for _ in 0..40 {
            if h.scheduler.status(&id).unwrap().status == JobStatus::Cancelling {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(seen, "job never reported cancelling");
        assert_eq!(h.scheduler.status(&id).unwrap().stage, "Cancelling");
        match h.scheduler.submit(request(&["480p"])) {
            Err(Rejected::Conflict { running_job_id }) => assert_eq!(running_job_id, id),
            other => panic!("expected conflict, got {:?}", other),
        }

        let job = wait(&h, &id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(h.scheduler.system_status().can_submit);
    }

    #[tokio::test]
    async fn test_subtitle_failure_fails_job() {
        let h = harness_with(
            ScriptPlanner::new,
            fetcher(),
            FakeSubtitles {
                fail: true,
                ..Default::default()
            },
        );
        let id = h.scheduler.submit(request(&["720p"])).unwrap();

        let job = wait(&h, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors["subtitle"].kind, ErrorKind::SubtitleError);
        assert_eq!(job.task_status(TASK_PROCESS_SUBTITLES), Some(TaskStatus::Failed));
        assert_eq!(job.task_status(TASK_ENCODE_VIDEOS), Some(TaskStatus::Pending));
        assert!(job.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_thumbnail_failure_still_completes() {
        let h = harness(
            |out| {
                let mut planner = ScriptPlanner::new(out);
                planner.thumbnail_exit = 1;
                planner
            },
            fetcher(),
        );
        let id = h.scheduler.submit(request(&["720p"])).unwrap();

        let job = wait(&h, &id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.thumbnails.is_empty());
        assert_eq!(job.task_status(TASK_GENERATE_THUMBNAILS), Some(TaskStatus::Failed));
        assert!(job.errors.is_empty());
        assert_eq!(job.outputs.keys().collect::<Vec<_>>(), vec!["720p"]);
    }

    #[tokio::test]
    async fn test_jobs_over_same_video_keep_their_own_outputs() {
        let h = harness(
            |out| {
                let mut planner = ScriptPlanner::new(out);
                planner.fail_after = Some(1);
                planner
            },
            fetcher(),
        );
        let outputs = h.root.join("outputs/720p");

        let first = h.scheduler.submit(request(&["720p"])).unwrap();
        let first_job = wait(&h, &first).await;
        assert_eq!(first_job.status, JobStatus::Completed);
        let first_output = first_job.outputs["720p"].clone();
        assert_eq!(first_output, outputs.join(format!("{}_out.mp4", first)));

        // Same sources; this encode fails and its partial output is removed
        let second = h.scheduler.submit(request(&["720p"])).unwrap();
        let second_job = wait(&h, &second).await;
        assert_eq!(second_job.status, JobStatus::Failed);
        assert!(!outputs.join(format!("{}_out.mp4", second)).exists());

        assert_eq!(std::fs::read(&first_output).unwrap(), b"ok");
        assert!(h.root.join("downloads").join(&first).join("fetched.mp4").exists());
        assert!(h.root.join("downloads").join(&second).join("fetched.mp4").exists());
    }

    #[tokio::test]
    async fn test_reserved_job_id() {
        let h = harness(ScriptPlanner::new, fetcher());
        let mut req = request(&["720p"]);
        req.job_id = Some("20250101_000000_abcdef12".to_string());
        let id = h.scheduler.submit(req.clone()).unwrap();
        assert_eq!(id, "20250101_000000_abcdef12");
        wait(&h, &id).await;

        assert!(matches!(
            h.scheduler.submit(req),
            Err(Rejected::Invalid(JobError::Validation(_)))
        ));
    }
}
