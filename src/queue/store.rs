use super::job::{Job, JobStatus};
use crate::error::{ErrorDescriptor, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// On-disk document: every known job plus the time of writing
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    jobs: BTreeMap<String, Job>,
    timestamp: DateTime<Utc>,
}

/// Keyed job records with an atomic JSON snapshot on disk.
///
/// Readers get clones; the map itself never leaves the store. Mutations
/// only touch memory, durability comes from [`JobStore::persist`] or, on
/// runtime threads, [`JobStore::save`].
pub struct JobStore {
    jobs: RwLock<HashMap<String, Job>>,
    path: PathBuf,
    /// Serializes snapshot + write so an older snapshot never lands last
    write_lock: Mutex<()>,
}

impl JobStore {
    /// Empty store persisting to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Load the state file and rewrite every job left active by a previous
    /// process as `Interrupted`. Called once at startup.
    pub fn load_and_reconcile(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(path);

        let loaded = match std::fs::read_to_string(&store.path) {
            Ok(content) => match serde_json::from_str::<StateFile>(&content) {
                Ok(state) => state.jobs,
                Err(e) => {
                    let backup = store.path.with_extension("json.corrupt");
                    warn!(
                        "State file {} is unreadable ({}), moving it to {}",
                        store.path.display(),
                        e,
                        backup.display()
                    );
                    if let Err(e) = std::fs::rename(&store.path, &backup) {
                        warn!("Failed to move corrupt state file: {}", e);
                    }
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: store.path.clone(),
                    source,
                });
            }
        };

        let mut reconciled = 0;
        {
            let mut jobs = store.write_jobs();
            for (id, mut job) in loaded {
                if job.status.is_active() {
                    let previous = job.status;
                    job.status = JobStatus::Interrupted;
                    job.stage = "Interrupted".to_string();
                    job.finished_at = Some(Utc::now());
                    job.errors.insert(
                        "interrupted".to_string(),
                        ErrorDescriptor::interrupted(format!(
                            "Job was {:?} when the server stopped and will not be resumed",
                            previous
                        )),
                    );
                    reconciled += 1;
                }
                jobs.insert(id, job);
            }
            info!("Loaded {} job(s) from state file", jobs.len());
        }

        if reconciled > 0 {
            info!("Marked {} unfinished job(s) as interrupted", reconciled);
        }
        store.persist()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace a record
    pub fn put(&self, job: Job) {
        self.write_jobs().insert(job.id.clone(), job);
    }

    pub fn get(&self, id: &str) -> Result<Job, StoreError> {
        self.read_jobs()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// All jobs, newest submission first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.read_jobs().values().cloned().collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }

    /// Mutate a record. Status changes must go through [`JobStore::transition`].
    pub fn update<F>(&self, id: &str, f: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.write_jobs();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let status = job.status;
        f(job);
        job.status = status;
        Ok(job.clone())
    }

    /// Move a job along the state machine and apply `f`
    pub fn transition<F>(&self, id: &str, next: JobStatus, f: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job),
    {
        let job = {
            let mut jobs = self.write_jobs();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            if !job.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    from: job.status,
                    to: next,
                });
            }

            debug!("Job {}: {:?} -> {:?}", id, job.status, next);
            job.status = next;
            if next == JobStatus::Processing && job.started_at.is_none() {
                job.started_at = Some(Utc::now());
            }
            if next.is_terminal() {
                job.finished_at = Some(Utc::now());
            }
            f(job);
            job.status = next;
            job.clone()
        };
        Ok(job)
    }

    /// Id of the job currently holding the pipeline, if any
    pub fn active_job_id(&self) -> Option<String> {
        self.read_jobs()
            .values()
            .filter(|j| j.status.is_active())
            .min_by_key(|j| j.submitted_at)
            .map(|j| j.id.clone())
    }

    /// Number of jobs per status
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for job in self.read_jobs().values() {
            let key = serde_json::to_value(job.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{:?}", job.status));
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }

    /// Write every record to the state file via temp file and rename
    pub fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let state = StateFile {
            jobs: self
                .read_jobs()
                .iter()
                .map(|(id, job)| (id.clone(), job.clone()))
                .collect(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&state)?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// [`JobStore::persist`] on the blocking pool. Failures are logged and
    /// never fail the job itself.
    pub async fn save(self: &Arc<Self>) {
        let store = Arc::clone(self);
        match tokio::task::spawn_blocking(move || store.persist()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to persist job state: {}", e),
            Err(e) => warn!("State writer stopped: {}", e),
        }
    }

    /// Detached [`JobStore::save`] for synchronous callbacks running on the
    /// runtime. Snapshots are taken under the write lock, so a late writer
    /// never lands an older state.
    pub fn save_in_background(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.persist() {
                warn!("Failed to persist job state: {}", e);
            }
        });
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Job>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Job>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }
}
