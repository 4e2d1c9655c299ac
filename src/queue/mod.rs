pub mod job;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use job::{Job, JobStatus, SourceRef, Sources, SubtitleMode, TaskStatus, generate_job_id};
pub use scheduler::{CancelError, JobScheduler, Rejected, SubmitRequest, SystemStatus};
pub use store::JobStore;
pub use worker::{JobWorker, Pipeline};
