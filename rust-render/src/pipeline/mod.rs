//! Render pipeline: durable job queue, worker pool and status reporting.
//!
//! - Jobs are persisted in SQLite and claimed under a lease
//! - A fixed pool of workers runs claimed jobs through a [`JobHandler`]
//! - Failed attempts are retried until the job's attempt limit
//! - A drain flag stops intake and dispatch across every process
//! - Every state change is published as a [`PipelineEvent`]

mod job_queue;
mod manager;
mod status;
mod worker_pool;

pub use job_queue::{
    ATTEMPT_LIMIT_REASON, ClaimedJob, DrainReport, FailOutcome, Job, JobQueue, JobQueueConfig,
    QueueStats,
};
pub use manager::RenderService;
pub use status::{EventPublisher, JobSnapshot, PipelineEvent, StatusReporter};
pub use worker_pool::{JobHandler, WorkerPool, WorkerPoolConfig};
