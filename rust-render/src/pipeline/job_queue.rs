//! Durable render job queue.
//!
//! Jobs live in SQLite; any number of worker pools (in this process or
//! others) claim them through [`JobRepository::claim_next_job`], which hands
//! each job to exactly one worker under a time-bounded lease. Delivery is
//! at-least-once: a failed attempt or a dead worker's expired lease puts the
//! job back in play until its attempt limit is reached.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::status::{EventPublisher, PipelineEvent};
use crate::artifact::ArtifactReference;
use crate::database::models::{JobCounts, JobDbModel, JobStatus};
use crate::database::parse_rfc3339;
use crate::database::repositories::JobRepository;
use crate::project::ProjectSpec;
use crate::{Error, Result};

/// Failure reason recorded when a reclaimed job has no attempts left.
pub const ATTEMPT_LIMIT_REASON: &str = "attempt limit reached";

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// Attempts per job before it is marked failed.
    pub max_attempts: u32,
    /// Poll interval while waiting for active jobs during a drain.
    pub poll_interval_ms: u64,
    /// Extra lease time beyond the job timeout before a claim is considered
    /// abandoned.
    pub lease_grace_secs: u64,
    /// Return ACTIVE jobs with an expired lease to the queue on startup.
    pub recover_on_start: bool,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_interval_ms: 250,
            lease_grace_secs: 60,
            recover_on_start: true,
        }
    }
}

/// A render job as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    /// Serialized [`ProjectSpec`].
    pub payload: String,
    pub priority: i64,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub result: Option<ArtifactReference>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the project payload. A payload that does not decode is
    /// invalid input, not a transient fault.
    pub fn project(&self) -> Result<ProjectSpec> {
        serde_json::from_str(&self.payload)
            .map_err(|e| Error::invalid_project(format!("malformed payload: {}", e)))
    }

    pub fn attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

impl TryFrom<JobDbModel> for Job {
    type Error = Error;

    fn try_from(db: JobDbModel) -> Result<Self> {
        let status = JobStatus::parse(&db.status)
            .ok_or_else(|| Error::Other(format!("Unknown job status '{}' for job {}", db.status, db.id)))?;
        let result = match db.result.as_deref() {
            Some(raw) => match serde_json::from_str(raw) {
                Ok(artifact) => Some(artifact),
                Err(e) => {
                    warn!(job_id = %db.id, error = %e, "Invalid artifact JSON in job result");
                    None
                }
            },
            None => None,
        };
        let created_at = parse_rfc3339(&db.created_at).unwrap_or_else(Utc::now);

        Ok(Self {
            status,
            result,
            created_at,
            started_at: db.started_at.as_deref().and_then(parse_rfc3339),
            finished_at: db.finished_at.as_deref().and_then(parse_rfc3339),
            updated_at: parse_rfc3339(&db.updated_at).unwrap_or(created_at),
            attempts_made: db.attempts_made.max(0) as u32,
            max_attempts: db.max_attempts.max(0) as u32,
            id: db.id,
            name: db.name,
            payload: db.payload,
            priority: db.priority,
            failure_reason: db.failure_reason,
        })
    }
}

/// A job claimed by a worker together with its cancellation token.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub cancel: CancellationToken,
}

/// What `fail` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Put back in the queue for another attempt.
    Retrying,
    /// Marked failed; no further attempts.
    Failed,
}

/// Result of a drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Queued jobs removed from the store.
    pub discarded: Vec<String>,
    /// Whether the drain waited for active jobs to finish.
    pub waited_for_active: bool,
}

/// Queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub counts: JobCounts,
    pub paused: bool,
}

/// The job queue service.
pub struct JobQueue {
    config: JobQueueConfig,
    repository: Arc<dyn JobRepository>,
    events: EventPublisher,
    /// Lease length for claims.
    lease: Duration,
    /// Notify when new jobs are added.
    notify: Arc<Notify>,
    /// Cancellation tokens for jobs claimed by this process.
    cancellation_tokens: DashMap<String, CancellationToken>,
    /// Claim instants, for job durations.
    started: DashMap<String, Instant>,
}

impl JobQueue {
    pub fn new(config: JobQueueConfig, repository: Arc<dyn JobRepository>, events: EventPublisher) -> Self {
        Self {
            config,
            repository,
            events,
            lease: Duration::from_secs(3600),
            notify: Arc::new(Notify::new()),
            cancellation_tokens: DashMap::new(),
            started: DashMap::new(),
        }
    }

    /// Set the claim lease; it should outlast the per-job timeout.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Notifier signalled whenever a job becomes claimable.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Enqueue a named render job. Returns the new job id.
    pub async fn enqueue(&self, name: &str, project: &ProjectSpec) -> Result<String> {
        self.enqueue_with_priority(name, project, 0).await
    }

    /// Enqueue with an explicit priority; higher runs first.
    pub async fn enqueue_with_priority(&self, name: &str, project: &ProjectSpec, priority: i64) -> Result<String> {
        if self.repository.is_paused().await? {
            return Err(Error::QueueDraining);
        }

        let payload = serde_json::to_string(project)?;
        let db_job = JobDbModel::new(name, payload, priority, self.config.max_attempts as i64);
        self.repository.create_job(&db_job).await?;

        info!(job_id = %db_job.id, name = %name, priority, "Enqueued render job");
        self.events.publish(PipelineEvent::JobEnqueued {
            job_id: db_job.id.clone(),
            name: name.to_string(),
        });
        self.notify.notify_one();

        Ok(db_job.id)
    }

    /// Claim the next runnable job, or `None` if there is none or the queue
    /// is paused.
    pub async fn dequeue(&self) -> Result<Option<ClaimedJob>> {
        loop {
            if self.repository.is_paused().await? {
                return Ok(None);
            }

            let lease_secs = self.lease.as_secs().max(1) as i64;
            let Some(db_job) = self.repository.claim_next_job(lease_secs).await? else {
                return Ok(None);
            };
            let job = Job::try_from(db_job)?;

            // Only reachable through a reclaimed lease: the previous holder
            // died after using the last attempt.
            if job.attempts_made > job.max_attempts {
                warn!(job_id = %job.id, attempts = job.attempts_made, "Reclaimed job has no attempts left");
                if self.repository.mark_failed(&job.id, ATTEMPT_LIMIT_REASON).await? {
                    self.events.publish(PipelineEvent::JobFailed {
                        job_id: job.id.clone(),
                        error: ATTEMPT_LIMIT_REASON.to_string(),
                        cancelled: false,
                    });
                }
                continue;
            }

            let cancel = CancellationToken::new();
            self.cancellation_tokens.insert(job.id.clone(), cancel.clone());
            self.started.insert(job.id.clone(), Instant::now());

            debug!(job_id = %job.id, attempt = job.attempts_made, "Claimed render job");
            self.events.publish(PipelineEvent::JobStarted {
                job_id: job.id.clone(),
                name: job.name.clone(),
                attempt: job.attempts_made,
            });

            return Ok(Some(ClaimedJob { job, cancel }));
        }
    }

    /// Mark a claimed job completed with its artifact.
    pub async fn complete(&self, job_id: &str, artifact: &ArtifactReference) -> Result<()> {
        let _ = self.cancellation_tokens.remove(job_id);
        let duration_secs = self
            .started
            .remove(job_id)
            .map(|(_, t)| t.elapsed().as_secs_f64())
            .unwrap_or_default();

        let result = serde_json::to_string(artifact)?;
        if !self.repository.mark_completed(job_id, &result).await? {
            let current = self.repository.get_job(job_id).await?;
            return Err(Error::InvalidStateTransition {
                from: current.status,
                to: JobStatus::Completed.as_str().to_string(),
            });
        }

        info!(job_id = %job_id, location = %artifact.location, "Job {} completed in {:.2}s", job_id, duration_secs);
        self.events.publish(PipelineEvent::JobCompleted {
            job_id: job_id.to_string(),
            artifact: artifact.clone(),
            duration_secs,
        });
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Retryable errors with attempts left requeue the job; anything else
    /// marks it failed. While the queue is drained every failure is final, so
    /// a waiting drain sees each in-flight job reach a terminal state.
    /// Cancellation is not logged as an error.
    pub async fn fail(&self, job: &Job, err: &Error) -> Result<FailOutcome> {
        let _ = self.cancellation_tokens.remove(&job.id);
        let _ = self.started.remove(&job.id);
        let reason = err.failure_reason();

        let retry = err.is_retryable() && job.attempts_left();
        if retry && self.repository.is_paused().await? {
            debug!(job_id = %job.id, "Queue drained, not retrying failed job");
        } else if retry {
            if self.repository.requeue(&job.id, &reason).await? {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    error = %err,
                    "Render attempt failed, retrying"
                );
                self.events.publish(PipelineEvent::JobRetrying {
                    job_id: job.id.clone(),
                    attempt: job.attempts_made,
                    error: reason,
                });
                self.notify.notify_one();
                return Ok(FailOutcome::Retrying);
            }
            // Not active any more (cancelled from elsewhere); fall through.
        }

        let marked = self.repository.mark_failed(&job.id, &reason).await?;
        if err.is_cancellation() {
            info!(job_id = %job.id, "Render job cancelled");
        } else {
            error!(job_id = %job.id, attempt = job.attempts_made, error = %err, "Render job failed");
        }
        if marked {
            self.events.publish(PipelineEvent::JobFailed {
                job_id: job.id.clone(),
                error: reason,
                cancelled: err.is_cancellation(),
            });
        }
        Ok(FailOutcome::Failed)
    }

    /// Hand an interrupted job back to the queue without recording a failure.
    ///
    /// Used when a worker stops mid-job; the attempt still counts.
    pub async fn release(&self, job: &Job) -> Result<()> {
        let _ = self.cancellation_tokens.remove(&job.id);
        let _ = self.started.remove(&job.id);
        if self.repository.requeue(&job.id, "interrupted by shutdown").await? {
            info!(job_id = %job.id, "Released job back to the queue");
            self.events.publish(PipelineEvent::JobRetrying {
                job_id: job.id.clone(),
                attempt: job.attempts_made,
                error: "interrupted by shutdown".to_string(),
            });
        }
        Ok(())
    }

    /// Stop accepting and dispatching jobs.
    ///
    /// With `wait_for_active`, waits until no live worker holds a job; queued
    /// jobs stay queued. Without it, queued jobs are deleted and the call
    /// returns immediately. Claimed jobs are never touched.
    pub async fn drain(&self, wait_for_active: bool) -> Result<DrainReport> {
        self.repository.set_paused(true).await?;
        info!(wait_for_active, "Queue paused for drain");

        let mut report = DrainReport {
            discarded: Vec::new(),
            waited_for_active: wait_for_active,
        };

        if wait_for_active {
            let poll = Duration::from_millis(self.config.poll_interval_ms.max(10));
            loop {
                let in_flight = self.repository.count_in_flight().await?;
                if in_flight == 0 {
                    break;
                }
                debug!(in_flight, "Waiting for active jobs to finish");
                tokio::time::sleep(poll).await;
            }
        } else {
            report.discarded = self.repository.delete_queued_jobs().await?;
            if !report.discarded.is_empty() {
                info!(count = report.discarded.len(), "Discarded queued jobs");
                self.events.publish(PipelineEvent::JobsDiscarded {
                    job_ids: report.discarded.clone(),
                });
            }
        }

        self.events.publish(PipelineEvent::QueueDrained {
            wait_for_active,
            discarded: report.discarded.len(),
        });
        info!(discarded = report.discarded.len(), "Queue drained");
        Ok(report)
    }

    /// Clear the drain flag.
    pub async fn resume(&self) -> Result<()> {
        self.repository.set_paused(false).await?;
        info!("Queue resumed");
        self.events.publish(PipelineEvent::QueueResumed);
        self.notify.notify_waiters();
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        self.repository.is_paused().await
    }

    /// Cancel a job.
    ///
    /// Queued jobs are failed directly. Active jobs held by this process get
    /// their token fired and the worker records the outcome. Active jobs held
    /// by another process are failed in the store; their worker notices on its
    /// next status check and tears the run down.
    pub async fn cancel_job(&self, id: &str) -> Result<()> {
        let job = Job::try_from(self.repository.get_job(id).await?)?;

        match job.status {
            JobStatus::Completed | JobStatus::Failed => Err(Error::InvalidStateTransition {
                from: job.status.as_str().to_string(),
                to: JobStatus::Failed.as_str().to_string(),
            }),
            JobStatus::Queued => {
                self.mark_cancelled(id).await?;
                info!(job_id = %id, "Cancelled queued job");
                Ok(())
            }
            JobStatus::Active => {
                if let Some(token) = self.cancellation_tokens.get(id) {
                    info!(job_id = %id, "Cancelling active job");
                    token.cancel();
                } else {
                    self.mark_cancelled(id).await?;
                    info!(job_id = %id, "Cancelled job active in another process");
                }
                Ok(())
            }
        }
    }

    async fn mark_cancelled(&self, id: &str) -> Result<()> {
        let reason = Error::Cancelled.failure_reason();
        if self.repository.mark_failed(id, &reason).await? {
            self.events.publish(PipelineEvent::JobFailed {
                job_id: id.to_string(),
                error: reason,
                cancelled: true,
            });
        }
        Ok(())
    }

    /// Whether the store still records `id` as active. Workers use this to
    /// notice cancellation issued from another process.
    pub async fn is_still_active(&self, id: &str) -> Result<bool> {
        let job = self.repository.get_job(id).await?;
        Ok(JobStatus::parse(&job.status) == Some(JobStatus::Active))
    }

    /// Return jobs abandoned by a dead worker to the queue.
    ///
    /// Only claims whose lease has expired are reset; a job still under lease
    /// may be running in another process sharing the store.
    pub async fn recover_jobs(&self) -> Result<u64> {
        let reset = self.repository.reset_expired_jobs().await?;
        if reset > 0 {
            info!("Reset {} interrupted jobs to queued", reset);
            self.notify.notify_waiters();
        }
        Ok(reset)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        Job::try_from(self.repository.get_job(id).await?)
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.repository
            .list_jobs(status)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            counts: self.repository.count_by_status().await?,
            paused: self.repository.is_paused().await?,
        })
    }
}
