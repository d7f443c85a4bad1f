//! Pipeline state reporting.
//!
//! The queue and the runner publish [`PipelineEvent`]s; the
//! [`StatusReporter`] folds them into one [`JobSnapshot`] per job for status
//! readers. Events are also broadcast to any other subscriber.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use super::job_queue::Job;
use crate::artifact::ArtifactReference;
use crate::database::models::JobStatus;
use crate::runner::RunnerStage;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the queue and the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Job persisted as queued.
    JobEnqueued { job_id: String, name: String },
    /// Job claimed by a worker.
    JobStarted {
        job_id: String,
        name: String,
        attempt: u32,
    },
    /// Runner moved to a new stage.
    StageChanged { job_id: String, stage: RunnerStage },
    /// Frames accepted by the encoder so far.
    FrameProgress {
        job_id: String,
        frames_done: u64,
        frames_total: u64,
    },
    /// Attempt failed; the job is queued again.
    JobRetrying {
        job_id: String,
        attempt: u32,
        error: String,
    },
    /// Job completed with an artifact.
    JobCompleted {
        job_id: String,
        artifact: ArtifactReference,
        duration_secs: f64,
    },
    /// Job failed permanently or was cancelled.
    JobFailed {
        job_id: String,
        error: String,
        cancelled: bool,
    },
    /// Queued jobs removed by a discarding drain.
    JobsDiscarded { job_ids: Vec<String> },
    /// Queue paused by a drain.
    QueueDrained { wait_for_active: bool, discarded: usize },
    /// Queue accepting and dispatching again.
    QueueResumed,
}

/// Latest known state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub name: String,
    pub status: JobStatus,
    pub stage: RunnerStage,
    pub attempts_made: u32,
    pub frames_done: u64,
    pub frames_total: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobSnapshot {
    fn new(job_id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            name: name.to_string(),
            status: JobStatus::Queued,
            stage: RunnerStage::Queued,
            attempts_made: 0,
            frames_done: 0,
            frames_total: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            artifact: None,
            error: None,
        }
    }

    /// Snapshot of a stored job, used to seed the reporter at startup.
    pub fn from_job(job: &Job) -> Self {
        let stage = match job.status {
            JobStatus::Queued | JobStatus::Active => RunnerStage::Queued,
            JobStatus::Completed => RunnerStage::Completed,
            JobStatus::Failed => RunnerStage::Failed,
        };
        Self {
            job_id: job.id.clone(),
            name: job.name.clone(),
            status: job.status,
            stage,
            attempts_made: job.attempts_made,
            frames_done: job.result.as_ref().map(|a| a.frames).unwrap_or(0),
            frames_total: job.result.as_ref().map(|a| a.frames).unwrap_or(0),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            updated_at: job.updated_at,
            artifact: job.result.clone(),
            error: job.failure_reason.clone(),
        }
    }
}

/// Aggregates events into per-job snapshots. Holds no business logic.
#[derive(Debug, Default)]
pub struct StatusReporter {
    jobs: RwLock<BTreeMap<String, JobSnapshot>>,
    paused: AtomicBool,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all snapshots with the stored jobs.
    pub fn seed(&self, jobs: &[Job], paused: bool) {
        let mut map = self.jobs.write();
        map.clear();
        for job in jobs {
            map.insert(job.id.clone(), JobSnapshot::from_job(job));
        }
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn apply(&self, event: &PipelineEvent) {
        let now = Utc::now();
        let mut jobs = self.jobs.write();

        match event {
            PipelineEvent::JobEnqueued { job_id, name } => {
                jobs.insert(job_id.clone(), JobSnapshot::new(job_id, name));
            }
            PipelineEvent::JobStarted {
                job_id,
                name,
                attempt,
            } => {
                let snap = jobs
                    .entry(job_id.clone())
                    .or_insert_with(|| JobSnapshot::new(job_id, name));
                snap.status = JobStatus::Active;
                snap.stage = RunnerStage::Queued;
                snap.attempts_made = *attempt;
                snap.frames_done = 0;
                snap.frames_total = 0;
                snap.started_at = Some(now);
                snap.updated_at = now;
            }
            PipelineEvent::StageChanged { job_id, stage } => {
                if let Some(snap) = jobs.get_mut(job_id) {
                    snap.stage = *stage;
                    snap.updated_at = now;
                }
            }
            PipelineEvent::FrameProgress {
                job_id,
                frames_done,
                frames_total,
            } => {
                if let Some(snap) = jobs.get_mut(job_id) {
                    snap.frames_done = *frames_done;
                    snap.frames_total = *frames_total;
                    snap.updated_at = now;
                }
            }
            PipelineEvent::JobRetrying { job_id, error, .. } => {
                if let Some(snap) = jobs.get_mut(job_id) {
                    snap.status = JobStatus::Queued;
                    snap.stage = RunnerStage::Queued;
                    snap.error = Some(error.clone());
                    snap.updated_at = now;
                }
            }
            PipelineEvent::JobCompleted {
                job_id, artifact, ..
            } => {
                if let Some(snap) = jobs.get_mut(job_id) {
                    snap.status = JobStatus::Completed;
                    snap.stage = RunnerStage::Completed;
                    snap.artifact = Some(artifact.clone());
                    snap.error = None;
                    snap.finished_at = Some(now);
                    snap.updated_at = now;
                }
            }
            PipelineEvent::JobFailed { job_id, error, .. } => {
                if let Some(snap) = jobs.get_mut(job_id) {
                    snap.status = JobStatus::Failed;
                    snap.stage = RunnerStage::Failed;
                    snap.error = Some(error.clone());
                    snap.finished_at = Some(now);
                    snap.updated_at = now;
                }
            }
            PipelineEvent::JobsDiscarded { job_ids } => {
                for id in job_ids {
                    jobs.remove(id);
                }
            }
            PipelineEvent::QueueDrained { .. } => self.paused.store(true, Ordering::SeqCst),
            PipelineEvent::QueueResumed => self.paused.store(false, Ordering::SeqCst),
        }
    }

    pub fn snapshot_all(&self) -> BTreeMap<String, JobSnapshot> {
        self.jobs.read().clone()
    }

    pub fn get(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs.read().get(job_id).cloned()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Applies events to the reporter, then broadcasts them.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    reporter: Arc<StatusReporter>,
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(Arc::new(StatusReporter::new()))
    }
}

impl EventPublisher {
    pub fn new(reporter: Arc<StatusReporter>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { reporter, tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        self.reporter.apply(&event);
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn reporter(&self) -> &Arc<StatusReporter> {
        &self.reporter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> ArtifactReference {
        ArtifactReference {
            location: "/artifacts/a.mp4".into(),
            size_bytes: 10,
            frames: 3,
            width: 1,
            height: 1,
            fps: 1,
        }
    }

    #[test]
    fn test_lifecycle_is_folded_into_snapshot() {
        let reporter = StatusReporter::new();
        reporter.apply(&PipelineEvent::JobEnqueued {
            job_id: "j1".into(),
            name: "intro".into(),
        });
        assert_eq!(reporter.get("j1").unwrap().status, JobStatus::Queued);

        reporter.apply(&PipelineEvent::JobStarted {
            job_id: "j1".into(),
            name: "intro".into(),
            attempt: 1,
        });
        reporter.apply(&PipelineEvent::StageChanged {
            job_id: "j1".into(),
            stage: RunnerStage::Exporting,
        });
        reporter.apply(&PipelineEvent::FrameProgress {
            job_id: "j1".into(),
            frames_done: 2,
            frames_total: 3,
        });

        let snap = reporter.get("j1").unwrap();
        assert_eq!(snap.status, JobStatus::Active);
        assert_eq!(snap.stage, RunnerStage::Exporting);
        assert_eq!((snap.frames_done, snap.frames_total), (2, 3));
        assert!(snap.started_at.is_some());

        reporter.apply(&PipelineEvent::JobCompleted {
            job_id: "j1".into(),
            artifact: artifact(),
            duration_secs: 1.5,
        });
        let snap = reporter.get("j1").unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.artifact, Some(artifact()));
        assert!(snap.finished_at.is_some());
    }

    #[test]
    fn test_retry_then_failure_keeps_reason() {
        let reporter = StatusReporter::new();
        reporter.apply(&PipelineEvent::JobEnqueued {
            job_id: "j2".into(),
            name: "outro".into(),
        });
        reporter.apply(&PipelineEvent::JobRetrying {
            job_id: "j2".into(),
            attempt: 1,
            error: "encoder failed".into(),
        });
        assert_eq!(reporter.get("j2").unwrap().status, JobStatus::Queued);

        reporter.apply(&PipelineEvent::JobFailed {
            job_id: "j2".into(),
            error: "encoder failed".into(),
            cancelled: false,
        });
        let snap = reporter.get("j2").unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.stage, RunnerStage::Failed);
        assert_eq!(snap.error.as_deref(), Some("encoder failed"));
    }

    #[test]
    fn test_discard_and_drain_flags() {
        let reporter = StatusReporter::new();
        for id in ["a", "b"] {
            reporter.apply(&PipelineEvent::JobEnqueued {
                job_id: id.into(),
                name: id.into(),
            });
        }
        reporter.apply(&PipelineEvent::JobsDiscarded {
            job_ids: vec!["a".into()],
        });
        reporter.apply(&PipelineEvent::QueueDrained {
            wait_for_active: false,
            discarded: 1,
        });

        let all = reporter.snapshot_all();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["b"]);
        assert!(reporter.is_paused());

        reporter.apply(&PipelineEvent::QueueResumed);
        assert!(!reporter.is_paused());
    }

    #[tokio::test]
    async fn test_publisher_updates_reporter_before_broadcast() {
        let publisher = EventPublisher::default();
        let mut rx = publisher.subscribe();

        publisher.publish(PipelineEvent::JobEnqueued {
            job_id: "j3".into(),
            name: "x".into(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, PipelineEvent::JobEnqueued { ref job_id, .. } if job_id == "j3"));
        assert!(publisher.reporter().get("j3").is_some());
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(PipelineEvent::StageChanged {
            job_id: "j".into(),
            stage: RunnerStage::Finalizing,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "stage_changed", "job_id": "j", "stage": "finalizing"})
        );
    }
}
