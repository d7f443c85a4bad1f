//! Render service: wires the queue, the worker pool, the runner and the
//! status reporter together behind one facade.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::job_queue::{DrainReport, Job, JobQueue, JobQueueConfig, QueueStats};
use super::status::{EventPublisher, JobSnapshot, PipelineEvent, StatusReporter};
use super::worker_pool::{JobHandler, WorkerPool, WorkerPoolConfig};
use crate::Result;
use crate::config::AppConfig;
use crate::database::DbPool;
use crate::database::models::JobStatus;
use crate::database::repositories::{JobRepository, SqlxJobRepository};
use crate::project::ProjectSpec;
use crate::runner::RenderRunner;

/// The render pipeline as seen by producers, admins and status readers.
pub struct RenderService {
    job_queue: Arc<JobQueue>,
    pool: WorkerPool,
    handler: Arc<dyn JobHandler>,
    events: EventPublisher,
}

impl RenderService {
    /// Assemble a service around an arbitrary job handler.
    pub fn new(
        queue_config: JobQueueConfig,
        pool_config: WorkerPoolConfig,
        repository: Arc<dyn JobRepository>,
        handler: Arc<dyn JobHandler>,
        events: EventPublisher,
    ) -> Self {
        // A live worker's lease must outlast its job timeout.
        let lease = Duration::from_secs(pool_config.job_timeout_secs + queue_config.lease_grace_secs);
        let job_queue = Arc::new(JobQueue::new(queue_config, repository, events.clone()).with_lease(lease));

        Self {
            job_queue,
            pool: WorkerPool::new(pool_config),
            handler,
            events,
        }
    }

    /// Build the production service: SQLite store and the ffmpeg-backed runner.
    pub fn from_config(config: &AppConfig, db: DbPool) -> Self {
        let events = EventPublisher::new(Arc::new(StatusReporter::new()));
        let runner = RenderRunner::from_config(config, events.clone());
        Self::new(
            config.queue.clone(),
            config.workers.clone(),
            Arc::new(SqlxJobRepository::new(db)),
            Arc::new(runner),
            events,
        )
    }

    pub fn job_queue(&self) -> &Arc<JobQueue> {
        &self.job_queue
    }

    /// Recover interrupted jobs, load the reporter and start the workers.
    pub async fn start(&self) -> Result<()> {
        info!("Starting render service");

        if self.job_queue.config().recover_on_start {
            info!("Recovering jobs from database...");
            let recovered = self.job_queue.recover_jobs().await?;
            if recovered == 0 {
                debug!("No jobs to recover from database");
            }
        }

        self.load_status().await?;
        self.pool.start(self.job_queue.clone(), self.handler.clone());

        info!("Render service started");
        Ok(())
    }

    /// Stop the workers. Jobs still running go back to the queue.
    pub async fn shutdown(&self) {
        info!("Stopping render service");
        self.pool.stop().await;
        info!("Render service stopped");
    }

    /// Replace the reporter's snapshots with the stored jobs.
    pub async fn load_status(&self) -> Result<()> {
        let jobs = self.job_queue.list_jobs(None).await?;
        let paused = self.job_queue.is_paused().await?;
        self.events.reporter().seed(&jobs, paused);
        debug!(jobs = jobs.len(), paused, "Loaded job status from database");
        Ok(())
    }

    pub async fn enqueue(&self, name: &str, project: &ProjectSpec) -> Result<String> {
        self.job_queue.enqueue(name, project).await
    }

    pub async fn enqueue_with_priority(&self, name: &str, project: &ProjectSpec, priority: i64) -> Result<String> {
        self.job_queue.enqueue_with_priority(name, project, priority).await
    }

    /// Latest snapshot of every known job.
    pub fn status(&self) -> BTreeMap<String, JobSnapshot> {
        self.events.reporter().snapshot_all()
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobSnapshot> {
        self.events.reporter().get(job_id)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.job_queue.get_job(id).await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.job_queue.list_jobs(status).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.job_queue.stats().await
    }

    pub async fn drain(&self, wait_for_active: bool) -> Result<DrainReport> {
        self.job_queue.drain(wait_for_active).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.job_queue.resume().await
    }

    pub async fn cancel_job(&self, id: &str) -> Result<()> {
        self.job_queue.cancel_job(id).await
    }

    /// Subscribe to pipeline events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    pub fn active_workers(&self) -> usize {
        self.pool.active_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactReference;
    use crate::database::test_pool;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: &Job, _cancel: CancellationToken) -> Result<ArtifactReference> {
            let spec = job.project()?;
            Ok(ArtifactReference {
                location: format!("/out/{}.bin", job.id),
                size_bytes: spec.frame_len() as u64 * spec.frame_count(),
                frames: spec.frame_count(),
                width: spec.width,
                height: spec.height,
                fps: spec.fps,
            })
        }
    }

    fn project() -> ProjectSpec {
        serde_json::from_str(
            r##"{"width": 2, "height": 2, "fps": 1, "layers": [{"clips": [
                {"start_frame": 0, "duration_frames": 3, "source": {"type": "solid", "color": "#00ff00"}}
            ]}]}"##,
        )
        .unwrap()
    }

    async fn service(dir: &TempDir) -> RenderService {
        let pool = test_pool(dir).await;
        RenderService::new(
            JobQueueConfig {
                poll_interval_ms: 10,
                ..Default::default()
            },
            WorkerPoolConfig {
                max_workers: 1,
                job_timeout_secs: 30,
                poll_interval_ms: 10,
            },
            Arc::new(SqlxJobRepository::new(pool)),
            Arc::new(Echo),
            EventPublisher::default(),
        )
    }

    #[tokio::test]
    async fn test_status_tracks_job_to_completion() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let mut events = service.subscribe();
        service.start().await.unwrap();

        let id = service.enqueue("green", &project()).await.unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Ok(PipelineEvent::JobCompleted { job_id, .. })) if job_id == id => break,
                Ok(Ok(_)) => continue,
                other => panic!("unexpected: {:?}", other),
            }
        }

        let snapshot = service.job_status(&id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.artifact.unwrap().frames, 3);
        assert_eq!(service.get_job(&id).await.unwrap().status, JobStatus::Completed);

        service.shutdown().await;
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_load_status_reflects_store() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let id = service.enqueue("queued", &project()).await.unwrap();
        service.drain(true).await.unwrap();

        // A second service over the same store sees the job and the pause.
        let other = RenderService::new(
            JobQueueConfig::default(),
            WorkerPoolConfig::default(),
            Arc::new(SqlxJobRepository::new(test_pool(&dir).await)),
            Arc::new(Echo),
            EventPublisher::default(),
        );
        other.load_status().await.unwrap();

        let status = other.status();
        assert_eq!(status[&id].status, JobStatus::Queued);
        assert!(other.stats().await.unwrap().paused);
    }
}
