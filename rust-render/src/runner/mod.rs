//! Render runner: executes one job from project spec to stored artifact.
//!
//! A run moves through `Queued -> Rendering -> Exporting -> Finalizing ->
//! Completed`, or to `Failed` from any non-terminal stage. Each run owns one
//! workspace and one export bridge; both are released on every exit path,
//! including when the run future is dropped by a timeout.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactReference, LocalArtifactStore};
use crate::config::AppConfig;
use crate::export::{EncoderBackend, EncoderSettings, ExportBridge, FfmpegBackend, RenderResult};
use crate::pipeline::{EventPublisher, Job, JobHandler, PipelineEvent};
use crate::project::AssetResolver;
use crate::render::{CpuCompositor, FrameRenderer};
use crate::workspace::{TempWorkspace, WorkspaceManager};
use crate::{Error, Result};

/// Progress events per job, at most.
const PROGRESS_STEPS: u64 = 100;

/// Runner lifecycle stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunnerStage {
    Queued,
    Rendering,
    Exporting,
    Finalizing,
    Completed,
    Failed,
}

impl RunnerStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Runs render jobs.
pub struct RenderRunner {
    workspaces: WorkspaceManager,
    assets: AssetResolver,
    artifacts: LocalArtifactStore,
    backend: Arc<dyn EncoderBackend>,
    ack_timeout: Duration,
    events: EventPublisher,
}

impl RenderRunner {
    pub fn new(
        workspaces: WorkspaceManager,
        assets: AssetResolver,
        artifacts: LocalArtifactStore,
        backend: Arc<dyn EncoderBackend>,
        events: EventPublisher,
    ) -> Self {
        Self {
            workspaces,
            assets,
            artifacts,
            backend,
            ack_timeout: Duration::from_secs(30),
            events,
        }
    }

    /// Build a runner with the ffmpeg backend from application config.
    pub fn from_config(config: &AppConfig, events: EventPublisher) -> Self {
        Self::new(
            WorkspaceManager::new(&config.workspace_root),
            AssetResolver::new(&config.asset_root),
            LocalArtifactStore::new(&config.artifact_dir),
            Arc::new(FfmpegBackend::from_config(&config.export)),
            events,
        )
        .with_ack_timeout(Duration::from_millis(config.export.ack_timeout_ms))
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Render `job` into an artifact.
    pub async fn run(&self, job: &Job, cancel: CancellationToken) -> Result<ArtifactReference> {
        let workspace = self.workspaces.create(&workspace_prefix(&job.id)).await?;
        let mut resources = JobResources {
            workspace: Some(workspace),
            bridge: None,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.execute(job, &mut resources) => result,
        };

        resources.release().await;

        if let Err(e) = &result {
            self.stage(job, RunnerStage::Failed);
            debug!(job_id = %job.id, error = %e, "Render run ended with error");
        }
        result
    }

    async fn execute(&self, job: &Job, resources: &mut JobResources) -> Result<ArtifactReference> {
        self.stage(job, RunnerStage::Rendering);

        // Invalid input must fail before any encoder is started.
        let project = self.assets.resolve(job.project()?).await?;
        let renderer: Arc<dyn FrameRenderer> = Arc::new(CpuCompositor::new(project));
        let settings = EncoderSettings::from(renderer.geometry());
        let total = renderer.frame_count();

        let workspace = resources
            .workspace
            .as_ref()
            .map(|w| w.path().to_path_buf())
            .ok_or_else(|| Error::Other("job workspace already released".to_string()))?;
        let bridge = resources.bridge.insert(ExportBridge::new(
            self.backend.clone(),
            workspace,
            self.ack_timeout,
        ));

        bridge.start(settings).await?;
        self.stage(job, RunnerStage::Exporting);
        info!(
            job_id = %job.id,
            frames = total,
            width = settings.width,
            height = settings.height,
            fps = settings.fps,
            "Rendering job {}",
            job.name
        );

        let step = (total / PROGRESS_STEPS).max(1);
        let mut pending = (total > 0).then(|| render_frame(renderer.clone(), 0));
        let mut index = 0;
        while let Some(next) = pending.take() {
            let frame = next
                .await
                .map_err(|e| Error::Render(format!("render task failed: {}", e)))??;
            // Render the next frame while this one goes to the encoder.
            if index + 1 < total {
                pending = Some(render_frame(renderer.clone(), index + 1));
            }
            bridge.submit_frame(frame).await?;
            index += 1;

            if index % step == 0 || index == total {
                self.events.publish(PipelineEvent::FrameProgress {
                    job_id: job.id.clone(),
                    frames_done: index,
                    frames_total: total,
                });
            }
        }

        self.stage(job, RunnerStage::Finalizing);
        let output = bridge.finalize(RenderResult { frames: Some(total) }).await?;
        let artifact = self.artifacts.store(&job.id, &output, &settings).await?;

        self.stage(job, RunnerStage::Completed);
        Ok(artifact)
    }

    fn stage(&self, job: &Job, stage: RunnerStage) {
        debug!(job_id = %job.id, stage = %stage, "Runner stage changed");
        self.events.publish(PipelineEvent::StageChanged {
            job_id: job.id.clone(),
            stage,
        });
    }
}

#[async_trait]
impl JobHandler for RenderRunner {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<ArtifactReference> {
        self.run(job, cancel).await
    }

    async fn discard(&self, artifact: &ArtifactReference) -> Result<()> {
        self.artifacts.discard(artifact).await
    }
}

fn workspace_prefix(job_id: &str) -> String {
    let short: String = job_id.chars().take(8).collect();
    format!("render-{}-", short)
}

fn render_frame(renderer: Arc<dyn FrameRenderer>, index: u64) -> JoinHandle<Result<Bytes>> {
    tokio::task::spawn_blocking(move || renderer.render_frame(index))
}

/// Per-run resources, torn down in order: encoder first, then workspace.
struct JobResources {
    workspace: Option<TempWorkspace>,
    bridge: Option<ExportBridge>,
}

impl JobResources {
    async fn release(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.shutdown().await;
        }
        if let Some(workspace) = self.workspace.take() {
            workspace.destroy().await;
        }
    }
}

impl Drop for JobResources {
    fn drop(&mut self) {
        if self.bridge.is_none() && self.workspace.is_none() {
            return;
        }
        let bridge = self.bridge.take();
        let workspace = self.workspace.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Render run dropped before cleanup, releasing resources in background");
                handle.spawn(async move {
                    if let Some(bridge) = bridge {
                        bridge.shutdown().await;
                    }
                    if let Some(workspace) = workspace {
                        workspace.destroy().await;
                    }
                });
            }
            // Bridge and workspace clean up through their own drops.
            Err(_) => {
                drop(bridge);
                drop(workspace);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(RunnerStage::Finalizing.to_string(), "finalizing");
        assert_eq!(
            serde_json::to_string(&RunnerStage::Exporting).unwrap(),
            "\"exporting\""
        );
        assert!(RunnerStage::Failed.is_terminal());
        assert!(!RunnerStage::Rendering.is_terminal());
    }

    #[test]
    fn test_workspace_prefix_is_short() {
        assert_eq!(
            workspace_prefix("0f8fad5b-d9cb-469f-a165-70867728950e"),
            "render-0f8fad5b-"
        );
    }
}

#[cfg(all(test, unix))]
mod run_tests {
    use super::*;
    use crate::database::models::JobStatus;
    use crate::export::CommandBackend;
    use crate::project::{Clip, ClipSource, Layer, ProjectSpec, Rgba};
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        workspaces: std::path::PathBuf,
        artifacts: std::path::PathBuf,
        runner: RenderRunner,
        events: EventPublisher,
    }

    fn fixture(backend: CommandBackend) -> Fixture {
        let dir = TempDir::new().unwrap();
        let workspaces = dir.path().join("work");
        let artifacts = dir.path().join("artifacts");
        let events = EventPublisher::default();
        let runner = RenderRunner::new(
            WorkspaceManager::new(&workspaces),
            AssetResolver::new(dir.path().join("assets")),
            LocalArtifactStore::new(&artifacts),
            Arc::new(backend),
            events.clone(),
        )
        .with_ack_timeout(Duration::from_secs(5));
        Fixture {
            _dir: dir,
            workspaces,
            artifacts,
            runner,
            events,
        }
    }

    fn job(source: ClipSource, frames: u64) -> Job {
        let spec = ProjectSpec {
            width: 1,
            height: 1,
            fps: 1,
            duration_frames: None,
            background: Rgba::black(),
            layers: vec![Layer {
                id: "main".into(),
                clips: vec![Clip {
                    id: "c".into(),
                    start_frame: 0,
                    duration_frames: frames,
                    source,
                    rect: None,
                    opacity: 1.0,
                }],
            }],
        };
        let now = Utc::now();
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            name: "test".into(),
            status: JobStatus::Active,
            payload: serde_json::to_string(&spec).unwrap(),
            priority: 0,
            attempts_made: 1,
            max_attempts: 3,
            result: None,
            failure_reason: None,
            created_at: now,
            started_at: Some(now),
            finished_at: None,
            updated_at: now,
        }
    }

    fn red() -> ClipSource {
        ClipSource::Solid {
            color: Rgba([255, 0, 0, 255]),
        }
    }

    fn is_empty_dir(path: &std::path::Path) -> bool {
        std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn test_run_produces_artifact_and_removes_workspace() {
        let fx = fixture(CommandBackend::shell("cat > \"$0\""));
        let job = job(red(), 3);
        let mut events = fx.events.subscribe();

        let artifact = fx.runner.run(&job, CancellationToken::new()).await.unwrap();

        assert_eq!(artifact.frames, 3);
        assert_eq!(artifact.size_bytes, 12);
        assert!(artifact.location.starts_with(fx.artifacts.canonicalize().unwrap().to_str().unwrap()));
        assert_eq!(
            std::fs::read(&artifact.location).unwrap(),
            vec![255, 0, 0, 255, 255, 0, 0, 255, 255, 0, 0, 255]
        );
        assert!(is_empty_dir(&fx.workspaces));

        let mut stages = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::StageChanged { stage, .. } = event {
                stages.push(stage);
            }
        }
        assert_eq!(
            stages,
            vec![
                RunnerStage::Rendering,
                RunnerStage::Exporting,
                RunnerStage::Finalizing,
                RunnerStage::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_asset_fails_before_encoder_starts() {
        let fx = fixture(CommandBackend::shell("cat > \"$0\""));
        let job = job(
            ClipSource::Image {
                asset: "missing.png".into(),
            },
            2,
        );
        let mut events = fx.events.subscribe();

        let err = fx.runner.run(&job, CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, Error::AssetNotFound { ref asset } if asset == "missing.png"));
        assert!(!err.is_retryable());
        assert!(is_empty_dir(&fx.workspaces));

        let mut stages = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::StageChanged { stage, .. } = event {
                stages.push(stage);
            }
        }
        assert_eq!(stages, vec![RunnerStage::Rendering, RunnerStage::Failed]);
    }

    #[tokio::test]
    async fn test_encoder_death_fails_run_and_cleans_up() {
        // Accepts one frame, then exits.
        let fx = fixture(CommandBackend::shell("head -c 4 > \"$0\"; exit 1"));
        let job = job(red(), 50);

        let err = fx.runner.run(&job, CancellationToken::new()).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(matches!(err, Error::Bridge { .. }));
        assert!(is_empty_dir(&fx.workspaces));
        assert!(is_empty_dir(&fx.artifacts));
    }

    #[tokio::test]
    async fn test_cancellation_stops_run() {
        // Never exits, so the run cannot finish before it is cancelled.
        let fx = fixture(CommandBackend::shell("exec sleep 30"));
        let job = job(red(), 1000);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), fx.runner.run(&job, cancel))
            .await
            .unwrap()
            .unwrap_err();

        assert!(err.is_cancellation());
        assert!(is_empty_dir(&fx.workspaces));
    }
}
