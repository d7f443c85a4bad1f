//! One encoder subprocess and the plumbing that feeds it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::encoder::{EncoderBackend, EncoderSettings};
use super::frame_buffer::FrameBufferAdapter;
use super::protocol::RenderResult;
use crate::{Error, Result};

/// Lines of encoder stderr kept for the failure log.
const STDERR_TAIL_LINES: usize = 20;

/// Grace period before an aborted encoder is killed.
const ABORT_GRACE: Duration = Duration::from_millis(200);

/// Result of a successful `end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOutput {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub frames: u64,
}

/// A running encoder for one job.
///
/// Frames go through a single-slot [`FrameBufferAdapter`] to a writer task
/// that owns the child's stdin, so at most one frame is in flight between
/// the producer and the pipe.
pub struct ExporterSession {
    settings: EncoderSettings,
    output_path: PathBuf,
    child: Child,
    adapter: Arc<FrameBufferAdapter>,
    writer: Option<JoinHandle<std::io::Result<u64>>>,
    stderr: Option<JoinHandle<VecDeque<String>>>,
    frames_submitted: u64,
}

impl ExporterSession {
    /// Spawn the encoder writing to `<workspace>/<backend output file>`.
    pub fn start(backend: &dyn EncoderBackend, settings: EncoderSettings, workspace: &Path) -> Result<Self> {
        settings.validate()?;

        let output_path = workspace.join(backend.output_file_name());
        let mut child = backend
            .command(&settings, &output_path)
            .spawn()
            .map_err(|e| Error::EncoderSpawn(format!("{}: {}", backend.name(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::EncoderSpawn("encoder stdin was not captured".to_string()))?;
        let pid = child.id();

        let adapter = Arc::new(FrameBufferAdapter::new());
        let writer = tokio::spawn(write_frames(adapter.clone(), stdin));
        let stderr = child.stderr.take().map(|s| tokio::spawn(drain_stderr(s)));

        info!(
            encoder = backend.name(),
            pid = ?pid,
            width = settings.width,
            height = settings.height,
            fps = settings.fps,
            output = %output_path.display(),
            "Encoder started"
        );

        Ok(Self {
            settings,
            output_path,
            child,
            adapter,
            writer: Some(writer),
            stderr,
            frames_submitted: 0,
        })
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// Fail if the encoder has already exited.
    pub fn check_alive(&mut self) -> Result<()> {
        match self.child.try_wait()? {
            None => Ok(()),
            Some(status) => Err(Error::Encoder(format!("encoder exited early ({})", status))),
        }
    }

    /// Hand one frame to the writer, waiting for the previous frame to be
    /// taken first. Returns the frame's 0-based position.
    pub async fn submit_frame(&mut self, frame: Bytes) -> Result<u64> {
        let expected = self.settings.frame_len();
        if frame.len() != expected {
            return Err(Error::Encoder(format!(
                "frame size mismatch: expected {} bytes, got {}",
                expected,
                frame.len()
            )));
        }
        self.check_alive()?;

        if self.adapter.push_when_ready(frame).await.is_err() {
            // The writer closes the adapter when the pipe breaks.
            self.check_alive()?;
            return Err(Error::Encoder("encoder stopped accepting frames".to_string()));
        }

        let index = self.frames_submitted;
        self.frames_submitted += 1;
        Ok(index)
    }

    /// Signal end-of-stream and wait for the encoder to finish the file.
    pub async fn finalize(mut self, result: RenderResult) -> Result<ExportOutput> {
        if let Some(expected) = result.frames
            && expected != self.frames_submitted
        {
            return Err(Error::Encoder(format!(
                "render reported {} frames but {} were submitted",
                expected, self.frames_submitted
            )));
        }

        self.check_alive()?;
        self.adapter
            .wait_drained()
            .await
            .map_err(|_| Error::Encoder("encoder stopped accepting frames".to_string()))?;
        self.adapter
            .push_image(None)
            .map_err(|_| Error::Encoder("encoder stopped accepting frames".to_string()))?;

        let written = match self.writer.take() {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Other(format!("Frame writer task failed: {}", e)))?,
            None => Ok(self.frames_submitted),
        };

        let status = self.child.wait().await?;
        let stderr_tail = self.collect_stderr().await;

        if !status.success() {
            warn!(
                status = %status,
                stderr = %stderr_tail.join("\n"),
                "Encoder exited with failure"
            );
            return Err(Error::Encoder(format!("encoder exited with {}", status)));
        }
        let written = written.map_err(|e| Error::Encoder(format!("failed to write frames: {}", e)))?;

        let size_bytes = match tokio::fs::metadata(&self.output_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if size_bytes == 0 {
            warn!(
                output = %self.output_path.display(),
                stderr = %stderr_tail.join("\n"),
                "Encoder produced no output"
            );
            return Err(Error::Encoder("encoder produced no output".to_string()));
        }

        info!(
            output = %self.output_path.display(),
            frames = written,
            size_bytes,
            "Encoder finished"
        );

        Ok(ExportOutput {
            path: self.output_path.clone(),
            size_bytes,
            frames: written,
        })
    }

    /// Stop the encoder without finishing the file.
    pub async fn abort(mut self) {
        self.adapter.close();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        match process_utils::terminate(&mut self.child, ABORT_GRACE).await {
            Ok(status) => debug!(status = %status, "Encoder stopped"),
            Err(e) => warn!(error = %e, "Failed to stop encoder"),
        }
        let tail = self.collect_stderr().await;
        if !tail.is_empty() {
            debug!(stderr = %tail.join("\n"), "Encoder stderr at abort");
        }
    }

    async fn collect_stderr(&mut self) -> Vec<String> {
        match self.stderr.take() {
            Some(handle) => match tokio::time::timeout(Duration::from_secs(1), handle).await {
                Ok(Ok(lines)) => lines.into_iter().collect(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        }
    }
}

impl Drop for ExporterSession {
    fn drop(&mut self) {
        // The child itself is killed on drop by its handle.
        self.adapter.close();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(stderr) = self.stderr.take() {
            stderr.abort();
        }
    }
}

/// Copy frames from the adapter into the encoder's stdin until end-of-stream.
async fn write_frames(adapter: Arc<FrameBufferAdapter>, mut stdin: ChildStdin) -> std::io::Result<u64> {
    let mut written = 0u64;
    while let Some(frame) = adapter.pull().await {
        if let Err(e) = stdin.write_all(&frame).await {
            debug!(error = %e, frames = written, "Encoder stdin closed");
            adapter.close();
            return Err(e);
        }
        written += 1;
    }

    let flushed = stdin.flush().await;
    drop(stdin);
    if let Err(e) = flushed {
        adapter.close();
        return Err(e);
    }
    Ok(written)
}

/// Log encoder stderr and keep the last few lines.
async fn drain_stderr(stderr: ChildStderr) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.to_lowercase().contains("error") {
            warn!("encoder stderr: {}", line);
        } else {
            debug!("encoder stderr: {}", line);
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::export::CommandBackend;
    use tempfile::TempDir;

    fn settings() -> EncoderSettings {
        EncoderSettings {
            width: 1,
            height: 1,
            fps: 1,
        }
    }

    #[tokio::test]
    async fn test_frames_reach_encoder_in_order() {
        let dir = TempDir::new().unwrap();
        let backend = CommandBackend::shell("cat > \"$0\"");
        let mut session = ExporterSession::start(&backend, settings(), dir.path()).unwrap();

        for i in 0..5u8 {
            let idx = session.submit_frame(Bytes::from(vec![i, i, i, 255])).await.unwrap();
            assert_eq!(idx, i as u64);
        }
        let output = session
            .finalize(RenderResult { frames: Some(5) })
            .await
            .unwrap();

        assert_eq!(output.frames, 5);
        assert_eq!(output.size_bytes, 20);
        let bytes = std::fs::read(&output.path).unwrap();
        let firsts: Vec<u8> = bytes.chunks(4).map(|c| c[0]).collect();
        assert_eq!(firsts, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_wrong_frame_size_is_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = CommandBackend::shell("cat > \"$0\"");
        let mut session = ExporterSession::start(&backend, settings(), dir.path()).unwrap();

        let err = session.submit_frame(Bytes::from_static(b"abc")).await.unwrap_err();
        assert!(err.to_string().contains("frame size mismatch"));
        assert_eq!(session.frames_submitted(), 0);
        session.abort().await;
    }

    #[tokio::test]
    async fn test_failing_encoder_fails_finalize() {
        let dir = TempDir::new().unwrap();
        let backend = CommandBackend::shell("cat > /dev/null; exit 3");
        let mut session = ExporterSession::start(&backend, settings(), dir.path()).unwrap();

        session.submit_frame(Bytes::from_static(&[0, 0, 0, 255])).await.unwrap();
        let err = session.finalize(RenderResult::default()).await.unwrap_err();

        assert!(matches!(err, Error::Encoder(_)));
    }

    #[tokio::test]
    async fn test_frame_count_mismatch_fails_finalize() {
        let dir = TempDir::new().unwrap();
        let backend = CommandBackend::shell("cat > \"$0\"");
        let mut session = ExporterSession::start(&backend, settings(), dir.path()).unwrap();
        session.submit_frame(Bytes::from_static(&[0, 0, 0, 255])).await.unwrap();

        let err = session
            .finalize(RenderResult { frames: Some(2) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2 frames"));
    }

    #[tokio::test]
    async fn test_missing_encoder_binary_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let backend = crate::export::FfmpegBackend::new("/nonexistent/encoder-binary");

        let err = ExporterSession::start(&backend, settings(), dir.path())
            .err()
            .unwrap();
        assert!(matches!(err, Error::EncoderSpawn(_)));
        assert!(err.is_retryable());
    }
}
