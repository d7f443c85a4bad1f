//! Command/acknowledgment bridge in front of one [`ExporterSession`].
//!
//! Commands are processed in order by a single worker task that owns the
//! session state. Every command produces exactly one [`AckMessage`] on an ack
//! channel separate from the command channel; a dispatcher task routes each
//! ack to the caller waiting on its `call_id` through this bridge's own
//! correlation table.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::encoder::{EncoderBackend, EncoderSettings};
use super::protocol::{AckMessage, AckStatus, ExportCommand, RawCommand, RenderResult};
use super::session::{ExportOutput, ExporterSession};
use crate::{Error, Result};

/// Acks retained for late observers.
const ACK_OBSERVER_CAPACITY: usize = 64;

pub const MSG_NOT_STARTED: &str = "process not started";
pub const MSG_ALREADY_STARTED: &str = "process already started";
pub const MSG_SESSION_CLOSED: &str = "session closed";

type PendingAcks = DashMap<u64, oneshot::Sender<AckMessage>>;

/// A command as queued for the worker. Commands that failed to decode still
/// travel through the worker so their ack keeps its place in the sequence.
struct Envelope {
    call_id: u64,
    method: String,
    command: std::result::Result<ExportCommand, String>,
}

enum SessionState {
    Idle,
    Started(ExporterSession),
    Closed,
}

/// Per-job export bridge.
pub struct ExportBridge {
    commands: mpsc::Sender<Envelope>,
    pending: Arc<PendingAcks>,
    observers: broadcast::Sender<AckMessage>,
    next_call_id: AtomicU64,
    encoder_pid: Arc<AtomicU32>,
    ack_timeout: Duration,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExportBridge {
    /// Create a bridge whose encoder writes into `workspace`.
    pub fn new(backend: Arc<dyn EncoderBackend>, workspace: PathBuf, ack_timeout: Duration) -> Self {
        let (commands, command_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (observers, _) = broadcast::channel(ACK_OBSERVER_CAPACITY);
        let pending: Arc<PendingAcks> = Arc::new(DashMap::new());
        let encoder_pid = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();

        let worker = BridgeWorker {
            backend,
            workspace,
            state: SessionState::Idle,
            encoder_pid: encoder_pid.clone(),
        };
        let handle = tokio::spawn(worker.run(command_rx, ack_tx, shutdown.clone()));
        tokio::spawn(dispatch_acks(ack_rx, pending.clone(), observers.clone()));

        Self {
            commands,
            pending,
            observers,
            next_call_id: AtomicU64::new(1),
            encoder_pid,
            ack_timeout,
            shutdown,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Observe every ack this bridge emits.
    pub fn subscribe_acks(&self) -> broadcast::Receiver<AckMessage> {
        self.observers.subscribe()
    }

    /// PID of the running encoder, if a session is started.
    pub fn encoder_pid(&self) -> Option<u32> {
        match self.encoder_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Send a typed command and wait for its ack.
    pub async fn call(&self, command: ExportCommand) -> Result<AckMessage> {
        let method = command.method().to_string();
        self.dispatch(method, Ok(command)).await
    }

    /// Send an untyped wire command and wait for its ack. Decode failures,
    /// including unknown methods, come back as error acks.
    pub async fn send_raw(&self, raw: RawCommand) -> Result<AckMessage> {
        let method = raw.method.clone();
        let command = raw.decode();
        self.dispatch(method, command).await
    }

    pub async fn start(&self, settings: EncoderSettings) -> Result<()> {
        let ack = self.call(ExportCommand::Start(settings)).await?;
        into_result(ack).map(|_| ())
    }

    /// Submit one frame; returns once the session has accepted it.
    pub async fn submit_frame(&self, frame: Bytes) -> Result<u64> {
        let ack = self.call(ExportCommand::HandleFrame(frame)).await?;
        let data = into_result(ack)?;
        Ok(data.get("frame").and_then(|v| v.as_u64()).unwrap_or_default())
    }

    pub async fn finalize(&self, result: RenderResult) -> Result<ExportOutput> {
        let ack = self.call(ExportCommand::End(result)).await?;
        let data = into_result(ack)?;
        Ok(serde_json::from_value(data)?)
    }

    /// Stop the worker, killing the encoder if one is still running.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Export bridge worker panicked");
        }
        self.pending.clear();
    }

    async fn dispatch(
        &self,
        method: String,
        command: std::result::Result<ExportCommand, String>,
    ) -> Result<AckMessage> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);

        let envelope = Envelope {
            call_id,
            method: method.clone(),
            command,
        };

        let exchange = async {
            self.commands
                .send(envelope)
                .await
                .map_err(|_| Error::bridge(&method, MSG_SESSION_CLOSED))?;
            rx.await.map_err(|_| Error::bridge(&method, MSG_SESSION_CLOSED))
        };

        match tokio::time::timeout(self.ack_timeout, exchange).await {
            Ok(result) => {
                if result.is_err() {
                    self.pending.remove(&call_id);
                }
                result
            }
            Err(_) => {
                self.pending.remove(&call_id);
                warn!(method = %method, call_id, timeout_ms = self.ack_timeout.as_millis() as u64, "Export acknowledgment timed out");
                Err(Error::bridge(
                    &method,
                    format!("no acknowledgment within {} ms", self.ack_timeout.as_millis()),
                ))
            }
        }
    }
}

impl Drop for ExportBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Turn an ack into the caller's result.
fn into_result(ack: AckMessage) -> Result<serde_json::Value> {
    match ack.status {
        AckStatus::Success { data } => Ok(data),
        AckStatus::Error { message } => Err(Error::bridge(ack.method, message)),
    }
}

async fn dispatch_acks(
    mut acks: mpsc::UnboundedReceiver<AckMessage>,
    pending: Arc<PendingAcks>,
    observers: broadcast::Sender<AckMessage>,
) {
    while let Some(ack) = acks.recv().await {
        let _ = observers.send(ack.clone());
        match pending.remove(&ack.call_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(ack);
            }
            None => debug!(call_id = ack.call_id, method = %ack.method, "Ack has no waiter"),
        }
    }
}

struct BridgeWorker {
    backend: Arc<dyn EncoderBackend>,
    workspace: PathBuf,
    state: SessionState,
    encoder_pid: Arc<AtomicU32>,
}

impl BridgeWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Envelope>,
        acks: mpsc::UnboundedSender<AckMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            let envelope = tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = commands.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let ack = tokio::select! {
                _ = shutdown.cancelled() => break,
                ack = self.handle(envelope) => ack,
            };

            if !ack.is_success() {
                debug!(method = %ack.method, message = ?ack.message(), "Export command rejected");
            }
            if acks.send(ack).is_err() {
                break;
            }
        }

        if let SessionState::Started(session) = std::mem::replace(&mut self.state, SessionState::Closed) {
            debug!("Aborting unfinished export session");
            session.abort().await;
        }
        self.encoder_pid.store(0, Ordering::SeqCst);
    }

    async fn handle(&mut self, envelope: Envelope) -> AckMessage {
        let Envelope {
            call_id,
            method,
            command,
        } = envelope;

        let command = match command {
            Ok(command) => command,
            Err(message) => return AckMessage::error(call_id, method, message),
        };

        match command {
            ExportCommand::Start(settings) => self.start(call_id, method, settings),
            ExportCommand::HandleFrame(frame) => match &mut self.state {
                SessionState::Idle => AckMessage::error(call_id, method, MSG_NOT_STARTED),
                SessionState::Closed => AckMessage::error(call_id, method, MSG_SESSION_CLOSED),
                SessionState::Started(session) => match session.submit_frame(frame).await {
                    Ok(index) => {
                        AckMessage::success(call_id, method, serde_json::json!({ "frame": index }))
                    }
                    Err(e) => AckMessage::error(call_id, method, ack_message(&e)),
                },
            },
            ExportCommand::End(result) => {
                match std::mem::replace(&mut self.state, SessionState::Closed) {
                    SessionState::Idle => {
                        self.state = SessionState::Idle;
                        AckMessage::error(call_id, method, MSG_NOT_STARTED)
                    }
                    SessionState::Closed => AckMessage::error(call_id, method, MSG_SESSION_CLOSED),
                    SessionState::Started(session) => {
                        self.encoder_pid.store(0, Ordering::SeqCst);
                        match session.finalize(result).await {
                            Ok(output) => match serde_json::to_value(&output) {
                                Ok(data) => AckMessage::success(call_id, method, data),
                                Err(e) => AckMessage::error(call_id, method, e.to_string()),
                            },
                            Err(e) => AckMessage::error(call_id, method, ack_message(&e)),
                        }
                    }
                }
            }
        }
    }

    fn start(&mut self, call_id: u64, method: String, settings: EncoderSettings) -> AckMessage {
        match self.state {
            SessionState::Idle => {}
            SessionState::Started(_) => return AckMessage::error(call_id, method, MSG_ALREADY_STARTED),
            SessionState::Closed => return AckMessage::error(call_id, method, MSG_SESSION_CLOSED),
        }

        match ExporterSession::start(self.backend.as_ref(), settings, &self.workspace) {
            Ok(session) => {
                self.encoder_pid
                    .store(session.pid().unwrap_or_default(), Ordering::SeqCst);
                let output = session.output_path().to_string_lossy().into_owned();
                self.state = SessionState::Started(session);
                AckMessage::success(call_id, method, serde_json::json!({ "output": output }))
            }
            Err(e) => {
                warn!(error = %e, "Failed to start encoder");
                AckMessage::error(call_id, method, ack_message(&e))
            }
        }
    }
}

/// Coarse message for an error ack; encoder diagnostics stay in the logs.
fn ack_message(err: &Error) -> String {
    match err {
        Error::Encoder(msg) => msg.clone(),
        Error::EncoderSpawn(_) => "encoder could not be started".to_string(),
        Error::Io(_) => "encoder i/o failed".to_string(),
        other => other.to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::export::CommandBackend;
    use crate::export::protocol::{METHOD_END, METHOD_HANDLE_FRAME};
    use serde_json::json;
    use tempfile::TempDir;

    fn cat_bridge(dir: &TempDir) -> ExportBridge {
        ExportBridge::new(
            Arc::new(CommandBackend::shell("cat > \"$0\"")),
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        )
    }

    fn one_by_one() -> EncoderSettings {
        EncoderSettings {
            width: 1,
            height: 1,
            fps: 1,
        }
    }

    fn pixel(v: u8) -> Bytes {
        Bytes::from(vec![v, v, v, 255])
    }

    #[tokio::test]
    async fn test_submit_and_finalize_before_start_are_rejected() {
        let dir = TempDir::new().unwrap();
        let bridge = cat_bridge(&dir);

        let ack = bridge.call(ExportCommand::HandleFrame(pixel(0))).await.unwrap();
        assert_eq!(ack.method, METHOD_HANDLE_FRAME);
        assert_eq!(ack.message(), Some(MSG_NOT_STARTED));

        let ack = bridge.call(ExportCommand::End(RenderResult::default())).await.unwrap();
        assert_eq!(ack.method, METHOD_END);
        assert_eq!(ack.message(), Some(MSG_NOT_STARTED));

        // The session is still usable afterwards.
        bridge.start(one_by_one()).await.unwrap();
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let bridge = cat_bridge(&dir);

        bridge.start(one_by_one()).await.unwrap();
        let ack = bridge.call(ExportCommand::Start(one_by_one())).await.unwrap();

        assert_eq!(ack.message(), Some(MSG_ALREADY_STARTED));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_method_gets_error_ack() {
        let dir = TempDir::new().unwrap();
        let bridge = cat_bridge(&dir);

        let ack = bridge.send_raw(RawCommand::new("pause", json!(null))).await.unwrap();

        assert_eq!(ack.method, "pause");
        assert_eq!(ack.message(), Some("unknown method: pause"));
    }

    #[tokio::test]
    async fn test_full_session_acks_in_order() {
        let dir = TempDir::new().unwrap();
        let bridge = cat_bridge(&dir);
        let mut acks = bridge.subscribe_acks();

        bridge.start(one_by_one()).await.unwrap();
        for i in 0..3u8 {
            assert_eq!(bridge.submit_frame(pixel(i)).await.unwrap(), i as u64);
        }
        let output = bridge
            .finalize(RenderResult { frames: Some(3) })
            .await
            .unwrap();

        assert_eq!(output.frames, 3);
        assert_eq!(std::fs::read(&output.path).unwrap().len(), 12);

        let mut seen = Vec::new();
        for _ in 0..5 {
            let ack = acks.recv().await.unwrap();
            assert!(ack.is_success());
            seen.push(ack.method);
        }
        assert_eq!(seen, vec!["start", "handleFrame", "handleFrame", "handleFrame", "end"]);
    }

    #[tokio::test]
    async fn test_commands_after_finalize_are_rejected() {
        let dir = TempDir::new().unwrap();
        let bridge = cat_bridge(&dir);

        bridge.start(one_by_one()).await.unwrap();
        bridge.submit_frame(pixel(1)).await.unwrap();
        bridge.finalize(RenderResult::default()).await.unwrap();

        let ack = bridge.call(ExportCommand::HandleFrame(pixel(2))).await.unwrap();
        assert_eq!(ack.message(), Some(MSG_SESSION_CLOSED));
        let ack = bridge.call(ExportCommand::Start(one_by_one())).await.unwrap();
        assert_eq!(ack.message(), Some(MSG_SESSION_CLOSED));
    }

    #[tokio::test]
    async fn test_killed_encoder_fails_next_command() {
        let dir = TempDir::new().unwrap();
        let bridge = cat_bridge(&dir);

        bridge.start(one_by_one()).await.unwrap();
        bridge.submit_frame(pixel(0)).await.unwrap();

        let pid = bridge.encoder_pid().unwrap();
        let status = std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()
            .unwrap();
        assert!(status.success());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = match bridge.submit_frame(pixel(1)).await {
            Err(e) => e,
            Ok(_) => bridge.finalize(RenderResult::default()).await.unwrap_err(),
        };
        assert!(matches!(err, Error::Bridge { .. }));
    }

    #[tokio::test]
    async fn test_slow_encoder_hits_ack_timeout() {
        let dir = TempDir::new().unwrap();
        let bridge = ExportBridge::new(
            Arc::new(CommandBackend::shell("sleep 30")),
            dir.path().to_path_buf(),
            Duration::from_millis(300),
        );
        bridge.start(one_by_one()).await.unwrap();

        // Never read by the encoder, so `end` cannot complete.
        bridge.submit_frame(pixel(0)).await.unwrap();
        let err = bridge.finalize(RenderResult::default()).await.unwrap_err();

        match err {
            Error::Bridge { method, message } => {
                assert_eq!(method, "end");
                assert!(message.contains("no acknowledgment"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        bridge.shutdown().await;
        assert!(bridge.encoder_pid().is_none());
    }
}
