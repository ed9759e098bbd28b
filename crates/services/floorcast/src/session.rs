//! Broadcast session
//!
//! A session binds one stream resource, one ingress endpoint, one relay
//! connection and the capture feeding it. At most one session is live at a
//! time. Starting walks the lifecycle (reconcile, create, select with
//! failover), then starts capture and opens the relay; any failure unwinds
//! what was already acquired. Teardown always releases the ingestor and
//! deletes the stream, even when earlier steps fail.
//!
//! Stopping during a start cancels it: the step in flight completes, then
//! the start unwinds and the session returns to idle.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureError, CaptureHandle, ChunkStream, Chunker};
use crate::config::{CaptureConfig, RelayConfig};
use crate::lifecycle::{Binding, LifecycleError, LifecycleManager, StreamResource};
use crate::metrics::global_metrics;
use crate::relay::{ControlFrame, LinkMonitor, Transport, TransportError, WsRelay};

/// Session status as seen by the display layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Selecting,
    Publishing,
    Failed,
}

impl SessionStatus {
    /// A session is starting or running
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Selecting | SessionStatus::Publishing)
    }
}

/// Why the last session failed
///
/// Deliberately coarse: the detail (control-plane messages, device paths,
/// peer close reasons) goes to the log, never to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoIngestorAvailable,
    ControlPlane,
    CaptureDevice,
    Relay,
    CaptureEnded,
    Internal,
}

impl FailureReason {
    pub fn of(err: &SessionError) -> Self {
        match err {
            SessionError::Lifecycle(LifecycleError::NoIngestorAvailable { .. }) => {
                FailureReason::NoIngestorAvailable
            }
            SessionError::Lifecycle(
                LifecycleError::ControlPlane(_) | LifecycleError::ReconcileIncomplete { .. },
            ) => FailureReason::ControlPlane,
            SessionError::Capture(_) => FailureReason::CaptureDevice,
            SessionError::Transport(_) => FailureReason::Relay,
            SessionError::Lifecycle(LifecycleError::InvalidTransition { .. })
            | SessionError::AlreadyActive
            | SessionError::Cancelled
            | SessionError::Teardown { .. } => FailureReason::Internal,
        }
    }
}

/// Snapshot of the current or last session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub stream_id: Option<String>,
    pub ingestor_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            session_id: None,
            stream_id: None,
            ingestor_id: None,
            started_at: None,
            failure: None,
        }
    }
}

/// Builds the capture and transport for each new session
pub trait PipelineFactory: Send + Sync {
    fn chunker(&self) -> Chunker;
    fn transport(&self) -> Box<dyn Transport>;
}

/// ffmpeg capture relayed over WebSocket
pub struct FfmpegPipelineFactory {
    capture: CaptureConfig,
    relay: RelayConfig,
}

impl FfmpegPipelineFactory {
    pub fn new(capture: CaptureConfig, relay: RelayConfig) -> Self {
        Self { capture, relay }
    }
}

impl PipelineFactory for FfmpegPipelineFactory {
    fn chunker(&self) -> Chunker {
        Chunker::from_config(&self.capture)
    }

    fn transport(&self) -> Box<dyn Transport> {
        Box::new(WsRelay::from_config(&self.relay))
    }
}

/// Handle to the broadcaster's session; cheap to clone
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    lifecycle: Arc<LifecycleManager>,
    pipeline: Arc<dyn PipelineFactory>,
    status_tx: watch::Sender<SessionStatus>,
    info: parking_lot::Mutex<SessionInfo>,
    active: Mutex<Option<Active>>,
    /// Cancels the start in flight, if any
    cancel: parking_lot::Mutex<CancellationToken>,
}

/// A start that won the slot
struct Claim {
    session_id: String,
    cancel: CancellationToken,
}

/// Resources held by the live session
struct Active {
    session_id: String,
    stream: StreamResource,
    binding: Option<Binding>,
    capture: Option<CaptureHandle>,
    pump: Option<Pump>,
}

/// Task moving chunks from capture to the transport
struct Pump {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<Option<Box<dyn Transport>>>,
}

enum PumpEnd {
    Stopped,
    TransportFailed(TransportError),
    CaptureEnded,
}

impl Session {
    pub fn new(lifecycle: Arc<LifecycleManager>, pipeline: Arc<dyn PipelineFactory>) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Idle);
        Self {
            inner: Arc::new(Inner {
                lifecycle,
                pipeline,
                status_tx,
                info: parking_lot::Mutex::new(SessionInfo::default()),
                active: Mutex::new(None),
                cancel: parking_lot::Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Follow status changes
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn info(&self) -> SessionInfo {
        self.inner.info.lock().clone()
    }

    /// Start broadcasting under `name`
    ///
    /// Resolves once the session is publishing or has failed. On failure
    /// everything acquired so far has been released and the status is
    /// `failed`. The session does not retry. A `stop` issued meanwhile
    /// makes this return [`SessionError::Cancelled`] with the status back
    /// at `idle`.
    pub async fn start(&self, name: &str) -> Result<(), SessionError> {
        let claim = self.claim()?;
        self.run_start(name, claim).await
    }

    /// Claim the session and start it in the background
    ///
    /// The status is `selecting` by the time this returns, so a second call
    /// is refused with [`SessionError::AlreadyActive`].
    pub fn spawn_start(&self, name: String) -> Result<SessionInfo, SessionError> {
        let claim = self.claim()?;
        let info = self.info();
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.run_start(&name, claim).await {
                tracing::warn!(error = %e, "Session start failed");
            }
        });
        Ok(info)
    }

    /// Move idle or failed to selecting, atomically with respect to other
    /// starts
    fn claim(&self) -> Result<Claim, SessionError> {
        let mut info = self.inner.info.lock();
        let claimed = self.inner.status_tx.send_if_modified(|status| {
            if status.is_active() {
                return false;
            }
            *status = SessionStatus::Selecting;
            true
        });
        if !claimed {
            return Err(SessionError::AlreadyActive);
        }

        let session_id = format!("sess_{}", uuid::Uuid::new_v4().simple());
        *info = SessionInfo {
            status: SessionStatus::Selecting,
            session_id: Some(session_id.clone()),
            ..SessionInfo::default()
        };
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();
        Ok(Claim { session_id, cancel })
    }

    async fn run_start(&self, name: &str, claim: Claim) -> Result<(), SessionError> {
        let Claim { session_id, cancel } = claim;
        // Nothing else holds the slot while the status is active
        let mut slot = self.inner.active.lock().await;
        tracing::info!(session_id = %session_id, name = %name, "Starting session");

        if let Err(e) = checkpoint(&cancel) {
            return Err(self.fail_start(&session_id, e));
        }
        if let Err(e) = self.inner.lifecycle.ensure_reconciled().await {
            return Err(self.fail_start(&session_id, e.into()));
        }
        if let Err(e) = checkpoint(&cancel) {
            return Err(self.fail_start(&session_id, e));
        }

        let stream = match self.inner.lifecycle.create_stream(name).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail_start(&session_id, e.into())),
        };
        self.inner.info.lock().stream_id = Some(stream.id.clone());

        let mut active = Active {
            session_id: session_id.clone(),
            stream,
            binding: None,
            capture: None,
            pump: None,
        };

        if let Err(e) = self.launch(&mut active, &cancel).await {
            if let Err(teardown) = self.inner.teardown(active, None).await {
                tracing::warn!(session_id = %session_id, error = %teardown, "Cleanup after failed start was incomplete");
            }
            return Err(self.fail_start(&session_id, e));
        }

        *slot = Some(active);
        {
            let mut info = self.inner.info.lock();
            info.started_at = Some(Utc::now());
        }
        self.set_status(SessionStatus::Publishing, None);
        global_metrics().session_started();
        tracing::info!(session_id = %session_id, "Session publishing");
        Ok(())
    }

    /// Select an ingestor, start capture and open the relay
    ///
    /// Each step runs to completion; cancellation is observed between steps
    /// so that whatever a step acquired is recorded in `active` and released
    /// by the caller.
    async fn launch(&self, active: &mut Active, cancel: &CancellationToken) -> Result<(), SessionError> {
        checkpoint(cancel)?;
        let lifecycle = &self.inner.lifecycle;

        let binding = lifecycle.select_any(&active.stream.id).await?;
        active.stream.mark_bound()?;
        self.inner.info.lock().ingestor_id = Some(binding.ingestor_id.clone());
        let control = ControlFrame::new(binding.endpoint.rtmp_url());
        active.binding = Some(binding);
        checkpoint(cancel)?;

        let (capture, chunks) = self.inner.pipeline.chunker().start().await?;
        active.capture = Some(capture);
        checkpoint(cancel)?;

        let mut transport = self.inner.pipeline.transport();
        let monitor = transport.open(control).await?;
        if cancel.is_cancelled() {
            if let Err(e) = transport.close().await {
                tracing::warn!(session_id = %active.session_id, error = %e, "Failed to close relay");
            }
            return Err(SessionError::Cancelled);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let session_id = active.session_id.clone();
        let handle = tokio::spawn(async move {
            let (transport, end) = pump(chunks, transport, monitor, stop_rx).await;
            let (reason, detail) = match end {
                PumpEnd::Stopped => return Some(transport),
                PumpEnd::TransportFailed(e) => (FailureReason::Relay, e.to_string()),
                PumpEnd::CaptureEnded => (FailureReason::CaptureEnded, "capture ended".to_string()),
            };
            inner.fail_running(&session_id, transport, reason, detail).await
        });
        active.pump = Some(Pump { stop_tx, handle });
        Ok(())
    }

    fn fail_start(&self, session_id: &str, err: SessionError) -> SessionError {
        if matches!(err, SessionError::Cancelled) {
            tracing::info!(session_id = %session_id, "Session start cancelled");
            self.set_status(SessionStatus::Idle, None);
            return err;
        }
        tracing::error!(session_id = %session_id, error = %err, "Session failed to start");
        self.set_status(SessionStatus::Failed, Some(FailureReason::of(&err)));
        global_metrics().session_failed();
        err
    }

    /// Stop the live session, if any, and release its resources
    ///
    /// A start in flight is cancelled as soon as this is called; the
    /// returned future waits for the slot and tears down whatever is left.
    pub fn stop(&self) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        self.inner.cancel.lock().cancel();
        let session = self.clone();
        async move { session.stop_active().await }
    }

    async fn stop_active(&self) -> Result<(), SessionError> {
        let active = self.inner.active.lock().await.take();
        let Some(mut active) = active else {
            return Ok(());
        };
        let session_id = active.session_id.clone();
        tracing::info!(session_id = %session_id, "Stopping session");

        let mut transport = None;
        if let Some(pump) = active.pump.take() {
            let _ = pump.stop_tx.send(());
            match pump.handle.await {
                Ok(t) => transport = t,
                Err(e) => tracing::error!(session_id = %session_id, "Chunk pump failed: {}", e),
            }
        }

        let result = self.inner.teardown(active, transport).await;
        self.set_status(SessionStatus::Idle, None);
        global_metrics().session_stopped();
        tracing::info!(session_id = %session_id, "Session stopped");
        result
    }

    fn set_status(&self, status: SessionStatus, failure: Option<FailureReason>) {
        self.inner.set_status(status, failure);
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), SessionError> {
    if cancel.is_cancelled() {
        return Err(SessionError::Cancelled);
    }
    Ok(())
}

impl Inner {
    fn set_status(&self, status: SessionStatus, failure: Option<FailureReason>) {
        {
            let mut info = self.info.lock();
            info.status = status;
            if failure.is_some() {
                info.failure = failure;
            }
        }
        self.status_tx.send_replace(status);
    }

    /// The running pipeline broke; tear the session down unless `stop` got
    /// there first, in which case the transport goes back to it.
    async fn fail_running(
        &self,
        session_id: &str,
        transport: Box<dyn Transport>,
        reason: FailureReason,
        detail: String,
    ) -> Option<Box<dyn Transport>> {
        let active = self.active.lock().await.take();
        let Some(mut active) = active else {
            return Some(transport);
        };

        tracing::error!(session_id = %session_id, reason = ?reason, detail = %detail, "Session failed");
        // This task is the pump
        active.pump = None;
        if let Err(e) = self.teardown(active, Some(transport)).await {
            tracing::warn!(session_id = %session_id, error = %e, "Teardown after failure was incomplete");
        }
        self.set_status(SessionStatus::Failed, Some(reason));
        global_metrics().session_failed();
        None
    }

    /// Release everything the session holds, in order
    ///
    /// Capture stops first, then the relay closes (which makes the far end
    /// discard its queue and stop publishing). Unselect and delete run
    /// regardless of earlier failures.
    async fn teardown(
        &self,
        mut active: Active,
        transport: Option<Box<dyn Transport>>,
    ) -> Result<(), SessionError> {
        let session_id = active.session_id.clone();
        let mut failures = Vec::new();

        if let Some(capture) = active.capture.take() {
            if let Err(e) = capture.stop().await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to stop capture");
                failures.push(format!("capture: {}", e));
            }
        }

        if let Some(mut transport) = transport {
            if let Err(e) = transport.close().await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to close relay");
                failures.push(format!("relay: {}", e));
            }
        }

        if let Some(binding) = active.binding.take() {
            if let Err(e) = self.lifecycle.unselect_ingestor(&binding.ingestor_id).await {
                tracing::warn!(
                    session_id = %session_id,
                    ingestor_id = %binding.ingestor_id,
                    error = %e,
                    "Failed to unselect ingestor"
                );
                failures.push(format!("unselect {}: {}", binding.ingestor_id, e));
            }
        }

        match self.lifecycle.delete_stream(&active.stream.id).await {
            Ok(()) => active.stream.mark_torn_down(),
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    stream_id = %active.stream.id,
                    error = %e,
                    "Failed to delete stream"
                );
                failures.push(format!("delete {}: {}", active.stream.id, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Teardown { failures })
        }
    }
}

async fn pump(
    mut chunks: ChunkStream,
    mut transport: Box<dyn Transport>,
    mut monitor: LinkMonitor,
    mut stop_rx: oneshot::Receiver<()>,
) -> (Box<dyn Transport>, PumpEnd) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => return (transport, PumpEnd::Stopped),
            err = monitor.failed() => return (transport, PumpEnd::TransportFailed(err)),
            chunk = chunks.next() => match chunk {
                Some(chunk) => {
                    transport.send(&chunk);
                }
                None => return (transport, PumpEnd::CaptureEnded),
            },
        }
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a session is already active")]
    AlreadyActive,

    #[error("session start cancelled")]
    Cancelled,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("teardown incomplete: {}", failures.join("; "))]
    Teardown { failures: Vec<String> },
}
