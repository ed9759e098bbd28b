//! WebSocket relay client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{
    ControlFrame, DropReason, LinkMonitor, LinkState, SendOutcome, Transport, TransportError,
};
use crate::config::RelayConfig;
use crate::media::MediaChunk;
use crate::metrics::global_metrics;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Relay transport over a single WebSocket connection
pub struct WsRelay {
    /// Relay endpoint (ws:// or wss://)
    url: String,

    /// Frames the writer task may hold before sends are dropped
    send_buffer: usize,

    connect_timeout: Duration,

    state: Arc<Mutex<LinkState>>,

    /// Outgoing frames, `None` until open and after close
    tx: Option<mpsc::Sender<Message>>,

    opened: bool,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl WsRelay {
    pub fn new(url: impl Into<String>, send_buffer: usize, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            send_buffer: send_buffer.max(1),
            connect_timeout,
            state: Arc::new(Mutex::new(LinkState::Idle)),
            tx: None,
            opened: false,
            writer: None,
            reader: None,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            config.url.clone(),
            config.send_buffer,
            Duration::from_secs(config.connect_timeout_seconds),
        )
    }

    fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }

    /// Writer task: forwards queued frames to the socket
    async fn writer_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::Receiver<Message>,
        state: Arc<Mutex<LinkState>>,
        fail_tx: mpsc::Sender<TransportError>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                report(&state, &fail_tx, TransportError::Send(e.to_string()));
                return;
            }
        }

        // Sender dropped: local close
        if let Err(e) = write.send(Message::Close(None)).await {
            tracing::debug!("Failed to send close frame: {}", e);
        }
        let _ = write.close().await;
        tracing::debug!("Relay writer terminated");
    }

    /// Reader task: watches the socket for the far end closing or failing
    async fn reader_task(
        mut read: futures::stream::SplitStream<WsStream>,
        state: Arc<Mutex<LinkState>>,
        fail_tx: mpsc::Sender<TransportError>,
    ) {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "no reason given".to_string());
                    report(&state, &fail_tx, TransportError::ClosedByPeer { reason });
                    return;
                }
                Ok(Message::Text(text)) => {
                    tracing::debug!(len = text.len(), "Ignoring text frame from relay");
                }
                Ok(_) => {}
                Err(e) => {
                    report(&state, &fail_tx, TransportError::Receive(e.to_string()));
                    return;
                }
            }
        }
        report(
            &state,
            &fail_tx,
            TransportError::ClosedByPeer {
                reason: "connection ended".to_string(),
            },
        );
    }
}

/// Surface a connection failure once, and only while the link is open
fn report(state: &Mutex<LinkState>, fail_tx: &mpsc::Sender<TransportError>, err: TransportError) {
    let mut state = state.lock();
    if *state != LinkState::Open {
        return;
    }
    *state = LinkState::Closed;
    tracing::warn!(error = %err, "Relay connection failed");
    let _ = fail_tx.try_send(err);
}

#[async_trait]
impl Transport for WsRelay {
    async fn open(&mut self, control: ControlFrame) -> Result<LinkMonitor, TransportError> {
        if self.opened {
            return Err(TransportError::AlreadyOpened);
        }
        self.opened = true;
        self.set_state(LinkState::Connecting);

        let text = control
            .to_json()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        tracing::info!(url = %self.url, "Connecting to relay");
        let connected = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str())).await;
        let (ws_stream, _) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.set_state(LinkState::Closed);
                return Err(TransportError::Connect(e.to_string()));
            }
            Err(_) => {
                self.set_state(LinkState::Closed);
                return Err(TransportError::Connect(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                )));
            }
        };

        let (mut write, read) = ws_stream.split();

        // The control frame goes out before any chunk can be queued
        if let Err(e) = write.send(Message::Text(text)).await {
            self.set_state(LinkState::Closed);
            return Err(TransportError::Send(e.to_string()));
        }

        let (tx, rx) = mpsc::channel(self.send_buffer);
        let (fail_tx, monitor) = LinkMonitor::channel();
        self.set_state(LinkState::Open);

        self.writer = Some(tokio::spawn(Self::writer_task(
            write,
            rx,
            self.state.clone(),
            fail_tx.clone(),
        )));
        self.reader = Some(tokio::spawn(Self::reader_task(read, self.state.clone(), fail_tx)));
        self.tx = Some(tx);

        tracing::info!("Relay connection open");
        Ok(monitor)
    }

    fn send(&mut self, chunk: &MediaChunk) -> SendOutcome {
        let metrics = global_metrics();
        let tx = match (&self.tx, self.state()) {
            (Some(tx), LinkState::Open) => tx,
            _ => {
                metrics.chunk_dropped_not_open();
                tracing::warn!(
                    media_type = %chunk.media_type,
                    sequence = chunk.sequence_number,
                    "Relay not open, dropping chunk"
                );
                return SendOutcome::Dropped(DropReason::NotOpen);
            }
        };

        match tx.try_send(Message::Binary(chunk.encode_frame())) {
            Ok(()) => {
                metrics.chunk_sent();
                SendOutcome::Sent
            }
            Err(TrySendError::Full(_)) => {
                metrics.chunk_dropped_buffer_full();
                tracing::warn!(
                    media_type = %chunk.media_type,
                    sequence = chunk.sequence_number,
                    "Relay send buffer full, dropping chunk"
                );
                SendOutcome::Dropped(DropReason::BufferFull)
            }
            Err(TrySendError::Closed(_)) => {
                metrics.chunk_dropped_not_open();
                SendOutcome::Dropped(DropReason::NotOpen)
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.set_state(LinkState::Closed);
        self.tx.take();

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        if let Some(writer) = self.writer.take() {
            match tokio::time::timeout(Duration::from_secs(5), writer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(TransportError::Send(e.to_string())),
                Err(_) => {
                    return Err(TransportError::Send(
                        "timed out flushing relay connection".to_string(),
                    ))
                }
            }
        }

        tracing::info!("Relay connection closed");
        Ok(())
    }

    fn state(&self) -> LinkState {
        *self.state.lock()
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
