//! Relay far end
//!
//! Terminates relay connections and feeds each one into its own publish
//! worker. The control frame must arrive first; binary frames before it are
//! ignored. Chunks must arrive in strictly increasing sequence order per
//! media type, anything else closes the connection.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::Instrument;

use super::{ControlFrame, TransportError};
use crate::media::{MediaChunk, SequenceTracker};
use crate::publish::{PublishError, PublishWorker, WorkerFactory};

/// Accepts relay connections and runs one publish worker per connection
pub struct RelayServer {
    factory: Arc<dyn WorkerFactory>,
}

impl RelayServer {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self { factory }
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "Relay server listening");

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Failed to accept relay connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("Relay server shutdown requested");
                    break;
                }
            };

            let factory = self.factory.clone();
            let connection_id = format!("conn_{}", uuid::Uuid::new_v4().simple());
            let span = tracing::info_span!("relay", connection_id = %connection_id, peer = %peer);
            tokio::spawn(
                async move {
                    tracing::info!("Relay connection accepted");
                    match serve_connection(stream, factory).await {
                        Ok(chunks) => tracing::info!(chunks = chunks, "Relay connection finished"),
                        Err(e) => tracing::warn!(error = %e, "Relay connection ended with error"),
                    }
                }
                .instrument(span),
            );
        }

        Ok(())
    }
}

/// Serve one relay connection to completion
///
/// Returns the number of chunks handed to the publish worker.
pub async fn serve_connection<S>(stream: S, factory: Arc<dyn WorkerFactory>) -> Result<u64, ServeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ws = accept_async(stream)
        .await
        .map_err(|e| TransportError::Protocol(e.to_string()))?;

    let control = match await_control_frame(&mut ws).await? {
        Some(control) => control,
        None => return Ok(0),
    };

    let mut worker = match factory.spawn(&control.rtmp_url) {
        Ok(worker) => worker,
        Err(e) => {
            close_with(&mut ws, CloseCode::Error, "publisher failed to start").await;
            return Err(e.into());
        }
    };
    tracing::info!("Publish worker started for connection");

    let outcome = relay_chunks(&mut ws, &mut worker).await;
    let discarded = worker.shutdown().await;
    if discarded > 0 {
        tracing::debug!(discarded = discarded, "Discarded queued chunks on close");
    }
    outcome
}

/// Wait for the control frame; `None` if the peer left before sending it
async fn await_control_frame<S>(ws: &mut WebSocketStream<S>) -> Result<Option<ControlFrame>, ServeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = ws.next().await {
        match msg.map_err(|e| TransportError::Receive(e.to_string()))? {
            Message::Text(text) => match ControlFrame::from_json(&text) {
                Ok(control) => return Ok(Some(control)),
                Err(e) => {
                    close_with(ws, CloseCode::Policy, "invalid control frame").await;
                    return Err(TransportError::Protocol(format!("invalid control frame: {}", e)).into());
                }
            },
            Message::Binary(data) => {
                tracing::warn!(bytes = data.len(), "Binary frame before control frame, ignoring");
            }
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

async fn relay_chunks<S>(ws: &mut WebSocketStream<S>, worker: &mut PublishWorker) -> Result<u64, ServeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut tracker = SequenceTracker::new();
    let mut received = 0u64;

    loop {
        tokio::select! {
            msg = ws.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => return Err(TransportError::Receive(e.to_string()).into()),
                    None => return Ok(received),
                };

                match msg {
                    Message::Binary(data) => {
                        let chunk = match MediaChunk::decode_frame(&data) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                close_with(ws, CloseCode::Invalid, "invalid chunk frame").await;
                                return Err(TransportError::from(e).into());
                            }
                        };
                        if let Err(violation) = tracker.observe(&chunk) {
                            tracing::warn!(error = %violation, "Out-of-order chunk, closing connection");
                            close_with(ws, CloseCode::Policy, "out-of-order chunk").await;
                            return Err(TransportError::from(violation).into());
                        }
                        received += 1;
                        worker.submit(chunk);
                    }
                    Message::Text(_) => {
                        tracing::warn!("Unexpected text frame after control frame, ignoring");
                    }
                    Message::Close(_) => return Ok(received),
                    _ => {}
                }
            }
            err = worker.failed() => {
                close_with(ws, CloseCode::Error, "publish failed").await;
                return Err(err.into());
            }
        }
    }
}

async fn close_with<S>(ws: &mut WebSocketStream<S>, code: CloseCode, reason: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = ws.send(Message::Close(Some(frame))).await {
        tracing::debug!("Failed to send close frame: {}", e);
    }
}

/// Why a relay connection ended abnormally
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}
