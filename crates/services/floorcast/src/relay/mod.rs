//! Transport relay
//!
//! Carries chunks from the broadcaster to the far end that hosts the publish
//! worker. A connection opens with exactly one text control frame naming the
//! publish URL, then carries one binary frame per chunk in production order.
//! There is no acknowledgement, no flow control and no reconnect: a broken
//! connection is reported to the session owner.

pub mod client;
pub mod server;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::media::{FrameError, MediaChunk, SequenceViolation};

pub use client::WsRelay;
pub use server::RelayServer;

/// First frame of every relay connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlFrame {
    pub rtmp_url: String,
}

impl ControlFrame {
    pub fn new(rtmp_url: impl Into<String>) -> Self {
        Self {
            rtmp_url: rtmp_url.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl fmt::Debug for ControlFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlFrame")
            .field("rtmp_url", &"<redacted>")
            .finish()
    }
}

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Why a chunk was not sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotOpen,
    BufferFull,
}

/// Result of a non-blocking send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped(DropReason),
}

/// Receives the error that ended an open connection
pub struct LinkMonitor {
    rx: mpsc::Receiver<TransportError>,
}

impl LinkMonitor {
    /// Create a monitor and the sender used to report failures into it
    pub fn channel() -> (mpsc::Sender<TransportError>, Self) {
        let (tx, rx) = mpsc::channel(1);
        (tx, Self { rx })
    }

    /// Resolves with the connection error
    ///
    /// Stays pending once the transport has been closed locally.
    pub async fn failed(&mut self) -> TransportError {
        match self.rx.recv().await {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }
}

/// Duplex link carrying chunks to the publish worker
#[async_trait]
pub trait Transport: Send {
    /// Connect and send the control frame. A transport opens at most once.
    async fn open(&mut self, control: ControlFrame) -> Result<LinkMonitor, TransportError>;

    /// Queue one chunk without waiting
    fn send(&mut self, chunk: &MediaChunk) -> SendOutcome;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;

    fn state(&self) -> LinkState;
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to relay: {0}")]
    Connect(String),

    #[error("relay protocol error: {0}")]
    Protocol(String),

    #[error("failed to send to relay: {0}")]
    Send(String),

    #[error("failed to receive from relay: {0}")]
    Receive(String),

    #[error("relay closed the connection: {reason}")]
    ClosedByPeer { reason: String },

    #[error("transport was already opened")]
    AlreadyOpened,

    #[error(transparent)]
    OutOfOrder(#[from] SequenceViolation),

    #[error("invalid chunk frame: {0}")]
    InvalidFrame(#[from] FrameError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_wire_format() {
        let frame = ControlFrame::new("rtmp://edge/live/key");
        assert_eq!(frame.to_json().unwrap(), r#"{"rtmpUrl":"rtmp://edge/live/key"}"#);
        assert_eq!(
            ControlFrame::from_json(r#"{"rtmpUrl":"rtmp://x/y"}"#).unwrap().rtmp_url,
            "rtmp://x/y"
        );
        assert!(ControlFrame::from_json(r#"{"url":"rtmp://x/y"}"#).is_err());
    }

    #[test]
    fn test_control_frame_debug_hides_url() {
        let frame = ControlFrame::new("rtmp://edge/live/s3cr3t");
        assert!(!format!("{:?}", frame).contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_monitor_pending_after_sender_dropped() {
        let (tx, mut monitor) = LinkMonitor::channel();
        drop(tx);
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(20), monitor.failed()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_monitor_reports_error() {
        let (tx, mut monitor) = LinkMonitor::channel();
        tx.send(TransportError::Receive("reset".to_string())).await.unwrap();
        assert_eq!(monitor.failed().await, TransportError::Receive("reset".to_string()));
    }
}
