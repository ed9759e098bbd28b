//! Capture & chunker
//!
//! Reads encoded bytes from one or more [`MediaSource`]s and cuts them into
//! [`MediaChunk`]s on a fixed wall-clock cadence. Boundaries are time based
//! and ignore keyframes. Each source gets its own task and its own sequence
//! counter; all chunks flow into one bounded channel.

pub mod ffmpeg;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::CaptureConfig;
use crate::media::{now_ms, MediaChunk, MediaType};
use crate::metrics::global_metrics;
pub use ffmpeg::{FfmpegSource, TS_PACKET_SIZE};

/// Stream of captured chunks, ends when every source has stopped
pub type ChunkStream = ReceiverStream<MediaChunk>;

/// A capture device supplied by the host runtime
#[async_trait]
pub trait MediaSource: Send {
    fn media_type(&self) -> MediaType;

    /// Human-readable device name for logs and errors
    fn describe(&self) -> String;

    /// Open the device and return its encoded byte stream
    async fn acquire(&mut self) -> Result<Box<dyn AsyncRead + Send + Unpin>, CaptureError>;

    /// Give the device back. Called once after a successful acquire.
    async fn release(&mut self);
}

/// Builder for a capture run
///
/// `start` consumes the chunker: a stopped capture cannot be resumed, a new
/// chunker has to reacquire the devices.
pub struct Chunker {
    interval: Duration,
    alignment: usize,
    channel_capacity: usize,
    sources: Vec<Box<dyn MediaSource>>,
}

impl Chunker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            alignment: 1,
            channel_capacity: 64,
            sources: Vec::new(),
        }
    }

    /// Chunker over the ffmpeg devices named in the configuration
    pub fn from_config(config: &CaptureConfig) -> Self {
        let mut chunker = Self::new(config.chunk_interval())
            .with_alignment(TS_PACKET_SIZE)
            .with_channel_capacity(config.channel_capacity);
        if let Some(video) = FfmpegSource::video(config) {
            chunker = chunker.with_source(Box::new(video));
        }
        if let Some(audio) = FfmpegSource::audio(config) {
            chunker = chunker.with_source(Box::new(audio));
        }
        chunker
    }

    pub fn with_source(mut self, source: Box<dyn MediaSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Only cut chunks at multiples of `bytes` (container packet size)
    pub fn with_alignment(mut self, bytes: usize) -> Self {
        self.alignment = bytes.max(1);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Acquire every source and start chunking
    ///
    /// Fails with [`CaptureError::DeviceUnavailable`] if any device cannot be
    /// acquired; devices acquired before the failure are released again.
    pub async fn start(self) -> Result<(CaptureHandle, ChunkStream), CaptureError> {
        if self.sources.is_empty() {
            return Err(CaptureError::NoSources);
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.media_type()) {
                return Err(CaptureError::DuplicateMediaType(source.media_type()));
            }
        }

        let mut acquired = Vec::with_capacity(self.sources.len());
        for mut source in self.sources {
            match source.acquire().await {
                Ok(reader) => {
                    tracing::info!(
                        media_type = %source.media_type(),
                        device = %source.describe(),
                        "Capture device acquired"
                    );
                    acquired.push((source, reader));
                }
                Err(e) => {
                    tracing::error!(device = %source.describe(), error = %e, "Failed to acquire capture device");
                    for (mut source, _) in acquired {
                        source.release().await;
                    }
                    return Err(e);
                }
            }
        }

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (shutdown_tx, _) = broadcast::channel(1);

        let tasks = acquired
            .into_iter()
            .map(|(source, reader)| {
                let segmenter = Segmenter {
                    media_type: source.media_type(),
                    alignment: self.alignment,
                    buffer: BytesMut::new(),
                    segment_start_ms: None,
                    next_sequence: 0,
                };
                tokio::spawn(run_source(
                    source,
                    reader,
                    segmenter,
                    self.interval,
                    tx.clone(),
                    shutdown_tx.subscribe(),
                ))
            })
            .collect();

        Ok((CaptureHandle { shutdown_tx, tasks }, ReceiverStream::new(rx)))
    }
}

/// Running capture; stopping it releases every device
pub struct CaptureHandle {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop all sources and wait for their devices to be released
    pub async fn stop(mut self) -> Result<(), CaptureError> {
        let _ = self.shutdown_tx.send(());

        let mut failure = None;
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                failure = Some(CaptureError::Stop(e.to_string()));
            }
        }
        tracing::info!("Capture stopped");
        failure.map_or(Ok(()), Err)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Accumulates bytes for one source and cuts them into chunks
struct Segmenter {
    media_type: MediaType,
    alignment: usize,
    buffer: BytesMut,
    segment_start_ms: Option<u64>,
    next_sequence: u64,
}

impl Segmenter {
    fn push(&mut self, bytes: &[u8]) {
        if self.segment_start_ms.is_none() {
            self.segment_start_ms = Some(now_ms());
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Cut the buffered bytes into a chunk. `force` ignores alignment.
    fn cut(&mut self, force: bool) -> Option<MediaChunk> {
        let len = if force {
            self.buffer.len()
        } else {
            self.buffer.len() - self.buffer.len() % self.alignment
        };
        if len == 0 {
            return None;
        }

        let payload = self.buffer.split_to(len).freeze();
        let captured_at_ms = self.segment_start_ms.unwrap_or_else(now_ms);
        // Leftover bytes open the next segment
        self.segment_start_ms = if self.buffer.is_empty() {
            None
        } else {
            Some(now_ms())
        };

        let chunk = MediaChunk::new(self.next_sequence, self.media_type, payload, captured_at_ms);
        self.next_sequence += 1;
        Some(chunk)
    }
}

async fn run_source(
    mut source: Box<dyn MediaSource>,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    mut segmenter: Segmenter,
    interval: Duration,
    tx: mpsc::Sender<MediaChunk>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let media_type = source.media_type();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut read_buf = vec![0u8; 64 * 1024];

    loop {
        let chunk = tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => segmenter.cut(false),
            result = reader.read(&mut read_buf) => match result {
                Ok(0) => {
                    tracing::warn!(media_type = %media_type, "Capture source ended");
                    if let Some(chunk) = segmenter.cut(true) {
                        emit(&tx, chunk, &mut shutdown_rx).await;
                    }
                    break;
                }
                Ok(n) => {
                    segmenter.push(&read_buf[..n]);
                    None
                }
                Err(e) => {
                    tracing::error!(media_type = %media_type, error = %e, "Capture read failed");
                    break;
                }
            },
        };

        if let Some(chunk) = chunk {
            if !emit(&tx, chunk, &mut shutdown_rx).await {
                break;
            }
        }
    }

    source.release().await;
    tracing::debug!(media_type = %media_type, device = %source.describe(), "Capture device released");
}

/// Hand a chunk downstream; false when capture should stop
async fn emit(
    tx: &mpsc::Sender<MediaChunk>,
    chunk: MediaChunk,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> bool {
    tracing::trace!(
        media_type = %chunk.media_type,
        sequence = chunk.sequence_number,
        bytes = chunk.payload.len(),
        "Chunk captured"
    );
    global_metrics().chunk_captured();
    tokio::select! {
        result = tx.send(chunk) => result.is_ok(),
        _ = shutdown_rx.recv() => false,
    }
}

/// Capture errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("capture device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("more than one {0} source configured")]
    DuplicateMediaType(MediaType),

    #[error("no capture sources configured")]
    NoSources,

    #[error("capture task failed: {0}")]
    Stop(String),
}
