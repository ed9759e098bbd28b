//! Transcode/publish worker
//!
//! Chunks arriving from the relay are queued (drop-oldest), transcoded one
//! at a time into FLV segments, placed on the session timeline and written
//! to a single long-lived publish connection. The worker runs on its own OS
//! thread because transcoding blocks.

pub mod ffmpeg;
pub mod flv;
pub mod queue;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;

use crate::media::MediaChunk;
use crate::metrics::global_metrics;
use flv::{FlvError, FlvTag, Timeline};
pub use queue::ChunkQueue;

/// Converts one encoded chunk into FLV tags with segment-relative timestamps
pub trait SegmentTranscoder: Send {
    fn transcode(&mut self, chunk: &MediaChunk) -> Result<Vec<FlvTag>, DecodeError>;
}

/// Outbound publish connection
pub trait PublishSink: Send {
    /// Append tags to the outbound stream
    fn write_tags(&mut self, tags: &[FlvTag]) -> Result<(), PublishError>;

    /// Flush and close the connection
    fn finish(&mut self) -> Result<(), PublishError>;
}

/// Starts one publish worker per relay connection
pub trait WorkerFactory: Send + Sync {
    fn spawn(&self, rtmp_url: &str) -> Result<PublishWorker, PublishError>;
}

/// Handle to a running publish worker thread
pub struct PublishWorker {
    queue: Arc<ChunkQueue>,
    failure_rx: Option<oneshot::Receiver<PublishError>>,
    thread: Option<JoinHandle<()>>,
}

impl PublishWorker {
    /// Start the worker thread
    pub fn spawn(
        transcoder: Box<dyn SegmentTranscoder>,
        sink: Box<dyn PublishSink>,
        queue_capacity: usize,
    ) -> Result<Self, PublishError> {
        let queue = Arc::new(ChunkQueue::new(queue_capacity));
        let (failure_tx, failure_rx) = oneshot::channel();

        let worker_queue = queue.clone();
        let thread = thread::Builder::new()
            .name("floorcast-publish".to_string())
            .spawn(move || run_worker(worker_queue, transcoder, sink, failure_tx))
            .map_err(|e| PublishError::Spawn(e.to_string()))?;

        Ok(Self {
            queue,
            failure_rx: Some(failure_rx),
            thread: Some(thread),
        })
    }

    /// Queue a chunk for publishing, returning the chunk evicted to make room
    pub fn submit(&self, chunk: MediaChunk) -> Option<MediaChunk> {
        self.queue.push(chunk)
    }

    /// Number of chunks waiting to be transcoded
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Resolves when the worker stops because publishing failed
    ///
    /// Stays pending forever if the worker ends without a failure, so it can
    /// sit in a `select!` next to other event sources.
    pub async fn failed(&mut self) -> PublishError {
        if let Some(rx) = self.failure_rx.as_mut() {
            let result = rx.await;
            self.failure_rx = None;
            if let Ok(err) = result {
                return err;
            }
        }
        std::future::pending().await
    }

    /// Stop publishing, discarding any chunks still queued
    ///
    /// Returns the number of discarded chunks.
    pub async fn shutdown(mut self) -> usize {
        let discarded = self.queue.close_and_discard();
        if discarded > 0 {
            tracing::debug!(discarded = discarded, "Discarded pending chunks");
        }

        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::error!("Publish worker thread panicked"),
                Err(e) => tracing::error!("Failed to join publish worker: {}", e),
            }
        }
        discarded
    }
}

impl Drop for PublishWorker {
    fn drop(&mut self) {
        // Unblocks the thread; it finishes the sink and exits on its own
        self.queue.close_and_discard();
    }
}

fn run_worker(
    queue: Arc<ChunkQueue>,
    mut transcoder: Box<dyn SegmentTranscoder>,
    mut sink: Box<dyn PublishSink>,
    failure_tx: oneshot::Sender<PublishError>,
) {
    let metrics = global_metrics();
    let mut timeline = Timeline::new();

    tracing::info!("Publish worker started");

    while let Some(chunk) = queue.pop() {
        let tags = match transcoder.transcode(&chunk) {
            Ok(tags) => tags,
            Err(e) => {
                metrics.decode_failed();
                tracing::warn!(
                    media_type = %chunk.media_type,
                    sequence = chunk.sequence_number,
                    error = %e,
                    "Skipping chunk that failed to decode"
                );
                continue;
            }
        };

        let tags = timeline.place(chunk.captured_at_ms, tags);
        if tags.is_empty() {
            continue;
        }

        if let Err(e) = sink.write_tags(&tags) {
            tracing::error!(error = %e, "Publish connection failed");
            let discarded = queue.close_and_discard();
            tracing::debug!(discarded = discarded, "Discarded pending chunks after failure");
            let _ = sink.finish();
            let _ = failure_tx.send(e);
            return;
        }
        metrics.tags_published(tags.len() as u64);
    }

    if let Err(e) = sink.finish() {
        tracing::warn!(error = %e, "Publish connection did not close cleanly");
    }
    tracing::info!("Publish worker stopped");
}

/// A single chunk could not be transcoded
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("transcoder failed to run: {0}")]
    Transcoder(String),

    #[error("transcoder exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("transcoder produced invalid FLV: {0}")]
    Flv(#[from] FlvError),

    #[error("transcoder produced no media")]
    Empty,
}

/// The outbound publish connection failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("failed to start publisher: {0}")]
    Spawn(String),

    #[error("failed to write to publish connection: {0}")]
    Write(String),

    #[error("publisher exited: {0}")]
    Exited(String),
}
