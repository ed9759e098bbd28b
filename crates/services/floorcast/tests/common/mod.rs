//! Test doubles shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, DuplexStream};
use tokio::sync::{mpsc, Notify};

use floorcast::capture::{CaptureError, Chunker, MediaSource};
use floorcast::control_plane::{
    ControlPlane, ControlPlaneError, Ingestor, IngestorUnavailable, IngressEndpoint, RemoteStream,
    SelectError, StreamKey,
};
use floorcast::media::{MediaChunk, MediaType};
use floorcast::publish::flv::{FlvTag, TagKind};
use floorcast::publish::{
    DecodeError, PublishError, PublishSink, PublishWorker, SegmentTranscoder, WorkerFactory,
};
use floorcast::relay::{ControlFrame, LinkMonitor, LinkState, SendOutcome, DropReason, Transport, TransportError};
use floorcast::session::PipelineFactory;

// ---------------------------------------------------------------------------
// Control-plane
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateStream(String),
    ListStreams,
    DeleteStream(String),
    ListIngestors,
    Select { ingestor: String, stream: String },
    Unselect(String),
}

#[derive(Default)]
struct PlaneState {
    next_stream: u32,
    streams: Vec<RemoteStream>,
    ingestors: Vec<Ingestor>,
    /// Listings returned before falling back to `ingestors`
    scripted_listings: VecDeque<Vec<Ingestor>>,
    /// Ingestors claimed by someone else: select fails as unavailable
    claimed: Vec<String>,
    select_errors: HashMap<String, ControlPlaneError>,
    fail_unselect: bool,
    fail_delete: bool,
    select_gate: Option<SelectGate>,
    calls: Vec<Call>,
}

/// Parks every select until the test releases it
#[derive(Clone, Default)]
pub struct SelectGate {
    /// Notified when a select reaches the gate
    pub entered: Arc<Notify>,
    /// Lets one parked select through
    pub release: Arc<Notify>,
}

/// In-memory control-plane recording every call
#[derive(Default)]
pub struct FakeControlPlane {
    state: Mutex<PlaneState>,
}

impl FakeControlPlane {
    pub fn with_ingestors(ingestors: Vec<Ingestor>) -> Arc<Self> {
        let plane = Self::default();
        plane.state.lock().ingestors = ingestors;
        Arc::new(plane)
    }

    pub fn claim(&self, ingestor_id: &str) {
        self.state.lock().claimed.push(ingestor_id.to_string());
    }

    pub fn push_listing(&self, listing: Vec<Ingestor>) {
        self.state.lock().scripted_listings.push_back(listing);
    }

    pub fn fail_select_with(&self, ingestor_id: &str, err: ControlPlaneError) {
        self.state
            .lock()
            .select_errors
            .insert(ingestor_id.to_string(), err);
    }

    pub fn hold_selects(&self) -> SelectGate {
        let gate = SelectGate::default();
        self.state.lock().select_gate = Some(gate.clone());
        gate
    }

    pub fn fail_unselect(&self) {
        self.state.lock().fail_unselect = true;
    }

    pub fn fail_delete(&self) {
        self.state.lock().fail_delete = true;
    }

    pub fn add_stream(&self, stream: RemoteStream) {
        self.state.lock().streams.push(stream);
    }

    pub fn streams(&self) -> Vec<RemoteStream> {
        self.state.lock().streams.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Ingestors a select was attempted on, in order
    pub fn select_attempts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Select { ingestor, .. } => Some(ingestor),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.calls().iter().filter(|c| *c == wanted).count()
    }

    fn set_availability(state: &mut PlaneState, ingestor_id: &str, available: bool) {
        if let Some(ingestor) = state.ingestors.iter_mut().find(|i| i.id == ingestor_id) {
            *ingestor = if available {
                Ingestor::available(ingestor_id)
            } else {
                Ingestor::unavailable(ingestor_id)
            };
        }
    }
}

pub fn endpoint_for(ingestor_id: &str) -> IngressEndpoint {
    IngressEndpoint::new(
        format!("rtmp://{}.edge.example.net/live", ingestor_id),
        StreamKey::new(format!("key-{}", ingestor_id)),
    )
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn create_stream(&self, name: &str) -> Result<String, ControlPlaneError> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateStream(name.to_string()));
        state.next_stream += 1;
        let id = format!("stream_{}", state.next_stream);
        state.streams.push(RemoteStream {
            id: id.clone(),
            name: name.to_string(),
            stream_server: None,
            stream_key: None,
        });
        Ok(id)
    }

    async fn list_streams(&self) -> Result<Vec<RemoteStream>, ControlPlaneError> {
        let mut state = self.state.lock();
        state.calls.push(Call::ListStreams);
        Ok(state.streams.clone())
    }

    async fn delete_stream(&self, stream_id: &str) -> Result<(), ControlPlaneError> {
        let mut state = self.state.lock();
        state.calls.push(Call::DeleteStream(stream_id.to_string()));
        if state.fail_delete {
            return Err(ControlPlaneError::Api {
                status: 500,
                message: "delete failed".to_string(),
            });
        }
        state.streams.retain(|s| s.id != stream_id);
        Ok(())
    }

    async fn list_ingestors(&self) -> Result<Vec<Ingestor>, ControlPlaneError> {
        let mut state = self.state.lock();
        state.calls.push(Call::ListIngestors);
        if let Some(listing) = state.scripted_listings.pop_front() {
            return Ok(listing);
        }
        Ok(state.ingestors.clone())
    }

    async fn select_ingestor(
        &self,
        ingestor_id: &str,
        stream_id: &str,
    ) -> Result<IngressEndpoint, SelectError> {
        let gate = self.state.lock().select_gate.clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let mut state = self.state.lock();
        state.calls.push(Call::Select {
            ingestor: ingestor_id.to_string(),
            stream: stream_id.to_string(),
        });

        if let Some(err) = state.select_errors.get(ingestor_id) {
            return Err(err.clone().into());
        }
        let available = state
            .ingestors
            .iter()
            .any(|i| i.id == ingestor_id && i.is_available());
        if state.claimed.iter().any(|c| c == ingestor_id) || !available {
            return Err(IngestorUnavailable {
                ingestor_id: ingestor_id.to_string(),
            }
            .into());
        }

        Self::set_availability(&mut state, ingestor_id, false);
        let endpoint = endpoint_for(ingestor_id);
        if let Some(stream) = state.streams.iter_mut().find(|s| s.id == stream_id) {
            stream.stream_server = Some(endpoint.server().to_string());
            stream.stream_key = Some(endpoint.key().expose().to_string());
        }
        Ok(endpoint)
    }

    async fn unselect_ingestor(&self, ingestor_id: &str) -> Result<(), ControlPlaneError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Unselect(ingestor_id.to_string()));
        if state.fail_unselect {
            return Err(ControlPlaneError::Network("connection reset".to_string()));
        }
        Self::set_availability(&mut state, ingestor_id, true);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ProbeState {
    opened_with: Option<String>,
    sent: Vec<MediaChunk>,
    closed: bool,
    fail_open: bool,
    fail_close: bool,
    fail_tx: Option<mpsc::Sender<TransportError>>,
}

/// Shared view into the transports a pipeline hands out
#[derive(Clone, Default)]
pub struct TransportProbe {
    inner: Arc<Mutex<ProbeState>>,
}

impl TransportProbe {
    pub fn opened_with(&self) -> Option<String> {
        self.inner.lock().opened_with.clone()
    }

    pub fn sent(&self) -> Vec<MediaChunk> {
        self.inner.lock().sent.clone()
    }

    pub fn closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn fail_open(&self) {
        self.inner.lock().fail_open = true;
    }

    pub fn fail_close(&self) {
        self.inner.lock().fail_close = true;
    }

    /// Simulate the far end dropping the connection
    pub fn break_link(&self, err: TransportError) {
        if let Some(tx) = self.inner.lock().fail_tx.take() {
            let _ = tx.try_send(err);
        }
    }
}

/// Transport that records what it was asked to do
pub struct RecordingTransport {
    probe: TransportProbe,
    state: LinkState,
}

impl RecordingTransport {
    pub fn new(probe: TransportProbe) -> Self {
        Self {
            probe,
            state: LinkState::Idle,
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn open(&mut self, control: ControlFrame) -> Result<LinkMonitor, TransportError> {
        if self.state != LinkState::Idle {
            return Err(TransportError::AlreadyOpened);
        }
        let mut probe = self.probe.inner.lock();
        if probe.fail_open {
            self.state = LinkState::Closed;
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        let (tx, monitor) = LinkMonitor::channel();
        probe.opened_with = Some(control.rtmp_url);
        probe.fail_tx = Some(tx);
        self.state = LinkState::Open;
        Ok(monitor)
    }

    fn send(&mut self, chunk: &MediaChunk) -> SendOutcome {
        if self.state != LinkState::Open {
            return SendOutcome::Dropped(DropReason::NotOpen);
        }
        self.probe.inner.lock().sent.push(chunk.clone());
        SendOutcome::Sent
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state = LinkState::Closed;
        let mut probe = self.probe.inner.lock();
        probe.closed = true;
        probe.fail_tx = None;
        if probe.fail_close {
            return Err(TransportError::Send("close failed".to_string()));
        }
        Ok(())
    }

    fn state(&self) -> LinkState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Source reading from an in-memory pipe the test writes into
pub struct PipeSource {
    media_type: MediaType,
    reader: Option<DuplexStream>,
    unavailable: bool,
}

impl PipeSource {
    pub fn new(media_type: MediaType) -> (Self, DuplexStream) {
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        (
            Self {
                media_type,
                reader: Some(reader),
                unavailable: false,
            },
            writer,
        )
    }

    pub fn unavailable(media_type: MediaType) -> Self {
        Self {
            media_type,
            reader: None,
            unavailable: true,
        }
    }
}

#[async_trait]
impl MediaSource for PipeSource {
    fn media_type(&self) -> MediaType {
        self.media_type
    }

    fn describe(&self) -> String {
        format!("pipe:{}", self.media_type)
    }

    async fn acquire(&mut self) -> Result<Box<dyn AsyncRead + Send + Unpin>, CaptureError> {
        match (self.unavailable, self.reader.take()) {
            (false, Some(reader)) => Ok(Box::new(reader)),
            _ => Err(CaptureError::DeviceUnavailable {
                device: self.describe(),
                reason: "device busy".to_string(),
            }),
        }
    }

    async fn release(&mut self) {}
}

/// Pipeline of one pipe-backed video source and a recording transport
pub struct FakePipeline {
    pub probe: TransportProbe,
    writer: Mutex<Option<DuplexStream>>,
    capture_unavailable: Mutex<bool>,
}

impl FakePipeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            probe: TransportProbe::default(),
            writer: Mutex::new(None),
            capture_unavailable: Mutex::new(false),
        })
    }

    pub fn capture_unavailable(&self) {
        *self.capture_unavailable.lock() = true;
    }

    /// Writer feeding the most recently started capture
    pub fn take_writer(&self) -> Option<DuplexStream> {
        self.writer.lock().take()
    }
}

impl PipelineFactory for FakePipeline {
    fn chunker(&self) -> Chunker {
        let chunker = Chunker::new(Duration::from_millis(20));
        if *self.capture_unavailable.lock() {
            return chunker.with_source(Box::new(PipeSource::unavailable(MediaType::Video)));
        }
        let (source, writer) = PipeSource::new(MediaType::Video);
        *self.writer.lock() = Some(writer);
        chunker.with_source(Box::new(source))
    }

    fn transport(&self) -> Box<dyn Transport> {
        Box::new(RecordingTransport::new(self.probe.clone()))
    }
}

// ---------------------------------------------------------------------------
// Publish worker
// ---------------------------------------------------------------------------

/// Turns each chunk into one video tag carrying the chunk payload;
/// payloads starting with `corrupt` fail to decode
pub struct PassthroughTranscoder;

impl SegmentTranscoder for PassthroughTranscoder {
    fn transcode(&mut self, chunk: &MediaChunk) -> Result<Vec<FlvTag>, DecodeError> {
        if chunk.payload.starts_with(b"corrupt") {
            return Err(DecodeError::Empty);
        }
        Ok(vec![FlvTag::new(TagKind::Video, 0, chunk.payload.clone())])
    }
}

/// Records published tag payloads; optionally fails every write
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub published: Arc<Mutex<Vec<Vec<u8>>>>,
    pub fail_writes: bool,
}

impl PublishSink for RecordingSink {
    fn write_tags(&mut self, tags: &[FlvTag]) -> Result<(), PublishError> {
        if self.fail_writes {
            return Err(PublishError::Write("ingest refused connection".to_string()));
        }
        let mut published = self.published.lock();
        published.extend(tags.iter().map(|t| t.data.to_vec()));
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Worker factory recording the URLs it was asked to publish to
#[derive(Clone, Default)]
pub struct RecordingWorkerFactory {
    pub urls: Arc<Mutex<Vec<String>>>,
    pub sink: RecordingSink,
}

impl WorkerFactory for RecordingWorkerFactory {
    fn spawn(&self, rtmp_url: &str) -> Result<PublishWorker, PublishError> {
        self.urls.lock().push(rtmp_url.to_string());
        PublishWorker::spawn(Box::new(PassthroughTranscoder), Box::new(self.sink.clone()), 64)
    }
}

/// Poll `check` until it holds or a second passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
