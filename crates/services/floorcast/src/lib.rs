//! Floorcast
//!
//! Live-media ingestion and publishing for broadcasting a participant's
//! camera and microphone to a third-party live-video platform. The
//! broadcaster captures encoded chunks, obtains an ingress endpoint from the
//! platform's control-plane (failing over between edge ingestors), and
//! relays the chunks over a WebSocket to a far end that transcodes and
//! republishes them as one continuous RTMP stream.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── floorcast (broadcaster) ───────────────────┐
//! │                                                                         │
//! │  HTTP API ──▶ Session ──▶ LifecycleManager ──▶ ControlPlane (HTTPS)     │
//! │                  │            reconcile / create / select_any           │
//! │                  ▼                                                      │
//! │               Chunker ──(MediaChunk)──▶ pump ──▶ WsRelay                │
//! │          (ffmpeg per device)                       │                    │
//! └────────────────────────────────────────────────────┼────────────────────┘
//!                                                      │ {"rtmpUrl": ..}
//!                                                      │ + binary frames
//! ┌──────────────────────── floorcast-relay (far end) ─▼────────────────────┐
//! │  RelayServer ──▶ ChunkQueue ──▶ PublishWorker thread                    │
//! │                   (drop-oldest)   transcode ─▶ Timeline ─▶ FLV ─▶ RTMP  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod capture;
pub mod config;
pub mod control_plane;
pub mod lifecycle;
pub mod media;
pub mod metrics;
pub mod publish;
pub mod relay;
pub mod session;
