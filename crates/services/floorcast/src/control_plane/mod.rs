//! Control-plane client
//!
//! The control-plane owns stream resources and edge ingestors. Everything
//! here is a remote resource: the local side only holds ids and requests
//! transitions. [`ControlPlane`] is the seam the lifecycle manager talks
//! through; [`HttpControlPlane`] is the production implementation.

pub mod http;

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

pub use http::HttpControlPlane;

/// Availability of an edge ingestor as reported by the control-plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable,
}

impl Availability {
    /// Map the control-plane `state` string. Anything other than
    /// `available` is treated as not selectable.
    pub fn from_state(state: &str) -> Self {
        if state.eq_ignore_ascii_case("available") {
            Availability::Available
        } else {
            Availability::Unavailable
        }
    }
}

/// A candidate network ingress point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingestor {
    pub id: String,
    pub availability: Availability,
}

impl Ingestor {
    pub fn new(id: impl Into<String>, availability: Availability) -> Self {
        Self {
            id: id.into(),
            availability,
        }
    }

    pub fn available(id: impl Into<String>) -> Self {
        Self::new(id, Availability::Available)
    }

    pub fn unavailable(id: impl Into<String>) -> Self {
        Self::new(id, Availability::Unavailable)
    }

    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }
}

/// A stream resource as listed by the control-plane
///
/// A bound stream carries its publish key; `Debug` redacts it.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteStream {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub stream_server: Option<String>,

    #[serde(default)]
    pub stream_key: Option<String>,
}

impl RemoteStream {
    /// A listed stream carrying both a server and a key is bound to an ingestor
    pub fn is_bound(&self) -> bool {
        self.stream_server.as_deref().is_some_and(|s| !s.is_empty())
            && self.stream_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("stream_server", &self.stream_server)
            .field("stream_key", &self.stream_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Publish key of an ingress endpoint
///
/// Anyone holding the key can publish, so it never appears in `Debug` or
/// `Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamKey(<redacted>)")
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Publish capability returned by a successful ingestor selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressEndpoint {
    server: String,
    key: StreamKey,
}

impl IngressEndpoint {
    pub fn new(server: impl Into<String>, key: StreamKey) -> Self {
        Self {
            server: server.into(),
            key,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Full RTMP publish URL (`<server>/<key>`). Contains the key.
    pub fn rtmp_url(&self) -> String {
        format!("{}/{}", self.server.trim_end_matches('/'), self.key.expose())
    }
}

impl fmt::Display for IngressEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server.trim_end_matches('/'), self.key)
    }
}

/// Operations exposed by the control-plane API
///
/// `delete_stream` and `unselect_ingestor` are idempotent: a resource that is
/// already gone or already released is reported as success.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register a new stream resource and return its id
    async fn create_stream(&self, name: &str) -> Result<String, ControlPlaneError>;

    /// List all stream resources owned by this account
    async fn list_streams(&self) -> Result<Vec<RemoteStream>, ControlPlaneError>;

    /// Delete a stream resource
    async fn delete_stream(&self, stream_id: &str) -> Result<(), ControlPlaneError>;

    /// Snapshot of the edge ingestors and their availability
    async fn list_ingestors(&self) -> Result<Vec<Ingestor>, ControlPlaneError>;

    /// Bind an ingestor to a stream
    async fn select_ingestor(
        &self,
        ingestor_id: &str,
        stream_id: &str,
    ) -> Result<IngressEndpoint, SelectError>;

    /// Release an ingestor binding
    async fn unselect_ingestor(&self, ingestor_id: &str) -> Result<(), ControlPlaneError>;
}

/// Network, authentication or protocol failure talking to the control-plane
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication rejected (HTTP {status})")]
    Auth { status: u16 },

    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ControlPlaneError::Parse(err.to_string())
        } else {
            ControlPlaneError::Network(err.to_string())
        }
    }
}

impl From<reqwest::header::InvalidHeaderValue> for ControlPlaneError {
    fn from(err: reqwest::header::InvalidHeaderValue) -> Self {
        ControlPlaneError::InvalidConfig(err.to_string())
    }
}

/// The ingestor was claimed by someone else between listing and selecting
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ingestor {ingestor_id} is unavailable")]
pub struct IngestorUnavailable {
    pub ingestor_id: String,
}

/// Failure of a single select call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error(transparent)]
    Unavailable(#[from] IngestorUnavailable),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_never_renders_key() {
        let endpoint = IngressEndpoint::new("rtmp://edge-1.example.net/live", StreamKey::new("s3cr3t"));

        assert_eq!(endpoint.rtmp_url(), "rtmp://edge-1.example.net/live/s3cr3t");
        assert!(!format!("{}", endpoint).contains("s3cr3t"));
        assert!(!format!("{:?}", endpoint).contains("s3cr3t"));
    }

    #[test]
    fn test_listed_stream_debug_redacts_key() {
        let stream = RemoteStream {
            id: "stream_1".to_string(),
            name: "demo".to_string(),
            stream_server: Some("rtmp://edge-1.example.net/live".to_string()),
            stream_key: Some("s3cr3t".to_string()),
        };

        let debug = format!("{:?}", stream);
        assert!(!debug.contains("s3cr3t"));
        assert!(debug.contains("stream_1"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_rtmp_url_trims_trailing_slash() {
        let endpoint = IngressEndpoint::new("rtmp://edge/live/", StreamKey::new("k"));
        assert_eq!(endpoint.rtmp_url(), "rtmp://edge/live/k");
    }

    #[test]
    fn test_availability_from_state() {
        assert_eq!(Availability::from_state("available"), Availability::Available);
        assert_eq!(Availability::from_state("unavailable"), Availability::Unavailable);
        assert_eq!(Availability::from_state("offline"), Availability::Unavailable);
    }

    #[test]
    fn test_remote_stream_bound_detection() {
        let stream: RemoteStream = serde_json::from_str(
            r#"{"id":"stream_1","name":"demo","stream_server":"rtmp://e/live","stream_key":"k"}"#,
        )
        .unwrap();
        assert!(stream.is_bound());

        let stream: RemoteStream =
            serde_json::from_str(r#"{"id":"stream_2","stream_server":"","stream_key":null}"#).unwrap();
        assert!(!stream.is_bound());
        assert_eq!(stream.name, "");
    }
}
