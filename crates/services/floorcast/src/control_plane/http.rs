//! HTTP implementation of the control-plane API
//!
//! Every request carries the two service-account credential headers.
//! Responses wrap their payload in a `{"body": ...}` envelope.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{
    Availability, ControlPlane, ControlPlaneError, Ingestor, IngestorUnavailable, IngressEndpoint,
    RemoteStream, SelectError, StreamKey,
};
use crate::config::ControlPlaneConfig;

const ACCOUNT_ID_HEADER: &str = "x-tva-sa-id";
const ACCOUNT_SECRET_HEADER: &str = "x-tva-sa-secret";

/// Reqwest-backed control-plane client
pub struct HttpControlPlane {
    /// Base URL; endpoint paths are appended as segments
    base_url: Url,

    /// Service account id, also part of the stream listing path
    account_id: String,

    /// Credential headers attached to every call
    headers: HeaderMap,

    client: Client,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    body: T,
}

#[derive(Debug, Deserialize)]
struct CreatedStream {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StreamList {
    #[serde(default)]
    streams: Vec<RemoteStream>,
}

#[derive(Debug, Deserialize)]
struct IngestorList {
    #[serde(default)]
    ingestors: Vec<IngestorEntry>,
}

#[derive(Debug, Deserialize)]
struct IngestorEntry {
    id: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct Selection {
    stream_server: Option<String>,
    stream_key: Option<String>,
}

impl HttpControlPlane {
    /// Create a client from configuration
    pub fn new(config: &ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        if config.base_url.is_empty() {
            return Err(ControlPlaneError::InvalidConfig(
                "control-plane base_url cannot be empty".to_string(),
            ));
        }
        let parsed = Url::parse(&config.base_url).map_err(|e| {
            ControlPlaneError::InvalidConfig(format!("invalid control-plane base_url: {}", e))
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ControlPlaneError::InvalidConfig(format!(
                "control-plane base_url must start with http:// or https://, got: {}",
                config.base_url
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCOUNT_ID_HEADER,
            HeaderValue::from_str(&config.service_account_id)?,
        );
        let mut secret = HeaderValue::from_str(&config.service_account_secret)?;
        secret.set_sensitive(true);
        headers.insert(ACCOUNT_SECRET_HEADER, secret);

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ControlPlaneError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: parsed,
            account_id: config.service_account_id.clone(),
            headers,
            client,
        })
    }

    /// Base URL with `segments` appended, each percent-encoded as a single
    /// path segment
    fn url(&self, segments: &[&str]) -> Result<Url, ControlPlaneError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ControlPlaneError::InvalidConfig("control-plane base_url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Map non-success statuses to errors, passing successful responses through
    async fn check(response: Response) -> Result<Response, ControlPlaneError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ControlPlaneError::Auth {
                status: status.as_u16(),
            });
        }
        let message = response.text().await.unwrap_or_default();
        Err(ControlPlaneError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn is_auth_failure(status: StatusCode) -> bool {
        status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_stream(&self, name: &str) -> Result<String, ControlPlaneError> {
        let response = self
            .client
            .post(self.url(&["stream"])?)
            .headers(self.headers.clone())
            .json(&json!({ "name": name }))
            .send()
            .await?;

        let envelope: Envelope<CreatedStream> = Self::check(response).await?.json().await?;
        tracing::info!(stream_id = %envelope.body.id, name = %name, "Created stream");
        Ok(envelope.body.id)
    }

    async fn list_streams(&self) -> Result<Vec<RemoteStream>, ControlPlaneError> {
        let response = self
            .client
            .get(self.url(&["service_account", &self.account_id, "streams"])?)
            .headers(self.headers.clone())
            .send()
            .await?;

        let envelope: Envelope<StreamList> = Self::check(response).await?.json().await?;
        Ok(envelope.body.streams)
    }

    async fn delete_stream(&self, stream_id: &str) -> Result<(), ControlPlaneError> {
        let response = self
            .client
            .delete(self.url(&["stream", stream_id])?)
            .headers(self.headers.clone())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::warn!(stream_id = %stream_id, "Stream not found, skipping deletion");
            return Ok(());
        }

        Self::check(response).await?;
        tracing::info!(stream_id = %stream_id, "Deleted stream");
        Ok(())
    }

    async fn list_ingestors(&self) -> Result<Vec<Ingestor>, ControlPlaneError> {
        let response = self
            .client
            .get(self.url(&["ingestor", "filter"])?)
            .headers(self.headers.clone())
            .send()
            .await?;

        let envelope: Envelope<IngestorList> = Self::check(response).await?.json().await?;
        Ok(envelope
            .body
            .ingestors
            .into_iter()
            .map(|entry| Ingestor::new(entry.id, Availability::from_state(&entry.state)))
            .collect())
    }

    async fn select_ingestor(
        &self,
        ingestor_id: &str,
        stream_id: &str,
    ) -> Result<IngressEndpoint, SelectError> {
        let response = self
            .client
            .put(self.url(&["ingestor", ingestor_id, "select"])?)
            .headers(self.headers.clone())
            .json(&json!({ "tva_stream": stream_id }))
            .send()
            .await
            .map_err(ControlPlaneError::from)?;

        let status = response.status();
        if status.is_client_error() && !Self::is_auth_failure(status) {
            tracing::debug!(
                ingestor_id = %ingestor_id,
                status = status.as_u16(),
                "Ingestor refused selection"
            );
            return Err(IngestorUnavailable {
                ingestor_id: ingestor_id.to_string(),
            }
            .into());
        }

        let envelope: Envelope<Selection> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(ControlPlaneError::from)?;

        match (envelope.body.stream_server, envelope.body.stream_key) {
            (Some(server), Some(key)) if !server.is_empty() && !key.is_empty() => {
                Ok(IngressEndpoint::new(server, StreamKey::new(key)))
            }
            _ => Err(ControlPlaneError::Parse(format!(
                "selection of ingestor {} returned no stream server/key",
                ingestor_id
            ))
            .into()),
        }
    }

    async fn unselect_ingestor(&self, ingestor_id: &str) -> Result<(), ControlPlaneError> {
        let response = self
            .client
            .put(self.url(&["ingestor", ingestor_id, "unselect"])?)
            .headers(self.headers.clone())
            .json(&json!({}))
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() && !Self::is_auth_failure(status) {
            tracing::debug!(
                ingestor_id = %ingestor_id,
                status = status.as_u16(),
                "Ingestor already unbound"
            );
            return Ok(());
        }

        Self::check(response).await?;
        tracing::info!(ingestor_id = %ingestor_id, "Unselected ingestor");
        Ok(())
    }
}
